use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;

//HAZRC_SCAN_THRESHOLD
//HAZRC_RECORDS_PER_THREAD

fn main() {
    println!("cargo:rerun-if-env-changed=HAZRC_SCAN_THRESHOLD");
    println!("cargo:rerun-if-env-changed=HAZRC_RECORDS_PER_THREAD");

    let out_dir = env::var("OUT_DIR").expect("no out directory");
    let dest = Path::new(&out_dir).join("build_constants.rs");

    let mut file = File::create(&dest).expect("could not create file");

    let scan: u32 = option_env!("HAZRC_SCAN_THRESHOLD")
        .map_or(Ok(64), str::parse)
        .expect("failed to parse env variable HAZRC_SCAN_THRESHOLD");

    if scan == 0 {
        panic!("invalid HAZRC_SCAN_THRESHOLD value (0)");
    }

    let records: usize = option_env!("HAZRC_RECORDS_PER_THREAD")
        .map_or(Ok(8), str::parse)
        .expect("failed to parse env variable HAZRC_RECORDS_PER_THREAD");

    if records == 0 {
        panic!("invalid HAZRC_RECORDS_PER_THREAD value (0)");
    }

    write!(
        &mut file,
        "const DEFAULT_SCAN_THRESHOLD: u32 = {};\npub(crate) const RECORDS_PER_THREAD: usize = {};\n",
        scan, records
    )
    .expect("could not write to file");
}

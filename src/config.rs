//! Types for configuring the runtime parameters of a reclamation domain.

include!(concat!(env!("OUT_DIR"), "/build_constants.rs"));

cfg_if::cfg_if! {
    if #[cfg(feature = "maximum-reclamation-freq")] {
        const SCAN_THRESHOLD: u32 = 1;
    } else if #[cfg(feature = "reduced-reclamation-freq")] {
        const SCAN_THRESHOLD: u32 = 2 * DEFAULT_SCAN_THRESHOLD;
    } else {
        const SCAN_THRESHOLD: u32 = DEFAULT_SCAN_THRESHOLD;
    }
}

const DEFAULT_RETIRED_BUCKETS: usize = 64;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Runtime configuration parameters of a [`Domain`](crate::Domain).
///
/// The number of hazard records reserved per thread is a compile time
/// constant (adjustable through the `HAZRC_RECORDS_PER_THREAD` environment
/// variable) and hence not part of this type.
#[derive(Copy, Clone, Debug)]
pub struct Config {
    scan_threshold: u32,
    retired_buckets: usize,
}

/********** impl Default **************************************************************************/

impl Default for Config {
    #[inline]
    fn default() -> Self {
        ConfigBuilder::new().build()
    }
}

/********** impl inherent *************************************************************************/

impl Config {
    pub(crate) const DEFAULT: Config = Config::with_params(SCAN_THRESHOLD, DEFAULT_RETIRED_BUCKETS);

    /// Creates a new [`Config`] with the given parameters.
    ///
    /// # Panics
    ///
    /// Panics if `scan_threshold` is 0 or if `retired_buckets` is not a
    /// power of two.
    #[inline]
    pub const fn with_params(scan_threshold: u32, retired_buckets: usize) -> Self {
        assert!(scan_threshold > 0, "scan threshold must be greater than 0");
        assert!(
            retired_buckets.is_power_of_two(),
            "retired set bucket count must be a power of two"
        );
        Self { scan_threshold, retired_buckets }
    }

    /// Returns the scan threshold.
    ///
    /// Every record retired by a thread counts towards this threshold. Once
    /// a thread's retired set reaches it, an attempt is made to reclaim
    /// records.
    #[inline]
    pub fn scan_threshold(&self) -> u32 {
        self.scan_threshold
    }

    /// Returns the number of buckets of each thread's retired set.
    #[inline]
    pub fn retired_buckets(&self) -> usize {
        self.retired_buckets
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConfigBuilder
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A builder type for gradually initializing a [`Config`].
#[derive(Copy, Clone, Debug, Default)]
pub struct ConfigBuilder {
    scan_threshold: Option<u32>,
    retired_buckets: Option<usize>,
}

/********** impl inherent *************************************************************************/

impl ConfigBuilder {
    /// Creates a new [`ConfigBuilder`] with default values.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the scan threshold.
    ///
    /// A threshold of 1 initiates a reclamation attempt on every retire.
    #[inline]
    pub fn scan_threshold(mut self, scan_threshold: u32) -> Self {
        self.scan_threshold = Some(scan_threshold);
        self
    }

    /// Sets the bucket count for each thread's retired set, rounded up to
    /// the next power of two.
    #[inline]
    pub fn retired_buckets(mut self, retired_buckets: usize) -> Self {
        self.retired_buckets = Some(retired_buckets.next_power_of_two());
        self
    }

    /// Consumes the [`ConfigBuilder`] and returns an initialized [`Config`].
    ///
    /// Unspecified parameters are initialized with their default values.
    #[inline]
    pub fn build(self) -> Config {
        Config::with_params(
            self.scan_threshold.unwrap_or(SCAN_THRESHOLD),
            self.retired_buckets.unwrap_or(DEFAULT_RETIRED_BUCKETS),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigBuilder};

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.scan_threshold(), super::SCAN_THRESHOLD);
        assert_eq!(config.retired_buckets(), super::DEFAULT_RETIRED_BUCKETS);
    }

    #[test]
    fn builder() {
        let config = ConfigBuilder::new().scan_threshold(1).retired_buckets(33).build();
        assert_eq!(config.scan_threshold(), 1);
        assert_eq!(config.retired_buckets(), 64);
    }

    #[test]
    #[should_panic]
    fn zero_threshold() {
        let _ = Config::with_params(0, 64);
    }
}

//! # Tunables

/// Walk/zap rounds a guard installation attempts before asking the caller
/// to restart.
pub const MAX_GUARD_RETRIES: u32 = 3;

/// Default upper bound on the number of mappings per address space.
pub const DEFAULT_MAX_MAP_COUNT: usize = 65_530;

/// Default number of pages requested from the fault resolver per call.
pub const DEFAULT_FAULT_BATCH: usize = 16;

/// Longest accepted anonymous mapping name, in bytes.
pub const ANON_NAME_LEN_MAX: usize = 80;

/// Runtime knobs of an [`Advisor`](crate::Advisor).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    /// Splitting a mapping fails with `ResourceExhausted` at this many mappings.
    pub max_map_count: usize,
    /// Pages the populate loop asks the fault resolver for per call.
    pub fault_batch: usize,
    /// See [`MAX_GUARD_RETRIES`].
    pub guard_install_retries: u32,
}

impl Tunables {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_map_count: DEFAULT_MAX_MAP_COUNT,
            fault_batch: DEFAULT_FAULT_BATCH,
            guard_install_retries: MAX_GUARD_RETRIES,
        }
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = {
    assert!(MAX_GUARD_RETRIES > 0);
    assert!(DEFAULT_FAULT_BATCH > 0);
};

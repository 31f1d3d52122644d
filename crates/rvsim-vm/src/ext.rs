//! Extension hooks consumed by the translation path.

use rvsim_mem::MemPriv;

use crate::mode::Mode5;

/// Physical-memory-attribute validation hook.
///
/// Derived models register one of these to veto physical ranges (device
/// holes, execute-never regions). Returning `false` arms a PMA access
/// fault on the triggering access.
pub trait PmaCheck {
    fn pma_check(&mut self, mode: Mode5, required: MemPriv, low_pa: u64, high_pa: u64) -> bool;
}

/// Hook set that accepts everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullExtension;

impl PmaCheck for NullExtension {
    fn pma_check(&mut self, _mode: Mode5, _required: MemPriv, _low: u64, _high: u64) -> bool {
        true
    }
}

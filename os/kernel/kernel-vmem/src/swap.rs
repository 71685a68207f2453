use crate::addr::VirtualAddress;
use crate::entry::SwapEntry;
use crate::folio::{Folio, FolioFlags};
use alloc::sync::Arc;

/// The swap device as seen by the page-table code.
pub trait SwapBackend: Send + Sync {
    /// Release `nr` consecutive slots starting at `entry`.
    fn free_swap_slots(&self, entry: SwapEntry, nr: usize);

    /// Start reading `entry` into the swap cache. Returns the folio it is read
    /// into, or `None` if the slot could not be read.
    fn read_swap_async(&self, entry: SwapEntry, addr: VirtualAddress) -> Option<Arc<Folio>>;

    /// Try to drop `folio` from the swap cache, freeing its slot. Returns
    /// whether the folio is no longer swap-cached afterwards.
    fn is_swap_cache_reclaimable(&self, folio: &Folio) -> bool {
        if !folio.test(FolioFlags::SWAPCACHE) {
            return true;
        }
        if let Some(entry) = folio.delete_from_swap_cache() {
            self.free_swap_slots(entry, 1);
        }
        true
    }
}

/// For address spaces without swap: nothing is ever swapped.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSwap;

impl SwapBackend for NoSwap {
    fn free_swap_slots(&self, _entry: SwapEntry, _nr: usize) {}

    fn read_swap_async(&self, _entry: SwapEntry, _addr: VirtualAddress) -> Option<Arc<Folio>> {
        None
    }
}

//! # Paging geometry

/// Size of a base page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// Number of entries in every page-table level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Bytes mapped by one leaf table (or one middle-level huge leaf).
pub const PMD_SIZE: u64 = PAGE_SIZE * ENTRIES_PER_TABLE as u64;

/// Bytes mapped by one directory (or one upper-level huge leaf).
pub const PUD_SIZE: u64 = PMD_SIZE * ENTRIES_PER_TABLE as u64;

/// Bytes covered by one top-level entry.
pub const P4D_SIZE: u64 = PUD_SIZE * ENTRIES_PER_TABLE as u64;

/// End of the user half of the address space. Only the lower half of the
/// top-level table holds user mappings; addresses at or above this either
/// belong to the kernel or would alias lower slots once truncated to an index.
pub const USER_VA_END: u64 = P4D_SIZE * (ENTRIES_PER_TABLE as u64 / 2);

/// Page-table entries processed between two scheduling checkpoints, and the
/// largest number of page groups a reclaim walk isolates before yielding.
pub const RECLAIM_BATCH: usize = 32;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(PMD_SIZE == 2 * 1024 * 1024);
    assert!(PUD_SIZE == 1024 * 1024 * 1024);
    assert!(RECLAIM_BATCH < ENTRIES_PER_TABLE);
    assert!(USER_VA_END == 1 << 47);
};

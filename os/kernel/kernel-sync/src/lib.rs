//! # Kernel synchronization primitives
//!
//! The memory-management crates rely on two lock shapes:
//!
//! * [`SpinLock`] protects short critical sections such as a single leaf
//!   page table (the "split page-table lock") or the upper page-table levels.
//! * [`RwLock`] is the address-space lock. Hint-only operations take it
//!   shared; anything that changes the mapping structure takes it exclusively,
//!   optionally in a killable fashion.
//!
//! Long-running walks periodically consult a [`Resched`] implementation and
//! yield the processor while holding none of the fine-grained locks.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod resched;
mod rw_lock;
mod spin_lock;

pub use resched::{NeverResched, Resched};
pub use rw_lock::{ReadGuard, RwLock, WriteGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};

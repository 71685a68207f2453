//! # Memory advice
//!
//! Applies usage hints and directives to ranges of a process address space,
//! in the manner of `madvise(2)` and `process_madvise(2)`.
//!
//! ## What you get
//! - An [`Advisor`] with the single-range, vectorized and remote entry points,
//!   plus anonymous-memory naming.
//! - Reclaim hints: [`Behavior::Cold`] and [`Behavior::Pageout`] age or
//!   reclaim exclusively mapped pages.
//! - Discards: [`Behavior::DontNeed`] drops pages at once, [`Behavior::Free`]
//!   lets reclaim drop them lazily unless they are written again.
//! - [`Behavior::WillNeed`] read-ahead and swap-in, [`Behavior::Remove`] hole
//!   punching, prefaulting with the populate behaviors.
//! - Guard regions with a bounded retry loop ([`GuardRetry`]).
//! - Attribute hints that split and merge [`Mapping`]s in the
//!   [`MappingTree`].
//!
//! ## Locking
//!
//! Every behavior has a [`LockMode`]. Hints that only look at page tables run
//! with the address-space lock shared, attribute changes exclusively (and
//! killably), memory-failure injection without it. Handlers that do I/O drop
//! the lock; the range walk then continues from the address it reached.
//!
//! ## Collaborators
//!
//! Reclaim, file I/O, faults and memory-failure handling are traits (see
//! [`Reclaimer`], [`BackingFile`], [`FaultResolver`], [`MemoryFailure`]).
//! [`DemandFaulter`] is a complete fault resolver over a [`FolioAllocator`].

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod backend;
mod behavior;
pub mod config;
mod dispatch;
mod error;
mod fault;
mod handlers;
mod mapping;
mod mutator;
mod space;
mod tree;

pub use backend::{
    BackingFile, Capability, FaultResolver, FileError, FolioAllocator, MemoryFailure,
    MemoryFailureError, Reclaimer, Resolved, SequentialAllocator, Task,
};
pub use behavior::{Behavior, LockMode};
pub use config::Tunables;
pub use dispatch::{Advisor, IoVec, VectorAdvice};
pub use error::{AdviseError, FaultError, MappingError, errno};
pub use fault::DemandFaulter;
pub use handlers::guard::{GuardRetry, GuardStep};
pub use mapping::{AnonName, Backing, Mapping, VmFlags};
pub use mutator::update as update_mapping;
pub use space::{AddressSpace, MmapGuard};
pub use tree::MappingTree;

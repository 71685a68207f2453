//! Behavior handlers. Each gets the request, the held address-space lock and
//! one mapping clipped to the requested range.

pub(crate) mod discard;
pub(crate) mod flags;
pub mod guard;
pub(crate) mod inject;
pub(crate) mod populate;
pub(crate) mod reclaim;
pub(crate) mod remove;
pub(crate) mod willneed;

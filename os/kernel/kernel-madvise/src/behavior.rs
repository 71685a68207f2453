//! # Advice behaviors
//!
//! The numeric codes are the Linux `MADV_*` values, so user space built
//! against those headers talks to this crate unchanged.

use crate::error::AdviseError;

/// A hint about how a range of memory will be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Behavior {
    /// No special treatment; clears the sequential and random read hints.
    Normal = 0,
    /// Expect random access: read-ahead is pointless.
    Random = 1,
    /// Expect sequential access: read ahead aggressively, drop pages behind.
    Sequential = 2,
    /// Start reading the range in.
    WillNeed = 3,
    /// Discard the contents now.
    DontNeed = 4,
    /// Contents may be discarded lazily unless written again first.
    Free = 8,
    /// Discard the contents and free the backing store.
    Remove = 9,
    /// Do not inherit the range into a forked child.
    DontFork = 10,
    /// Undo [`DontFork`](Self::DontFork).
    DoFork = 11,
    /// Allow same-page merging.
    Mergeable = 12,
    /// Undo [`Mergeable`](Self::Mergeable).
    Unmergeable = 13,
    /// Prefer transparent huge pages.
    HugePage = 14,
    /// Never use transparent huge pages.
    NoHugePage = 15,
    /// Leave the range out of core dumps.
    DontDump = 16,
    /// Undo [`DontDump`](Self::DontDump).
    DoDump = 17,
    /// A forked child sees the range zero-filled.
    WipeOnFork = 18,
    /// Undo [`WipeOnFork`](Self::WipeOnFork).
    KeepOnFork = 19,
    /// Deactivate the pages: reclaim them before others.
    Cold = 20,
    /// Reclaim the pages now.
    Pageout = 21,
    /// Fault the range in for reading.
    PopulateRead = 22,
    /// Fault the range in for writing.
    PopulateWrite = 23,
    /// [`DontNeed`](Self::DontNeed) that also applies to locked mappings.
    DontNeedLocked = 24,
    /// Synchronously collapse into huge pages. Not supported.
    Collapse = 25,
    /// Simulate a hardware memory error on the pages.
    HwPoison = 100,
    /// Migrate the pages away and take their frames offline.
    SoftOffline = 101,
    /// Make accesses to the range fault fatally.
    GuardInstall = 102,
    /// Remove guard markers again.
    GuardRemove = 103,
}

/// How the address-space lock is held while a behavior runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
    /// The behavior does not touch the mapping structure at all.
    Unlocked,
}

impl Behavior {
    /// Decode a numeric behavior code.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Normal,
            1 => Self::Random,
            2 => Self::Sequential,
            3 => Self::WillNeed,
            4 => Self::DontNeed,
            8 => Self::Free,
            9 => Self::Remove,
            10 => Self::DontFork,
            11 => Self::DoFork,
            12 => Self::Mergeable,
            13 => Self::Unmergeable,
            14 => Self::HugePage,
            15 => Self::NoHugePage,
            16 => Self::DontDump,
            17 => Self::DoDump,
            18 => Self::WipeOnFork,
            19 => Self::KeepOnFork,
            20 => Self::Cold,
            21 => Self::Pageout,
            22 => Self::PopulateRead,
            23 => Self::PopulateWrite,
            24 => Self::DontNeedLocked,
            25 => Self::Collapse,
            100 => Self::HwPoison,
            101 => Self::SoftOffline,
            102 => Self::GuardInstall,
            103 => Self::GuardRemove,
            _ => return None,
        })
    }

    #[inline]
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Whether this build accepts the behavior at all.
    #[must_use]
    pub const fn is_supported(self) -> bool {
        match self {
            Self::Collapse => false,
            Self::HwPoison | Self::SoftOffline => cfg!(feature = "memory-failure"),
            _ => true,
        }
    }

    /// Behaviors that change mapping attributes need the lock exclusively;
    /// memory-failure injection takes it only around its own faults.
    #[must_use]
    pub const fn lock_mode(self) -> LockMode {
        match self {
            Self::Remove
            | Self::WillNeed
            | Self::DontNeed
            | Self::DontNeedLocked
            | Self::Cold
            | Self::Pageout
            | Self::Free
            | Self::PopulateRead
            | Self::PopulateWrite
            | Self::Collapse
            | Self::GuardInstall
            | Self::GuardRemove => LockMode::Shared,
            Self::HwPoison | Self::SoftOffline => LockMode::Unlocked,
            _ => LockMode::Exclusive,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_memory_failure(self) -> bool {
        matches!(self, Self::HwPoison | Self::SoftOffline)
    }

    /// Whether the behavior may be applied to another process' address space.
    #[must_use]
    pub const fn is_remote_allowed(self) -> bool {
        matches!(self, Self::Cold | Self::Pageout | Self::WillNeed | Self::Collapse)
    }

    /// Behaviors that throw away anonymous memory contents and are therefore
    /// refused on sealed read-only anonymous mappings.
    #[must_use]
    pub const fn is_discard(self) -> bool {
        matches!(
            self,
            Self::Free
                | Self::DontNeed
                | Self::DontNeedLocked
                | Self::Remove
                | Self::DontFork
                | Self::WipeOnFork
                | Self::GuardInstall
        )
    }

    /// Behaviors that only change attributes of the mapping.
    #[must_use]
    pub const fn is_flag_update(self) -> bool {
        matches!(
            self,
            Self::Normal
                | Self::Random
                | Self::Sequential
                | Self::DontFork
                | Self::DoFork
                | Self::Mergeable
                | Self::Unmergeable
                | Self::HugePage
                | Self::NoHugePage
                | Self::DontDump
                | Self::DoDump
                | Self::WipeOnFork
                | Self::KeepOnFork
        )
    }
}

impl TryFrom<i32> for Behavior {
    type Error = AdviseError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or(AdviseError::InvalidArgument)
    }
}

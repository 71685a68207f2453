use core::sync::atomic::{AtomicIsize, Ordering};

/// Which resident-set counter to adjust.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RssKind {
    /// Present anonymous pages.
    Anon,
    /// Present page-cache pages.
    File,
    /// Swap entries.
    Swap,
}

/// Per-address-space page accounting.
#[derive(Debug, Default)]
pub struct RssCounters {
    anon: AtomicIsize,
    file: AtomicIsize,
    swap: AtomicIsize,
}

impl RssCounters {
    const fn counter(&self, kind: RssKind) -> &AtomicIsize {
        match kind {
            RssKind::Anon => &self.anon,
            RssKind::File => &self.file,
            RssKind::Swap => &self.swap,
        }
    }

    #[inline]
    pub fn add(&self, kind: RssKind, delta: isize) {
        if delta != 0 {
            self.counter(kind).fetch_add(delta, Ordering::Relaxed);
        }
    }

    #[inline]
    #[must_use]
    pub fn get(&self, kind: RssKind) -> isize {
        self.counter(kind).load(Ordering::Relaxed)
    }

    /// The counter a present page of `folio` is accounted to.
    #[inline]
    #[must_use]
    pub fn kind_of(folio: &crate::Folio) -> RssKind {
        if folio.is_anon() { RssKind::Anon } else { RssKind::File }
    }
}

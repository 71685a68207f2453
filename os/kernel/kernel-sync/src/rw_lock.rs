use core::{
    cell::UnsafeCell,
    num::Wrapping,
    ops::{Deref, DerefMut},
    panic::Location,
    sync::atomic::{AtomicI64, Ordering},
};

use log::warn;

/// Readers back off and repair the state once a writer's bias has been eaten
/// this far into by failed optimistic increments.
const RELOAD_LIMIT: i64 = i64::MIN / 2;

/// A spinning reader/writer lock.
///
/// The state word encodes the holders:
///
/// * `0`: unlocked
/// * `> 0`: number of readers
/// * `< 0`: write-locked (biased by [`i64::MIN`])
pub struct RwLock<T> {
    state: AtomicI64,
    cell: UnsafeCell<T>,
}

// Safety: readers share `&T` across threads, writers hand out `&mut T`.
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicI64::new(0),
            cell: UnsafeCell::new(value),
        }
    }

    /// Try to take a shared guard without spinning.
    #[inline]
    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        // Optimistically register as a reader. A writer keeps the state so far
        // below zero that the stray increments cannot flip its sign before
        // `reload` restores the bias.
        let value = self.state.fetch_add(1, Ordering::Acquire);
        match value {
            0.. => Some(ReadGuard { lock: self }),
            ..=RELOAD_LIMIT => {
                self.reload();
                None
            }
            _ => None,
        }
    }

    #[inline(never)]
    #[cold]
    fn reload(&self) {
        let mut value = self.state.load(Ordering::Relaxed);
        loop {
            core::hint::spin_loop();

            if !(..=RELOAD_LIMIT).contains(&value) {
                break;
            }
            match self.state.compare_exchange(
                value,
                i64::MIN,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(new_value) => value = new_value,
            }
        }
    }

    /// Take the lock shared, spinning while a writer holds it.
    #[inline]
    #[track_caller]
    pub fn read(&self) -> ReadGuard<'_, T> {
        if let Some(guard) = self.try_read() {
            return guard;
        }
        self.read_slow_path()
    }

    #[inline(never)]
    #[cold]
    #[track_caller]
    fn read_slow_path(&self) -> ReadGuard<'_, T> {
        let mut counter = Wrapping(0u32);
        loop {
            core::hint::spin_loop();

            if let Some(guard) = self.try_read() {
                return guard;
            }
            counter += 1;
            if counter.0 == 0 {
                warn!("read lock stalling at {}", Location::caller());
            }
        }
    }

    /// Try to take the lock exclusively without spinning.
    #[inline]
    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        self.state
            .compare_exchange(0, i64::MIN, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| WriteGuard { lock: self })
    }

    /// Take the lock exclusively, spinning until all readers are gone.
    #[inline]
    #[track_caller]
    pub fn write(&self) -> WriteGuard<'_, T> {
        match self.write_killable(|| false) {
            Some(guard) => guard,
            None => unreachable!("write lock acquisition cannot be cancelled"),
        }
    }

    /// Take the lock exclusively unless `killed` reports a pending fatal
    /// signal while waiting. Returns `None` if the wait was abandoned.
    #[inline]
    #[track_caller]
    pub fn write_killable(&self, killed: impl Fn() -> bool) -> Option<WriteGuard<'_, T>> {
        if let Some(guard) = self.try_write() {
            return Some(guard);
        }
        self.write_slow_path(&killed)
    }

    #[inline(never)]
    #[cold]
    #[track_caller]
    fn write_slow_path(&self, killed: &dyn Fn() -> bool) -> Option<WriteGuard<'_, T>> {
        let mut counter = Wrapping(0u32);
        loop {
            core::hint::spin_loop();

            if let Some(guard) = self.try_write() {
                return Some(guard);
            }
            if killed() {
                return None;
            }
            counter += 1;
            if counter.0 == 0 {
                warn!("write lock stalling at {}", Location::caller());
            }
        }
    }

    /// Number of readers currently holding the lock, or `None` if a writer does.
    #[must_use]
    pub fn readers(&self) -> Option<usize> {
        usize::try_from(self.state.load(Ordering::Relaxed)).ok()
    }

    /// Get a mutable reference to the contained value.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }
}

/// Shared access to an [`RwLock`].
pub struct ReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.cell.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

/// Exclusive access to an [`RwLock`].
pub struct WriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.cell.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.cell.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

/// The single reader-writer lock guarding a cache.
///
/// Heap regions use an ordinary `parking_lot::RwLock`. Mapped regions use a
/// spinning reader-writer lock stored in the header's lock word, so every
/// process that maps the file contends on the same word:
///
///   bit 31      writer holds the lock
///   bit 30      a writer is waiting; new readers back off
///   bits 0..30  number of active readers
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const WRITER: u32 = 1 << 31;
const WRITER_WAITING: u32 = 1 << 30;

/// Spins before yielding the thread while waiting.
const SPIN_LIMIT: u32 = 128;

/// A reader-writer spinlock living in shared memory.
pub struct ShmRwLock {
    word: *const AtomicU32,
}

unsafe impl Send for ShmRwLock {}
unsafe impl Sync for ShmRwLock {}

impl ShmRwLock {
    /// Attach to the lock word at `word`.
    ///
    /// # Safety
    /// `word` must stay valid for the lifetime of the lock and only be
    /// touched through `ShmRwLock`.
    pub unsafe fn from_existing(word: *const AtomicU32) -> Self {
        ShmRwLock { word }
    }

    fn word(&self) -> &AtomicU32 {
        unsafe { &*self.word }
    }

    pub fn read_lock(&self) {
        let word = self.word();
        let mut spins = 0;
        loop {
            let state = word.load(Ordering::Relaxed);
            if state & (WRITER | WRITER_WAITING) == 0
                && word
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            backoff(&mut spins);
        }
    }

    pub fn read_unlock(&self) {
        self.word().fetch_sub(1, Ordering::Release);
    }

    /// TTAS: spin on a plain load until free, then try to take it. While
    /// readers are still in, the waiting bit keeps new ones out.
    pub fn write_lock(&self) {
        let word = self.word();
        let mut spins = 0;
        loop {
            let state = word.load(Ordering::Relaxed);
            if state & !WRITER_WAITING == 0 {
                if word
                    .compare_exchange_weak(state, WRITER, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            if state & WRITER_WAITING == 0 {
                word.fetch_or(WRITER_WAITING, Ordering::Relaxed);
            }
            backoff(&mut spins);
        }
    }

    /// Also clears the waiting bit; writers still spinning set it again.
    pub fn write_unlock(&self) {
        self.word().store(0, Ordering::Release);
    }
}

#[inline]
fn backoff(spins: &mut u32) {
    if *spins < SPIN_LIMIT {
        *spins += 1;
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

/// The engine lock, in whichever flavour the region needs.
pub enum EngineLock {
    Local(RwLock<()>),
    Shared(ShmRwLock),
}

impl EngineLock {
    pub fn read(&self) -> ReadGuard<'_> {
        match self {
            EngineLock::Local(lock) => ReadGuard::Local(lock.read()),
            EngineLock::Shared(lock) => {
                lock.read_lock();
                ReadGuard::Shared(lock)
            }
        }
    }

    pub fn write(&self) -> WriteGuard<'_> {
        match self {
            EngineLock::Local(lock) => WriteGuard::Local(lock.write()),
            EngineLock::Shared(lock) => {
                lock.write_lock();
                WriteGuard::Shared(lock)
            }
        }
    }
}

#[must_use]
pub enum ReadGuard<'a> {
    Local(#[allow(dead_code)] RwLockReadGuard<'a, ()>),
    Shared(&'a ShmRwLock),
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let ReadGuard::Shared(lock) = self {
            lock.read_unlock();
        }
    }
}

#[must_use]
pub enum WriteGuard<'a> {
    Local(#[allow(dead_code)] RwLockWriteGuard<'a, ()>),
    Shared(&'a ShmRwLock),
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let WriteGuard::Shared(lock) = self {
            lock.write_unlock();
        }
    }
}

//! Cross-process wake primitives built on the Linux futex syscall.
//!
//! Every blocking operation in the crate parks on a 32-bit word placed
//! inside the shared region. The `FUTEX_PRIVATE_FLAG` is deliberately not
//! used: waiters and wakers live in different processes.
//!
//! Callers must follow the lost-wake discipline: snapshot the word, re-check
//! the condition that decides whether to sleep, then wait on the snapshot.
//! A waker that changes the word between snapshot and wait makes the wait
//! return immediately with [`WaitOutcome::ValueChanged`].

use nix::errno::Errno;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Woken by a `wake` call, a signal, or spuriously.
    Woken,
    /// The word no longer held the expected value; the caller should
    /// re-check its condition without sleeping.
    ValueChanged,
    TimedOut,
}

fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> io::Result<WaitOutcome> {
    let ts;
    let ts_ptr = match timeout {
        Some(t) => {
            ts = libc::timespec {
                tv_sec: t.as_secs() as libc::time_t,
                tv_nsec: t.subsec_nanos() as libc::c_long,
            };
            &ts as *const libc::timespec
        }
        None => std::ptr::null(),
    };

    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0u32,
        )
    };

    if rc == 0 {
        return Ok(WaitOutcome::Woken);
    }
    match Errno::last() {
        Errno::EAGAIN => Ok(WaitOutcome::ValueChanged),
        // A signal interrupted the wait; the protocol loops re-check anyway.
        Errno::EINTR => Ok(WaitOutcome::Woken),
        Errno::ETIMEDOUT => Ok(WaitOutcome::TimedOut),
        errno => Err(io::Error::from_raw_os_error(errno as i32)),
    }
}

fn futex_wake(word: &AtomicU32, count: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

/// A 32-bit futex word living in shared memory.
#[repr(transparent)]
#[derive(Default)]
pub(crate) struct WaitWord {
    value: AtomicU32,
}

impl WaitWord {
    pub fn load(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    pub fn set(&self, value: u32) {
        self.value.store(value, Ordering::Release);
    }

    /// Advance the word so that pending snapshots go stale.
    pub fn bump(&self) {
        self.value.fetch_add(1, Ordering::AcqRel);
    }

    pub fn wait(&self, expected: u32, timeout: Option<Duration>) -> io::Result<WaitOutcome> {
        futex_wait(&self.value, expected, timeout)
    }

    pub fn wake(&self, count: i32) {
        futex_wake(&self.value, count);
    }

    pub fn wake_all(&self) {
        futex_wake(&self.value, i32::MAX);
    }
}

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// A process-shared mutex backed by a futex word, used to serialise
/// writers on the message slot.
///
/// Three states keep the uncontended paths to a single atomic operation:
/// unlocked, locked with no waiters, and locked with at least one waiter
/// parked on the futex.
#[repr(transparent)]
#[derive(Default)]
pub(crate) struct RegionMutex {
    state: AtomicU32,
}

impl RegionMutex {
    pub fn lock(&self) -> RegionMutexGuard<'_> {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.lock_contended();
        }
        RegionMutexGuard { lock: self }
    }

    #[cold]
    fn lock_contended(&self) {
        let mut state = self.spin();

        if state == UNLOCKED {
            match self.state.compare_exchange(
                UNLOCKED,
                LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => state = observed,
            }
        }

        loop {
            // Mark the lock contended, unless it already is; taking it from
            // UNLOCKED to CONTENDED acquires it directly.
            if state != CONTENDED && self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }

            let _ = futex_wait(&self.state, CONTENDED, None);
            state = self.spin();
        }
    }

    fn spin(&self) -> u32 {
        let mut spin = 100;
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state != LOCKED || spin == 0 {
                return state;
            }
            std::hint::spin_loop();
            spin -= 1;
        }
    }

    fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            // One waiter is enough: whoever wins will re-mark the lock
            // contended and keep the wake chain going.
            futex_wake(&self.state, 1);
        }
    }
}

pub(crate) struct RegionMutexGuard<'a> {
    lock: &'a RegionMutex,
}

impl Drop for RegionMutexGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

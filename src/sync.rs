//! Process-shared mutex and condition variable that live inside the control
//! block.
//!
//! Both primitives are a single `AtomicU32` and carry no pointers, so they stay
//! valid no matter where each process maps the region. Blocking goes through
//! the shared (non-private) futex on Linux, which the kernel keys on the
//! physical page, so a waiter in one mapping is woken by a notifier in another.
//! Other platforms fall back to bounded polling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

const SPIN_LIMIT: u32 = 64;

/// Result of a timed wait on [`ShmCondvar`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The condition variable was signalled while waiting.
    Notified,
    /// The timeout elapsed with no signal.
    TimedOut,
    /// The mutex could not be taken back in time, most likely because the
    /// peer died holding it. The guard no longer holds the lock.
    LockLost,
}

impl WaitOutcome {
    /// Whether the wait ended without a signal.
    pub fn timed_out(self) -> bool {
        matches!(self, WaitOutcome::TimedOut | WaitOutcome::LockLost)
    }
}

/// Three-state futex mutex usable from any mapping of the shared region.
#[repr(C)]
pub struct ShmMutex {
    state: AtomicU32,
}

const _: () = assert!(core::mem::size_of::<ShmMutex>() == 4);

impl ShmMutex {
    /// Unlocked mutex, suitable for in-place construction.
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }

    /// Acquire without blocking. `None` means another holder has it; try later.
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmMutexGuard::held(self))
    }

    /// Acquire, blocking for as long as the other holder keeps the lock.
    ///
    /// Real-time callers should use [`try_lock`](Self::try_lock) instead.
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        self.acquire(None);
        ShmMutexGuard::held(self)
    }

    /// Acquire, giving up once `timeout` has elapsed.
    ///
    /// Bounds the damage when the peer died while holding the lock.
    pub fn lock_timeout(&self, timeout: Duration) -> Option<ShmMutexGuard<'_>> {
        let deadline = Instant::now() + timeout;
        if self.acquire(Some(deadline)) {
            Some(ShmMutexGuard::held(self))
        } else {
            None
        }
    }

    /// Whether some process currently holds the lock. Advisory only.
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }

    fn acquire(&self, deadline: Option<Instant>) -> bool {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return true;
        }

        for _ in 0..SPIN_LIMIT {
            std::hint::spin_loop();
            if self.state.load(Ordering::Relaxed) == UNLOCKED
                && self
                    .state
                    .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return true;
            }
        }

        loop {
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return true;
            }
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            futex_wait(&self.state, CONTENDED, remaining);
        }
    }

    fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            futex_wake(&self.state, 1);
        }
    }
}

impl Default for ShmMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for [`ShmMutex`]; releases on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
    held: bool,
}

impl<'a> ShmMutexGuard<'a> {
    fn held(mutex: &'a ShmMutex) -> Self {
        Self { mutex, held: true }
    }

    /// False once a condition wait failed to re-acquire the mutex.
    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            self.mutex.unlock();
        }
    }
}

/// Sequence-counter condition variable paired with a [`ShmMutex`].
#[repr(C)]
pub struct ShmCondvar {
    seq: AtomicU32,
}

const _: () = assert!(core::mem::size_of::<ShmCondvar>() == 4);

impl ShmCondvar {
    /// Fresh condition variable, suitable for in-place construction.
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
        }
    }

    /// Wake one waiter. Does not require the lock.
    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake(&self.seq, 1);
    }

    /// Wake every waiter. Does not require the lock.
    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        futex_wake(&self.seq, i32::MAX as u32);
    }

    /// Release `guard`'s mutex, sleep until signalled or `timeout` elapses,
    /// then re-acquire, spending at most another `timeout` on it. Returns
    /// [`WaitOutcome::LockLost`] without sleeping if the guard is not held.
    ///
    /// A signal only means "something changed"; callers re-check their own
    /// condition after every return.
    pub fn wait_timeout(&self, guard: &mut ShmMutexGuard<'_>, timeout: Duration) -> WaitOutcome {
        if !guard.held {
            return WaitOutcome::LockLost;
        }
        let seq = self.seq.load(Ordering::Acquire);
        let deadline = Instant::now() + timeout;

        guard.mutex.unlock();
        let outcome = loop {
            if self.seq.load(Ordering::Acquire) != seq {
                break WaitOutcome::Notified;
            }
            let now = Instant::now();
            if now >= deadline {
                break WaitOutcome::TimedOut;
            }
            futex_wait(&self.seq, seq, Some(deadline - now));
        };
        if !guard.mutex.acquire(Some(Instant::now() + timeout)) {
            guard.held = false;
            return WaitOutcome::LockLost;
        }
        outcome
    }

    /// Current sequence value, for diagnostics.
    pub fn sequence(&self) -> u32 {
        self.seq.load(Ordering::Relaxed)
    }
}

impl Default for ShmCondvar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let timespec = timeout.map(|timeout| libc::timespec {
        tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    });
    let timespec_ptr = timespec
        .as_ref()
        .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);
    // Shared futex: no FUTEX_PRIVATE_FLAG, so other mappings of the page see it.
    // EAGAIN, EINTR and ETIMEDOUT all just return; callers re-check the word.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            timespec_ptr,
            std::ptr::null::<u32>(),
            0u32,
        );
    }
}

#[cfg(target_os = "linux")]
fn futex_wake(word: &AtomicU32, waiters: u32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            waiters.min(i32::MAX as u32) as libc::c_int,
        );
    }
}

#[cfg(not(target_os = "linux"))]
const POLL_INTERVAL: Duration = Duration::from_micros(200);

#[cfg(not(target_os = "linux"))]
fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let deadline = timeout.map(|t| Instant::now() + t);
    while word.load(Ordering::Acquire) == expected {
        let nap = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return;
                }
                (deadline - now).min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };
        std::thread::sleep(nap);
    }
}

#[cfg(not(target_os = "linux"))]
fn futex_wake(_word: &AtomicU32, _waiters: u32) {}

//! Channel lifecycle: stall budgets, state derived from the flag bits, and the
//! capture-side restore handshake.
//!
//! ```text
//! Constructed -> Active -> { Underrun | Disabled } -> Active (restart)
//!                       \-> Invalid (terminal)
//! ```

use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::CblkError;
use crate::cblk::{ControlBlock, PEER_LOCK_TIMEOUT};
use crate::packed::CblkFlags;
use crate::sync::WaitOutcome;

/// Timeout budgets. Every value can be overridden; none is baked into the
/// protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Cumulated client wait allowed before the server has taken any frames.
    /// Longer than the steady-state budget to absorb cold-start latency.
    pub startup_timeout_ms: u16,
    /// Cumulated client wait allowed once the channel is running.
    pub run_timeout_ms: u16,
    /// Length of one wait on the condition variable.
    pub wait_period_ms: u16,
    /// How long a capture client waits for another thread's restore.
    pub restore_timeout_ms: u32,
    /// Consecutive unready server ticks before the channel is disabled.
    pub max_underruns_before_disable: u32,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            startup_timeout_ms: 3_000,
            run_timeout_ms: 1_000,
            wait_period_ms: 10,
            restore_timeout_ms: 5_000,
            max_underruns_before_disable: 3,
        }
    }
}

impl TimeoutPolicy {
    /// Defaults, overridden by any of `CBLK_STARTUP_TIMEOUT_MS`,
    /// `CBLK_RUN_TIMEOUT_MS`, `CBLK_WAIT_PERIOD_MS`, `CBLK_RESTORE_TIMEOUT_MS`
    /// and `CBLK_MAX_UNDERRUNS` that parse.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            startup_timeout_ms: env_override(
                "CBLK_STARTUP_TIMEOUT_MS",
                defaults.startup_timeout_ms,
            ),
            run_timeout_ms: env_override("CBLK_RUN_TIMEOUT_MS", defaults.run_timeout_ms),
            wait_period_ms: env_override("CBLK_WAIT_PERIOD_MS", defaults.wait_period_ms),
            restore_timeout_ms: env_override(
                "CBLK_RESTORE_TIMEOUT_MS",
                defaults.restore_timeout_ms,
            ),
            max_underruns_before_disable: env_override(
                "CBLK_MAX_UNDERRUNS",
                defaults.max_underruns_before_disable,
            ),
        }
    }

    /// Set the startup budget.
    pub fn with_startup_timeout_ms(mut self, ms: u16) -> Self {
        self.startup_timeout_ms = ms;
        self
    }

    /// Set the steady-state budget.
    pub fn with_run_timeout_ms(mut self, ms: u16) -> Self {
        self.run_timeout_ms = ms;
        self
    }

    /// Set the per-wait period.
    pub fn with_wait_period_ms(mut self, ms: u16) -> Self {
        self.wait_period_ms = ms.max(1);
        self
    }

    /// Set the restore timeout.
    pub fn with_restore_timeout_ms(mut self, ms: u32) -> Self {
        self.restore_timeout_ms = ms;
        self
    }

    /// Set how many consecutive underruns disable the channel.
    pub fn with_max_underruns(mut self, count: u32) -> Self {
        self.max_underruns_before_disable = count.max(1);
        self
    }

    /// One wait period as a `Duration`.
    pub fn wait_period(&self) -> Duration {
        Duration::from_millis(self.wait_period_ms as u64)
    }
}

fn env_override<T: FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(variable = name, value = %raw, "ignoring unparsable timeout override");
                default
            }
        },
        Err(_) => default,
    }
}

/// Lifecycle state as seen through the flag bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackState {
    /// Built, but the server has not consumed or produced anything yet.
    Constructed,
    /// Normal operation.
    Active,
    /// Producer (playback) or consumer (capture) fell behind.
    Underrun,
    /// Server stopped servicing the channel until it is restarted.
    Disabled,
    /// A capture client is re-creating the channel.
    Restoring,
    /// Terminal; the channel must be re-created.
    Invalid,
}

impl TrackState {
    /// Derive the state from a flag snapshot.
    pub fn from_flags(flags: CblkFlags) -> Self {
        if flags.contains(CblkFlags::INVALID) {
            TrackState::Invalid
        } else if flags.contains(CblkFlags::RESTORING) {
            TrackState::Restoring
        } else if flags.contains(CblkFlags::DISABLED) {
            TrackState::Disabled
        } else if flags.contains(CblkFlags::UNDERRUN_OVERRUN) {
            TrackState::Underrun
        } else if !flags.contains(CblkFlags::STARTED) {
            TrackState::Constructed
        } else {
            TrackState::Active
        }
    }

    /// Whether positions may still be trusted.
    pub fn is_usable(self) -> bool {
        !matches!(self, TrackState::Invalid)
    }
}

impl ControlBlock {
    /// Current lifecycle state.
    pub fn state(&self) -> TrackState {
        TrackState::from_flags(self.flags())
    }

    /// Bring a disabled or underrun channel back to service.
    pub fn restart(&self) -> Result<(), CblkError> {
        if self.is_invalid() {
            return Err(CblkError::Invalidated);
        }
        self.clear_flags(CblkFlags::DISABLED | CblkFlags::UNDERRUN_OVERRUN);
        self.set_wait_time_ms(0);
        debug!(name = self.name(), "channel restarted");
        self.notify_progress();
        Ok(())
    }

    /// Claim the restore of an invalidated capture channel.
    ///
    /// Returns `true` for the one caller that should re-create the channel;
    /// everyone else should [`wait_restored`](Self::wait_restored).
    pub fn begin_restore(&self) -> bool {
        let previous = self.set_flags(CblkFlags::RESTORING);
        !previous.contains(CblkFlags::RESTORING)
    }

    /// Publish that the replacement channel exists.
    pub fn complete_restore(&self) {
        {
            let _guard = self.lock_timeout(PEER_LOCK_TIMEOUT);
            self.set_flags(CblkFlags::RESTORED);
            self.clear_flags(CblkFlags::RESTORING);
        }
        self.wake_all();
    }

    /// Wait until another thread has finished restoring this channel.
    pub fn wait_restored(&self, timeout: Duration) -> Result<(), CblkError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock_timeout(timeout).ok_or(CblkError::TimedOut)?;
        loop {
            if self.flags().contains(CblkFlags::RESTORED) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(name = self.name(), "restore did not complete in time");
                return Err(CblkError::TimedOut);
            }
            if self.wait_for_progress(&mut guard, deadline - now) == WaitOutcome::LockLost {
                warn!(name = self.name(), "lock lost while waiting for restore");
                return Err(CblkError::TimedOut);
            }
        }
    }
}

/// Verdict of one [`StallTracker::record_wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stall {
    /// Still within budget; keep waiting.
    Waiting {
        /// Cumulated wait so far.
        waited_ms: u16,
        /// Budget in force.
        budget_ms: u16,
    },
    /// Budget exhausted; retries are halted until [`StallTracker::resume`].
    Exceeded {
        /// Cumulated wait so far.
        waited_ms: u16,
        /// Budget in force.
        budget_ms: u16,
    },
}

/// Client-side stall detection over the block's `buffer_timeout_ms` and
/// `wait_time_ms` accumulators.
#[derive(Debug)]
pub struct StallTracker {
    policy: TimeoutPolicy,
    halted: bool,
}

impl StallTracker {
    /// Tracker enforcing `policy`.
    pub fn new(policy: TimeoutPolicy) -> Self {
        Self {
            policy,
            halted: false,
        }
    }

    /// Budgets in force.
    pub fn policy(&self) -> &TimeoutPolicy {
        &self.policy
    }

    /// Whether a stall was detected and not yet cleared.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Budget for the current phase, switching to the steady-state budget once
    /// the server has taken its first buffer. The client's policy wins over
    /// the value written at construction; the block mirrors whichever applies.
    pub fn budget_ms(&self, cblk: &ControlBlock) -> u16 {
        let budget = if cblk.flags().contains(CblkFlags::STARTED) {
            self.policy.run_timeout_ms
        } else {
            self.policy.startup_timeout_ms
        };
        if cblk.buffer_timeout_ms() != budget {
            cblk.set_buffer_timeout_ms(budget);
        }
        budget
    }

    /// Account for a wait that ended without progress.
    pub fn record_wait(&mut self, cblk: &ControlBlock, waited: Duration) -> Stall {
        let budget_ms = self.budget_ms(cblk);
        let step = waited.as_millis().min(u16::MAX as u128) as u16;
        let waited_ms = cblk.wait_time_ms().saturating_add(step);
        cblk.set_wait_time_ms(waited_ms);

        if self.halted || waited_ms >= budget_ms {
            if !self.halted {
                self.halted = true;
                cblk.set_flags(CblkFlags::UNDERRUN_OVERRUN);
                warn!(
                    name = cblk.name(),
                    waited_ms, budget_ms, "peer stalled past budget, halting retries"
                );
            }
            Stall::Exceeded {
                waited_ms,
                budget_ms,
            }
        } else {
            Stall::Waiting {
                waited_ms,
                budget_ms,
            }
        }
    }

    /// The peer made progress; forget accumulated wait time.
    pub fn record_progress(&mut self, cblk: &ControlBlock) {
        if cblk.wait_time_ms() != 0 {
            cblk.set_wait_time_ms(0);
        }
    }

    /// Explicitly clear a detected stall so waits may resume.
    pub fn resume(&mut self, cblk: &ControlBlock) {
        self.halted = false;
        cblk.set_wait_time_ms(0);
        cblk.clear_flags(CblkFlags::UNDERRUN_OVERRUN);
        debug!(name = cblk.name(), "stall cleared, resuming");
    }
}

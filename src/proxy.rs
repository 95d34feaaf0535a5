//! Per-side endpoints over a [`Track`].
//!
//! The client proxy may sleep on the shared condition variable and escalates
//! through its [`StallTracker`]; the server proxy never blocks and never takes
//! the lock on its obtain/release path.

use std::time::{Duration, Instant};

use dasp_frame::Frame;
use tracing::{debug, warn};

use crate::cblk::ControlBlock;
use crate::lifecycle::{Stall, StallTracker, TimeoutPolicy};
use crate::packed::{CblkFlags, VolumeLR};
use crate::region::Track;
use crate::{CblkError, Direction, Side};

/// Application-side endpoint.
pub struct ClientProxy<'a> {
    track: Track<'a>,
    direction: Direction,
    stall: StallTracker,
}

impl<'a> ClientProxy<'a> {
    /// Client endpoint for `direction`, enforcing `policy`.
    pub fn new(track: Track<'a>, direction: Direction, policy: TimeoutPolicy) -> Self {
        Self {
            track,
            direction,
            stall: StallTracker::new(policy),
        }
    }

    /// The shared block.
    pub fn control_block(&self) -> &'a ControlBlock {
        self.track.control_block()
    }

    /// Flow direction of this channel.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Stall state for this endpoint.
    pub fn stall_tracker(&self) -> &StallTracker {
        &self.stall
    }

    /// Frames the client may touch without waiting.
    pub fn frames_available(&self) -> Result<u32, CblkError> {
        self.control_block()
            .frames_available(self.direction, Side::Client)
    }

    fn check_usable(&self) -> Result<(), CblkError> {
        let flags = self.control_block().flags();
        if flags.contains(CblkFlags::INVALID) {
            return Err(CblkError::Invalidated);
        }
        if flags.contains(CblkFlags::DISABLED) {
            return Err(CblkError::Disabled);
        }
        Ok(())
    }

    /// Wait until at least one frame is available and return how many may be
    /// used, capped at `requested`.
    ///
    /// With `blocking == false` an empty ring yields [`CblkError::WouldBlock`].
    /// Blocking waits are accounted against the stall budget; once it is spent
    /// this returns [`CblkError::TimedOut`] until [`resume`](Self::resume).
    pub fn obtain_buffer(&mut self, requested: u32, blocking: bool) -> Result<u32, CblkError> {
        if requested == 0 {
            return Ok(0);
        }
        let cblk = self.control_block();
        let period = self.stall.policy().wait_period();
        loop {
            self.check_usable()?;
            let available = self.frames_available()?;
            if available > 0 {
                self.stall.record_progress(cblk);
                return Ok(available.min(requested));
            }
            if !blocking {
                return Err(CblkError::WouldBlock);
            }
            if self.stall.is_halted() {
                return Err(CblkError::TimedOut);
            }

            let started = Instant::now();
            let timed_out = match cblk.lock_timeout(period) {
                Some(mut guard) => {
                    // Re-check under the lock so a notify between the first
                    // check and the sleep is not lost.
                    if cblk.is_invalid() || self.frames_available()? > 0 {
                        continue;
                    }
                    cblk.wait_for_progress(&mut guard, period).timed_out()
                }
                None => {
                    debug!(name = cblk.name(), "lock busy while waiting for the server");
                    true
                }
            };
            if timed_out {
                if let Stall::Exceeded { waited_ms, .. } =
                    self.stall.record_wait(cblk, started.elapsed())
                {
                    debug!(waited_ms, "giving up on obtain_buffer");
                    return Err(CblkError::TimedOut);
                }
            }
        }
    }

    /// Publish (playback) or release (capture) `frames` frames.
    pub fn release_buffer(&mut self, frames: u32) -> Result<u32, CblkError> {
        self.control_block().step_user(self.direction, frames)
    }

    /// Write every frame of `frames` into a playback ring, waiting for space
    /// as needed. Returns frames written, which is short only when the stall
    /// budget ran out part way.
    pub fn write<F: Frame>(&mut self, frames: &[F]) -> Result<usize, CblkError> {
        if self.direction != Direction::Output {
            return Err(CblkError::InvalidConfig("write on a capture channel"));
        }
        let mut written = 0;
        while written < frames.len() {
            let wanted = (frames.len() - written).min(u32::MAX as usize) as u32;
            match self.obtain_buffer(wanted, true) {
                Ok(_) => {}
                Err(CblkError::TimedOut) if written > 0 => break,
                Err(err) => return Err(err),
            }
            written += self.track.produce(self.direction, &frames[written..])?;
        }
        Ok(written)
    }

    /// Fill `out` from a capture ring, waiting for data as needed. Returns
    /// frames read.
    pub fn read<F: Frame>(&mut self, out: &mut [F]) -> Result<usize, CblkError> {
        if self.direction != Direction::Input {
            return Err(CblkError::InvalidConfig("read on a playback channel"));
        }
        let mut read = 0;
        while read < out.len() {
            let wanted = (out.len() - read).min(u32::MAX as usize) as u32;
            match self.obtain_buffer(wanted, true) {
                Ok(_) => {}
                Err(CblkError::TimedOut) if read > 0 => break,
                Err(err) => return Err(err),
            }
            read += self.track.consume(self.direction, &mut out[read..])?;
        }
        Ok(read)
    }

    /// Set both channel gains as one unit.
    pub fn set_volume(&self, left: f32, right: f32) {
        self.control_block()
            .set_volume_lr(VolumeLR::from_gains(left, right));
    }

    /// Set the auxiliary send level.
    pub fn set_send_level(&self, level: f32) {
        self.control_block().set_send_level(level);
    }

    /// Replay `start..end` of a playback ring `count` more times.
    pub fn set_loop(&self, start: u32, end: u32, count: i32) -> Result<(), CblkError> {
        if self.direction != Direction::Output {
            return Err(CblkError::InvalidLoop("loops apply to playback only"));
        }
        let cblk = self.control_block();
        let guard = cblk.lock();
        cblk.set_loop(&guard, start, end, count)
    }

    /// Stop looping once the current lap is done.
    pub fn clear_loop(&self) {
        let cblk = self.control_block();
        let guard = cblk.lock();
        cblk.clear_loop(&guard);
    }

    /// Ask the server to start consuming before the ring is full.
    pub fn force_ready(&self) {
        self.control_block().set_flags(CblkFlags::FORCE_READY);
        self.control_block().notify_progress();
    }

    /// Clear a detected stall so waits may resume.
    pub fn resume(&mut self) {
        self.stall.resume(self.track.control_block());
    }

    /// Bring a disabled channel back and clear any local stall.
    pub fn restart(&mut self) -> Result<(), CblkError> {
        let cblk = self.control_block();
        cblk.restart()?;
        self.stall.resume(cblk);
        Ok(())
    }

    /// Restore an invalidated capture channel.
    ///
    /// Exactly one caller runs `recreate` and gets `Some`; concurrent callers
    /// wait for it and get `None`.
    pub fn restore<T>(
        &self,
        recreate: impl FnOnce() -> Result<T, CblkError>,
    ) -> Result<Option<T>, CblkError> {
        let cblk = self.control_block();
        if self.direction != Direction::Input {
            return Err(CblkError::InvalidConfig("restore applies to capture only"));
        }
        if cblk.begin_restore() {
            let restored = recreate();
            // Waiters must not hang even when re-creation failed.
            cblk.complete_restore();
            restored.map(Some)
        } else {
            let timeout = Duration::from_millis(self.stall.policy().restore_timeout_ms as u64);
            cblk.wait_restored(timeout)?;
            Ok(None)
        }
    }
}

/// Contiguous run handed to the server's mix or capture step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerBuffer {
    /// First ring slot of the run.
    pub slot: u32,
    /// Frames in the run.
    pub frames: u32,
}

/// Mixer or capture thread endpoint. Never blocks.
pub struct ServerProxy<'a> {
    track: Track<'a>,
    direction: Direction,
    policy: TimeoutPolicy,
    underruns: u32,
}

impl<'a> ServerProxy<'a> {
    /// Server endpoint for `direction`.
    pub fn new(track: Track<'a>, direction: Direction, policy: TimeoutPolicy) -> Self {
        Self {
            track,
            direction,
            policy,
            underruns: 0,
        }
    }

    /// The shared block.
    pub fn control_block(&self) -> &'a ControlBlock {
        self.track.control_block()
    }

    /// Process-local view of the ring.
    pub fn track(&self) -> &Track<'a> {
        &self.track
    }

    /// Consecutive unready ticks since the last successful one.
    pub fn underruns(&self) -> u32 {
        self.underruns
    }

    /// Whether a playback channel has enough data to start mixing: a full
    /// ring, or the client asked for an early start. Capture is always ready.
    pub fn is_ready(&self) -> bool {
        let cblk = self.control_block();
        if self.direction == Direction::Input {
            return true;
        }
        let flags = cblk.flags();
        if flags.contains(CblkFlags::STARTED) || flags.contains(CblkFlags::FORCE_READY) {
            return true;
        }
        matches!(cblk.frames_ready(Direction::Output), Ok(ready) if ready >= cblk.frame_count())
    }

    /// Next contiguous run the server may consume (playback) or fill
    /// (capture), capped at `requested`.
    ///
    /// Returns [`CblkError::WouldBlock`] when nothing is available; for
    /// playback that tick also counts toward disabling the channel.
    pub fn get_next_buffer(&mut self, requested: u32) -> Result<ServerBuffer, CblkError> {
        let cblk = self.control_block();
        let flags = cblk.flags();
        if flags.contains(CblkFlags::INVALID) {
            return Err(CblkError::Invalidated);
        }
        if flags.contains(CblkFlags::DISABLED) {
            return Err(CblkError::Disabled);
        }
        if !self.is_ready() {
            return Err(CblkError::WouldBlock);
        }
        let (slot, run) = cblk.contiguous_run(self.direction, Side::Server)?;
        if run == 0 || requested == 0 {
            if run == 0 && self.direction == Direction::Output {
                self.note_underrun();
            }
            return Err(CblkError::WouldBlock);
        }
        self.underruns = 0;
        Ok(ServerBuffer {
            slot,
            frames: run.min(requested),
        })
    }

    /// Hand back a run obtained from [`get_next_buffer`](Self::get_next_buffer)
    /// and wake the client.
    pub fn release_buffer(&mut self, buffer: ServerBuffer) -> Result<u32, CblkError> {
        self.control_block().step_server(self.direction, buffer.frames)
    }

    /// Copy out of a playback ring. Returns frames mixed; zero on underrun.
    pub fn mix<F: Frame>(&mut self, out: &mut [F]) -> Result<usize, CblkError> {
        if self.direction != Direction::Output {
            return Err(CblkError::InvalidConfig("mix on a capture channel"));
        }
        self.transfer(|track, direction| track.consume(direction, out))
    }

    /// Copy into a capture ring. Returns frames captured; short when the
    /// client has not drained the ring.
    pub fn capture<F: Frame>(&mut self, frames: &[F]) -> Result<usize, CblkError> {
        if self.direction != Direction::Input {
            return Err(CblkError::InvalidConfig("capture on a playback channel"));
        }
        let done = self.transfer(|track, direction| track.produce(direction, frames))?;
        if done < frames.len() {
            // Capture overrun: the client is not draining.
            self.control_block().set_flags(CblkFlags::UNDERRUN_OVERRUN);
        }
        Ok(done)
    }

    fn transfer(
        &mut self,
        copy: impl FnOnce(&Track<'a>, Direction) -> Result<usize, CblkError>,
    ) -> Result<usize, CblkError> {
        match self.get_next_buffer(u32::MAX) {
            Ok(_) => {}
            Err(CblkError::WouldBlock) => return Ok(0),
            Err(err) => return Err(err),
        }
        let done = copy(&self.track, self.direction)?;
        self.control_block().notify_progress();
        Ok(done)
    }

    fn note_underrun(&mut self) {
        let cblk = self.control_block();
        if !cblk.flags().contains(CblkFlags::STARTED) {
            return;
        }
        self.underruns += 1;
        if self.underruns >= self.policy.max_underruns_before_disable {
            let previous = cblk.set_flags(CblkFlags::DISABLED);
            if !previous.contains(CblkFlags::DISABLED) {
                warn!(
                    name = cblk.name(),
                    underruns = self.underruns,
                    "client kept missing its deadline, disabling channel"
                );
            }
            cblk.notify_progress();
        }
    }

    /// Clear `DISABLED` and the underrun count.
    pub fn restart(&mut self) -> Result<(), CblkError> {
        self.underruns = 0;
        self.control_block().restart()
    }

    /// Rewind the ring after a stop.
    pub fn flush(&mut self) {
        let cblk = self.control_block();
        let guard = cblk.lock();
        cblk.flush(&guard);
        drop(guard);
        cblk.clear_flags(CblkFlags::STARTED | CblkFlags::FORCE_READY);
        self.underruns = 0;
    }

    /// Condemn the channel; the client must re-create it.
    pub fn invalidate(&self) {
        self.control_block().invalidate();
    }
}

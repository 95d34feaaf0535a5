//! The control block shared by a client and the audio server.
//!
//! One `ControlBlock` sits at a fixed offset inside a mapping that both
//! processes hold at different virtual addresses. Its layout is part of the
//! contract between them and is pinned by the assertions below. Nothing in it
//! is a pointer, and there is no dispatch table: behaviour that differs between
//! playback and capture is selected with a [`Direction`] argument.
//!
//! | Field | Written by |
//! |---|---|
//! | `lock`, `cv` | both |
//! | `user`, `user_base`, `user_laps` | client |
//! | `server`, `server_base`, `server_laps` | server |
//! | `buffers`, `frame_count`, `sample_rate`, `frame_size`, `name` | server, once, at construction |
//! | `loop_start`, `loop_end`, `loop_count` | client (playback only) |
//! | `volume_lr`, `send_level` | client |
//! | `buffer_timeout_ms`, `wait_time_ms` | client |
//! | `flags` | server, except `UNDERRUN_OVERRUN` (client sets it on a stall and clears it when it steps), `FORCE_READY` (client) and `RESTORING`/`RESTORED` (capture client) |

use std::mem::offset_of;
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::packed::{CblkFlags, UNITY_GAIN_U4_12, VolumeLR, encode_u4_12};
use crate::sync::{ShmCondvar, ShmMutex, ShmMutexGuard, WaitOutcome};
use crate::{CblkError, Direction, Side};

/// `buffers` value meaning the sample storage immediately follows the block.
pub const INLINE_BUFFERS: u64 = u64::MAX;

/// Longest a teardown path waits for the shared lock before acting without it.
pub const PEER_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

/// Default startup budget written into `buffer_timeout_ms` at construction.
pub const DEFAULT_STARTUP_TIMEOUT_MS: u16 = 3_000;

/// Construction parameters, fixed for the life of the block.
#[derive(Clone, Copy, Debug)]
pub struct CblkConfig {
    /// Ring capacity in frames. Must be non-zero.
    pub frame_count: u32,
    /// Stream sample rate in Hz.
    pub sample_rate: u32,
    /// Bytes per frame. Must be non-zero.
    pub frame_size: u8,
    /// Track name for normal tracks, track index for fast tracks.
    pub name: u8,
    /// Where the samples live: [`INLINE_BUFFERS`] or an external region handle.
    pub buffers: u64,
    /// Initial client stall budget, shown until a client publishes its own.
    pub startup_timeout_ms: u16,
}

impl CblkConfig {
    /// Inline-buffer configuration with default startup budget.
    pub fn new(frame_count: u32, sample_rate: u32, frame_size: u8) -> Self {
        Self {
            frame_count,
            sample_rate,
            frame_size,
            name: 0,
            buffers: INLINE_BUFFERS,
            startup_timeout_ms: DEFAULT_STARTUP_TIMEOUT_MS,
        }
    }

    /// Set the channel name/index.
    pub fn with_name(mut self, name: u8) -> Self {
        self.name = name;
        self
    }

    /// Point the block at externally supplied sample storage.
    pub fn with_external_buffers(mut self, handle: u64) -> Self {
        self.buffers = handle;
        self
    }

    /// Override the initial client stall budget.
    pub fn with_startup_timeout_ms(mut self, ms: u16) -> Self {
        self.startup_timeout_ms = ms;
        self
    }

    /// Bytes of sample storage the ring needs.
    pub fn buffer_bytes(&self) -> usize {
        self.frame_count as usize * self.frame_size as usize
    }

    fn validate(&self) -> Result<(), CblkError> {
        if self.frame_count == 0 {
            return Err(CblkError::InvalidConfig("frame_count must be > 0"));
        }
        if self.frame_count > i32::MAX as u32 {
            return Err(CblkError::InvalidConfig("frame_count must fit in 31 bits"));
        }
        if self.frame_size == 0 {
            return Err(CblkError::InvalidConfig("frame_size must be > 0"));
        }
        Ok(())
    }
}

/// Point-in-time copy of both counters and their anchors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Positions {
    /// Client frame counter.
    pub user: u32,
    /// Server frame counter.
    pub server: u32,
    /// Client lap anchor.
    pub user_base: u32,
    /// Server lap anchor.
    pub server_base: u32,
    /// Loop jumps taken by the client counter.
    pub user_laps: u32,
    /// Loop jumps taken by the server counter.
    pub server_laps: u32,
}

/// Loop configuration as currently published.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopState {
    /// First ring index of the repeat region.
    pub start: u32,
    /// Ring index one past the repeat region.
    pub end: u32,
    /// Remaining repeats; negative repeats forever, zero disables the loop.
    pub count: i32,
}

/// Shared control block. See the module docs for the ownership table.
#[repr(C, align(64))]
pub struct ControlBlock {
    lock: ShmMutex,
    cv: ShmCondvar,

    user: AtomicU32,
    server: AtomicU32,
    user_base: AtomicU32,
    server_base: AtomicU32,

    buffers: u64,
    frame_count: u32,

    loop_start: AtomicU32,
    loop_end: AtomicU32,
    loop_count: AtomicI32,

    volume_lr: AtomicU32,
    sample_rate: u32,

    frame_size: u8,
    name: u8,
    buffer_timeout_ms: AtomicU16,
    wait_time_ms: AtomicU16,
    send_level: AtomicU16,

    flags: AtomicU32,
    user_laps: AtomicU32,
    server_laps: AtomicU32,
}

const _: () = {
    assert!(core::mem::size_of::<ControlBlock>() == 128);
    assert!(core::mem::align_of::<ControlBlock>() == 64);
    assert!(offset_of!(ControlBlock, lock) == 0);
    assert!(offset_of!(ControlBlock, cv) == 4);
    assert!(offset_of!(ControlBlock, user) == 8);
    assert!(offset_of!(ControlBlock, server) == 12);
    assert!(offset_of!(ControlBlock, user_base) == 16);
    assert!(offset_of!(ControlBlock, server_base) == 20);
    assert!(offset_of!(ControlBlock, buffers) == 24);
    assert!(offset_of!(ControlBlock, frame_count) == 32);
    assert!(offset_of!(ControlBlock, loop_start) == 36);
    assert!(offset_of!(ControlBlock, loop_end) == 40);
    assert!(offset_of!(ControlBlock, loop_count) == 44);
    assert!(offset_of!(ControlBlock, volume_lr) == 48);
    assert!(offset_of!(ControlBlock, sample_rate) == 52);
    assert!(offset_of!(ControlBlock, frame_size) == 56);
    assert!(offset_of!(ControlBlock, name) == 57);
    assert!(offset_of!(ControlBlock, buffer_timeout_ms) == 58);
    assert!(offset_of!(ControlBlock, wait_time_ms) == 60);
    assert!(offset_of!(ControlBlock, send_level) == 62);
    assert!(offset_of!(ControlBlock, flags) == 64);
    assert!(offset_of!(ControlBlock, user_laps) == 68);
    assert!(offset_of!(ControlBlock, server_laps) == 72);
};

impl ControlBlock {
    /// Build a block by value. Used by in-place construction and by tests that
    /// keep the block on the heap.
    pub fn new(config: CblkConfig) -> Result<Self, CblkError> {
        config.validate()?;
        Ok(Self {
            lock: ShmMutex::new(),
            cv: ShmCondvar::new(),
            user: AtomicU32::new(0),
            server: AtomicU32::new(0),
            user_base: AtomicU32::new(0),
            server_base: AtomicU32::new(0),
            buffers: config.buffers,
            frame_count: config.frame_count,
            loop_start: AtomicU32::new(0),
            loop_end: AtomicU32::new(0),
            loop_count: AtomicI32::new(0),
            volume_lr: AtomicU32::new(VolumeLR::UNITY.bits()),
            sample_rate: config.sample_rate,
            frame_size: config.frame_size,
            name: config.name,
            buffer_timeout_ms: AtomicU16::new(config.startup_timeout_ms),
            wait_time_ms: AtomicU16::new(0),
            send_level: AtomicU16::new(0),
            flags: AtomicU32::new(0),
            user_laps: AtomicU32::new(0),
            server_laps: AtomicU32::new(0),
        })
    }

    /// Construct a block at `ptr`, which must lie in the shared mapping.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `size_of::<ControlBlock>()` bytes,
    /// aligned to 64, and no other process may be using the block yet.
    pub unsafe fn init_in_place(
        ptr: *mut ControlBlock,
        config: CblkConfig,
    ) -> Result<(), CblkError> {
        let block = Self::new(config)?;
        unsafe { ptr.write(block) };
        info!(
            frame_count = config.frame_count,
            sample_rate = config.sample_rate,
            frame_size = config.frame_size,
            name = config.name,
            "control block constructed"
        );
        Ok(())
    }

    /// Ring capacity in frames.
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Bytes per frame.
    pub fn frame_size(&self) -> usize {
        self.frame_size as usize
    }

    /// Stream sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Channel name/index within the server.
    pub fn name(&self) -> u8 {
        self.name
    }

    /// Opaque handle describing where the samples live.
    pub fn buffers_handle(&self) -> u64 {
        self.buffers
    }

    /// Whether the samples immediately follow the block.
    pub fn has_inline_buffers(&self) -> bool {
        self.buffers == INLINE_BUFFERS
    }

    // ---- synchronization -------------------------------------------------

    /// Block until the shared lock is held.
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        self.lock.lock()
    }

    /// Take the shared lock only if it is free right now.
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        self.lock.try_lock()
    }

    /// Take the shared lock, giving up after `timeout`.
    pub fn lock_timeout(&self, timeout: Duration) -> Option<ShmMutexGuard<'_>> {
        self.lock.lock_timeout(timeout)
    }

    /// Whether either process holds the lock right now. Advisory only.
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Condition variable sequence, for diagnostics.
    pub fn notify_sequence(&self) -> u32 {
        self.cv.sequence()
    }

    /// Sleep on the condition variable until the peer signals or `timeout`
    /// elapses. `guard` must come from this block's lock.
    pub fn wait_for_progress(
        &self,
        guard: &mut ShmMutexGuard<'_>,
        timeout: Duration,
    ) -> WaitOutcome {
        self.cv.wait_timeout(guard, timeout)
    }

    /// Wake the peer after a counter or flag change.
    ///
    /// Never blocks. Briefly touching the lock orders this signal after any
    /// waiter that is between checking its condition and going to sleep; if the
    /// lock is busy the signal is still sent and a missed wakeup costs at most
    /// the waiter's timeout.
    pub fn notify_progress(&self) {
        if self.is_invalid() {
            return;
        }
        drop(self.lock.try_lock());
        self.cv.notify_all();
    }

    // ---- positions -------------------------------------------------------

    fn counter(&self, side: Side) -> &AtomicU32 {
        match side {
            Side::Client => &self.user,
            Side::Server => &self.server,
        }
    }

    fn base(&self, side: Side) -> &AtomicU32 {
        match side {
            Side::Client => &self.user_base,
            Side::Server => &self.server_base,
        }
    }

    fn laps(&self, side: Side) -> &AtomicU32 {
        match side {
            Side::Client => &self.user_laps,
            Side::Server => &self.server_laps,
        }
    }

    /// Copy of both counters and anchors. The two halves may be from slightly
    /// different instants; each value is whole.
    pub fn positions(&self) -> Positions {
        Positions {
            user: self.user.load(Ordering::Acquire),
            server: self.server.load(Ordering::Acquire),
            user_base: self.user_base.load(Ordering::Acquire),
            server_base: self.server_base.load(Ordering::Acquire),
            user_laps: self.user_laps.load(Ordering::Acquire),
            server_laps: self.server_laps.load(Ordering::Acquire),
        }
    }

    /// Project `counter` onto a slot index using `base`.
    pub fn ring_offset(&self, counter: u32, base: u32) -> u32 {
        counter.wrapping_sub(base) % self.frame_count
    }

    /// Current slot index of `side`'s counter, before any loop jump still
    /// pending at `loop_end`. Use [`contiguous_run`](Self::contiguous_run) to
    /// locate the next frame.
    pub fn side_offset(&self, side: Side) -> u32 {
        let counter = self.counter(side).load(Ordering::Acquire);
        let base = self.base(side).load(Ordering::Acquire);
        self.ring_offset(counter, base)
    }

    /// Frames published by the producer and not yet released by the consumer.
    fn filled(&self, direction: Direction) -> Result<u32, CblkError> {
        let producer = direction.producer();
        let produced = self.counter(producer).load(Ordering::Acquire);
        let consumed = self.counter(producer.peer()).load(Ordering::Acquire);
        let filled = produced.wrapping_sub(consumed);
        if filled > self.frame_count {
            self.mark_inconsistent(direction, filled);
            return Err(CblkError::Inconsistent {
                direction,
                filled,
                frame_count: self.frame_count,
            });
        }
        Ok(filled)
    }

    fn loop_laps_outstanding(&self) -> bool {
        self.loop_count.load(Ordering::Acquire) != 0
            || self.user_laps.load(Ordering::Acquire) != self.server_laps.load(Ordering::Acquire)
    }

    /// Producer's usable space. While a loop is replaying, the producer may not
    /// run more than one loop length ahead of the consumer.
    fn producer_capacity(&self) -> u32 {
        if self.loop_laps_outstanding() {
            let start = self.loop_start.load(Ordering::Acquire);
            let end = self.loop_end.load(Ordering::Acquire);
            end.saturating_sub(start).clamp(1, self.frame_count)
        } else {
            self.frame_count
        }
    }

    /// Frames `side` may touch right now: free space for the producer, ready
    /// frames for the consumer. Always within `[0, frame_count]`.
    pub fn frames_available(
        &self,
        direction: Direction,
        side: Side,
    ) -> Result<u32, CblkError> {
        let filled = self.filled(direction)?;
        if side == direction.producer() {
            Ok(self.producer_capacity().saturating_sub(filled))
        } else {
            Ok(filled)
        }
    }

    /// Free space on the producing side of `direction`.
    pub fn frames_free(&self, direction: Direction) -> Result<u32, CblkError> {
        self.frames_available(direction, direction.producer())
    }

    /// Frames ready for the consuming side of `direction`.
    pub fn frames_ready(&self, direction: Direction) -> Result<u32, CblkError> {
        self.frames_available(direction, direction.consumer())
    }

    /// Advance `side`'s counter by up to `frames`, applying ring wrap and loop
    /// jumps to its anchor. Returns how many frames were actually advanced,
    /// which is less than requested only when the request exceeds what
    /// [`frames_available`](Self::frames_available) allows.
    pub fn advance(
        &self,
        direction: Direction,
        side: Side,
        frames: u32,
    ) -> Result<u32, CblkError> {
        if frames == 0 {
            return Ok(0);
        }
        if self.is_invalid() {
            return Err(CblkError::Invalidated);
        }

        let available = self.frames_available(direction, side)?;
        let granted = frames.min(available);
        if granted < frames {
            if side == direction.consumer() {
                warn!(
                    ?direction,
                    ?side,
                    requested = frames,
                    available,
                    "consumer stepped past the producer, clamping"
                );
            } else {
                debug!(
                    ?direction,
                    ?side,
                    requested = frames,
                    available,
                    "advance clamped to free space"
                );
            }
        }
        if granted == 0 {
            return Ok(0);
        }

        let producing = side == direction.producer();
        let fc = self.frame_count;
        let start = self.counter(side).load(Ordering::Relaxed);
        let mut base = self.base(side).load(Ordering::Relaxed);
        let mut laps = self.laps(side).load(Ordering::Relaxed);
        let mut position = start;
        let mut remaining = granted;

        // A loop configured while this side already sat on `loop_end`.
        if self.take_loop_jump(producing, side, laps)
            && position.wrapping_sub(base) == self.loop_end.load(Ordering::Acquire)
        {
            self.jump(producing, &mut base, &mut laps);
        }

        while remaining > 0 {
            let offset = position.wrapping_sub(base);
            let looping = self.take_loop_jump(producing, side, laps);
            let loop_end = self.loop_end.load(Ordering::Acquire);
            let boundary = if looping && offset < loop_end { loop_end } else { fc };
            let step = boundary.saturating_sub(offset).min(remaining).max(1);

            position = position.wrapping_add(step);
            remaining -= step;
            let reached = offset + step;

            if looping && reached == loop_end {
                self.jump(producing, &mut base, &mut laps);
            } else if reached >= fc {
                base = base.wrapping_add(fc);
            }
        }

        self.base(side).store(base, Ordering::Release);
        self.laps(side).store(laps, Ordering::Release);
        self.counter(side).store(position, Ordering::Release);

        match side {
            Side::Client => {
                if self.flags().contains(CblkFlags::UNDERRUN_OVERRUN) {
                    self.clear_flags(CblkFlags::UNDERRUN_OVERRUN);
                }
            }
            Side::Server => {
                if !self.flags().contains(CblkFlags::STARTED) {
                    self.set_flags(CblkFlags::STARTED);
                }
            }
        }

        Ok(granted)
    }

    /// Slot index and length of the run `side` can touch without wrapping or
    /// crossing a pending loop jump. A short run means the caller should step
    /// and ask again for the remainder.
    pub fn contiguous_run(
        &self,
        direction: Direction,
        side: Side,
    ) -> Result<(u32, u32), CblkError> {
        let available = self.frames_available(direction, side)?;
        let counter = self.counter(side).load(Ordering::Acquire);
        let base = self.base(side).load(Ordering::Acquire);
        let laps = self.laps(side).load(Ordering::Acquire);
        let mut offset = self.ring_offset(counter, base);

        let mut limit = self.frame_count - offset;
        if self.take_loop_jump(side == direction.producer(), side, laps) {
            let start = self.loop_start.load(Ordering::Acquire);
            let end = self.loop_end.load(Ordering::Acquire);
            // Parked on `loop_end`: the next frame lands at `loop_start`, the
            // same jump `advance` takes before stepping.
            if counter.wrapping_sub(base) == end {
                offset = start;
                limit = self.frame_count - offset;
            }
            if offset < end {
                limit = limit.min(end - offset);
            }
        }
        Ok((offset, available.min(limit)))
    }

    /// Whether `side` should take a loop jump when it reaches `loop_end`.
    fn take_loop_jump(&self, producing: bool, side: Side, laps: u32) -> bool {
        if producing {
            self.loop_count.load(Ordering::Acquire) != 0
        } else {
            let leader = self.laps(side.peer()).load(Ordering::Acquire);
            let behind = leader.wrapping_sub(laps);
            behind != 0 && behind < i32::MAX as u32
        }
    }

    fn jump(&self, producing: bool, base: &mut u32, laps: &mut u32) {
        let start = self.loop_start.load(Ordering::Acquire);
        let end = self.loop_end.load(Ordering::Acquire);
        *base = base.wrapping_add(end - start);
        *laps = laps.wrapping_add(1);
        if producing {
            let count = self.loop_count.load(Ordering::Acquire);
            if count > 0 {
                self.loop_count.store(count - 1, Ordering::Release);
                if count == 1 {
                    debug!(start, end, "loop finished");
                }
            }
        }
    }

    /// Client-side step: `user += frames`.
    pub fn step_user(&self, direction: Direction, frames: u32) -> Result<u32, CblkError> {
        self.advance(direction, Side::Client, frames)
    }

    /// Server-side step: `server += frames`, then wake the client.
    pub fn step_server(&self, direction: Direction, frames: u32) -> Result<u32, CblkError> {
        let stepped = self.advance(direction, Side::Server, frames)?;
        self.notify_progress();
        Ok(stepped)
    }

    /// Rewind both counters, anchors and loop state. Caller holds the lock.
    pub fn flush(&self, _guard: &ShmMutexGuard<'_>) {
        self.user.store(0, Ordering::Release);
        self.server.store(0, Ordering::Release);
        self.user_base.store(0, Ordering::Release);
        self.server_base.store(0, Ordering::Release);
        self.user_laps.store(0, Ordering::Release);
        self.server_laps.store(0, Ordering::Release);
        self.loop_count.store(0, Ordering::Release);
        self.loop_start.store(0, Ordering::Release);
        self.loop_end.store(0, Ordering::Release);
        debug!(name = self.name, "control block flushed");
    }

    /// Park both counters at `counter`, slot 0.
    #[cfg(test)]
    pub(crate) fn seed_positions(&self, counter: u32) {
        for side in [Side::Client, Side::Server] {
            self.counter(side).store(counter, Ordering::Release);
            self.base(side).store(counter, Ordering::Release);
        }
    }

    // ---- loop region -----------------------------------------------------

    /// Published loop configuration.
    pub fn loop_state(&self) -> LoopState {
        LoopState {
            start: self.loop_start.load(Ordering::Acquire),
            end: self.loop_end.load(Ordering::Acquire),
            count: self.loop_count.load(Ordering::Acquire),
        }
    }

    /// Configure a repeat region on a playback channel. Caller holds the lock.
    ///
    /// Both counters must sit at or before `end` in the current lap, and any
    /// previous loop must have been fully replayed by the consumer.
    pub fn set_loop(
        &self,
        _guard: &ShmMutexGuard<'_>,
        start: u32,
        end: u32,
        count: i32,
    ) -> Result<(), CblkError> {
        if count == 0 {
            self.loop_count.store(0, Ordering::Release);
            return Ok(());
        }
        if start >= end || end > self.frame_count {
            return Err(CblkError::InvalidLoop("require start < end <= frame_count"));
        }
        if self.user_laps.load(Ordering::Acquire) != self.server_laps.load(Ordering::Acquire) {
            return Err(CblkError::InvalidLoop("previous loop still replaying"));
        }
        let filled = self.filled(Direction::Output)?;
        let consumer_offset = self.side_offset(Side::Server);
        if consumer_offset + filled > end {
            return Err(CblkError::InvalidLoop("positions already past loop end"));
        }

        self.loop_start.store(start, Ordering::Release);
        self.loop_end.store(end, Ordering::Release);
        self.loop_count.store(count, Ordering::Release);
        debug!(start, end, count, "loop configured");
        Ok(())
    }

    /// Stop looping after the current lap. Pending replays still complete.
    pub fn clear_loop(&self, _guard: &ShmMutexGuard<'_>) {
        self.loop_count.store(0, Ordering::Release);
    }

    // ---- packed fields ---------------------------------------------------

    /// Store both channel volumes as one word.
    pub fn set_volume_lr(&self, volume: VolumeLR) {
        self.volume_lr.store(volume.bits(), Ordering::Relaxed);
    }

    /// Load both channel volumes as one word. Server validates the result.
    pub fn volume_lr(&self) -> VolumeLR {
        VolumeLR::from_bits(self.volume_lr.load(Ordering::Relaxed))
    }

    /// Set the auxiliary send level. Clamped to `[0.0, 1.0]`.
    pub fn set_send_level(&self, level: f32) {
        let encoded = encode_u4_12(level).min(UNITY_GAIN_U4_12);
        self.send_level.store(encoded, Ordering::Relaxed);
    }

    /// Auxiliary send level in U4.12.
    pub fn send_level_u4_12(&self) -> u16 {
        self.send_level.load(Ordering::Relaxed)
    }

    // ---- client stall accounting -------------------------------------------

    /// Current stall budget in milliseconds.
    pub fn buffer_timeout_ms(&self) -> u16 {
        self.buffer_timeout_ms.load(Ordering::Relaxed)
    }

    /// Replace the stall budget.
    pub fn set_buffer_timeout_ms(&self, ms: u16) {
        self.buffer_timeout_ms.store(ms, Ordering::Relaxed);
    }

    /// Accumulated wait time in milliseconds.
    pub fn wait_time_ms(&self) -> u16 {
        self.wait_time_ms.load(Ordering::Relaxed)
    }

    /// Replace the accumulated wait time.
    pub fn set_wait_time_ms(&self, ms: u16) {
        self.wait_time_ms.store(ms, Ordering::Relaxed);
    }

    // ---- flags -----------------------------------------------------------

    /// Snapshot of the status bits.
    pub fn flags(&self) -> CblkFlags {
        CblkFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// OR `flags` into the status bits; returns the previous value.
    pub fn set_flags(&self, flags: CblkFlags) -> CblkFlags {
        CblkFlags::from_bits_retain(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    /// Clear `flags` from the status bits; returns the previous value.
    pub fn clear_flags(&self, flags: CblkFlags) -> CblkFlags {
        CblkFlags::from_bits_retain(self.flags.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    /// Whether the block has been invalidated.
    pub fn is_invalid(&self) -> bool {
        self.flags().contains(CblkFlags::INVALID)
    }

    /// Mark the block unusable and wake every waiter so it can bail out.
    ///
    /// The lock is only tried for [`PEER_LOCK_TIMEOUT`]; a peer that died
    /// holding it cannot keep the block alive.
    pub fn invalidate(&self) {
        let previous = {
            let guard = self.lock.lock_timeout(PEER_LOCK_TIMEOUT);
            if guard.is_none() {
                warn!(name = self.name, "lock still held, invalidating without it");
            }
            self.set_flags(CblkFlags::INVALID)
        };
        if !previous.contains(CblkFlags::INVALID) {
            warn!(name = self.name, "control block invalidated");
        }
        self.cv.notify_all();
    }

    pub(crate) fn wake_all(&self) {
        self.cv.notify_all();
    }

    fn mark_inconsistent(&self, direction: Direction, filled: u32) {
        let previous = self.set_flags(CblkFlags::INVALID);
        if !previous.contains(CblkFlags::INVALID) {
            warn!(
                ?direction,
                filled,
                frame_count = self.frame_count,
                "position counters inconsistent, invalidating control block"
            );
        }
        self.cv.notify_all();
    }
}

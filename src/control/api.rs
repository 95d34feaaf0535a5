use std::path::Path;

use crate::cblk::{LoopState, Positions};
use crate::lifecycle::TrackState;
use crate::packed::{CblkFlags, VolumeLR, decode_u4_12};
use crate::region::TrackRegion;
use crate::{CblkError, Direction, Side};

/// Point-in-time view of a control block, computed without side effects.
#[derive(Clone, Debug)]
pub struct CblkStatus {
    /// Channel name/index.
    pub name: u8,
    /// Flow direction.
    pub direction: Direction,
    /// Ring capacity in frames.
    pub frame_count: u32,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bytes per frame.
    pub frame_size: usize,
    /// Whether samples follow the block in the same region.
    pub inline_buffers: bool,
    /// Raw counters, anchors and laps.
    pub positions: Positions,
    /// Client slot index.
    pub user_offset: u32,
    /// Server slot index.
    pub server_offset: u32,
    /// Producer minus consumer, or `None` when the counters disagree.
    pub filled: Option<u32>,
    /// Loop configuration.
    pub loop_state: LoopState,
    /// Packed channel volumes.
    pub volume: VolumeLR,
    /// Auxiliary send level as a gain.
    pub send_level: f32,
    /// Status bits.
    pub flags: CblkFlags,
    /// Lifecycle state derived from `flags`.
    pub state: TrackState,
    /// Client stall budget.
    pub buffer_timeout_ms: u16,
    /// Client accumulated wait.
    pub wait_time_ms: u16,
    /// Whether the shared lock was held when sampled.
    pub locked: bool,
    /// Condition variable sequence.
    pub notify_sequence: u32,
}

impl CblkStatus {
    /// Fill level as a fraction of the ring.
    pub fn fill_ratio(&self) -> Option<f32> {
        self.filled
            .map(|filled| filled as f32 / self.frame_count as f32)
    }
}

/// Map an existing file-backed region for inspection.
pub fn open(path: impl AsRef<Path>) -> Result<TrackRegion, CblkError> {
    TrackRegion::open_file(path)
}

/// Snapshot `region`.
pub fn status(region: &TrackRegion) -> CblkStatus {
    let cblk = region.control_block();
    let direction = region.direction();
    let positions = cblk.positions();
    let (produced, consumed) = match direction.producer() {
        Side::Client => (positions.user, positions.server),
        Side::Server => (positions.server, positions.user),
    };
    let filled = produced.wrapping_sub(consumed);
    let flags = cblk.flags();
    CblkStatus {
        name: cblk.name(),
        direction,
        frame_count: cblk.frame_count(),
        sample_rate: cblk.sample_rate(),
        frame_size: cblk.frame_size(),
        inline_buffers: cblk.has_inline_buffers(),
        positions,
        user_offset: cblk.ring_offset(positions.user, positions.user_base),
        server_offset: cblk.ring_offset(positions.server, positions.server_base),
        filled: (filled <= cblk.frame_count()).then_some(filled),
        loop_state: cblk.loop_state(),
        volume: cblk.volume_lr(),
        send_level: decode_u4_12(cblk.send_level_u4_12()),
        flags,
        state: TrackState::from_flags(flags),
        buffer_timeout_ms: cblk.buffer_timeout_ms(),
        wait_time_ms: cblk.wait_time_ms(),
        locked: cblk.is_locked(),
        notify_sequence: cblk.notify_sequence(),
    }
}

/// Open `path` and snapshot it.
pub fn inspect(path: impl AsRef<Path>) -> Result<CblkStatus, CblkError> {
    open(path).map(|region| status(&region))
}

/// Toggle `FORCE_READY`. Returns the new state.
pub fn toggle_force_ready(region: &TrackRegion) -> bool {
    let cblk = region.control_block();
    let previous = cblk.flags();
    let enabled = if previous.contains(CblkFlags::FORCE_READY) {
        cblk.clear_flags(CblkFlags::FORCE_READY);
        false
    } else {
        cblk.set_flags(CblkFlags::FORCE_READY);
        true
    };
    cblk.notify_progress();
    enabled
}

/// Clear `UNDERRUN_OVERRUN` and the client's wait accumulator.
pub fn clear_underrun(region: &TrackRegion) {
    let cblk = region.control_block();
    cblk.clear_flags(CblkFlags::UNDERRUN_OVERRUN);
    cblk.set_wait_time_ms(0);
}

/// Bring a disabled channel back.
pub fn restart(region: &TrackRegion) -> Result<(), CblkError> {
    region.control_block().restart()
}

/// Condemn the channel.
pub fn invalidate(region: &TrackRegion) {
    region.control_block().invalidate();
}

/// Store both channel gains.
pub fn set_volume(region: &TrackRegion, left: f32, right: f32) {
    region
        .control_block()
        .set_volume_lr(VolumeLR::from_gains(left, right));
}

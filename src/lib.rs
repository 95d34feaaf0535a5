#![deny(missing_docs)]

//! Shared-memory control block coordinating an audio client with the mixing or
//! capture server.
//!
//! The server constructs a [`ControlBlock`](cblk::ControlBlock) in place at the
//! start of a mapped [`TrackRegion`](region::TrackRegion) and hands the region to
//! the client. From then on both processes exchange progress through the
//! block's position counters, packed status fields and flag bits, using the
//! embedded process-shared lock and condition variable only for multi-field
//! transitions and for sleeping while the peer catches up.

use std::collections::VecDeque;
use std::ffi::CString;
use std::sync::Once;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

pub mod cblk;
/// Developer-facing inspection API and console.
pub mod control;
pub mod ffi;
pub mod lifecycle;
pub mod packed;
pub mod proxy;
pub mod region;
pub mod sync;

#[cfg(test)]
mod tests;

pub use cblk::{CblkConfig, ControlBlock, INLINE_BUFFERS, LoopState, Positions};
pub use lifecycle::{Stall, StallTracker, TimeoutPolicy, TrackState};
pub use packed::{CblkFlags, VolumeLR, decode_u4_12, encode_u4_12};
pub use proxy::{ClientProxy, ServerBuffer, ServerProxy};
pub use region::{BufferStorage, Track, TrackRegion};
pub use sync::{ShmCondvar, ShmMutex, ShmMutexGuard, WaitOutcome};

static LOG_BUFFER: Lazy<Mutex<VecDeque<String>>> =
    Lazy::new(|| Mutex::new(VecDeque::with_capacity(64)));
pub(crate) static LOG_CACHE: Lazy<Mutex<Option<CString>>> = Lazy::new(|| Mutex::new(None));
static TRACING_INIT: Once = Once::new();

/// Install the `fmt` subscriber once per process.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });
}

pub(crate) fn push_log(line: impl Into<String>) {
    let mut guard = LOG_BUFFER.lock();
    guard.push_back(line.into());
    while guard.len() > 256 {
        guard.pop_front();
    }
}

pub(crate) fn pop_log() -> Option<String> {
    LOG_BUFFER.lock().pop_front()
}

/// Which process owns a counter: `user` belongs to the client, `server` to the
/// server.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// The application-side stream endpoint.
    Client = 0,
    /// The mixer or capture thread in the audio service.
    Server = 1,
}

impl Side {
    /// The other endpoint.
    pub fn peer(self) -> Self {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Flow of audio through the channel.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Playback: the client produces, the server consumes.
    Output = 0,
    /// Capture: the server produces, the client consumes.
    Input = 1,
}

impl Direction {
    /// Side that writes samples into the ring.
    pub fn producer(self) -> Side {
        match self {
            Direction::Output => Side::Client,
            Direction::Input => Side::Server,
        }
    }

    /// Side that reads samples out of the ring.
    pub fn consumer(self) -> Side {
        self.producer().peer()
    }
}

/// Errors surfaced by control block operations.
#[derive(thiserror::Error, Debug)]
pub enum CblkError {
    /// The server flagged the block `INVALID`; the channel must be re-created.
    #[error("control block invalidated, channel must be re-created")]
    Invalidated,
    /// The server disabled the channel after repeated underruns.
    #[error("channel disabled by server, restart required")]
    Disabled,
    /// Counters describe more filled frames than the ring holds.
    #[error("{direction:?} ring reports {filled} filled frames but holds only {frame_count}")]
    Inconsistent {
        /// Direction whose counters were compared.
        direction: Direction,
        /// Producer minus consumer counter.
        filled: u32,
        /// Ring capacity.
        frame_count: u32,
    },
    /// Loop parameters rejected.
    #[error("invalid loop region: {0}")]
    InvalidLoop(&'static str),
    /// Construction parameters rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Typed frame copy used a frame type of the wrong size.
    #[error("frame size mismatch: block uses {expected} bytes, caller passed {found}")]
    FrameSizeMismatch {
        /// Bytes per frame recorded in the block.
        expected: usize,
        /// Bytes per frame of the caller's type.
        found: usize,
    },
    /// Mapping is too small or does not carry a control block.
    #[error("bad region: {0}")]
    BadRegion(&'static str),
    /// Underlying mapping or file operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Non-blocking call could not proceed right now.
    #[error("operation would block")]
    WouldBlock,
    /// Stall budget or restore timeout exhausted.
    #[error("timed out waiting for the peer")]
    TimedOut,
}

//! Fields that travel as one machine word so neither side needs the lock to
//! read or write them: U4.12 gains, the packed left/right volume pair and the
//! status flag bitmask.

use bitflags::bitflags;

/// Number of fractional bits in the U4.12 encoding.
pub const U4_12_FRAC_BITS: u32 = 12;

/// `1.0` in U4.12.
pub const UNITY_GAIN_U4_12: u16 = 1 << U4_12_FRAC_BITS;

/// Largest representable U4.12 value, just under `16.0`.
///
/// Channel volumes may be boosted up to this value. Send levels are limited to
/// [`UNITY_GAIN_U4_12`].
pub const MAX_GAIN_U4_12: u16 = u16::MAX;

/// Largest gain accepted by [`encode_u4_12`], as a float.
pub const MAX_GAIN: f32 = MAX_GAIN_U4_12 as f32 / UNITY_GAIN_U4_12 as f32;

/// Encode a linear gain as U4.12, rounding to the nearest step.
///
/// Negative and NaN inputs encode as silence; values above [`MAX_GAIN`] saturate.
pub fn encode_u4_12(gain: f32) -> u16 {
    if gain.is_nan() || gain <= 0.0 {
        return 0;
    }
    let scaled = (gain * UNITY_GAIN_U4_12 as f32).round();
    if scaled >= MAX_GAIN_U4_12 as f32 {
        MAX_GAIN_U4_12
    } else {
        scaled as u16
    }
}

/// Decode a U4.12 value into a linear gain.
pub fn decode_u4_12(value: u16) -> f32 {
    value as f32 / UNITY_GAIN_U4_12 as f32
}

/// Left/right channel volume packed into a single 32-bit word.
///
/// Left occupies bits `[0:15]`, right bits `[16:31]`, both U4.12. The pair is
/// always stored and loaded as a whole so a reader never sees one channel
/// updated and the other stale.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VolumeLR(u32);

impl VolumeLR {
    /// Unity gain on both channels.
    pub const UNITY: Self = Self::new(UNITY_GAIN_U4_12, UNITY_GAIN_U4_12);

    /// Both channels muted.
    pub const SILENT: Self = Self(0);

    /// Pack two U4.12 channel values.
    pub const fn new(left: u16, right: u16) -> Self {
        Self((left as u32) | ((right as u32) << 16))
    }

    /// Pack two float gains.
    pub fn from_gains(left: f32, right: f32) -> Self {
        Self::new(encode_u4_12(left), encode_u4_12(right))
    }

    /// Rebuild from the raw shared-memory word.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw word as stored in shared memory.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Left channel in U4.12.
    pub const fn left(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Right channel in U4.12.
    pub const fn right(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Left channel as a linear gain.
    pub fn left_gain(self) -> f32 {
        decode_u4_12(self.left())
    }

    /// Right channel as a linear gain.
    pub fn right_gain(self) -> f32 {
        decode_u4_12(self.right())
    }
}

impl Default for VolumeLR {
    fn default() -> Self {
        Self::UNITY
    }
}

bitflags! {
    /// Status bits shared by client and server.
    ///
    /// The server is authoritative for most bits; readers must treat a load as
    /// an advisory snapshot, not as a synchronization point.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CblkFlags: u32 {
        /// Underrun on an output channel, overrun on an input channel.
        const UNDERRUN_OVERRUN = 0x01;
        /// Server treats the channel as ready without waiting for a full buffer.
        const FORCE_READY      = 0x02;
        /// Channel state can no longer be trusted; it must be re-created.
        const INVALID          = 0x04;
        /// Server stopped servicing the channel after repeated underruns.
        const DISABLED         = 0x08;
        /// Capture channel is being restored after invalidation.
        const RESTORING        = 0x10;
        /// Capture channel has been restored after invalidation.
        const RESTORED         = 0x20;
        /// Server has stepped at least once; startup budget no longer applies.
        const STARTED          = 0x40;
    }
}

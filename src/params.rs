//! PCM parameters and per-stream format negotiation.

use std::time::Duration;

use crate::{Result, RouterError};

/// Bytes per sample of the only format carried end to end.
pub const SAMPLE_SIZE: usize = 2;

/// Upper bound on channels per frame anywhere in the router.
pub const MAX_CHANNELS: usize = 8;

/// Shape of a PCM stream: channels, sample depth, rate and period length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmParams {
    /// Interleaved channels per frame.
    pub channels: usize,
    /// Bits per sample.
    pub sample_bits: u32,
    /// Frames per second.
    pub sample_rate: u32,
    /// Frames per period.
    pub frame_count: usize,
}

impl PcmParams {
    /// Creates parameters without checking them.
    #[must_use]
    pub const fn new(channels: usize, sample_bits: u32, sample_rate: u32, frame_count: usize) -> Self {
        Self {
            channels,
            sample_bits,
            sample_rate,
            frame_count,
        }
    }

    /// Checks that the parameters describe a stream this crate can carry.
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` for anything but 16-bit samples,
    /// `UnsupportedChannelLayout` above [`MAX_CHANNELS`] and
    /// `InvalidParameters` for zero channels, rate or period.
    pub fn validate(&self) -> Result<()> {
        if self.sample_bits != 16 {
            return Err(RouterError::UnsupportedFormat {
                bits: self.sample_bits,
            });
        }
        if self.channels == 0 {
            return Err(RouterError::invalid("zero channels"));
        }
        if self.channels > MAX_CHANNELS {
            return Err(RouterError::UnsupportedChannelLayout {
                input: self.channels,
                output: MAX_CHANNELS,
            });
        }
        if self.sample_rate == 0 {
            return Err(RouterError::invalid("zero sample rate"));
        }
        if self.frame_count == 0 {
            return Err(RouterError::invalid("zero frames per period"));
        }
        Ok(())
    }

    /// Bytes per sample.
    #[must_use]
    pub fn sample_size(&self) -> usize {
        (self.sample_bits / 8) as usize
    }

    /// Bytes per frame.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.channels * self.sample_size()
    }

    /// Bytes in `frames` frames.
    #[must_use]
    pub fn frames_to_bytes(&self, frames: usize) -> usize {
        frames * self.frame_size()
    }

    /// Whole frames in `bytes` bytes.
    #[must_use]
    pub fn bytes_to_frames(&self, bytes: usize) -> usize {
        match self.frame_size() {
            0 => 0,
            size => bytes / size,
        }
    }

    /// Whole frames in `samples` interleaved samples.
    #[must_use]
    pub fn samples_to_frames(&self, samples: usize) -> usize {
        match self.channels {
            0 => 0,
            ch => samples / ch,
        }
    }

    /// Samples in one period.
    #[must_use]
    pub fn period_samples(&self) -> usize {
        self.frame_count * self.channels
    }

    /// Wall-clock duration of `frames` frames.
    #[must_use]
    pub fn frames_duration(&self, frames: usize) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(frames as u64 * 1_000_000 / u64::from(self.sample_rate))
    }

    /// Wall-clock duration of one period.
    #[must_use]
    pub fn period_duration(&self) -> Duration {
        self.frames_duration(self.frame_count)
    }
}

impl std::fmt::Display for PcmParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}ch {}-bit {}Hz x{}",
            self.channels, self.sample_bits, self.sample_rate, self.frame_count
        )
    }
}

/// Sample encodings a client may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian.
    #[default]
    I16,
    /// Signed 24-bit packed in 32.
    I24,
    /// Signed 32-bit.
    I32,
}

impl SampleFormat {
    /// Bits per sample.
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Self::I16 => 16,
            Self::I24 => 24,
            Self::I32 => 32,
        }
    }
}

/// Negotiation record passed to stream open calls.
///
/// The device rewrites it with the values it actually granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConfig {
    /// Frames per second.
    pub sample_rate: u32,
    /// Interleaved channels per frame.
    pub channels: usize,
    /// Sample encoding.
    pub format: SampleFormat,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            format: SampleFormat::I16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_math() {
        let params = PcmParams::new(2, 16, 44_100, 1024);
        assert_eq!(params.sample_size(), 2);
        assert_eq!(params.frame_size(), 4);
        assert_eq!(params.frames_to_bytes(10), 40);
        assert_eq!(params.bytes_to_frames(41), 10);
        assert_eq!(params.samples_to_frames(21), 10);
        assert_eq!(params.period_samples(), 2048);
    }

    #[test]
    fn test_durations() {
        let params = PcmParams::new(1, 16, 8000, 160);
        assert_eq!(params.period_duration(), Duration::from_millis(20));
        assert_eq!(params.frames_duration(8000), Duration::from_secs(1));
    }

    #[test]
    fn test_validate() {
        assert!(PcmParams::new(2, 16, 44_100, 882).validate().is_ok());
        assert_eq!(
            PcmParams::new(2, 24, 44_100, 882).validate(),
            Err(RouterError::UnsupportedFormat { bits: 24 })
        );
        assert!(matches!(
            PcmParams::new(0, 16, 44_100, 882).validate(),
            Err(RouterError::InvalidParameters { .. })
        ));
        assert!(matches!(
            PcmParams::new(9, 16, 44_100, 882).validate(),
            Err(RouterError::UnsupportedChannelLayout { .. })
        ));
        assert!(PcmParams::new(2, 16, 0, 882).validate().is_err());
    }

    #[test]
    fn test_zero_channel_helpers_do_not_divide_by_zero() {
        let params = PcmParams::new(0, 16, 0, 0);
        assert_eq!(params.bytes_to_frames(100), 0);
        assert_eq!(params.samples_to_frames(100), 0);
        assert_eq!(params.frames_duration(100), Duration::ZERO);
    }

    #[test]
    fn test_display() {
        let params = PcmParams::new(8, 16, 44_100, 882);
        assert_eq!(params.to_string(), "8ch 16-bit 44100Hz x882");
    }
}

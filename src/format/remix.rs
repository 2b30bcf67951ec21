//! In-place channel remixing.
//!
//! A [`Remix`] converts the channel count of a [`FrameBuffer`] without moving
//! it to new storage: dropping trailing channels compacts frames towards the
//! front of the buffer, and mono duplication fills the spare slots of frames
//! already laid out at the wider stride.

use crate::params::{MAX_CHANNELS, SAMPLE_SIZE};
use crate::{Result, RouterError};

/// Fixed-capacity interleaved sample buffer that knows its current layout.
///
/// The backing storage is allocated once; only `frames` and `channels`
/// change afterwards.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    samples: Vec<i16>,
    frames: usize,
    channels: usize,
}

impl FrameBuffer {
    /// Allocates room for `frames` frames of `channels` channels.
    #[must_use]
    pub fn with_capacity(frames: usize, channels: usize) -> Self {
        Self {
            samples: vec![0; frames * channels],
            frames: 0,
            channels,
        }
    }

    /// Total samples the buffer can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Frames of the given width that fit.
    #[must_use]
    pub fn capacity_frames(&self, channels: usize) -> usize {
        match channels {
            0 => 0,
            ch => self.samples.len() / ch,
        }
    }

    /// Valid frames.
    #[must_use]
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Valid channels per frame.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Declares the valid layout, clamping `frames` to capacity.
    ///
    /// Returns the number of frames actually declared.
    pub fn set_layout(&mut self, frames: usize, channels: usize) -> usize {
        self.channels = channels;
        self.frames = frames.min(self.capacity_frames(channels));
        self.frames
    }

    /// Marks the buffer empty.
    pub fn clear(&mut self) {
        self.frames = 0;
    }

    /// Valid samples.
    #[must_use]
    pub fn as_slice(&self) -> &[i16] {
        &self.samples[..self.frames * self.channels]
    }

    /// Valid samples, mutable.
    pub fn as_mut_slice(&mut self) -> &mut [i16] {
        let len = self.frames * self.channels;
        &mut self.samples[..len]
    }

    /// Whole backing storage, for filling before [`set_layout`](Self::set_layout).
    pub fn storage_mut(&mut self) -> &mut [i16] {
        &mut self.samples
    }
}

/// Which in-place transform a [`Remix`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemixKind {
    /// Same channel count on both sides.
    Passthrough,
    /// Keep the first `out` channels of every frame.
    Truncate,
    /// Copy channel 0 over channels `1..out` of every frame.
    Duplicate,
}

/// Channel conversion descriptor chosen once at stream construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Remix {
    sample_size: usize,
    in_channels: usize,
    out_channels: usize,
    kind: RemixKind,
}

impl Remix {
    /// Picks the transform for `in_channels -> out_channels`.
    ///
    /// # Errors
    ///
    /// `UnsupportedChannelLayout` for widening from more than one channel or
    /// for zero or too many channels, `UnsupportedFormat` for anything but
    /// 16-bit samples.
    pub fn new(sample_size: usize, in_channels: usize, out_channels: usize) -> Result<Self> {
        if sample_size != SAMPLE_SIZE {
            return Err(RouterError::UnsupportedFormat {
                bits: (sample_size * 8) as u32,
            });
        }
        let unsupported = RouterError::UnsupportedChannelLayout {
            input: in_channels,
            output: out_channels,
        };
        if in_channels == 0
            || out_channels == 0
            || in_channels > MAX_CHANNELS
            || out_channels > MAX_CHANNELS
        {
            return Err(unsupported);
        }

        let kind = match (in_channels, out_channels) {
            (i, o) if i == o => RemixKind::Passthrough,
            (i, o) if i > o => RemixKind::Truncate,
            (1, _) => RemixKind::Duplicate,
            _ => return Err(unsupported),
        };

        Ok(Self {
            sample_size,
            in_channels,
            out_channels,
            kind,
        })
    }

    /// The chosen transform.
    #[must_use]
    pub fn kind(&self) -> RemixKind {
        self.kind
    }

    /// Channels expected on input.
    #[must_use]
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Channels produced.
    #[must_use]
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Frame stride the buffer must be filled at before [`apply`](Self::apply).
    ///
    /// Duplication works on frames already spaced for the output width.
    #[must_use]
    pub fn fill_channels(&self) -> usize {
        match self.kind {
            RemixKind::Duplicate => self.out_channels,
            _ => self.in_channels,
        }
    }

    /// Bytes of working space `frames` frames need.
    #[must_use]
    pub fn required_bytes(&self, frames: usize) -> usize {
        frames * self.in_channels.max(self.out_channels) * self.sample_size
    }

    /// Converts `buf` to the output layout in place.
    ///
    /// A buffer that already has the output layout is left untouched, so
    /// applying the same descriptor twice is the same as applying it once.
    pub fn apply(&self, buf: &mut FrameBuffer) {
        let frames = buf.frames();
        if buf.channels() == self.out_channels {
            if self.kind == RemixKind::Duplicate {
                duplicate_first(buf.as_mut_slice(), self.out_channels);
            }
            return;
        }
        if buf.channels() != self.in_channels {
            tracing::error!(
                have = buf.channels(),
                expected = self.in_channels,
                "remix applied to a buffer with the wrong layout"
            );
            return;
        }
        if frames == 0 {
            buf.set_layout(0, self.out_channels);
            return;
        }

        match self.kind {
            RemixKind::Passthrough | RemixKind::Duplicate => {}
            RemixKind::Truncate => {
                let (input, output) = (self.in_channels, self.out_channels);
                let samples = buf.storage_mut();
                // Frame 0 is already in place; destination stride < source
                // stride keeps every copy ahead of unread input.
                for frame in 1..frames {
                    let src = frame * input;
                    samples.copy_within(src..src + output, frame * output);
                }
            }
        }
        buf.set_layout(frames, self.out_channels);
    }
}

fn duplicate_first(samples: &mut [i16], channels: usize) {
    for frame in samples.chunks_exact_mut(channels) {
        let first = frame[0];
        frame[1..].fill(first);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(samples: &[i16], channels: usize, capacity_frames: usize) -> FrameBuffer {
        let mut buf = FrameBuffer::with_capacity(capacity_frames, channels);
        buf.storage_mut()[..samples.len()].copy_from_slice(samples);
        buf.set_layout(samples.len() / channels, channels);
        buf
    }

    #[test]
    fn test_kind_selection() {
        assert_eq!(Remix::new(2, 2, 1).unwrap().kind(), RemixKind::Truncate);
        assert_eq!(Remix::new(2, 1, 2).unwrap().kind(), RemixKind::Duplicate);
        assert_eq!(Remix::new(2, 1, 8).unwrap().kind(), RemixKind::Duplicate);
        assert_eq!(Remix::new(2, 2, 2).unwrap().kind(), RemixKind::Passthrough);
    }

    #[test]
    fn test_unsupported_layouts_fail_at_construction() {
        assert_eq!(
            Remix::new(2, 2, 4),
            Err(RouterError::UnsupportedChannelLayout {
                input: 2,
                output: 4
            })
        );
        assert!(Remix::new(2, 0, 1).is_err());
        assert!(Remix::new(2, 1, 9).is_err());
        assert_eq!(
            Remix::new(4, 2, 1),
            Err(RouterError::UnsupportedFormat { bits: 32 })
        );
    }

    #[test]
    fn test_truncate_stereo_to_mono() {
        let remix = Remix::new(2, 2, 1).unwrap();
        let mut buf = buffer(&[1, -1, 2, -2, 3, -3, 4, -4], 2, 4);
        remix.apply(&mut buf);
        assert_eq!(buf.channels(), 1);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_truncate_eight_to_two() {
        let remix = Remix::new(2, 8, 2).unwrap();
        let samples: Vec<i16> = (0..24).collect();
        let mut buf = buffer(&samples, 8, 3);
        remix.apply(&mut buf);
        assert_eq!(buf.as_slice(), &[0, 1, 8, 9, 16, 17]);
    }

    #[test]
    fn test_truncate_is_idempotent() {
        let remix = Remix::new(2, 2, 1).unwrap();
        let mut buf = buffer(&[5, 0, 6, 0, 7, 0], 2, 3);
        remix.apply(&mut buf);
        let once = buf.as_slice().to_vec();
        remix.apply(&mut buf);
        assert_eq!(buf.as_slice(), once.as_slice());
    }

    #[test]
    fn test_duplicate_mono_to_stereo() {
        let remix = Remix::new(2, 1, 2).unwrap();
        assert_eq!(remix.fill_channels(), 2);
        // Frames laid out at the output stride, right slot not yet valid.
        let mut buf = buffer(&[7, 0, 8, 0, 9, 0], 2, 3);
        remix.apply(&mut buf);
        assert_eq!(buf.as_slice(), &[7, 7, 8, 8, 9, 9]);
    }

    #[test]
    fn test_duplicate_mono_to_eight_slots() {
        let remix = Remix::new(2, 1, 8).unwrap();
        let mut samples = vec![0i16; 16];
        samples[0] = 100;
        samples[8] = -100;
        let mut buf = buffer(&samples, 8, 2);
        remix.apply(&mut buf);
        assert_eq!(buf.channels(), 8);
        assert!(buf.as_slice()[..8].iter().all(|&s| s == 100));
        assert!(buf.as_slice()[8..].iter().all(|&s| s == -100));
    }

    #[test]
    fn test_passthrough_leaves_data() {
        let remix = Remix::new(2, 2, 2).unwrap();
        let mut buf = buffer(&[1, 2, 3, 4], 2, 2);
        remix.apply(&mut buf);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_zero_frames_is_noop() {
        let remix = Remix::new(2, 2, 1).unwrap();
        let mut buf = FrameBuffer::with_capacity(4, 2);
        buf.set_layout(0, 2);
        remix.apply(&mut buf);
        assert_eq!(buf.frames(), 0);
        assert_eq!(buf.channels(), 1);
    }

    #[test]
    fn test_never_touches_past_working_space() {
        let remix = Remix::new(2, 2, 1).unwrap();
        // Room for 4 stereo frames plus a sentinel frame.
        let mut buf = FrameBuffer::with_capacity(5, 2);
        buf.storage_mut().copy_from_slice(&[1, 1, 2, 2, 3, 3, 4, 4, 99, 99]);
        buf.set_layout(4, 2);
        remix.apply(&mut buf);
        assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
        assert_eq!(&buf.storage_mut()[8..], &[99, 99]);
        assert_eq!(remix.required_bytes(4), 16);
    }

    #[test]
    fn test_set_layout_clamps_to_capacity() {
        let mut buf = FrameBuffer::with_capacity(4, 2);
        assert_eq!(buf.set_layout(10, 2), 4);
        assert_eq!(buf.set_layout(10, 1), 8);
    }
}

//! Pull-based sample rate conversion.
//!
//! The consumer asks a [`Resampler`] for N output frames; the resampler pulls
//! however many input frames that takes from a [`BufferProvider`]. Linear
//! interpolation is used, which is cheap and adequate for speech and for the
//! small ratios between the port rates here.

use crate::params::MAX_CHANNELS;
use crate::{Result, RouterError};

/// Source of input frames for a [`Resampler`].
///
/// `get_next_buffer` hands out a slice of whole interleaved frames (at most
/// `frames` of them); the caller reports how many it consumed with
/// `release_buffer` before asking again. An empty slice means no input is
/// available right now.
pub trait BufferProvider {
    /// Returns up to `frames` frames of input.
    ///
    /// # Errors
    ///
    /// Propagates the failure of whatever produces the input.
    fn get_next_buffer(&mut self, frames: usize) -> Result<&[i16]>;

    /// Marks `frames` frames of the last buffer as consumed.
    fn release_buffer(&mut self, frames: usize);
}

/// Provider over a caller-supplied slice.
#[derive(Debug)]
pub struct SliceProvider<'a> {
    samples: &'a [i16],
    channels: usize,
    offset: usize,
}

impl<'a> SliceProvider<'a> {
    /// Serves the whole frames in `samples`.
    #[must_use]
    pub fn new(samples: &'a [i16], channels: usize) -> Self {
        let whole = samples.len() - samples.len() % channels.max(1);
        Self {
            samples: &samples[..whole],
            channels: channels.max(1),
            offset: 0,
        }
    }

    /// Frames not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        (self.samples.len() - self.offset) / self.channels
    }
}

impl BufferProvider for SliceProvider<'_> {
    fn get_next_buffer(&mut self, frames: usize) -> Result<&[i16]> {
        let n = frames.min(self.remaining());
        Ok(&self.samples[self.offset..self.offset + n * self.channels])
    }

    fn release_buffer(&mut self, frames: usize) {
        let n = frames.min(self.remaining());
        self.offset += n * self.channels;
    }
}

/// Copies up to `frames` frames from `provider` into `out` without rate
/// conversion. Returns the frames copied.
pub fn copy_from_provider(
    provider: &mut dyn BufferProvider,
    out: &mut [i16],
    channels: usize,
    frames: usize,
) -> usize {
    let mut copied = 0;
    while copied < frames {
        let n = match provider.get_next_buffer(frames - copied) {
            Ok(buf) if !buf.is_empty() => {
                let n = (buf.len() / channels).min(frames - copied);
                out[copied * channels..(copied + n) * channels]
                    .copy_from_slice(&buf[..n * channels]);
                n
            }
            _ => break,
        };
        provider.release_buffer(n);
        copied += n;
    }
    copied
}

/// Streaming linear-interpolation resampler for interleaved 16-bit frames.
///
/// `cur` is the newest input frame consumed and `frac` the output position
/// measured from `prev`, kept in `(0, 1]` between emitted frames.
///
/// State carries across calls, so a long stream converted in arbitrary
/// pieces produces the same output as converting it in one go.
#[derive(Debug, Clone)]
pub struct Resampler {
    in_rate: u32,
    out_rate: u32,
    channels: usize,
    step: f64,
    frac: f64,
    prev: [i16; MAX_CHANNELS],
    cur: [i16; MAX_CHANNELS],
    primed: bool,
}

impl Resampler {
    /// Creates a resampler from `in_rate` to `out_rate`.
    ///
    /// # Errors
    ///
    /// `InvalidParameters` for a zero rate, `UnsupportedChannelLayout` for
    /// zero or too many channels.
    pub fn new(in_rate: u32, out_rate: u32, channels: usize) -> Result<Self> {
        if in_rate == 0 || out_rate == 0 {
            return Err(RouterError::invalid("resampler rate is zero"));
        }
        if channels == 0 || channels > MAX_CHANNELS {
            return Err(RouterError::UnsupportedChannelLayout {
                input: channels,
                output: channels,
            });
        }
        Ok(Self {
            in_rate,
            out_rate,
            channels,
            step: f64::from(in_rate) / f64::from(out_rate),
            frac: 0.0,
            prev: [0; MAX_CHANNELS],
            cur: [0; MAX_CHANNELS],
            primed: false,
        })
    }

    /// Input rate in Hz.
    #[must_use]
    pub fn in_rate(&self) -> u32 {
        self.in_rate
    }

    /// Output rate in Hz.
    #[must_use]
    pub fn out_rate(&self) -> u32 {
        self.out_rate
    }

    /// Forgets all history, as after a stream restart.
    pub fn reset(&mut self) {
        self.frac = 0.0;
        self.prev = [0; MAX_CHANNELS];
        self.cur = [0; MAX_CHANNELS];
        self.primed = false;
    }

    /// Input frames needed for `out_frames` output frames, rounded up.
    #[must_use]
    pub fn input_frames_for(&self, out_frames: usize) -> usize {
        (out_frames as f64 * self.step).ceil() as usize
    }

    /// Produces up to `frames` frames into `out`, pulling input from
    /// `provider`. Returns fewer frames only when the provider runs dry or
    /// fails; never more than `frames`.
    pub fn resample(
        &mut self,
        provider: &mut dyn BufferProvider,
        out: &mut [i16],
        frames: usize,
    ) -> usize {
        let ch = self.channels;
        let frames = frames.min(out.len() / ch);
        let mut produced = 0;

        while produced < frames {
            if self.primed && self.frac <= 1.0 {
                self.emit(&mut out[produced * ch..(produced + 1) * ch]);
                produced += 1;
                continue;
            }

            let wanted = self.input_frames_for(frames - produced) + 1;
            let buf = match provider.get_next_buffer(wanted) {
                Ok(buf) if !buf.is_empty() => buf,
                _ => break,
            };
            let available = buf.len() / ch;
            let mut used = 0;

            if !self.primed {
                self.cur[..ch].copy_from_slice(&buf[..ch]);
                self.prev = self.cur;
                self.frac = 1.0;
                self.primed = true;
                used = 1;
            }

            while produced < frames {
                while self.frac > 1.0 && used < available {
                    self.prev = self.cur;
                    self.cur[..ch].copy_from_slice(&buf[used * ch..(used + 1) * ch]);
                    used += 1;
                    self.frac -= 1.0;
                }
                if self.frac > 1.0 {
                    break;
                }
                self.emit(&mut out[produced * ch..(produced + 1) * ch]);
                produced += 1;
            }

            provider.release_buffer(used);
        }

        produced
    }

    fn emit(&mut self, frame: &mut [i16]) {
        for (c, sample) in frame.iter_mut().enumerate() {
            let a = f64::from(self.prev[c]);
            let b = f64::from(self.cur[c]);
            let value = a + (b - a) * self.frac;
            *sample = value.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
        }
        self.frac += self.step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Provider that hands out at most `chunk` frames per call.
    struct ChunkedProvider {
        samples: Vec<i16>,
        channels: usize,
        offset: usize,
        chunk: usize,
        fail: bool,
    }

    impl BufferProvider for ChunkedProvider {
        fn get_next_buffer(&mut self, frames: usize) -> Result<&[i16]> {
            if self.fail {
                return Err(RouterError::NoDevice);
            }
            let left = (self.samples.len() - self.offset) / self.channels;
            let n = frames.min(self.chunk).min(left);
            Ok(&self.samples[self.offset..self.offset + n * self.channels])
        }

        fn release_buffer(&mut self, frames: usize) {
            self.offset += frames * self.channels;
        }
    }

    fn ramp(frames: usize) -> Vec<i16> {
        (0..frames).map(|i| (i * 10) as i16).collect()
    }

    #[test]
    fn test_slice_provider() {
        let data = [1i16, 2, 3, 4, 5];
        let mut provider = SliceProvider::new(&data, 2);
        assert_eq!(provider.remaining(), 2);
        assert_eq!(provider.get_next_buffer(1).unwrap(), &[1, 2]);
        provider.release_buffer(1);
        assert_eq!(provider.get_next_buffer(8).unwrap(), &[3, 4]);
        provider.release_buffer(1);
        assert!(provider.get_next_buffer(8).unwrap().is_empty());
    }

    #[test]
    fn test_copy_from_provider() {
        let data: Vec<i16> = (0..10).collect();
        let mut provider = SliceProvider::new(&data, 2);
        let mut out = [0i16; 8];
        assert_eq!(copy_from_provider(&mut provider, &mut out, 2, 4), 4);
        assert_eq!(out, [0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(provider.remaining(), 1);
    }

    #[test]
    fn test_same_rate_is_identity() {
        let data = ramp(100);
        let mut provider = SliceProvider::new(&data, 1);
        let mut resampler = Resampler::new(8000, 8000, 1).unwrap();
        let mut out = vec![0i16; 100];
        assert_eq!(resampler.resample(&mut provider, &mut out, 100), 100);
        assert_eq!(out, data);
    }

    #[test]
    fn test_downsample_ratio() {
        // 48kHz to 16kHz = 3:1
        let data = ramp(480);
        let mut provider = SliceProvider::new(&data, 1);
        let mut resampler = Resampler::new(48_000, 16_000, 1).unwrap();
        let mut out = vec![0i16; 160];
        assert_eq!(resampler.resample(&mut provider, &mut out, 160), 160);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 30);
        assert_eq!(out[159], 4770);
    }

    #[test]
    fn test_upsample_interpolates() {
        let data = [0i16, 1000, 2000, 3000];
        let mut provider = SliceProvider::new(&data, 1);
        let mut resampler = Resampler::new(16_000, 32_000, 1).unwrap();
        let mut out = [0i16; 7];
        assert_eq!(resampler.resample(&mut provider, &mut out, 7), 7);
        assert_eq!(out, [0, 500, 1000, 1500, 2000, 2500, 3000]);
    }

    #[test]
    fn test_never_returns_more_than_requested() {
        let data = ramp(10_000);
        let mut provider = SliceProvider::new(&data, 1);
        let mut resampler = Resampler::new(44_100, 8000, 1).unwrap();
        let mut out = vec![0i16; 1000];
        assert_eq!(resampler.resample(&mut provider, &mut out, 160), 160);
        assert!(out[160..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_chunked_input_matches_contiguous() {
        let data: Vec<i16> = (0..2000).map(|i| ((i * 37) % 2000) as i16).collect();

        let mut whole = Resampler::new(44_100, 8000, 2).unwrap();
        let mut provider = SliceProvider::new(&data, 2);
        let mut expected = vec![0i16; 300];
        let n = whole.resample(&mut provider, &mut expected, 150);

        let mut pieces = Resampler::new(44_100, 8000, 2).unwrap();
        let mut provider = ChunkedProvider {
            samples: data,
            channels: 2,
            offset: 0,
            chunk: 7,
            fail: false,
        };
        let mut actual = vec![0i16; 300];
        let mut done = 0;
        while done < n {
            let got = pieces.resample(&mut provider, &mut actual[done * 2..], 13.min(n - done));
            assert!(got > 0);
            done += got;
        }
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_provider_failure_stops_early() {
        let mut provider = ChunkedProvider {
            samples: ramp(10),
            channels: 1,
            offset: 0,
            chunk: 10,
            fail: true,
        };
        let mut resampler = Resampler::new(44_100, 8000, 1).unwrap();
        let mut out = [0i16; 4];
        assert_eq!(resampler.resample(&mut provider, &mut out, 4), 0);
    }

    #[test]
    fn test_stereo_channels_stay_separate() {
        let data: Vec<i16> = (0..64).flat_map(|_| [1000i16, -1000]).collect();
        let mut provider = SliceProvider::new(&data, 2);
        let mut resampler = Resampler::new(44_100, 8000, 2).unwrap();
        let mut out = [0i16; 20];
        assert_eq!(resampler.resample(&mut provider, &mut out, 10), 10);
        for frame in out.chunks_exact(2) {
            assert_eq!(frame, &[1000, -1000]);
        }
    }

    #[test]
    fn test_input_frames_for() {
        let resampler = Resampler::new(44_100, 8000, 1).unwrap();
        assert_eq!(resampler.input_frames_for(160), 882);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(Resampler::new(0, 8000, 1).is_err());
        assert!(Resampler::new(8000, 8000, 0).is_err());
        assert!(Resampler::new(8000, 8000, 9).is_err());
    }
}

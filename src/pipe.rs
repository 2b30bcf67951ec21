//! Bounded single-producer/single-consumer pipe between voice pump threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::{Result, RouterError};

/// Lifecycle of a [`MonoPipe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    /// Normal operation: both sides block (bounded) on full/empty.
    Active,
    /// Graceful shutdown: buffered data is still delivered and writes are
    /// still accepted, but reads no longer wait for more.
    Draining,
    /// Immediate shutdown: nothing blocks, writes are refused.
    Shutdown,
    /// Emptied after both sides stopped.
    Flushed,
}

impl PipeState {
    /// Whether the pipe has been shut down or flushed.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Shutdown | Self::Flushed)
    }
}

struct PipeInner {
    producer: HeapProd<i16>,
    consumer: HeapCons<i16>,
    state: PipeState,
}

/// A fixed-capacity ring of interleaved frames connecting one producer
/// thread to one consumer thread.
///
/// Both sides move whole frames only. A writer facing a full pipe and a
/// reader facing an empty one wait at most `max_block` (the time the whole
/// pipe takes to play) and then return a short count, so a stalled peer can
/// never wedge the other thread. [`shutdown`](Self::shutdown) wakes any
/// waiting call immediately.
///
/// The ring is allocated once in [`new`](Self::new).
///
/// # Example
///
/// ```
/// use pcm_router::MonoPipe;
///
/// let pipe = MonoPipe::new("uplink", 2, 8000, 800).unwrap();
/// assert_eq!(pipe.write(&[1, 2, 3, 4], 2), 2);
///
/// let mut out = [0i16; 4];
/// assert_eq!(pipe.read(&mut out, 2), 2);
/// assert_eq!(out, [1, 2, 3, 4]);
/// ```
pub struct MonoPipe {
    name: String,
    channels: usize,
    sample_rate: u32,
    capacity: usize,
    max_block: Duration,
    inner: Mutex<PipeInner>,
    readable: Condvar,
    writable: Condvar,
    overrun_frames: AtomicU64,
    underrun_frames: AtomicU64,
}

impl MonoPipe {
    /// Creates an active pipe holding `capacity` frames of `channels`
    /// channels at `sample_rate`.
    ///
    /// # Errors
    ///
    /// `InvalidParameters` if any argument is zero.
    pub fn new(name: impl Into<String>, channels: usize, sample_rate: u32, capacity: usize) -> Result<Self> {
        if channels == 0 || sample_rate == 0 || capacity == 0 {
            return Err(RouterError::invalid(format!(
                "pipe needs non-zero channels, rate and capacity (got {channels}, {sample_rate}, {capacity})"
            )));
        }
        let (producer, consumer) = HeapRb::<i16>::new(capacity * channels).split();
        let micros = capacity as u64 * 1_000_000 / u64::from(sample_rate);
        let max_block = Duration::from_micros(micros).max(Duration::from_millis(1));

        Ok(Self {
            name: name.into(),
            channels,
            sample_rate,
            capacity,
            max_block,
            inner: Mutex::new(PipeInner {
                producer,
                consumer,
                state: PipeState::Active,
            }),
            readable: Condvar::new(),
            writable: Condvar::new(),
            overrun_frames: AtomicU64::new(0),
            underrun_frames: AtomicU64::new(0),
        })
    }

    /// Name for logs and events.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channels per frame.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Rate the capacity was sized at.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Capacity in frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Longest time a single `read` or `write` waits.
    pub fn max_block(&self) -> Duration {
        self.max_block
    }

    /// Current state.
    pub fn state(&self) -> PipeState {
        self.inner.lock().state
    }

    /// Frames buffered right now.
    pub fn available(&self) -> usize {
        self.inner.lock().consumer.occupied_len() / self.channels
    }

    /// Frames writers could not place since construction.
    pub fn overrun_frames(&self) -> u64 {
        self.overrun_frames.load(Ordering::Relaxed)
    }

    /// Frames readers asked for but did not get since construction.
    pub fn underrun_frames(&self) -> u64 {
        self.underrun_frames.load(Ordering::Relaxed)
    }

    /// Appends up to `frames` frames from `src` and returns how many were
    /// accepted.
    ///
    /// Waits for room while the pipe is active or draining, up to the pipe
    /// duration in total. Returns 0 once shut down.
    pub fn write(&self, src: &[i16], frames: usize) -> usize {
        let ch = self.channels;
        let frames = frames.min(src.len() / ch);
        let deadline = Instant::now() + self.max_block;
        let mut written = 0;

        let mut inner = self.inner.lock();
        while written < frames {
            if inner.state.is_closed() {
                return written;
            }
            let n = (inner.producer.vacant_len() / ch).min(frames - written);
            if n > 0 {
                inner.producer.push_slice(&src[written * ch..(written + n) * ch]);
                written += n;
                self.readable.notify_all();
                continue;
            }
            if self.writable.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        drop(inner);

        if written < frames {
            let dropped = frames - written;
            self.overrun_frames.fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::trace!(pipe = %self.name, dropped, "pipe overrun");
        }
        written
    }

    /// Removes up to `frames` frames into `dst` and returns how many were
    /// delivered.
    ///
    /// Waits for data only while active, up to the pipe duration in total.
    /// A draining or shut-down pipe hands over what it holds without waiting.
    pub fn read(&self, dst: &mut [i16], frames: usize) -> usize {
        let ch = self.channels;
        let frames = frames.min(dst.len() / ch);
        let deadline = Instant::now() + self.max_block;
        let mut read = 0;

        let mut inner = self.inner.lock();
        while read < frames {
            let n = (inner.consumer.occupied_len() / ch).min(frames - read);
            if n > 0 {
                inner.consumer.pop_slice(&mut dst[read * ch..(read + n) * ch]);
                read += n;
                self.writable.notify_all();
                continue;
            }
            if inner.state != PipeState::Active {
                return read;
            }
            if self.readable.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        drop(inner);

        if read < frames {
            let missing = frames - read;
            self.underrun_frames.fetch_add(missing as u64, Ordering::Relaxed);
            tracing::trace!(pipe = %self.name, missing, "pipe underrun");
        }
        read
    }

    /// Shuts the pipe down and wakes both sides.
    ///
    /// With `immediate`, blocked calls return at once with a short count and
    /// further writes are refused. Otherwise the pipe drains: buffered data
    /// is still delivered and writes are still accepted until
    /// [`flush`](Self::flush).
    pub fn shutdown(&self, immediate: bool) {
        let mut inner = self.inner.lock();
        inner.state = match (inner.state, immediate) {
            (PipeState::Flushed, _) => PipeState::Flushed,
            (_, true) => PipeState::Shutdown,
            (PipeState::Shutdown, false) => PipeState::Shutdown,
            (_, false) => PipeState::Draining,
        };
        tracing::debug!(pipe = %self.name, state = ?inner.state, "pipe shut down");
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Discards everything buffered. Call only once both sides have stopped.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        let discarded = inner.consumer.clear() / self.channels;
        inner.state = PipeState::Flushed;
        tracing::debug!(pipe = %self.name, discarded, "pipe flushed");
        self.readable.notify_all();
        self.writable.notify_all();
    }

    /// Empties the pipe and makes it active again.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.consumer.clear();
        inner.state = PipeState::Active;
        tracing::debug!(pipe = %self.name, "pipe reset");
    }
}

impl std::fmt::Debug for MonoPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MonoPipe")
            .field("name", &self.name)
            .field("channels", &self.channels)
            .field("capacity", &self.capacity)
            .field("available", &(inner.consumer.occupied_len() / self.channels))
            .field("state", &inner.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_rejects_zero_sizes() {
        assert!(MonoPipe::new("p", 0, 8000, 10).is_err());
        assert!(MonoPipe::new("p", 1, 0, 10).is_err());
        assert!(MonoPipe::new("p", 1, 8000, 0).is_err());
    }

    #[test]
    fn test_max_block_is_pipe_duration() {
        let pipe = MonoPipe::new("p", 2, 8000, 800).unwrap();
        assert_eq!(pipe.max_block(), Duration::from_millis(100));
    }

    #[test]
    fn test_fifo_order() {
        let pipe = MonoPipe::new("p", 2, 8000, 16).unwrap();
        pipe.write(&[1, 1, 2, 2], 2);
        pipe.write(&[3, 3], 1);
        pipe.write(&[4, 4, 5, 5, 6, 6], 3);
        assert_eq!(pipe.available(), 6);

        let mut out = [0i16; 12];
        assert_eq!(pipe.read(&mut out, 6), 6);
        assert_eq!(out, [1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6]);
    }

    #[test]
    fn test_fifo_across_threads() {
        let pipe = Arc::new(MonoPipe::new("p", 1, 8000, 64).unwrap());
        let producer = Arc::clone(&pipe);
        let handle = std::thread::spawn(move || {
            for chunk in (0..1000i16).collect::<Vec<_>>().chunks(10) {
                assert_eq!(producer.write(chunk, chunk.len()), chunk.len());
            }
        });

        let mut received = Vec::new();
        let mut buf = [0i16; 10];
        while received.len() < 1000 {
            let n = pipe.read(&mut buf, 10);
            received.extend_from_slice(&buf[..n]);
        }
        handle.join().unwrap();
        assert_eq!(received, (0..1000).collect::<Vec<i16>>());
    }

    #[test]
    fn test_full_pipe_write_is_bounded() {
        // 80 frames at 8kHz: 10ms of blocking at most.
        let pipe = MonoPipe::new("p", 1, 8000, 80).unwrap();
        let start = Instant::now();
        assert_eq!(pipe.write(&[7; 100], 100), 80);
        assert!(start.elapsed() >= Duration::from_millis(9));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(pipe.overrun_frames(), 20);
    }

    #[test]
    fn test_empty_pipe_read_is_bounded() {
        let pipe = MonoPipe::new("p", 1, 8000, 80).unwrap();
        let mut out = [0i16; 10];
        let start = Instant::now();
        assert_eq!(pipe.read(&mut out, 10), 0);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(pipe.underrun_frames(), 10);
    }

    #[test]
    fn test_partial_frames_are_ignored() {
        let pipe = MonoPipe::new("p", 2, 8000, 8).unwrap();
        // Three samples hold one whole stereo frame.
        assert_eq!(pipe.write(&[1, 2, 3], 2), 1);
        assert_eq!(pipe.available(), 1);
    }

    #[test]
    fn test_immediate_shutdown_releases_blocked_reader() {
        // One second of capacity so the reader would otherwise wait a second.
        let pipe = Arc::new(MonoPipe::new("p", 1, 8000, 8000).unwrap());
        let reader = Arc::clone(&pipe);
        let handle = std::thread::spawn(move || {
            let mut buf = vec![0i16; 160];
            reader.read(&mut buf, 160)
        });

        std::thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        pipe.shutdown(true);
        assert_eq!(handle.join().unwrap(), 0);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(pipe.state(), PipeState::Shutdown);
    }

    #[test]
    fn test_immediate_shutdown_releases_blocked_writer() {
        let pipe = Arc::new(MonoPipe::new("p", 1, 8000, 8000).unwrap());
        assert_eq!(pipe.write(&vec![0; 8000], 8000), 8000);

        let writer = Arc::clone(&pipe);
        let handle = std::thread::spawn(move || writer.write(&[1; 160], 160));
        std::thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        pipe.shutdown(true);
        assert_eq!(handle.join().unwrap(), 0);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(pipe.write(&[1; 10], 10), 0);
    }

    #[test]
    fn test_draining_delivers_buffered_data() {
        let pipe = MonoPipe::new("p", 1, 8000, 8000).unwrap();
        pipe.write(&[1, 2, 3], 3);
        pipe.shutdown(false);
        assert_eq!(pipe.state(), PipeState::Draining);

        // Writes are still accepted while draining.
        assert_eq!(pipe.write(&[4], 1), 1);

        let mut out = [0i16; 8];
        let start = Instant::now();
        assert_eq!(pipe.read(&mut out, 8), 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_flush_and_reset() {
        let pipe = MonoPipe::new("p", 1, 8000, 16).unwrap();
        pipe.write(&[1, 2, 3], 3);
        pipe.shutdown(true);
        pipe.flush();
        assert_eq!(pipe.state(), PipeState::Flushed);
        assert_eq!(pipe.available(), 0);

        // A later graceful shutdown does not reopen a flushed pipe.
        pipe.shutdown(false);
        assert_eq!(pipe.state(), PipeState::Flushed);

        pipe.reset();
        assert_eq!(pipe.state(), PipeState::Active);
        assert_eq!(pipe.write(&[9], 1), 1);
        let mut out = [0i16; 1];
        assert_eq!(pipe.read(&mut out, 1), 1);
        assert_eq!(out, [9]);
    }
}

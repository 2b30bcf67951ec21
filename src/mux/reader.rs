//! Capture-side multiplexer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::StreamId;
use crate::params::PcmParams;
use crate::port::{InPort, PortTimestamp};
use crate::{Result, RouterError};

#[derive(Debug, Default)]
struct Cursor {
    /// Sequence number of the last period this stream consumed.
    seq: u64,
    started: bool,
    frames_lost: u64,
}

struct ReaderState {
    streams: HashMap<StreamId, Cursor>,
    active: usize,
    open: bool,
    period: Vec<i16>,
    period_frames: usize,
    seq: u64,
}

/// Fans one capture port out to any number of registered streams.
///
/// Each hardware period is read once, by whichever started stream first
/// asks for a period it has not seen, and then handed to every other stream
/// as it asks. Streams keep their own cursor, so a stream that falls more
/// than a period behind skips ahead (and counts the loss) instead of holding
/// the others back.
///
/// The port is opened on the first [`start_stream`](Self::start_stream) and
/// closed when the last started stream stops.
pub struct PcmReader {
    port: Arc<dyn InPort>,
    params: PcmParams,
    state: Mutex<ReaderState>,
}

impl PcmReader {
    /// Creates a reader for `port`, which will be opened with `params`.
    pub fn new(port: Arc<dyn InPort>, params: PcmParams) -> Self {
        Self {
            port,
            params,
            state: Mutex::new(ReaderState {
                streams: HashMap::new(),
                active: 0,
                open: false,
                period: vec![0; params.period_samples()],
                period_frames: 0,
                seq: 0,
            }),
        }
    }

    /// Name of the underlying port.
    pub fn name(&self) -> &str {
        self.port.name()
    }

    /// Whether the port can be used.
    ///
    /// # Errors
    ///
    /// The port's `DeviceUnavailable` report.
    pub fn init_check(&self) -> Result<()> {
        self.port.init_check()
    }

    /// Parameters the port runs at.
    pub fn params(&self) -> &PcmParams {
        &self.params
    }

    /// Attaches a stream.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if `id` is attached, `DeviceUnavailable` if the
    /// port cannot be used.
    pub fn register_stream(&self, id: StreamId) -> Result<()> {
        self.port.init_check()?;
        let mut state = self.state.lock();
        if state.streams.contains_key(&id) {
            return Err(RouterError::AlreadyRegistered {
                stream: id,
                port: self.name().to_string(),
            });
        }
        state.streams.insert(id, Cursor::default());
        tracing::debug!(port = self.name(), %id, "stream registered on reader");
        Ok(())
    }

    /// Detaches a stream, stopping it first if needed.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if `id` was not attached; nothing changes.
    pub fn unregister_stream(&self, id: StreamId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(cursor) = state.streams.remove(&id) else {
            tracing::warn!(port = self.name(), %id, "unregister of unknown stream");
            return Err(RouterError::NotRegistered {
                stream: id,
                port: self.name().to_string(),
            });
        };
        if cursor.started {
            self.release(&mut state);
        }
        tracing::debug!(port = self.name(), %id, "stream unregistered from reader");
        Ok(())
    }

    /// Whether `id` is attached.
    pub fn is_stream_registered(&self, id: StreamId) -> bool {
        self.state.lock().streams.contains_key(&id)
    }

    /// Marks a registered stream running, opening the port if it is the
    /// first one.
    ///
    /// # Errors
    ///
    /// `NotRegistered` for an unknown stream, `DeviceUnavailable` if the
    /// port fails to open (the stream stays stopped).
    pub fn start_stream(&self, id: StreamId) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(cursor) = state.streams.get_mut(&id) else {
            return Err(RouterError::NotRegistered {
                stream: id,
                port: self.name().to_string(),
            });
        };
        if cursor.started {
            return Ok(());
        }
        if !state.open {
            self.port.open(&self.params)?;
            state.open = true;
            state.period_frames = 0;
            tracing::info!(port = self.name(), params = %self.params, "capture port opened");
        }
        cursor.started = true;
        cursor.seq = state.seq;
        state.active += 1;
        tracing::debug!(port = self.name(), %id, active = state.active, "reader stream started");
        Ok(())
    }

    /// Marks a stream stopped, closing the port after the last one.
    ///
    /// # Errors
    ///
    /// `NotRegistered` for an unknown stream.
    pub fn stop_stream(&self, id: StreamId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(cursor) = state.streams.get_mut(&id) else {
            return Err(RouterError::NotRegistered {
                stream: id,
                port: self.name().to_string(),
            });
        };
        if !cursor.started {
            return Ok(());
        }
        cursor.started = false;
        self.release(&mut state);
        tracing::debug!(port = self.name(), %id, active = state.active, "reader stream stopped");
        Ok(())
    }

    fn release(&self, state: &mut ReaderState) {
        state.active = state.active.saturating_sub(1);
        if state.active == 0 && state.open {
            self.port.close();
            state.open = false;
            tracing::info!(port = self.name(), "capture port closed");
        }
    }

    /// Copies the next period `id` has not seen into `dst` and returns its
    /// frame count. Performs the hardware read when `id` is the first to ask.
    ///
    /// # Errors
    ///
    /// `NoDevice` when the stream is not running or the port is closed,
    /// `NotRegistered` for an unknown stream, and the port's error when the
    /// hardware read fails.
    pub fn read_period(&self, id: StreamId, dst: &mut [i16]) -> Result<usize> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(cursor) = state.streams.get_mut(&id) else {
            return Err(RouterError::NotRegistered {
                stream: id,
                port: self.name().to_string(),
            });
        };
        if !cursor.started || !state.open {
            return Err(RouterError::NoDevice);
        }

        if cursor.seq >= state.seq {
            let frames = self.port.read(&mut state.period, self.params.frame_count)?;
            state.period_frames = frames;
            state.seq += 1;
        } else if state.seq - cursor.seq > 1 {
            let lost = (state.seq - cursor.seq - 1) * self.params.frame_count as u64;
            cursor.frames_lost += lost;
            tracing::trace!(port = self.name(), %id, lost, "stream fell behind capture");
        }
        cursor.seq = state.seq;

        let ch = self.params.channels;
        let frames = state.period_frames.min(dst.len() / ch);
        if frames < state.period_frames {
            tracing::warn!(
                port = self.name(),
                %id,
                have = frames,
                period = state.period_frames,
                "destination shorter than a period"
            );
        }
        dst[..frames * ch].copy_from_slice(&state.period[..frames * ch]);
        Ok(frames)
    }

    /// Frames `id` missed by falling behind.
    pub fn frames_lost(&self, id: StreamId) -> u64 {
        self.state
            .lock()
            .streams
            .get(&id)
            .map_or(0, |cursor| cursor.frames_lost)
    }

    /// Aborts the hardware stream so a blocked read returns. The port stays
    /// open; reads fail until it is reopened.
    pub fn stop_port(&self) {
        tracing::debug!(port = self.name(), "stopping capture port");
        self.port.stop();
    }

    /// Hardware timestamp of the port.
    ///
    /// # Errors
    ///
    /// Whatever the port reports; `NoDevice` when closed.
    pub fn timestamp(&self) -> Result<PortTimestamp> {
        self.port.timestamp()
    }

    /// Whether the hardware is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Registered streams.
    pub fn registered_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    /// Started streams.
    pub fn active_count(&self) -> usize {
        self.state.lock().active
    }
}

impl std::fmt::Debug for PcmReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PcmReader")
            .field("port", &self.name())
            .field("params", &self.params)
            .field("registered", &state.streams.len())
            .field("active", &state.active)
            .field("open", &state.open)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{MockInPort, Signal};

    fn reader() -> (Arc<MockInPort>, PcmReader) {
        let port = Arc::new(MockInPort::new("in", Signal::Ramp));
        let reader = PcmReader::new(port.clone(), PcmParams::new(2, 16, 8000, 4));
        (port, reader)
    }

    #[test]
    fn test_register_twice_fails() {
        let (_, reader) = reader();
        let id = StreamId::next();
        reader.register_stream(id).unwrap();
        assert!(reader.is_stream_registered(id));
        assert!(matches!(
            reader.register_stream(id),
            Err(RouterError::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn test_unregister_unknown_is_reported() {
        let (_, reader) = reader();
        assert!(matches!(
            reader.unregister_stream(StreamId::next()),
            Err(RouterError::NotRegistered { .. })
        ));
    }

    #[test]
    fn test_lazy_open_and_refcounted_close() {
        let (port, reader) = reader();
        let a = StreamId::next();
        let b = StreamId::next();
        reader.register_stream(a).unwrap();
        reader.register_stream(b).unwrap();
        assert!(!port.is_open());

        reader.start_stream(a).unwrap();
        reader.start_stream(b).unwrap();
        reader.start_stream(b).unwrap();
        assert!(port.is_open());
        assert_eq!(port.open_count(), 1);
        assert_eq!(reader.active_count(), 2);

        reader.stop_stream(a).unwrap();
        assert!(port.is_open());
        reader.stop_stream(b).unwrap();
        assert!(!port.is_open());
    }

    #[test]
    fn test_open_failure_leaves_stream_stopped() {
        let (port, reader) = reader();
        let id = StreamId::next();
        reader.register_stream(id).unwrap();
        port.set_fail_open(true);
        assert!(matches!(
            reader.start_stream(id),
            Err(RouterError::DeviceUnavailable { .. })
        ));
        assert_eq!(reader.active_count(), 0);
        let mut buf = [0i16; 8];
        assert_eq!(reader.read_period(id, &mut buf), Err(RouterError::NoDevice));
    }

    #[test]
    fn test_streams_share_each_period() {
        let (port, reader) = reader();
        let a = StreamId::next();
        let b = StreamId::next();
        for id in [a, b] {
            reader.register_stream(id).unwrap();
            reader.start_stream(id).unwrap();
        }

        let mut buf_a = [0i16; 8];
        let mut buf_b = [0i16; 8];
        assert_eq!(reader.read_period(a, &mut buf_a).unwrap(), 4);
        assert_eq!(reader.read_period(b, &mut buf_b).unwrap(), 4);
        assert_eq!(buf_a, buf_b);
        assert_eq!(buf_a, [0, 0, 1, 1, 2, 2, 3, 3]);
        // One hardware read served both streams.
        assert_eq!(port.frames_read(), 4);

        reader.read_period(a, &mut buf_a).unwrap();
        assert_eq!(buf_a, [4, 4, 5, 5, 6, 6, 7, 7]);
    }

    #[test]
    fn test_slow_stream_skips_ahead() {
        let (_, reader) = reader();
        let fast = StreamId::next();
        let slow = StreamId::next();
        for id in [fast, slow] {
            reader.register_stream(id).unwrap();
            reader.start_stream(id).unwrap();
        }

        let mut buf = [0i16; 8];
        for _ in 0..3 {
            reader.read_period(fast, &mut buf).unwrap();
        }
        reader.read_period(slow, &mut buf).unwrap();
        // The slow stream sees the latest period, not the first.
        assert_eq!(buf[0], 8);
        assert_eq!(reader.frames_lost(slow), 8);
        assert_eq!(reader.frames_lost(fast), 0);
    }

    #[test]
    fn test_read_failure_propagates_and_recovers() {
        let (port, reader) = reader();
        let id = StreamId::next();
        reader.register_stream(id).unwrap();
        reader.start_stream(id).unwrap();

        port.fail_next(1);
        let mut buf = [0i16; 8];
        assert!(reader.read_period(id, &mut buf).unwrap_err().is_transient());
        assert_eq!(reader.read_period(id, &mut buf).unwrap(), 4);
    }

    #[test]
    fn test_unregister_running_stream_closes_port() {
        let (port, reader) = reader();
        let id = StreamId::next();
        reader.register_stream(id).unwrap();
        reader.start_stream(id).unwrap();
        reader.unregister_stream(id).unwrap();
        assert!(!port.is_open());
        assert_eq!(reader.registered_count(), 0);
    }
}

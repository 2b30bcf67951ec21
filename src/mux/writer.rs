//! Playback-side multiplexer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::StreamId;
use crate::params::PcmParams;
use crate::port::{OutPort, PortTimestamp};
use crate::{Result, RouterError};

#[derive(Debug, Default)]
struct WriterState {
    /// Registered streams and whether each is started.
    streams: HashMap<StreamId, bool>,
    active: usize,
    open: bool,
}

/// Demand-driven adapter from registered streams to one playback port.
///
/// Every `write_period` call is one hardware write; the writer does not mix.
/// Only one stream is expected to be live at a time, which the device
/// enforces through its registration order.
pub struct PcmWriter {
    port: Arc<dyn OutPort>,
    params: PcmParams,
    state: Mutex<WriterState>,
}

impl PcmWriter {
    /// Creates a writer for `port`, which will be opened with `params`.
    pub fn new(port: Arc<dyn OutPort>, params: PcmParams) -> Self {
        Self {
            port,
            params,
            state: Mutex::new(WriterState::default()),
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
        state.streams.insert(id, false);
        tracing::debug!(port = self.name(), %id, "stream registered on writer");
        Ok(())
    }

    /// Detaches a stream, stopping it first if needed.
    ///
    /// # Errors
    ///
    /// `NotRegistered` if `id` was not attached; nothing changes.
    pub fn unregister_stream(&self, id: StreamId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(started) = state.streams.remove(&id) else {
            tracing::warn!(port = self.name(), %id, "unregister of unknown stream");
            return Err(RouterError::NotRegistered {
                stream: id,
                port: self.name().to_string(),
            });
        };
        if started {
            self.release(&mut state);
        }
        tracing::debug!(port = self.name(), %id, "stream unregistered from writer");
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
        let Some(started) = state.streams.get_mut(&id) else {
            return Err(RouterError::NotRegistered {
                stream: id,
                port: self.name().to_string(),
            });
        };
        if *started {
            return Ok(());
        }
        if !state.open {
            self.port.open(&self.params)?;
            state.open = true;
            tracing::info!(port = self.name(), params = %self.params, "playback port opened");
        }
        *started = true;
        state.active += 1;
        Ok(())
    }

    /// Marks a stream stopped, closing the port after the last one.
    ///
    /// # Errors
    ///
    /// `NotRegistered` for an unknown stream.
    pub fn stop_stream(&self, id: StreamId) -> Result<()> {
        let mut state = self.state.lock();
        let Some(started) = state.streams.get_mut(&id) else {
            return Err(RouterError::NotRegistered {
                stream: id,
                port: self.name().to_string(),
            });
        };
        if !*started {
            return Ok(());
        }
        *started = false;
        self.release(&mut state);
        Ok(())
    }

    fn release(&self, state: &mut WriterState) {
        state.active = state.active.saturating_sub(1);
        if state.active == 0 && state.open {
            self.port.close();
            state.open = false;
            tracing::info!(port = self.name(), "playback port closed");
        }
    }

    /// Writes `frames` port-layout frames from `src` for stream `id`.
    ///
    /// # Errors
    ///
    /// `NoDevice` when the stream is not running or the port is closed,
    /// `NotRegistered` for an unknown stream, and the port's error when the
    /// hardware write fails.
    pub fn write_period(&self, id: StreamId, src: &[i16], frames: usize) -> Result<usize> {
        let state = self.state.lock();
        match state.streams.get(&id) {
            None => {
                return Err(RouterError::NotRegistered {
                    stream: id,
                    port: self.name().to_string(),
                })
            }
            Some(false) => return Err(RouterError::NoDevice),
            Some(true) if !state.open => return Err(RouterError::NoDevice),
            Some(true) => {}
        }
        let frames = frames.min(src.len() / self.params.channels);
        self.port.write(src, frames)
    }

    /// Aborts the hardware stream so a blocked write returns.
    pub fn stop_port(&self) {
        tracing::debug!(port = self.name(), "stopping playback port");
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

impl std::fmt::Debug for PcmWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PcmWriter")
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
    use crate::port::MockOutPort;

    fn writer() -> (Arc<MockOutPort>, PcmWriter) {
        let port = Arc::new(MockOutPort::new("out"));
        let writer = PcmWriter::new(port.clone(), PcmParams::new(2, 16, 8000, 4));
        (port, writer)
    }

    #[test]
    fn test_write_requires_started_stream() {
        let (_, writer) = writer();
        let id = StreamId::next();
        assert!(matches!(
            writer.write_period(id, &[0; 8], 4),
            Err(RouterError::NotRegistered { .. })
        ));
        writer.register_stream(id).unwrap();
        assert_eq!(writer.write_period(id, &[0; 8], 4), Err(RouterError::NoDevice));
    }

    #[test]
    fn test_write_reaches_port() {
        let (port, writer) = writer();
        let id = StreamId::next();
        writer.register_stream(id).unwrap();
        writer.start_stream(id).unwrap();
        assert_eq!(writer.write_period(id, &[1, 2, 3, 4], 2).unwrap(), 2);
        assert_eq!(port.recorded(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_refcounted_open_close() {
        let (port, writer) = writer();
        let a = StreamId::next();
        let b = StreamId::next();
        for id in [a, b] {
            writer.register_stream(id).unwrap();
            writer.start_stream(id).unwrap();
        }
        assert_eq!(port.open_count(), 1);
        writer.stop_stream(a).unwrap();
        assert!(writer.is_open());
        writer.unregister_stream(b).unwrap();
        assert!(!writer.is_open());
        assert!(!port.is_open());
    }

    #[test]
    fn test_open_failure() {
        let (port, writer) = writer();
        let id = StreamId::next();
        writer.register_stream(id).unwrap();
        port.set_fail_open(true);
        assert!(matches!(
            writer.start_stream(id),
            Err(RouterError::DeviceUnavailable { .. })
        ));
        assert_eq!(writer.active_count(), 0);
        port.set_fail_open(false);
        writer.start_stream(id).unwrap();
        assert_eq!(writer.active_count(), 1);
    }

    #[test]
    fn test_stop_unknown_stream() {
        let (_, writer) = writer();
        assert!(writer.stop_stream(StreamId::next()).is_err());
    }
}

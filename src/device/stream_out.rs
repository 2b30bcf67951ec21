//! Client playback stream.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::{query_parameters, AudioStream, DeviceShared};
use crate::event::{emit, DeviceEvent};
use crate::format::SlotMap;
use crate::kv::{self, ParamList};
use crate::mux::PcmWriter;
use crate::params::{AudioConfig, PcmParams, SampleFormat};
use crate::port::NullOutPort;
use crate::routing::devices;
use crate::stream::OutStream;
use crate::{Result, RouterError};

struct OutInner {
    stream: OutStream,
    standby: bool,
    voice_call: bool,
    devices: u32,
    frames_written: u64,
}

/// A client playback stream.
///
/// Starts in standby. The first [`write`](Self::write) attaches it to its
/// port; [`standby`](AudioStream::standby) detaches it again. While the
/// stream is the primary output and a call is active, its audio goes to a
/// discard sink paced like the real port.
pub struct StreamOut {
    shared: Arc<DeviceShared>,
    params: PcmParams,
    writer: Arc<PcmWriter>,
    null_writer: Arc<PcmWriter>,
    hw_buffer_frames: usize,
    inner: Mutex<OutInner>,
}

impl StreamOut {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        writer: Arc<PcmWriter>,
        config: &AudioConfig,
        slots: SlotMap,
        devices: u32,
        period_count: usize,
    ) -> Result<Self> {
        let port = *writer.params();
        let params = PcmParams::new(2, 16, config.sample_rate, port.frame_count);
        let null_port = Arc::new(NullOutPort::new(format!("{}-null", writer.name())));
        let null_writer = Arc::new(PcmWriter::new(null_port, port));
        let stream = OutStream::new(Arc::clone(&writer), params, slots)?;

        Ok(Self {
            shared,
            params,
            writer,
            null_writer,
            hw_buffer_frames: port.frame_count * period_count,
            inner: Mutex::new(OutInner {
                stream,
                standby: true,
                voice_call: false,
                devices,
                frames_written: 0,
            }),
        })
    }

    /// Writer of the port this stream is routed to.
    pub(crate) fn writer(&self) -> &Arc<PcmWriter> {
        &self.writer
    }

    /// Parameters the client writes in.
    pub fn params(&self) -> &PcmParams {
        &self.params
    }

    /// Writes interleaved 16-bit samples and returns the bytes consumed.
    ///
    /// # Errors
    ///
    /// The attach or hardware error. The call sleeps for the duration of the
    /// samples before returning it, so a caller retrying in a loop keeps
    /// real-time pace.
    pub fn write(&self, samples: &[i16]) -> Result<usize> {
        let frames = samples.len() / self.params.channels;
        let mut inner = self.inner.lock();

        if inner.standby {
            if let Err(err) = self.resume(&mut inner) {
                tracing::error!(port = self.writer.name(), %err, "failed to resume output stream");
                std::thread::sleep(self.params.frames_duration(frames));
                return Err(err);
            }
            inner.standby = false;
        }

        match inner.stream.write(samples, frames) {
            Ok(written) => {
                if written != frames {
                    tracing::warn!(written, frames, "short output write");
                }
                inner.frames_written += written as u64;
                Ok(self.params.frames_to_bytes(written))
            }
            Err(err) => {
                tracing::error!(port = self.writer.name(), %err, "failed to write output data");
                emit(
                    self.shared.events.as_ref(),
                    DeviceEvent::TransientIo {
                        stream: inner.stream.id().to_string(),
                        error: err.to_string(),
                    },
                );
                std::thread::sleep(self.params.frames_duration(frames));
                Err(err)
            }
        }
    }

    fn resume(&self, inner: &mut OutInner) -> Result<()> {
        let writer = if inner.voice_call {
            &self.null_writer
        } else {
            &self.writer
        };
        tracing::debug!(writer = writer.name(), "resuming output stream");
        inner.stream.retarget(Arc::clone(writer))?;
        inner.stream.register()?;
        if let Err(err) = inner.stream.start() {
            if let Err(unregister_err) = inner.stream.unregister() {
                tracing::warn!(%unregister_err, "unregister after failed start");
            }
            return Err(err);
        }
        Ok(())
    }

    fn idle(inner: &mut OutInner) {
        if let Err(err) = inner.stream.stop() {
            tracing::warn!(%err, "output stream stop failed");
        }
        if let Err(err) = inner.stream.unregister() {
            tracing::warn!(%err, "output stream unregister failed");
        }
    }

    /// Diverts the stream to the discard sink (`on`) or back to its port.
    ///
    /// A running stream goes through standby so the switch happens on the
    /// next write.
    pub(crate) fn set_voice_call(&self, on: bool) {
        let mut inner = self.inner.lock();
        if inner.voice_call != on {
            tracing::debug!(on, "output stream voice call");
            if !inner.standby {
                Self::idle(&mut inner);
                inner.standby = true;
            }
            inner.voice_call = on;
        }
    }

    /// Whether the stream is currently diverted for a call.
    pub fn is_diverted(&self) -> bool {
        self.inner.lock().voice_call
    }

    /// Whether the stream is in standby.
    pub fn is_standby(&self) -> bool {
        self.inner.lock().standby
    }

    /// Hardware latency in milliseconds.
    pub fn latency_ms(&self) -> u32 {
        let rate = self.writer.params().sample_rate;
        (self.hw_buffer_frames as u64 * 1000 / u64::from(rate)) as u32
    }

    /// Per-stream volume is not supported by the hardware.
    ///
    /// # Errors
    ///
    /// Always `NotSupported`.
    pub fn set_volume(&self, left: f32, right: f32) -> Result<()> {
        tracing::debug!(left, right, "set_volume");
        Err(RouterError::NotSupported {
            operation: "set_volume",
        })
    }

    /// Client frames accepted since the stream was opened.
    pub fn render_position(&self) -> u64 {
        self.inner.lock().frames_written
    }

    /// Client frames that have reached the speaker, and when that was
    /// measured.
    ///
    /// # Errors
    ///
    /// `NoDevice` in standby, otherwise the port's timestamp error.
    pub fn presentation_position(&self) -> Result<(u64, Instant)> {
        let inner = self.inner.lock();
        if inner.standby {
            return Err(RouterError::NoDevice);
        }
        let ts = inner.stream.timestamp()?;
        let port_rate = u64::from(self.writer.params().sample_rate);
        let queued = self.hw_buffer_frames.saturating_sub(ts.available) as u64;
        let queued = queued * u64::from(self.params.sample_rate) / port_rate;
        let pending = inner.stream.pending_frames() as u64;
        Ok((
            inner.frames_written.saturating_sub(queued + pending),
            ts.time,
        ))
    }
}

impl AudioStream for StreamOut {
    fn sample_rate(&self) -> u32 {
        self.params.sample_rate
    }

    fn channels(&self) -> usize {
        self.params.channels
    }

    fn format(&self) -> SampleFormat {
        SampleFormat::I16
    }

    fn buffer_size(&self) -> usize {
        let port_rate = self.writer.params().sample_rate as usize;
        let frames = self.params.frame_count * self.params.sample_rate as usize / port_rate;
        ((frames + 15) & !15) * self.params.frame_size()
    }

    fn standby(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.standby {
            Self::idle(&mut inner);
            inner.standby = true;
            tracing::debug!(port = self.writer.name(), "output stream in standby");
        }
        Ok(())
    }

    fn devices(&self) -> u32 {
        self.inner.lock().devices
    }

    fn set_parameters(&self, kv_pairs: &str) -> Result<()> {
        tracing::debug!(kv_pairs, "output set_parameters");
        let params = ParamList::parse(kv_pairs);
        let Some(device) = params.get_u32(kv::ROUTING) else {
            return Ok(());
        };
        if self.devices() & devices::OUT_ALL != device {
            self.standby()?;
        }
        if devices::is_supported(device) {
            self.inner.lock().devices = device;
        } else {
            tracing::warn!(device = format_args!("0x{device:08x}"), "unsupported output device, keeping current");
        }
        Ok(())
    }

    fn get_parameters(&self, keys: &str) -> String {
        let devices = self.devices();
        query_parameters(keys, |key| (key == kv::ROUTING).then(|| devices.to_string()))
    }
}

impl std::fmt::Debug for StreamOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StreamOut")
            .field("port", &self.writer.name())
            .field("params", &self.params)
            .field("standby", &inner.standby)
            .field("voice_call", &inner.voice_call)
            .field("devices", &format_args!("0x{:08x}", inner.devices))
            .field("frames_written", &inner.frames_written)
            .finish()
    }
}

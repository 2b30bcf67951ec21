//! Client capture stream.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{input_buffer_frames, query_parameters, AudioStream, DeviceShared};
use crate::event::{emit, DeviceEvent};
use crate::format::SlotMap;
use crate::kv::{self, ParamList};
use crate::mux::PcmReader;
use crate::params::{PcmParams, SampleFormat};
use crate::routing::devices;
use crate::stream::InStream;
use crate::Result;

struct InInner {
    stream: InStream,
    standby: bool,
    devices: u32,
    source: u32,
    lost_reported: u64,
}

/// A client capture stream.
///
/// Starts in standby; the first [`read`](Self::read) attaches it to the
/// capture port. Hardware hiccups are papered over with silence so the
/// client always gets the amount it asked for.
pub struct StreamIn {
    shared: Arc<DeviceShared>,
    params: PcmParams,
    reader: Arc<PcmReader>,
    inner: Mutex<InInner>,
}

impl StreamIn {
    pub(crate) fn new(
        shared: Arc<DeviceShared>,
        reader: Arc<PcmReader>,
        params: PcmParams,
        slots: SlotMap,
        devices: u32,
    ) -> Result<Self> {
        let stream = InStream::new(Arc::clone(&reader), params, slots)?;
        Ok(Self {
            shared,
            params,
            reader,
            inner: Mutex::new(InInner {
                stream,
                standby: true,
                devices,
                source: 0,
                lost_reported: 0,
            }),
        })
    }

    /// Parameters the client reads in.
    pub fn params(&self) -> &PcmParams {
        &self.params
    }

    /// Fills `buf` with interleaved 16-bit samples and returns the bytes
    /// produced.
    ///
    /// A transient hardware failure yields silence for the whole request.
    /// With the microphone muted the data is zeroed.
    ///
    /// # Errors
    ///
    /// The attach error, or `NoDevice` when the port went away. The call
    /// sleeps for the duration of the request before returning it.
    pub fn read(&self, buf: &mut [i16]) -> Result<usize> {
        let ch = self.params.channels;
        let frames = buf.len() / ch;
        let mut inner = self.inner.lock();

        if inner.standby {
            if let Err(err) = Self::resume(&mut inner) {
                tracing::error!(port = self.reader.name(), %err, "failed to resume input stream");
                std::thread::sleep(self.params.frames_duration(frames));
                return Err(err);
            }
            inner.standby = false;
        }

        match inner.stream.read(buf, frames) {
            Ok(read) => {
                if read != frames {
                    tracing::warn!(read, frames, "short input read");
                }
                if self.shared.mic_mute.load(Ordering::Relaxed) {
                    buf[..read * ch].fill(0);
                }
                Ok(self.params.frames_to_bytes(read))
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(port = self.reader.name(), %err, "input read failed, returning silence");
                emit(
                    self.shared.events.as_ref(),
                    DeviceEvent::TransientIo {
                        stream: inner.stream.id().to_string(),
                        error: err.to_string(),
                    },
                );
                std::thread::sleep(self.params.frames_duration(frames));
                buf[..frames * ch].fill(0);
                Ok(self.params.frames_to_bytes(frames))
            }
            Err(err) => {
                tracing::error!(port = self.reader.name(), %err, "failed to read input data");
                std::thread::sleep(self.params.frames_duration(frames));
                Err(err)
            }
        }
    }

    fn resume(inner: &mut InInner) -> Result<()> {
        inner.stream.register()?;
        if let Err(err) = inner.stream.start() {
            if let Err(unregister_err) = inner.stream.unregister() {
                tracing::warn!(%unregister_err, "unregister after failed start");
            }
            return Err(err);
        }
        Ok(())
    }

    fn idle(inner: &mut InInner) {
        if let Err(err) = inner.stream.stop() {
            tracing::warn!(%err, "input stream stop failed");
        }
        if let Err(err) = inner.stream.unregister() {
            tracing::warn!(%err, "input stream unregister failed");
        }
    }

    /// Whether the stream is in standby.
    pub fn is_standby(&self) -> bool {
        self.inner.lock().standby
    }

    /// Input gain is fixed in hardware; the request is accepted and ignored.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn set_gain(&self, gain: f32) -> Result<()> {
        tracing::debug!(gain, "set_gain ignored");
        Ok(())
    }

    /// Frames dropped since the previous call because the client read too
    /// slowly.
    pub fn input_frames_lost(&self) -> u64 {
        let mut inner = self.inner.lock();
        let total = inner.stream.frames_lost();
        let lost = total.saturating_sub(inner.lost_reported);
        inner.lost_reported = total;
        lost
    }

    /// Capture source last selected through `input_source`, 0 if none.
    pub fn input_source(&self) -> u32 {
        self.inner.lock().source
    }
}

impl AudioStream for StreamIn {
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
        input_buffer_frames(self.reader.params(), self.params.sample_rate) * self.params.frame_size()
    }

    fn standby(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.standby {
            Self::idle(&mut inner);
            inner.standby = true;
            tracing::debug!(port = self.reader.name(), "input stream in standby");
        }
        Ok(())
    }

    fn devices(&self) -> u32 {
        self.inner.lock().devices
    }

    fn set_parameters(&self, kv_pairs: &str) -> Result<()> {
        tracing::debug!(kv_pairs, "input set_parameters");
        let params = ParamList::parse(kv_pairs);

        if let Some(source) = params.get_u32(kv::INPUT_SOURCE) {
            let mut inner = self.inner.lock();
            if inner.source != source && kv::is_valid_input_source(source) {
                tracing::debug!(from = inner.source, to = source, "input source changed");
                inner.source = source;
            }
        }

        if let Some(device) = params.get_u32(kv::ROUTING) {
            if self.devices() & devices::IN_ALL != device {
                self.standby()?;
            }
            if devices::is_supported(device) {
                self.inner.lock().devices = device;
            } else {
                tracing::warn!(device = format_args!("0x{device:08x}"), "unsupported input device, keeping current");
            }
        }
        Ok(())
    }

    fn get_parameters(&self, keys: &str) -> String {
        let (devices, source) = {
            let inner = self.inner.lock();
            (inner.devices, inner.source)
        };
        query_parameters(keys, |key| match key {
            kv::ROUTING => Some(devices.to_string()),
            kv::INPUT_SOURCE => Some(source.to_string()),
            _ => None,
        })
    }
}

impl std::fmt::Debug for StreamIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StreamIn")
            .field("port", &self.reader.name())
            .field("params", &self.params)
            .field("standby", &inner.standby)
            .field("devices", &format_args!("0x{:08x}", inner.devices))
            .field("source", &inner.source)
            .finish()
    }
}

//! The hardware device: ports, client streams and the voice-call state
//! machine.

mod builder;
mod stream_in;
mod stream_out;

pub use builder::HwDeviceBuilder;
pub use stream_in::StreamIn;
pub use stream_out::StreamOut;
pub use crate::voice::CallState;

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{DeviceConfig, PortId, PORT_COUNT};
use crate::event::{emit, DeviceEvent, EventCallback};
use crate::kv::ParamList;
use crate::mixer::{voice_volume_register, MixerControl, MixerValue};
use crate::mux::{PcmReader, PcmWriter};
use crate::params::{AudioConfig, PcmParams, SampleFormat};
use crate::pipe::MonoPipe;
use crate::routing;
use crate::voice::{CallPorts, VoiceSession};
use crate::{Result, RouterError};

/// Audio mode requested by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioMode {
    /// Media playback and capture.
    #[default]
    Normal,
    /// A call is ringing.
    Ringtone,
    /// Cellular call over the far-end link.
    InCall,
    /// VoIP call; handled by clients, not the device.
    InCommunication,
}

impl fmt::Display for AudioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::Ringtone => "ringtone",
            Self::InCall => "in-call",
            Self::InCommunication => "in-communication",
        };
        f.write_str(name)
    }
}

/// Operations shared by input and output streams.
pub trait AudioStream: Send + Sync {
    /// Client sample rate.
    fn sample_rate(&self) -> u32;

    /// Client channel count.
    fn channels(&self) -> usize;

    /// Client sample format.
    fn format(&self) -> SampleFormat;

    /// Bytes the client should move per call.
    fn buffer_size(&self) -> usize;

    /// Detaches the stream from its port. Redundant calls are fine.
    ///
    /// # Errors
    ///
    /// Reserved for drivers that can fail to stop; never fails today.
    fn standby(&self) -> Result<()>;

    /// Device mask the stream is routed to.
    fn devices(&self) -> u32;

    /// Applies `key=value;...` parameters. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Reserved; unsupported values are logged and ignored.
    fn set_parameters(&self, kv_pairs: &str) -> Result<()>;

    /// Values of the requested `;`-separated keys that the stream knows.
    fn get_parameters(&self, keys: &str) -> String;
}

/// Builds a `key=value;...` reply for the keys in `keys` that `lookup`
/// answers.
pub(crate) fn query_parameters(keys: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let requested = ParamList::parse(keys);
    let mut reply = ParamList::new();
    for key in requested.keys() {
        if let Some(value) = lookup(key) {
            reply.set(key, value);
        }
    }
    reply.to_string()
}

/// Frames a capture client reads per call: one port period at `rate`,
/// rounded up to a multiple of 16.
pub(crate) fn input_buffer_frames(port: &PcmParams, rate: u32) -> usize {
    let period = port.frame_count as u64 * u64::from(rate);
    let frames = period.div_ceil(u64::from(port.sample_rate)) as usize;
    (frames + 15) & !15
}

/// State the device shares with its streams.
#[derive(Default)]
pub(crate) struct DeviceShared {
    pub(crate) mic_mute: AtomicBool,
    pub(crate) events: Option<EventCallback>,
}

#[derive(Default)]
struct DeviceState {
    mode: AudioMode,
    call_state: CallState,
    outputs: Vec<Arc<StreamOut>>,
    inputs: Vec<Arc<StreamIn>>,
    primary: Option<Arc<StreamOut>>,
    voice: Option<VoiceSession>,
}

/// The audio device.
///
/// Owns one reader and one writer per hardware port, the open client
/// streams and, while in call mode, the voice session. A device-wide lock
/// serialises mode changes and stream open/close; it is always taken before
/// any stream lock.
///
/// # Example
///
/// ```
/// use pcm_router::port::MockPorts;
/// use pcm_router::{devices, AudioConfig, HwDevice};
///
/// let ports = MockPorts::new();
/// let device = HwDevice::builder().ports(ports.port_set()).build().unwrap();
///
/// let mut config = AudioConfig::default();
/// let out = device.open_output_stream(devices::OUT_SPEAKER, &mut config).unwrap();
/// assert_eq!(out.write(&[0i16; 2048]).unwrap(), 4096);
/// ```
pub struct HwDevice {
    config: Arc<DeviceConfig>,
    readers: [Arc<PcmReader>; PORT_COUNT],
    writers: [Arc<PcmWriter>; PORT_COUNT],
    mixer: Arc<dyn MixerControl>,
    shared: Arc<DeviceShared>,
    state: Mutex<DeviceState>,
}

impl HwDevice {
    /// Creates a builder.
    pub fn builder() -> HwDeviceBuilder {
        HwDeviceBuilder::new()
    }

    pub(crate) fn from_parts(
        config: Arc<DeviceConfig>,
        readers: [Arc<PcmReader>; PORT_COUNT],
        writers: [Arc<PcmWriter>; PORT_COUNT],
        mixer: Arc<dyn MixerControl>,
        events: Option<EventCallback>,
    ) -> Self {
        Self {
            config,
            readers,
            writers,
            mixer,
            shared: Arc::new(DeviceShared {
                mic_mute: AtomicBool::new(false),
                events,
            }),
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// The configuration the device was built with.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Checks that every port can be used.
    ///
    /// # Errors
    ///
    /// The first port's `DeviceUnavailable`.
    pub fn init_check(&self) -> Result<()> {
        for reader in &self.readers {
            reader.init_check()?;
        }
        for writer in &self.writers {
            writer.init_check()?;
        }
        Ok(())
    }

    /// Current audio mode.
    pub fn mode(&self) -> AudioMode {
        self.state.lock().mode
    }

    /// Current voice-call state.
    pub fn call_state(&self) -> CallState {
        self.state.lock().call_state
    }

    /// Switches the audio mode. Entering [`AudioMode::InCall`] starts the
    /// voice call, any other mode ends it. Setting the current mode again
    /// does nothing.
    ///
    /// # Errors
    ///
    /// Whatever prevented the call from starting; the mode is unchanged and
    /// nothing of the call is left running.
    pub fn set_mode(&self, mode: AudioMode) -> Result<()> {
        let mut state = self.state.lock();
        if state.mode == mode {
            tracing::warn!(%mode, "already in mode");
            return Ok(());
        }

        if mode == AudioMode::InCall {
            if let Err(err) = self.enter_call(&mut state) {
                tracing::error!(%err, "failed to enter voice call");
                return Err(err);
            }
        } else {
            self.leave_call(&mut state);
        }

        let previous = std::mem::replace(&mut state.mode, mode);
        drop(state);
        tracing::info!(%previous, current = %mode, "audio mode changed");
        emit(
            self.shared.events.as_ref(),
            DeviceEvent::ModeChanged {
                previous,
                current: mode,
            },
        );
        Ok(())
    }

    fn set_call_state(&self, state: &mut DeviceState, call_state: CallState) {
        if state.call_state != call_state {
            state.call_state = call_state;
            tracing::debug!(state = %call_state, "call state");
            emit(
                self.shared.events.as_ref(),
                DeviceEvent::CallStateChanged { state: call_state },
            );
        }
    }

    fn set_far_end_clock(&self, master: bool) -> Result<()> {
        let controls = &self.config.controls;
        let value = if master {
            &controls.far_end_master
        } else {
            &controls.far_end_slave
        };
        self.mixer
            .set(&controls.far_end_mode, MixerValue::from(value.as_str()), true)
    }

    fn enter_call(&self, state: &mut DeviceState) -> Result<()> {
        if state.voice.is_some() {
            return Ok(());
        }
        tracing::info!("entering voice call");
        self.set_call_state(state, CallState::Entering);

        if let Err(err) = self.set_far_end_clock(true) {
            self.set_call_state(state, CallState::Idle);
            return Err(err);
        }

        let Some(primary) = state.primary.clone() else {
            tracing::error!("no primary output stream for the call downlink");
            self.restore_far_end_clock();
            self.set_call_state(state, CallState::Idle);
            return Err(RouterError::NoPrimaryOutput);
        };
        primary.set_voice_call(true);

        let media = self.config.media_port();
        let ports = CallPorts {
            media_reader: Arc::clone(&self.readers[media.index()]),
            media_writer: Arc::clone(primary.writer()),
            far_end_reader: Arc::clone(&self.readers[PortId::FarEnd.index()]),
            far_end_writer: Arc::clone(&self.writers[PortId::FarEnd.index()]),
        };
        let session = VoiceSession::new(&self.config, ports, self.shared.events.clone())
            .and_then(|mut session| {
                session.enter(self.config.voice_settle_time())?;
                Ok(session)
            });

        match session {
            Ok(session) => {
                state.voice = Some(session);
                self.set_call_state(state, CallState::Active);
                Ok(())
            }
            Err(err) => {
                primary.set_voice_call(false);
                self.restore_far_end_clock();
                self.set_call_state(state, CallState::Idle);
                Err(err)
            }
        }
    }

    fn restore_far_end_clock(&self) {
        if let Err(err) = self.set_far_end_clock(false) {
            tracing::warn!(%err, "failed to return the far-end link to slave mode");
        }
    }

    fn leave_call(&self, state: &mut DeviceState) {
        let Some(mut session) = state.voice.take() else {
            return;
        };
        self.set_call_state(state, CallState::Leaving);

        // The far-end ports must have a clock to stop cleanly.
        self.restore_far_end_clock();
        session.leave();
        drop(session);

        match &state.primary {
            Some(primary) => primary.set_voice_call(false),
            None => tracing::warn!("primary output closed during the call"),
        }
        for output in &state.outputs {
            if output.is_diverted() {
                output.set_voice_call(false);
            }
        }

        if let Err(err) = self.set_voice_volume(1.0) {
            tracing::warn!(%err, "failed to restore cabin volume");
        }
        self.set_call_state(state, CallState::Idle);
    }

    /// Sets the cabin volume used during a call, `0.0..=1.0`.
    ///
    /// Mixer failures are logged; the device keeps its previous volume.
    ///
    /// # Errors
    ///
    /// `InvalidParameters` outside `0.0..=1.0`.
    pub fn set_voice_volume(&self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(RouterError::invalid(format!(
                "voice volume {volume} is outside 0.0..=1.0"
            )));
        }
        let value = voice_volume_register(volume, self.config.voice_volume_db);
        tracing::debug!(volume, value, "voice volume");
        let controls = &self.config.controls;
        for control in [&controls.headphone_volume, &controls.line_volume] {
            if let Err(err) = self.mixer.set(control, MixerValue::Int(value), true) {
                tracing::warn!(%err, "failed to set voice volume");
            }
        }
        Ok(())
    }

    /// Master volume is not supported by the hardware.
    ///
    /// # Errors
    ///
    /// Always `NotSupported`.
    pub fn set_master_volume(&self, volume: f32) -> Result<()> {
        tracing::debug!(volume, "set_master_volume");
        Err(RouterError::NotSupported {
            operation: "set_master_volume",
        })
    }

    /// Master mute is not supported by the hardware.
    ///
    /// # Errors
    ///
    /// Always `NotSupported`.
    pub fn set_master_mute(&self, mute: bool) -> Result<()> {
        tracing::debug!(mute, "set_master_mute");
        Err(RouterError::NotSupported {
            operation: "set_master_mute",
        })
    }

    /// Mutes or unmutes every capture stream.
    pub fn set_mic_mute(&self, mute: bool) {
        tracing::debug!(mute, "mic mute");
        self.shared.mic_mute.store(mute, Ordering::Relaxed);
    }

    /// Whether capture is muted.
    pub fn mic_mute(&self) -> bool {
        self.shared.mic_mute.load(Ordering::Relaxed)
    }

    /// Device-level parameters are accepted and ignored.
    ///
    /// # Errors
    ///
    /// Never fails.
    pub fn set_parameters(&self, kv_pairs: &str) -> Result<()> {
        tracing::debug!(kv_pairs, "device set_parameters");
        Ok(())
    }

    /// The device exposes no parameters.
    pub fn get_parameters(&self, keys: &str) -> String {
        tracing::debug!(keys, "device get_parameters");
        String::new()
    }

    /// Bytes a capture client with `config` should read per call: one
    /// capture period at the client rate, rounded up to 16 frames.
    ///
    /// # Errors
    ///
    /// `UnsupportedChannelLayout` for anything but mono or stereo,
    /// `UnsupportedFormat` for anything but 16-bit.
    pub fn get_input_buffer_size(&self, config: &AudioConfig) -> Result<usize> {
        let reader = self.readers[self.config.media_port().index()].params();
        check_input_config(config, reader)?;
        let frames = input_buffer_frames(reader, config.sample_rate);
        Ok(frames * config.channels * config.format.bits() as usize / 8)
    }

    /// Opens a playback stream on `devices`, a single output device.
    ///
    /// `config` is rewritten with what was granted: stereo 16-bit at the
    /// requested rate. The first stream opened becomes the primary output,
    /// which carries the call downlink while in call mode.
    ///
    /// # Errors
    ///
    /// `UnsupportedDevice` for an unknown or combined device mask, or the
    /// stream construction error.
    pub fn open_output_stream(&self, devices: u32, config: &mut AudioConfig) -> Result<Arc<StreamOut>> {
        let route = routing::output_route(&self.config, devices)?;
        if config.channels != 2 || config.format != SampleFormat::I16 {
            tracing::debug!(
                channels = config.channels,
                format = ?config.format,
                "granting stereo 16-bit output"
            );
        }
        config.channels = 2;
        config.format = SampleFormat::I16;

        let mut state = self.state.lock();
        let stream = Arc::new(StreamOut::new(
            Arc::clone(&self.shared),
            Arc::clone(&self.writers[route.port.index()]),
            config,
            route.slots,
            devices,
            self.config.port(route.port).period_count,
        )?);
        if state.primary.is_none() {
            tracing::info!(port = %route.port, "primary output opened");
            state.primary = Some(Arc::clone(&stream));
        }
        state.outputs.push(Arc::clone(&stream));
        tracing::info!(port = %route.port, params = %stream.params(), "output stream opened");
        Ok(stream)
    }

    /// Closes a playback stream, putting it in standby first.
    pub fn close_output_stream(&self, stream: &Arc<StreamOut>) {
        let mut state = self.state.lock();
        let Some(pos) = state.outputs.iter().position(|s| Arc::ptr_eq(s, stream)) else {
            tracing::warn!("output stream is not open");
            return;
        };
        let stream = state.outputs.swap_remove(pos);
        if let Err(err) = stream.standby() {
            tracing::warn!(%err, "standby on close failed");
        }
        if state
            .primary
            .as_ref()
            .is_some_and(|primary| Arc::ptr_eq(primary, &stream))
        {
            state.primary = None;
        }
        tracing::info!("output stream closed");
    }

    /// Opens a capture stream on `devices`, a single input device.
    ///
    /// # Errors
    ///
    /// `UnsupportedDevice`, `UnsupportedChannelLayout` or
    /// `UnsupportedFormat` for a request the board cannot serve.
    pub fn open_input_stream(&self, devices: u32, config: &mut AudioConfig) -> Result<Arc<StreamIn>> {
        let route = routing::input_route(&self.config, devices, config.channels)?;
        let reader = Arc::clone(&self.readers[route.port.index()]);
        check_input_config(config, reader.params())?;
        let params = PcmParams::new(
            config.channels,
            config.format.bits(),
            config.sample_rate,
            reader.params().frame_count,
        );

        let mut state = self.state.lock();
        let stream = Arc::new(StreamIn::new(
            Arc::clone(&self.shared),
            reader,
            params,
            route.slots,
            devices,
        )?);
        state.inputs.push(Arc::clone(&stream));
        tracing::info!(port = %route.port, %params, "input stream opened");
        Ok(stream)
    }

    /// Closes a capture stream, putting it in standby first.
    pub fn close_input_stream(&self, stream: &Arc<StreamIn>) {
        let mut state = self.state.lock();
        let Some(pos) = state.inputs.iter().position(|s| Arc::ptr_eq(s, stream)) else {
            tracing::warn!("input stream is not open");
            return;
        };
        let stream = state.inputs.swap_remove(pos);
        if let Err(err) = stream.standby() {
            tracing::warn!(%err, "standby on close failed");
        }
        tracing::info!("input stream closed");
    }

    /// The uplink and downlink pipes of the running call.
    pub fn voice_pipes(&self) -> Option<(Arc<MonoPipe>, Arc<MonoPipe>)> {
        self.state.lock().voice.as_ref().map(VoiceSession::pipes)
    }

    /// The primary output stream, if one is open.
    pub fn primary_output(&self) -> Option<Arc<StreamOut>> {
        self.state.lock().primary.clone()
    }

    /// Streams registered on the capture and playback side of `id`.
    pub fn registered_streams(&self, id: PortId) -> (usize, usize) {
        (
            self.readers[id.index()].registered_count(),
            self.writers[id.index()].registered_count(),
        )
    }

    /// Human-readable snapshot of the device state.
    pub fn dump(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        let _ = writeln!(out, "mode: {}", state.mode);
        let _ = writeln!(out, "call: {}", state.call_state);
        let _ = writeln!(out, "mic mute: {}", self.mic_mute());
        for id in PortId::ALL {
            let reader = &self.readers[id.index()];
            let writer = &self.writers[id.index()];
            let _ = writeln!(
                out,
                "port {id}: capture {} ({} streams, {} active), playback {} ({} streams, {} active)",
                reader.params(),
                reader.registered_count(),
                reader.active_count(),
                writer.params(),
                writer.registered_count(),
                writer.active_count(),
            );
        }
        let _ = writeln!(out, "outputs: {}", state.outputs.len());
        let _ = writeln!(out, "inputs: {}", state.inputs.len());
        if let Some(voice) = &state.voice {
            let (uplink, downlink) = voice.pipes();
            for pipe in [uplink, downlink] {
                let _ = writeln!(
                    out,
                    "pipe {}: {:?}, {} frames, {} overrun, {} underrun",
                    pipe.name(),
                    pipe.state(),
                    pipe.available(),
                    pipe.overrun_frames(),
                    pipe.underrun_frames(),
                );
            }
            for (name, phase) in voice.phases() {
                let _ = writeln!(out, "pump {name}: {phase:?}");
            }
        }
        out
    }
}

fn check_input_config(config: &AudioConfig, port: &PcmParams) -> Result<()> {
    if !(1..=2).contains(&config.channels) {
        return Err(RouterError::UnsupportedChannelLayout {
            input: port.channels,
            output: config.channels,
        });
    }
    if config.format != SampleFormat::I16 {
        return Err(RouterError::UnsupportedFormat {
            bits: config.format.bits(),
        });
    }
    Ok(())
}

impl Drop for HwDevice {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.voice.is_some() {
            tracing::info!("device dropped during a call");
            self.leave_call(&mut state);
        }
    }
}

impl fmt::Debug for HwDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("HwDevice")
            .field("mode", &state.mode)
            .field("call_state", &state.call_state)
            .field("outputs", &state.outputs.len())
            .field("inputs", &state.inputs.len())
            .finish_non_exhaustive()
    }
}

//! Voice-call orchestration.
//!
//! A call runs four pumps around two pipes:
//!
//! ```text
//!   cabin mic ──UL-in──▶ [uplink] ──UL-out──▶ far end
//!   far end   ──DL-in──▶ [downlink] ──DL-out──▶ speakers
//! ```
//!
//! [`VoiceSession`] owns all of it for the lifetime of one call.

mod pump;

pub use pump::PumpPhase;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DeviceConfig;
use crate::event::EventCallback;
use crate::mux::{PcmReader, PcmWriter};
use crate::params::PcmParams;
use crate::pipe::MonoPipe;
use crate::routing;
use crate::stream::{InStream, OutStream};
use crate::Result;
use pump::Pump;

/// Voice-call state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    /// No call.
    #[default]
    Idle,
    /// Pumps are being set up.
    Entering,
    /// All four pumps are running.
    Active,
    /// Pumps are being torn down.
    Leaving,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Entering => "entering",
            Self::Active => "active",
            Self::Leaving => "leaving",
        };
        f.write_str(name)
    }
}

/// Ports a call is wired to.
pub(crate) struct CallPorts {
    /// Reader of the port carrying the cabin microphone.
    pub media_reader: Arc<PcmReader>,
    /// Writer the primary output plays through outside the call.
    pub media_writer: Arc<PcmWriter>,
    /// Far-end capture.
    pub far_end_reader: Arc<PcmReader>,
    /// Far-end playback.
    pub far_end_writer: Arc<PcmWriter>,
}

/// One voice call: the uplink and downlink pipes and their four pumps.
pub(crate) struct VoiceSession {
    uplink: Arc<MonoPipe>,
    downlink: Arc<MonoPipe>,
    ul_in: Pump,
    dl_in: Pump,
    dl_out: Pump,
    ul_out: Pump,
    far_end_reader: Arc<PcmReader>,
    far_end_writer: Arc<PcmWriter>,
}

impl VoiceSession {
    /// Builds the pipes and streams for a call. Nothing is registered or
    /// started yet.
    ///
    /// # Errors
    ///
    /// A stream that cannot be built for the port layouts in `config`.
    pub(crate) fn new(
        config: &DeviceConfig,
        ports: CallPorts,
        events: Option<EventCallback>,
    ) -> Result<Self> {
        let far_end = *ports.far_end_reader.params();
        let voice = PcmParams::new(2, 16, far_end.sample_rate, far_end.frame_count);
        let pipe_frames = config.voice_pipe_frames();

        let uplink = Arc::new(MonoPipe::new("uplink", voice.channels, voice.sample_rate, pipe_frames)?);
        let downlink = Arc::new(MonoPipe::new("downlink", voice.channels, voice.sample_rate, pipe_frames)?);

        let ul_in = InStream::new(
            Arc::clone(&ports.media_reader),
            voice,
            routing::voice_mic_slots(config)?,
        )?;
        let dl_in = InStream::new(
            Arc::clone(&ports.far_end_reader),
            voice,
            routing::far_end_slots()?,
        )?;
        let dl_out = OutStream::new(
            Arc::clone(&ports.media_writer),
            voice,
            routing::far_end_slots()?,
        )?;
        let ul_out = OutStream::new(
            Arc::clone(&ports.far_end_writer),
            voice,
            routing::far_end_slots()?,
        )?;

        let prime = config.prime_periods;
        Ok(Self {
            ul_in: Pump::capture("voice-ul-in", ul_in, Arc::clone(&uplink), events.clone()),
            dl_in: Pump::capture("voice-dl-in", dl_in, Arc::clone(&downlink), events.clone()),
            dl_out: Pump::playback("voice-dl-out", dl_out, Arc::clone(&downlink), prime, events.clone()),
            ul_out: Pump::playback("voice-ul-out", ul_out, Arc::clone(&uplink), prime, events),
            uplink,
            downlink,
            far_end_reader: ports.far_end_reader,
            far_end_writer: ports.far_end_writer,
        })
    }

    /// The uplink and downlink pipes.
    pub(crate) fn pipes(&self) -> (Arc<MonoPipe>, Arc<MonoPipe>) {
        (Arc::clone(&self.uplink), Arc::clone(&self.downlink))
    }

    /// Phases of the four pumps, in UL-in, DL-in, DL-out, UL-out order.
    pub(crate) fn phases(&self) -> [(&str, PumpPhase); 4] {
        [
            (self.ul_in.name(), self.ul_in.phase()),
            (self.dl_in.name(), self.dl_in.phase()),
            (self.dl_out.name(), self.dl_out.phase()),
            (self.ul_out.name(), self.ul_out.phase()),
        ]
    }

    /// Registers and starts everything. Producers start first; consumers
    /// follow after `settle` so the pipes hold data when they begin.
    ///
    /// On failure everything already set up is torn down again.
    ///
    /// # Errors
    ///
    /// The first registration, open or thread-spawn failure.
    pub(crate) fn enter(&mut self, settle: Duration) -> Result<()> {
        tracing::info!(settle_ms = settle.as_millis(), "entering voice call");
        if let Err(err) = self.start_all(settle) {
            tracing::error!(%err, "voice call setup failed");
            self.leave();
            return Err(err);
        }
        tracing::info!("voice call running");
        Ok(())
    }

    fn start_all(&mut self, settle: Duration) -> Result<()> {
        for pump in [&self.ul_in, &self.dl_in, &self.dl_out, &self.ul_out] {
            pump.register()?;
        }
        self.uplink.reset();
        self.downlink.reset();

        self.ul_in.start()?;
        self.dl_in.start()?;
        std::thread::sleep(settle);
        self.dl_out.start()?;
        self.ul_out.start()?;
        Ok(())
    }

    /// Stops and unregisters everything. Safe after a partial `enter`.
    pub(crate) fn leave(&mut self) {
        tracing::info!("leaving voice call");
        self.uplink.shutdown(true);
        self.downlink.shutdown(true);

        // Only far-end ports are aborted; the media ports keep serving
        // client streams.
        self.far_end_reader.stop_port();
        self.far_end_writer.stop_port();

        self.dl_out.stop();
        self.ul_out.stop();
        self.ul_in.stop();
        self.dl_in.stop();

        self.uplink.flush();
        self.downlink.flush();

        for pump in [&self.ul_in, &self.dl_in, &self.dl_out, &self.ul_out] {
            pump.unregister();
        }
        tracing::info!(
            uplink_overrun = self.uplink.overrun_frames(),
            downlink_underrun = self.downlink.underrun_frames(),
            "voice call stopped"
        );
    }
}

impl fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceSession")
            .field("uplink", &self.uplink)
            .field("downlink", &self.downlink)
            .field("pumps", &self.phases())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortId;
    use crate::pipe::PipeState;
    use crate::port::MockPorts;

    fn config() -> DeviceConfig {
        DeviceConfig {
            adc_settle: Duration::ZERO,
            ..Default::default()
        }
    }

    fn call_ports(config: &DeviceConfig, ports: &MockPorts) -> CallPorts {
        let set = ports.port_set();
        let media = config.media_port();
        let far = PortId::FarEnd;
        CallPorts {
            media_reader: Arc::new(PcmReader::new(set.input(media), config.port(media).capture_params())),
            media_writer: Arc::new(PcmWriter::new(set.output(media), config.port(media).playback_params())),
            far_end_reader: Arc::new(PcmReader::new(set.input(far), config.port(far).capture_params())),
            far_end_writer: Arc::new(PcmWriter::new(set.output(far), config.port(far).playback_params())),
        }
    }

    #[test]
    fn test_call_state_display() {
        assert_eq!(CallState::Active.to_string(), "active");
        assert_eq!(CallState::default(), CallState::Idle);
    }

    #[test]
    fn test_enter_moves_audio_both_ways() {
        let config = config();
        let ports = MockPorts::realtime();
        let mut session = VoiceSession::new(&config, call_ports(&config, &ports), None).unwrap();

        session.enter(Duration::from_millis(20)).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert!(session
            .phases()
            .iter()
            .all(|(_, phase)| *phase == PumpPhase::SteadyState));

        session.leave();
        let (uplink, downlink) = session.pipes();
        assert_eq!(uplink.state(), PipeState::Flushed);
        assert_eq!(downlink.state(), PipeState::Flushed);

        // The far end hears the cabin mic, the speakers carry the far end.
        let far_out = ports.output(PortId::FarEnd).recorded();
        assert!(!far_out.is_empty());
        let speaker = ports.media_output(&config).recorded();
        assert!(speaker.chunks_exact(8).any(|frame| frame[0] != 0 && frame[0] == frame[1]));
        assert!(speaker.chunks_exact(8).all(|frame| frame[2..].iter().all(|&s| s == 0)));
    }

    #[test]
    fn test_leave_releases_ports() {
        let config = config();
        let ports = MockPorts::realtime();
        let call = call_ports(&config, &ports);
        let media_reader = Arc::clone(&call.media_reader);
        let far_end_writer = Arc::clone(&call.far_end_writer);
        let mut session = VoiceSession::new(&config, call, None).unwrap();

        session.enter(Duration::ZERO).unwrap();
        assert_eq!(media_reader.registered_count(), 1);
        assert!(far_end_writer.is_open());

        session.leave();
        assert_eq!(media_reader.registered_count(), 0);
        assert!(!media_reader.is_open());
        assert!(!far_end_writer.is_open());
    }

    #[test]
    fn test_failed_enter_unwinds() {
        let config = config();
        let ports = MockPorts::new();
        ports.output(PortId::FarEnd).set_fail_open(true);
        let call = call_ports(&config, &ports);
        let media_reader = Arc::clone(&call.media_reader);
        let far_end_reader = Arc::clone(&call.far_end_reader);
        let mut session = VoiceSession::new(&config, call, None).unwrap();

        assert!(session.enter(Duration::ZERO).is_err());
        assert_eq!(media_reader.registered_count(), 0);
        assert!(!media_reader.is_open());
        assert!(!far_end_reader.is_open());
    }
}

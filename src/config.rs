//! Device-wide configuration.
//!
//! All hardware constants live in one [`DeviceConfig`] built at device init
//! and shared by reference; nothing is read from global state afterwards.

use std::time::Duration;

use crate::params::PcmParams;
use crate::{Result, RouterError};

/// Number of hardware port pairs managed by a device.
pub const PORT_COUNT: usize = 3;

/// Identifies one of the fixed hardware port pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortId {
    /// Codec wired straight to the CPU, two slots.
    Onboard = 0,
    /// Expansion board codec, eight TDM slots.
    Expansion = 1,
    /// Far-end voice link (Bluetooth SCO), clocked at the voice rate.
    FarEnd = 2,
}

impl PortId {
    /// All ports, in index order.
    pub const ALL: [PortId; PORT_COUNT] = [PortId::Onboard, PortId::Expansion, PortId::FarEnd];

    /// Index of this port in per-port tables.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Short name used in logs and errors.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Onboard => "onboard",
            Self::Expansion => "expansion",
            Self::FarEnd => "far-end",
        }
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed format of one hardware port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
    /// Physical slots on the port.
    pub channels: usize,
    /// Native sample rate in Hz.
    pub sample_rate: u32,
    /// Frames per capture period.
    pub capture_period: usize,
    /// Frames per playback period.
    pub playback_period: usize,
    /// Periods per hardware buffer.
    pub period_count: usize,
}

impl PortConfig {
    /// Parameters the capture side of this port is opened with.
    #[must_use]
    pub fn capture_params(&self) -> PcmParams {
        PcmParams::new(self.channels, 16, self.sample_rate, self.capture_period)
    }

    /// Parameters the playback side of this port is opened with.
    #[must_use]
    pub fn playback_params(&self) -> PcmParams {
        PcmParams::new(self.channels, 16, self.sample_rate, self.playback_period)
    }
}

/// Names and values of the mixer controls the device drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixerControls {
    /// Headphone DAC volume of the cabin zone.
    pub headphone_volume: String,
    /// Line DAC volume of the cabin zone.
    pub line_volume: String,
    /// Selects which side clocks the far-end link.
    pub far_end_mode: String,
    /// Value of `far_end_mode` while a call is up.
    pub far_end_master: String,
    /// Value of `far_end_mode` otherwise.
    pub far_end_slave: String,
}

impl Default for MixerControls {
    fn default() -> Self {
        Self {
            headphone_volume: "HP DAC Playback Volume".to_string(),
            line_volume: "Line DAC Playback Volume".to_string(),
            far_end_mode: "Bluetooth Mode".to_string(),
            far_end_master: "Master".to_string(),
            far_end_slave: "Slave".to_string(),
        }
    }
}

/// Immutable hardware and routing configuration.
///
/// Use [`DeviceConfig::default()`] for the reference board, or override
/// individual fields:
///
/// ```
/// use pcm_router::DeviceConfig;
/// use std::time::Duration;
///
/// let config = DeviceConfig {
///     adc_settle: Duration::ZERO,
///     use_expansion_board: false,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Per-port formats, indexed by [`PortId::index`].
    pub ports: [PortConfig; PORT_COUNT],

    /// Route media and the cabin microphone through the expansion board.
    ///
    /// When `false` the onboard codec carries media.
    /// Default: true
    pub use_expansion_board: bool,

    /// Audio held by each voice-call pipe.
    ///
    /// Default: 100ms
    pub voice_pipe: Duration,

    /// Time the microphone ADC needs before its samples are usable.
    ///
    /// Default: 80ms
    pub adc_settle: Duration,

    /// Periods of silence a voice playback pump writes before moving data.
    ///
    /// Default: 4
    pub prime_periods: usize,

    /// Voice volume range in dB, `(min, max)`.
    ///
    /// Default: (-24.0, 0.0)
    pub voice_volume_db: (f32, f32),

    /// Mixer control names.
    pub controls: MixerControls,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            ports: [
                PortConfig {
                    channels: 2,
                    sample_rate: 44_100,
                    capture_period: 882,
                    playback_period: 1024,
                    period_count: 4,
                },
                PortConfig {
                    channels: 8,
                    sample_rate: 44_100,
                    capture_period: 882,
                    playback_period: 1024,
                    period_count: 4,
                },
                PortConfig {
                    channels: 2,
                    sample_rate: 8000,
                    capture_period: 160,
                    playback_period: 160,
                    period_count: 4,
                },
            ],
            use_expansion_board: true,
            voice_pipe: Duration::from_millis(100),
            adc_settle: Duration::from_millis(80),
            prime_periods: 4,
            voice_volume_db: (-24.0, 0.0),
            controls: MixerControls::default(),
        }
    }
}

impl DeviceConfig {
    /// Format of the given port.
    #[must_use]
    pub fn port(&self, id: PortId) -> &PortConfig {
        &self.ports[id.index()]
    }

    /// Port that carries media playback and the cabin microphone.
    #[must_use]
    pub fn media_port(&self) -> PortId {
        if self.use_expansion_board {
            PortId::Expansion
        } else {
            PortId::Onboard
        }
    }

    /// Frames each voice pipe holds at the far-end rate.
    #[must_use]
    pub fn voice_pipe_frames(&self) -> usize {
        let rate = u128::from(self.port(PortId::FarEnd).sample_rate);
        (self.voice_pipe.as_millis() * rate / 1000) as usize
    }

    /// Time the orchestrator waits between starting the call producers and
    /// starting the consumers: half a pipe, the ADC settle time and one
    /// far-end period.
    #[must_use]
    pub fn voice_settle_time(&self) -> Duration {
        let far_end = self.port(PortId::FarEnd);
        let period = Duration::from_micros(
            far_end.capture_period as u64 * 1_000_000 / u64::from(far_end.sample_rate),
        );
        self.voice_pipe / 2 + self.adc_settle + period
    }

    /// Checks the configuration once at device init.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` for zero-sized ports or an empty volume
    /// range.
    pub fn validate(&self) -> Result<()> {
        for id in PortId::ALL {
            let port = self.port(id);
            if port.channels == 0 || port.sample_rate == 0 {
                return Err(RouterError::invalid(format!(
                    "port {id} has no channels or no rate"
                )));
            }
            if port.capture_period == 0 || port.playback_period == 0 || port.period_count == 0 {
                return Err(RouterError::invalid(format!("port {id} has an empty period")));
            }
        }
        if self.port(PortId::Expansion).channels < 4 {
            return Err(RouterError::invalid(
                "expansion port needs at least 4 slots for microphone routing",
            ));
        }
        if self.voice_pipe_frames() < self.port(PortId::FarEnd).capture_period {
            return Err(RouterError::invalid("voice pipe is shorter than one far-end period"));
        }
        let (min, max) = self.voice_volume_db;
        if min.is_nan() || max.is_nan() || min >= max {
            return Err(RouterError::invalid("voice volume range is empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.media_port(), PortId::Expansion);
        assert_eq!(config.port(PortId::Expansion).channels, 8);
        assert_eq!(config.port(PortId::FarEnd).sample_rate, 8000);
    }

    #[test]
    fn test_voice_pipe_frames() {
        let config = DeviceConfig::default();
        // 100ms at 8kHz
        assert_eq!(config.voice_pipe_frames(), 800);
    }

    #[test]
    fn test_voice_settle_time() {
        let config = DeviceConfig::default();
        // 50ms half pipe + 80ms ADC + 20ms far-end period
        assert_eq!(config.voice_settle_time(), Duration::from_millis(150));
    }

    #[test]
    fn test_onboard_media_port() {
        let config = DeviceConfig {
            use_expansion_board: false,
            ..Default::default()
        };
        assert_eq!(config.media_port(), PortId::Onboard);
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let mut config = DeviceConfig::default();
        config.ports[PortId::Onboard.index()].sample_rate = 0;
        assert!(matches!(
            config.validate(),
            Err(RouterError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_short_pipe() {
        let config = DeviceConfig {
            voice_pipe: Duration::from_millis(5),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_params() {
        let config = DeviceConfig::default();
        let params = config.port(PortId::Onboard).playback_params();
        assert_eq!(params.channels, 2);
        assert_eq!(params.frame_count, 1024);
        assert_eq!(params.frame_size(), 4);
    }
}

//! Builder for [`HwDevice`].

use std::sync::Arc;

use super::HwDevice;
use crate::config::{DeviceConfig, PortId};
use crate::event::{event_callback, DeviceEvent, EventCallback};
use crate::mixer::{MixerControl, SoftMixer};
use crate::mux::{PcmReader, PcmWriter};
use crate::port::PortSet;
use crate::{Result, RouterError};

/// Builder for configuring and creating an [`HwDevice`].
///
/// Ports are required; the configuration defaults to the reference board
/// and the mixer to an in-memory [`SoftMixer`].
///
/// # Example
///
/// ```
/// use pcm_router::port::MockPorts;
/// use pcm_router::{DeviceConfig, HwDevice};
///
/// let ports = MockPorts::new();
/// let device = HwDevice::builder()
///     .config(DeviceConfig::default())
///     .ports(ports.port_set())
///     .on_event(|event| tracing::warn!(?event, "device event"))
///     .build()
///     .unwrap();
/// assert!(device.init_check().is_ok());
/// ```
#[must_use]
#[derive(Default)]
pub struct HwDeviceBuilder {
    config: DeviceConfig,
    ports: Option<PortSet>,
    mixer: Option<Arc<dyn MixerControl>>,
    event_callback: Option<EventCallback>,
}

impl HwDeviceBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hardware configuration.
    pub fn config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the hardware ports.
    pub fn ports(mut self, ports: PortSet) -> Self {
        self.ports = Some(ports);
        self
    }

    /// Sets the mixer the device drives.
    pub fn mixer(mut self, mixer: Arc<dyn MixerControl>) -> Self {
        self.mixer = Some(mixer);
        self
    }

    /// Registers a callback for runtime events.
    ///
    /// Called from pump threads and client threads alike, so it must not
    /// block or call back into the device.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(event_callback(callback));
        self
    }

    /// Validates the configuration and creates the device.
    ///
    /// # Errors
    ///
    /// `InvalidParameters` for an invalid configuration or missing ports.
    pub fn build(self) -> Result<HwDevice> {
        self.config.validate()?;
        let ports = self
            .ports
            .ok_or_else(|| RouterError::invalid("no hardware ports given"))?;

        let config = Arc::new(self.config);
        let readers = PortId::ALL
            .map(|id| Arc::new(PcmReader::new(ports.input(id), config.port(id).capture_params())));
        let writers = PortId::ALL
            .map(|id| Arc::new(PcmWriter::new(ports.output(id), config.port(id).playback_params())));
        let mixer = self
            .mixer
            .unwrap_or_else(|| Arc::new(SoftMixer::new()) as Arc<dyn MixerControl>);

        tracing::info!(
            media_port = %config.media_port(),
            expansion = config.use_expansion_board,
            "audio device created"
        );
        Ok(HwDevice::from_parts(
            config,
            readers,
            writers,
            mixer,
            self.event_callback,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MockPorts;

    #[test]
    fn test_builder_requires_ports() {
        let result = HwDeviceBuilder::new().build();
        assert!(matches!(result, Err(RouterError::InvalidParameters { .. })));
    }

    #[test]
    fn test_builder_validates_config() {
        let mut config = DeviceConfig::default();
        config.voice_volume_db = (0.0, -10.0);
        let result = HwDeviceBuilder::new()
            .config(config)
            .ports(MockPorts::new().port_set())
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_uses_config() {
        let ports = MockPorts::new();
        let device = HwDevice::builder()
            .config(DeviceConfig {
                use_expansion_board: false,
                ..Default::default()
            })
            .ports(ports.port_set())
            .build()
            .unwrap();
        assert!(!device.config().use_expansion_board);
        assert!(device.init_check().is_ok());
    }
}

//! Integration tests for pcm-router.
//!
//! Everything here runs against mock ports. Tests that require actual audio
//! hardware are marked with `#[ignore]` and should be run manually.

use std::sync::Arc;
use std::time::Duration;

use pcm_router::port::{InPort, MockPorts, OutPort};
use pcm_router::{
    devices, AudioConfig, AudioMode, AudioStream, CallState, DeviceConfig, DeviceEvent, HwDevice,
    MixerControl, MixerValue, PipeState, PortId, SampleFormat, SoftMixer,
};

fn config() -> DeviceConfig {
    DeviceConfig {
        adc_settle: Duration::ZERO,
        ..Default::default()
    }
}

fn device(ports: &MockPorts) -> (HwDevice, Arc<SoftMixer>) {
    let mixer = Arc::new(SoftMixer::new());
    let device = HwDevice::builder()
        .config(config())
        .ports(ports.port_set())
        .mixer(Arc::clone(&mixer) as Arc<dyn MixerControl>)
        .build()
        .unwrap();
    (device, mixer)
}

fn open_primary(device: &HwDevice) -> Arc<pcm_router::StreamOut> {
    let mut config = AudioConfig {
        sample_rate: 44_100,
        channels: 2,
        format: SampleFormat::I16,
    };
    device
        .open_output_stream(devices::OUT_SPEAKER, &mut config)
        .unwrap()
}

#[test]
fn test_call_round_trip() {
    let ports = MockPorts::realtime();
    let (device, mixer) = device(&ports);
    let primary = open_primary(&device);
    primary.write(&[100i16; 2048]).unwrap();

    device.set_mode(AudioMode::InCall).unwrap();
    assert_eq!(device.mode(), AudioMode::InCall);
    assert_eq!(device.call_state(), CallState::Active);
    assert_eq!(mixer.value("Bluetooth Mode"), Some(MixerValue::from("Master")));
    std::thread::sleep(Duration::from_millis(300));

    device.set_mode(AudioMode::Normal).unwrap();
    assert_eq!(device.call_state(), CallState::Idle);
    assert!(device.voice_pipes().is_none());
    assert_eq!(mixer.value("Bluetooth Mode"), Some(MixerValue::from("Slave")));

    // The modem heard the cabin mic.
    let far_end = ports.output(PortId::FarEnd).recorded();
    assert!(far_end.iter().any(|&s| s != 0));
    assert!(!ports.input(PortId::FarEnd).is_open());
    assert!(!ports.output(PortId::FarEnd).is_open());
}

#[test]
fn test_repeated_in_call_keeps_session() {
    let ports = MockPorts::realtime();
    let (device, _) = device(&ports);
    let _primary = open_primary(&device);

    device.set_mode(AudioMode::InCall).unwrap();
    let (uplink, downlink) = device.voice_pipes().unwrap();
    device.set_mode(AudioMode::InCall).unwrap();
    let (uplink2, downlink2) = device.voice_pipes().unwrap();
    assert!(Arc::ptr_eq(&uplink, &uplink2));
    assert!(Arc::ptr_eq(&downlink, &downlink2));

    device.set_mode(AudioMode::Normal).unwrap();
    assert_eq!(uplink.state(), PipeState::Flushed);
    assert_eq!(downlink.state(), PipeState::Flushed);
}

#[test]
fn test_media_is_diverted_during_call() {
    let ports = MockPorts::realtime();
    let (device, _) = device(&ports);
    let primary = open_primary(&device);
    primary.write(&[100i16; 2048]).unwrap();
    assert!(!primary.is_diverted());

    device.set_mode(AudioMode::InCall).unwrap();
    assert!(primary.is_diverted());
    // Media writes keep succeeding while the call owns the speaker.
    assert_eq!(primary.write(&[100i16; 2048]).unwrap(), 4096);

    device.set_mode(AudioMode::Normal).unwrap();
    assert!(!primary.is_diverted());
    assert_eq!(primary.write(&[100i16; 2048]).unwrap(), 4096);
}

#[test]
fn test_voice_volume_restored_after_call() {
    let ports = MockPorts::realtime();
    let (device, mixer) = device(&ports);
    let _primary = open_primary(&device);

    device.set_mode(AudioMode::InCall).unwrap();
    device.set_voice_volume(0.5).unwrap();
    assert_eq!(mixer.value("HP DAC Playback Volume"), Some(MixerValue::Int(94)));

    device.set_mode(AudioMode::Normal).unwrap();
    assert_eq!(mixer.value("HP DAC Playback Volume"), Some(MixerValue::Int(118)));
    assert_eq!(mixer.value("Line DAC Playback Volume"), Some(MixerValue::Int(118)));
}

#[test]
fn test_input_buffer_size_for_voice_rate() {
    let ports = MockPorts::new();
    let (device, _) = device(&ports);
    let config = AudioConfig {
        sample_rate: 8000,
        channels: 1,
        format: SampleFormat::I16,
    };
    assert_eq!(device.get_input_buffer_size(&config).unwrap(), 320);
}

#[test]
fn test_input_stream_buffer_size_matches_device() {
    let ports = MockPorts::new();
    let (device, _) = device(&ports);
    for sample_rate in [8000, 11_025, 16_000, 22_050, 32_000, 44_100, 48_000] {
        let mut audio = AudioConfig {
            sample_rate,
            channels: 1,
            format: SampleFormat::I16,
        };
        let expected = device.get_input_buffer_size(&audio).unwrap();
        let input = device
            .open_input_stream(devices::IN_BUILTIN_MIC, &mut audio)
            .unwrap();
        assert_eq!(input.buffer_size(), expected, "rate {sample_rate}");
        assert_eq!(expected % 32, 0, "rate {sample_rate}");
        device.close_input_stream(&input);
    }
}

#[test]
fn test_no_stream_registered_after_call() {
    let ports = MockPorts::realtime();
    let (device, _) = device(&ports);
    let primary = open_primary(&device);
    primary.write(&[100i16; 2048]).unwrap();

    device.set_mode(AudioMode::InCall).unwrap();
    let media = device.config().media_port();
    assert_eq!(device.registered_streams(media), (1, 1));
    assert_eq!(device.registered_streams(PortId::FarEnd), (1, 1));
    std::thread::sleep(Duration::from_millis(100));

    device.set_mode(AudioMode::Normal).unwrap();
    for id in PortId::ALL {
        assert_eq!(device.registered_streams(id), (0, 0), "port {id}");
    }
}

#[test]
fn test_input_read_survives_transient_failure() {
    let ports = MockPorts::new();
    let (device, _) = device(&ports);
    let mut audio = AudioConfig {
        sample_rate: 44_100,
        channels: 2,
        format: SampleFormat::I16,
    };
    let input = device
        .open_input_stream(devices::IN_BUILTIN_MIC, &mut audio)
        .unwrap();

    ports.media_input(&config()).fail_next(1);
    let mut buf = [9i16; 256];
    assert_eq!(input.read(&mut buf).unwrap(), 512);
    assert!(buf.iter().all(|&s| s == 0));

    input.standby().unwrap();
    device.close_input_stream(&input);
    assert!(!ports.media_input(&config()).is_open());
}

#[test]
fn test_events_report_mode_changes() {
    let ports = MockPorts::realtime();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let device = HwDevice::builder()
        .config(config())
        .ports(ports.port_set())
        .on_event(move |event| sink.lock().push(event))
        .build()
        .unwrap();
    let _primary = open_primary(&device);

    device.set_mode(AudioMode::InCall).unwrap();
    device.set_mode(AudioMode::Normal).unwrap();

    let events = seen.lock();
    assert!(events.iter().any(|e| matches!(
        e,
        DeviceEvent::ModeChanged {
            previous: AudioMode::Normal,
            current: AudioMode::InCall,
        }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        DeviceEvent::CallStateChanged {
            state: CallState::Idle
        }
    )));
}

#[test]
#[ignore = "requires audio hardware"]
#[cfg(feature = "cpal")]
fn test_host_devices_carry_media() {
    use pcm_router::port::{CpalInPort, CpalOutPort};
    use pcm_router::PortSet;

    let onboard_in: Arc<dyn InPort> = Arc::new(CpalInPort::default_device("onboard"));
    let onboard_out: Arc<dyn OutPort> = Arc::new(CpalOutPort::default_device("onboard"));
    let ports = MockPorts::new();
    let set = PortSet::new(
        [
            onboard_in,
            ports.port_set().input(PortId::Expansion),
            ports.port_set().input(PortId::FarEnd),
        ],
        [
            onboard_out,
            ports.port_set().output(PortId::Expansion),
            ports.port_set().output(PortId::FarEnd),
        ],
    );
    let device = HwDevice::builder()
        .config(DeviceConfig {
            use_expansion_board: false,
            ..config()
        })
        .ports(set)
        .build()
        .unwrap();
    let primary = open_primary(&device);
    for _ in 0..20 {
        primary.write(&[0i16; 2048]).unwrap();
    }
}

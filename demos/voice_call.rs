//! Voice call example.
//!
//! Plays media through the mock expansion board, takes a two-second voice
//! call and returns to media playback, printing the device state on the way.
//!
//! Run with: cargo run --example voice_call
//! Set `RUST_LOG=pcm_router=debug` to watch the pumps.

use std::sync::Arc;

use pcm_router::port::MockPorts;
use pcm_router::{devices, AudioConfig, AudioMode, HwDevice, PortId};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ports = MockPorts::realtime();
    let device = HwDevice::builder()
        .ports(ports.port_set())
        .on_event(|e| tracing::warn!(?e, "device event"))
        .build()?;

    let mut config = AudioConfig::default();
    let media = device.open_output_stream(devices::OUT_SPEAKER, &mut config)?;
    println!("Media stream: {} Hz, {} ms latency", config.sample_rate, media.latency_ms());

    let tone: Vec<i16> = (0..2048)
        .map(|i| ((i as f32 * 0.05).sin() * 8000.0) as i16)
        .collect();
    let play = |media: &Arc<pcm_router::StreamOut>, periods: usize| -> pcm_router::Result<()> {
        for _ in 0..periods {
            media.write(&tone)?;
        }
        Ok(())
    };

    play(&media, 20)?;

    println!("Entering call...");
    device.set_mode(AudioMode::InCall)?;
    device.set_voice_volume(0.8)?;
    play(&media, 40)?;
    println!("{}", device.dump());

    println!("Leaving call...");
    device.set_mode(AudioMode::Normal)?;
    play(&media, 20)?;

    let far_end = ports.output(PortId::FarEnd).frames_written();
    let speaker = ports.media_output(device.config()).frames_written();
    println!("Far end received {far_end} frames, speakers played {speaker} frames");

    device.close_output_stream(&media);
    Ok(())
}

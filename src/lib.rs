//! # pcm-router
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Real-time PCM routing between fixed hardware ports and client streams.
//!
//! `pcm-router` sits between a small number of fixed-format hardware ports
//! (an onboard codec, an 8-slot expansion board and a far-end voice modem)
//! and any number of client streams with their own rate and channel count.
//! Each port is shared through a multiplexer that resamples, remixes and
//! slot-maps per stream, and a voice call takes over the media path by
//! pumping audio between the modem and the local mic/speaker.
//!
//! ## Quick Start
//!
//! ```rust
//! use pcm_router::port::MockPorts;
//! use pcm_router::{devices, AudioConfig, AudioMode, HwDevice};
//!
//! let ports = MockPorts::realtime();
//! let device = HwDevice::builder()
//!     .ports(ports.port_set())
//!     .on_event(|e| tracing::warn!(?e, "device event"))
//!     .build()?;
//!
//! let mut config = AudioConfig::default();
//! let output = device.open_output_stream(devices::OUT_SPEAKER, &mut config)?;
//! output.write(&[0i16; 2048])?;
//!
//! device.set_mode(AudioMode::InCall)?;
//! // ... media audio is diverted, the call runs on pump threads ...
//! device.set_mode(AudioMode::Normal)?;
//! # Ok::<(), pcm_router::RouterError>(())
//! ```
//!
//! ## Architecture
//!
//! The crate keeps every data path synchronous and thread-based:
//!
//! - **Ports**: blocking, fixed-format PCM endpoints behind [`port::InPort`]
//!   and [`port::OutPort`]
//! - **Multiplexers**: [`PcmReader`] fans one capture port out to many
//!   streams, [`PcmWriter`] hands one playback port to whichever
//!   registered stream pulls from it (it does not mix)
//! - **Voice pumps**: four named threads move call audio through two
//!   [`MonoPipe`]s (uplink and downlink) between the modem and local ports
//!
//! Client calls block for at most about one port period.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod config;
mod device;
mod error;
mod event;
pub mod format;
mod kv;
mod mixer;
mod mux;
mod params;
mod pipe;
pub mod port;
mod routing;
mod stream;
mod voice;

pub use config::{DeviceConfig, MixerControls, PortConfig, PortId, PORT_COUNT};
pub use device::{
    AudioMode, AudioStream, CallState, HwDevice, HwDeviceBuilder, StreamIn, StreamOut,
};
pub use error::{Result, RouterError};
pub use event::{event_callback, DeviceEvent, EventCallback};
pub use kv::ParamList;
pub use mixer::{voice_volume_register, MixerControl, MixerSet, MixerValue, SoftMixer};
pub use mux::{PcmReader, PcmWriter, StreamId};
pub use params::{AudioConfig, PcmParams, SampleFormat};
pub use pipe::{MonoPipe, PipeState};
pub use port::PortSet;
pub use routing::{devices, input_route, output_route, InputRoute, OutputRoute};
pub use stream::{InStream, OutStream};
pub use voice::PumpPhase;

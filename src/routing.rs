//! Device selection and slot routing.
//!
//! Translates client device masks into the port and slot map a stream uses.
//! The tables are fixed by the board: media goes to the media port's first
//! two slots, headphone zones sit on the expansion board, and microphones
//! are picked by slot on whichever port carries media.

use crate::config::{DeviceConfig, PortId};
use crate::format::SlotMap;
use crate::{Result, RouterError};

/// Device bitmasks understood by the router.
pub mod devices {
    /// Cabin speakers.
    pub const OUT_SPEAKER: u32 = 0x0000_0002;
    /// Wired headset, playback side.
    pub const OUT_WIRED_HEADSET: u32 = 0x0000_0004;
    /// First headphone zone.
    pub const OUT_WIRED_HEADPHONE: u32 = 0x0000_0008;
    /// Second headphone zone.
    pub const OUT_WIRED_HEADPHONE2: u32 = 0x2000_0000;

    /// Marks a mask as describing capture devices.
    pub const IN_BIT: u32 = 0x8000_0000;
    /// Main cabin microphone.
    pub const IN_BUILTIN_MIC: u32 = IN_BIT | 0x0000_0004;
    /// Voice-call capture.
    pub const IN_VOICE_CALL: u32 = IN_BIT | 0x0000_0040;
    /// Rear cabin microphone.
    pub const IN_BACK_MIC: u32 = IN_BIT | 0x0000_0080;
    /// Analog dock headset.
    pub const IN_ANLG_DOCK_HEADSET: u32 = IN_BIT | 0x0000_0200;

    /// Every playback device.
    pub const OUT_ALL: u32 =
        OUT_SPEAKER | OUT_WIRED_HEADSET | OUT_WIRED_HEADPHONE | OUT_WIRED_HEADPHONE2;
    /// Every capture device.
    pub const IN_ALL: u32 = IN_BUILTIN_MIC | IN_VOICE_CALL | IN_BACK_MIC | IN_ANLG_DOCK_HEADSET;

    /// Whether every bit of `mask` names a supported device.
    pub fn is_supported(mask: u32) -> bool {
        if mask & IN_BIT != 0 {
            mask & !IN_ALL == 0
        } else {
            mask & !OUT_ALL == 0
        }
    }
}

/// Slots media playback streams are written from: the client's stereo pair.
const MEDIA_SOURCE_MASK: u32 = 0x03;

/// Where a playback stream lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRoute {
    /// Port to write to.
    pub port: PortId,
    /// Port slots (destinations) fed from stream channels (sources).
    pub slots: SlotMap,
}

/// Where a capture stream is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRoute {
    /// Port to read from.
    pub port: PortId,
    /// Stream channels (destinations) fed from port slots (sources).
    pub slots: SlotMap,
}

/// Resolves a playback device to its port and slots.
///
/// # Errors
///
/// `UnsupportedDevice` for anything but one known playback device.
pub fn output_route(config: &DeviceConfig, device: u32) -> Result<OutputRoute> {
    let (port, dst_mask) = match device {
        devices::OUT_SPEAKER => (config.media_port(), 0x03),
        devices::OUT_WIRED_HEADPHONE | devices::OUT_WIRED_HEADSET => (PortId::Expansion, 0x0c),
        devices::OUT_WIRED_HEADPHONE2 => (PortId::Expansion, 0x30),
        _ => return Err(RouterError::UnsupportedDevice { device }),
    };
    Ok(OutputRoute {
        port,
        slots: SlotMap::from_masks(MEDIA_SOURCE_MASK, dst_mask)?,
    })
}

/// Resolves a capture device to its port and slots for a stream of
/// `channels` channels.
///
/// # Errors
///
/// `UnsupportedDevice` for an unknown device or one the board lacks, and
/// `UnsupportedChannelLayout` for more than two channels.
pub fn input_route(config: &DeviceConfig, device: u32, channels: usize) -> Result<InputRoute> {
    let expansion = config.use_expansion_board;
    let (left, right) = match device {
        devices::IN_BUILTIN_MIC | devices::IN_VOICE_CALL if expansion => (2, 2),
        devices::IN_BACK_MIC if expansion => (3, 3),
        devices::IN_BUILTIN_MIC | devices::IN_VOICE_CALL | devices::IN_BACK_MIC => (0, 1),
        devices::IN_ANLG_DOCK_HEADSET if expansion => (0, 1),
        devices::IN_ANLG_DOCK_HEADSET => {
            tracing::error!(device = format_args!("0x{device:08x}"), "device requires the expansion board");
            return Err(RouterError::UnsupportedDevice { device });
        }
        _ => return Err(RouterError::UnsupportedDevice { device }),
    };
    let slots = match channels {
        1 => SlotMap::new([(0, left)])?,
        2 => SlotMap::new([(0, left), (1, right)])?,
        _ => {
            return Err(RouterError::UnsupportedChannelLayout {
                input: 2,
                output: channels,
            })
        }
    };
    Ok(InputRoute {
        port: config.media_port(),
        slots,
    })
}

/// Slots the uplink reads the cabin microphone from.
///
/// # Errors
///
/// Only if the fixed table is inconsistent, which construction rules out.
pub fn voice_mic_slots(config: &DeviceConfig) -> Result<SlotMap> {
    if config.use_expansion_board {
        SlotMap::new([(0, 2), (1, 2)])
    } else {
        SlotMap::new([(0, 0), (1, 0)])
    }
}

/// Slots used on the far-end link and for the downlink to the speakers:
/// the single voice channel on both slots.
///
/// # Errors
///
/// Only if the fixed table is inconsistent, which construction rules out.
pub fn far_end_slots() -> Result<SlotMap> {
    SlotMap::new([(0, 0), (1, 0)])
}

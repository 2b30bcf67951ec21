//! Channel-slot maps between stream layouts and port layouts.

use std::collections::BTreeMap;

use crate::params::MAX_CHANNELS;
use crate::{Result, RouterError};

/// Destination-slot to source-channel table.
///
/// For capture the destinations are stream channels and the sources are port
/// slots; for playback it is the other way round. Every map is checked once
/// at construction and cannot change afterwards.
///
/// ```
/// use pcm_router::format::SlotMap;
///
/// // Stereo stream onto slots 2 and 3 of a TDM port.
/// let map = SlotMap::from_masks(0x03, 0x0c).unwrap();
/// assert_eq!(map.source(2), Some(0));
/// assert_eq!(map.source(3), Some(1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMap {
    entries: BTreeMap<usize, usize>,
}

impl SlotMap {
    /// Builds a map from `(destination, source)` pairs.
    ///
    /// # Errors
    ///
    /// `InvalidSlotMap` if the map is empty, names a destination twice or
    /// reaches past [`MAX_CHANNELS`].
    pub fn new(pairs: impl IntoIterator<Item = (usize, usize)>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (dst, src) in pairs {
            if dst >= MAX_CHANNELS || src >= MAX_CHANNELS {
                return Err(RouterError::InvalidSlotMap {
                    reason: format!("slot {dst}<-{src} is beyond {MAX_CHANNELS} channels"),
                });
            }
            if entries.insert(dst, src).is_some() {
                return Err(RouterError::InvalidSlotMap {
                    reason: format!("destination {dst} mapped twice"),
                });
            }
        }
        if entries.is_empty() {
            return Err(RouterError::InvalidSlotMap {
                reason: "empty map".to_string(),
            });
        }
        Ok(Self { entries })
    }

    /// Pairs the n-th set bit of `src_mask` with the n-th set bit of
    /// `dst_mask`.
    ///
    /// # Errors
    ///
    /// `InvalidSlotMap` when the masks select different numbers of channels.
    pub fn from_masks(src_mask: u32, dst_mask: u32) -> Result<Self> {
        if src_mask.count_ones() != dst_mask.count_ones() {
            return Err(RouterError::InvalidSlotMap {
                reason: format!("masks 0x{src_mask:x} and 0x{dst_mask:x} differ in width"),
            });
        }
        Self::new(set_bits(dst_mask).zip(set_bits(src_mask)))
    }

    /// Identity map over the first `channels` channels.
    ///
    /// # Errors
    ///
    /// `InvalidSlotMap` for zero or too many channels.
    pub fn identity(channels: usize) -> Result<Self> {
        Self::new((0..channels).map(|c| (c, c)))
    }

    /// Same destinations, all fed from source channel 0.
    #[must_use]
    pub fn with_mono_source(&self) -> Self {
        Self {
            entries: self.entries.keys().map(|&dst| (dst, 0)).collect(),
        }
    }

    /// Source feeding `dst`, if mapped.
    #[must_use]
    pub fn source(&self, dst: usize) -> Option<usize> {
        self.entries.get(&dst).copied()
    }

    /// Number of mapped destinations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always `false`; empty maps cannot be built.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Channels a destination frame needs to hold every mapped slot.
    #[must_use]
    pub fn dst_channels(&self) -> usize {
        self.entries.keys().next_back().map_or(0, |&d| d + 1)
    }

    /// Channels a source frame needs to provide every referenced slot.
    #[must_use]
    pub fn src_channels(&self) -> usize {
        self.entries.values().max().map_or(0, |&s| s + 1)
    }

    /// Checks the map against concrete frame layouts.
    ///
    /// # Errors
    ///
    /// `InvalidSlotMap` when a destination or source is out of bounds.
    pub fn validate(&self, src_channels: usize, dst_channels: usize) -> Result<()> {
        if self.dst_channels() > dst_channels {
            return Err(RouterError::InvalidSlotMap {
                reason: format!(
                    "destination slot {} outside {dst_channels} channels",
                    self.dst_channels() - 1
                ),
            });
        }
        if self.src_channels() > src_channels {
            return Err(RouterError::InvalidSlotMap {
                reason: format!(
                    "source slot {} outside {src_channels} channels",
                    self.src_channels() - 1
                ),
            });
        }
        Ok(())
    }

    /// Copies mapped slots of `frames` frames from `src` into `dst`.
    ///
    /// Unmapped destination slots are zeroed. Both buffers must hold
    /// `frames` whole frames of their layouts.
    pub fn map_frames(
        &self,
        src: &[i16],
        src_channels: usize,
        dst: &mut [i16],
        dst_channels: usize,
        frames: usize,
    ) {
        let src = &src[..frames * src_channels];
        let dst = &mut dst[..frames * dst_channels];
        for (out, input) in dst
            .chunks_exact_mut(dst_channels)
            .zip(src.chunks_exact(src_channels))
        {
            out.fill(0);
            for (&d, &s) in &self.entries {
                out[d] = input[s];
            }
        }
    }
}

impl std::fmt::Display for SlotMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, (dst, src)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dst}<-{src}")?;
        }
        f.write_str("}")
    }
}

fn set_bits(mask: u32) -> impl Iterator<Item = usize> {
    (0..32usize).filter(move |bit| mask & (1 << bit) != 0)
}

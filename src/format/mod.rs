//! Frame-level format adaptation between streams and ports.
//!
//! This module provides the three transforms a logical stream applies on its
//! way to or from a hardware port:
//! - Slot mapping (stream channels ↔ physical port slots)
//! - Channel remixing in place (truncate, mono duplication)
//! - Sample rate conversion (pull-based resampling)

mod remix;
mod resample;
mod slots;

pub use remix::{FrameBuffer, Remix, RemixKind};
pub use resample::{copy_from_provider, BufferProvider, Resampler, SliceProvider};
pub use slots::SlotMap;

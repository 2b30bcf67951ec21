//! Port multiplexing.
//!
//! A hardware port is shared by every logical stream routed to it. Capture
//! goes through a [`PcmReader`], which reads each period once and lets every
//! registered stream consume it at its own pace; playback goes through a
//! [`PcmWriter`]. Both open their port when the first registered stream
//! starts and close it when the last one stops.

mod reader;
mod stream_id;
mod writer;

pub use reader::PcmReader;
pub use stream_id::StreamId;
pub use writer::PcmWriter;

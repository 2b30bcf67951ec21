//! Logical streams.
//!
//! [`InStream`] and [`OutStream`] adapt a client's channel layout and rate
//! to a port's fixed format. They are the unit the multiplexers register,
//! and are used both by the client-facing facades and by the voice pumps.

mod capture;
mod playback;

pub use capture::InStream;
pub use playback::OutStream;

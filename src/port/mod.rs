//! Hardware port abstraction.
//!
//! A port is one physical capture or playback endpoint with a fixed format.
//! The traits here are the only thing the router needs from a PCM driver:
//! open with parameters, move whole frames, stop, close, and report a
//! timestamp. Every method takes `&self` so that `stop()` can be called from
//! a control thread while a data thread is blocked inside `read()` or
//! `write()`; `stop()` must make that blocked call return promptly.
//!
//! Implementations shipped with the crate:
//!
//! - [`NullOutPort`]: discards audio at real-time pace
//! - [`MockInPort`] / [`MockOutPort`]: synthetic ports for tests and demos
//! - `CpalInPort` / `CpalOutPort` (feature `cpal`): host audio devices

#[cfg(feature = "cpal")]
mod cpal;
pub mod mock;
mod null;

#[cfg(feature = "cpal")]
pub use self::cpal::{CpalInPort, CpalOutPort};
pub use mock::{MockInPort, MockOutPort, MockPorts, Signal};
pub use null::NullOutPort;

use std::sync::Arc;
use std::time::Instant;

use crate::config::{PortId, PORT_COUNT};
use crate::params::PcmParams;
use crate::Result;

/// Frames the hardware can move right now, and when that was measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortTimestamp {
    /// Frames ready to read (capture) or free to write (playback).
    pub available: usize,
    /// Moment the count was taken.
    pub time: Instant,
}

/// A capture endpoint.
pub trait InPort: Send + Sync {
    /// Name for logs and errors.
    fn name(&self) -> &str;

    /// Reports whether the port can be used at all.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` when the driver has no such device.
    fn init_check(&self) -> Result<()> {
        Ok(())
    }

    /// Opens the port with the given parameters.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` when the driver refuses the device or format.
    fn open(&self, params: &PcmParams) -> Result<()>;

    /// Blocks until `frames` frames have been read into `buf` and returns
    /// the count.
    ///
    /// # Errors
    ///
    /// `TransientIo` on a driver failure or after [`stop`](Self::stop).
    fn read(&self, buf: &mut [i16], frames: usize) -> Result<usize>;

    /// Aborts the stream, releasing any blocked `read`.
    fn stop(&self);

    /// Closes the port. Safe to call when already closed.
    fn close(&self);

    /// Whether the port is open.
    fn is_open(&self) -> bool;

    /// Frames ready to read.
    ///
    /// # Errors
    ///
    /// `NoDevice` when closed, `TransientIo` before the stream has settled.
    fn timestamp(&self) -> Result<PortTimestamp>;
}

/// A playback endpoint.
pub trait OutPort: Send + Sync {
    /// Name for logs and errors.
    fn name(&self) -> &str;

    /// Reports whether the port can be used at all.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` when the driver has no such device.
    fn init_check(&self) -> Result<()> {
        Ok(())
    }

    /// Opens the port with the given parameters.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` when the driver refuses the device or format.
    fn open(&self, params: &PcmParams) -> Result<()>;

    /// Blocks until `frames` frames from `buf` have been queued and returns
    /// the count.
    ///
    /// # Errors
    ///
    /// `TransientIo` on a driver failure or after [`stop`](Self::stop).
    fn write(&self, buf: &[i16], frames: usize) -> Result<usize>;

    /// Aborts the stream, releasing any blocked `write`.
    fn stop(&self);

    /// Closes the port. Safe to call when already closed.
    fn close(&self);

    /// Whether the port is open.
    fn is_open(&self) -> bool;

    /// Frames free in the hardware buffer.
    ///
    /// # Errors
    ///
    /// `NoDevice` when closed.
    fn timestamp(&self) -> Result<PortTimestamp>;
}

/// The fixed set of hardware ports handed to a device.
#[derive(Clone)]
pub struct PortSet {
    inputs: [Arc<dyn InPort>; PORT_COUNT],
    outputs: [Arc<dyn OutPort>; PORT_COUNT],
}

impl PortSet {
    /// Bundles capture and playback ports, indexed by [`PortId::index`].
    pub fn new(inputs: [Arc<dyn InPort>; PORT_COUNT], outputs: [Arc<dyn OutPort>; PORT_COUNT]) -> Self {
        Self { inputs, outputs }
    }

    /// Capture side of `id`.
    #[must_use]
    pub fn input(&self, id: PortId) -> Arc<dyn InPort> {
        Arc::clone(&self.inputs[id.index()])
    }

    /// Playback side of `id`.
    #[must_use]
    pub fn output(&self, id: PortId) -> Arc<dyn OutPort> {
        Arc::clone(&self.outputs[id.index()])
    }
}

impl std::fmt::Debug for PortSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inputs: Vec<&str> = self.inputs.iter().map(|p| p.name()).collect();
        let outputs: Vec<&str> = self.outputs.iter().map(|p| p.name()).collect();
        f.debug_struct("PortSet")
            .field("inputs", &inputs)
            .field("outputs", &outputs)
            .finish()
    }
}

//! Error types for pcm-router.
//!
//! Errors are split into two categories:
//! - **Construction errors** (layouts, formats, slot maps): returned when a
//!   stream or device is built and never seen on the data path.
//! - **Runtime errors** (`TransientIo`, `NoDevice`): returned from reads and
//!   writes; the stream stays usable and the next call retries. The same
//!   conditions are also surfaced via [`EventCallback`](crate::EventCallback).

use crate::mux::StreamId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Errors returned by ports, multiplexers, streams and the device.
///
/// The enum is `Clone` so a failed hardware read can be kept as a sticky
/// status and handed back to every caller of the same resample pass.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    /// A hardware port failed to open.
    #[error("port unavailable: {port} - {reason}")]
    DeviceUnavailable {
        /// Name of the port.
        port: String,
        /// Why the port could not be opened.
        reason: String,
    },

    /// The stream is already attached to this multiplexer.
    #[error("{stream} is already registered on {port}")]
    AlreadyRegistered {
        /// The offending stream.
        stream: StreamId,
        /// Name of the multiplexer's port.
        port: String,
    },

    /// The stream is not attached to this multiplexer.
    #[error("{stream} is not registered on {port}")]
    NotRegistered {
        /// The offending stream.
        stream: StreamId,
        /// Name of the multiplexer's port.
        port: String,
    },

    /// A channel conversion that cannot be done in place.
    #[error("unsupported channel layout: {input} -> {output} channels")]
    UnsupportedChannelLayout {
        /// Channels on the source side.
        input: usize,
        /// Channels on the destination side.
        output: usize,
    },

    /// Only 16-bit signed PCM is carried.
    #[error("unsupported sample format: {bits}-bit")]
    UnsupportedFormat {
        /// Requested bits per sample.
        bits: u32,
    },

    /// PCM parameters that cannot describe a stream.
    #[error("invalid parameters: {reason}")]
    InvalidParameters {
        /// What was wrong.
        reason: String,
    },

    /// A slot map that points outside the port or stream layout.
    #[error("invalid slot map: {reason}")]
    InvalidSlotMap {
        /// What was wrong.
        reason: String,
    },

    /// A hardware read or write failed mid-stream.
    #[error("transient I/O error on {port}: {reason}")]
    TransientIo {
        /// Name of the port.
        port: String,
        /// Driver-provided reason.
        reason: String,
    },

    /// The port was torn down under an in-flight transfer.
    #[error("no device attached")]
    NoDevice,

    /// The requested routing device has no port behind it.
    #[error("unsupported device 0x{device:08x}")]
    UnsupportedDevice {
        /// The device mask that was requested.
        device: u32,
    },

    /// A voice call needs a primary output stream to divert.
    #[error("no primary output stream is open")]
    NoPrimaryOutput,

    /// The operation is not implemented by this device.
    #[error("operation not supported: {operation}")]
    NotSupported {
        /// Name of the operation.
        operation: &'static str,
    },

    /// A mixer control could not be set.
    #[error("mixer control '{control}' failed: {reason}")]
    MixerControl {
        /// Control name.
        control: String,
        /// Why it failed.
        reason: String,
    },

    /// A pump thread could not be spawned.
    #[error("failed to spawn thread '{name}': {reason}")]
    ThreadSpawn {
        /// Thread name.
        name: String,
        /// OS error text.
        reason: String,
    },
}

impl RouterError {
    /// Creates a [`RouterError::TransientIo`] for the given port.
    pub fn transient(port: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransientIo {
            port: port.into(),
            reason: reason.into(),
        }
    }

    /// Creates a [`RouterError::DeviceUnavailable`] for the given port.
    pub fn unavailable(port: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            port: port.into(),
            reason: reason.into(),
        }
    }

    /// Creates a [`RouterError::InvalidParameters`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors the next read or write may recover from.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }
}

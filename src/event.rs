//! Runtime events for monitoring routing health.
//!
//! Events are non-fatal notifications. The device keeps running after any of
//! them is emitted; they exist for logging and metrics, not error handling.

use std::sync::Arc;

use crate::device::{AudioMode, CallState};

/// Runtime events emitted by the device and its voice pumps.
///
/// # Example
///
/// ```
/// use pcm_router::DeviceEvent;
///
/// fn handle_event(event: DeviceEvent) {
///     match event {
///         DeviceEvent::PipeOverrun { pipe, dropped_frames } => {
///             eprintln!("{pipe}: dropped {dropped_frames} frames");
///         }
///         DeviceEvent::PipeUnderrun { pipe, missing_frames } => {
///             eprintln!("{pipe}: padded {missing_frames} frames of silence");
///         }
///         other => eprintln!("{other:?}"),
///     }
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// The audio mode changed.
    ModeChanged {
        /// Mode before the change.
        previous: AudioMode,
        /// Mode after the change.
        current: AudioMode,
    },

    /// The voice-call state machine moved.
    CallStateChanged {
        /// New state.
        state: CallState,
    },

    /// A hardware transfer failed; the stream keeps running.
    TransientIo {
        /// Stream or pump that saw the failure.
        stream: String,
        /// Description of the error.
        error: String,
    },

    /// A voice pipe was full and the producer dropped data.
    PipeOverrun {
        /// Name of the pipe.
        pipe: String,
        /// Frames that did not fit.
        dropped_frames: usize,
    },

    /// A voice pipe was empty and the consumer played silence.
    PipeUnderrun {
        /// Name of the pipe.
        pipe: String,
        /// Frames replaced by silence.
        missing_frames: usize,
    },
}

/// Callback type for receiving runtime events.
///
/// Register one via [`HwDeviceBuilder::on_event()`].
///
/// [`HwDeviceBuilder::on_event()`]: crate::HwDeviceBuilder::on_event
pub type EventCallback = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use pcm_router::{event_callback, DeviceEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(DeviceEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Emits `event` on an optional callback.
pub(crate) fn emit(callback: Option<&EventCallback>, event: DeviceEvent) {
    if let Some(callback) = callback {
        callback(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_event_debug() {
        let event = DeviceEvent::PipeOverrun {
            pipe: "uplink".to_string(),
            dropped_frames: 160,
        };
        let debug = format!("{:?}", event);
        assert!(debug.contains("PipeOverrun"));
        assert!(debug.contains("160"));
    }

    #[test]
    fn test_event_callback_helper() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let callback = event_callback(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        emit(Some(&callback), DeviceEvent::CallStateChanged {
            state: CallState::Active,
        });
        emit(None, DeviceEvent::CallStateChanged {
            state: CallState::Idle,
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

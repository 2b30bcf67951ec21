//! Playback port that throws audio away at real-time pace.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{OutPort, PortTimestamp};
use crate::params::PcmParams;
use crate::{Result, RouterError};

#[derive(Debug, Default)]
struct NullState {
    params: Option<PcmParams>,
    last_write: Option<Instant>,
    frames_written: u64,
}

/// Discard sink used in place of the media port while a call owns it.
///
/// Writes succeed and take as long as the audio would take to play, so a
/// client writing to it keeps its normal cadence.
#[derive(Debug)]
pub struct NullOutPort {
    name: String,
    state: Mutex<NullState>,
}

impl NullOutPort {
    /// Creates a closed null port.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(NullState::default()),
        }
    }

    /// Frames discarded since the port was opened.
    pub fn frames_written(&self) -> u64 {
        self.state.lock().frames_written
    }
}

impl OutPort for NullOutPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self, params: &PcmParams) -> Result<()> {
        let mut state = self.state.lock();
        state.params = Some(*params);
        state.last_write = None;
        state.frames_written = 0;
        tracing::debug!(port = %self.name, %params, "null port opened");
        Ok(())
    }

    fn write(&self, _buf: &[i16], frames: usize) -> Result<usize> {
        let remaining = {
            let mut state = self.state.lock();
            let Some(params) = state.params else {
                return Err(RouterError::transient(&self.name, "write on closed port"));
            };
            let now = Instant::now();
            // The first write after open returns at once; later ones fill out
            // whatever part of the period the caller did not spend elsewhere.
            let remaining = state.last_write.map_or(Duration::ZERO, |last| {
                params
                    .frames_duration(frames)
                    .saturating_sub(now.saturating_duration_since(last))
            });
            state.last_write = Some(now + remaining);
            state.frames_written += frames as u64;
            remaining
        };

        if remaining > Duration::ZERO {
            std::thread::sleep(remaining);
        }
        Ok(frames)
    }

    fn stop(&self) {}

    fn close(&self) {
        let mut state = self.state.lock();
        state.params = None;
        state.last_write = None;
    }

    fn is_open(&self) -> bool {
        self.state.lock().params.is_some()
    }

    fn timestamp(&self) -> Result<PortTimestamp> {
        let state = self.state.lock();
        let params = state.params.ok_or(RouterError::NoDevice)?;
        Ok(PortTimestamp {
            available: params.frame_count,
            time: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_port_discards() {
        let port = NullOutPort::new("null");
        assert!(!port.is_open());
        assert!(port.write(&[0; 4], 2).is_err());

        port.open(&PcmParams::new(2, 16, 8000, 160)).unwrap();
        assert!(port.is_open());
        assert_eq!(port.write(&[1; 320], 160).unwrap(), 160);
        assert_eq!(port.frames_written(), 160);

        port.close();
        assert!(!port.is_open());
        assert_eq!(port.timestamp(), Err(RouterError::NoDevice));
    }

    #[test]
    fn test_null_port_paces_writes() {
        let port = NullOutPort::new("null");
        port.open(&PcmParams::new(2, 16, 8000, 160)).unwrap();

        let start = Instant::now();
        for _ in 0..3 {
            port.write(&[0; 320], 160).unwrap();
        }
        // First write is free, the next two take one 20ms period each.
        assert!(start.elapsed() >= Duration::from_millis(35));
    }
}

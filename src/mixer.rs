//! Mixer control plane.
//!
//! The router only ever sets named controls: routing presets, the far-end
//! clock mode and the cabin voice volume. Everything else about the codec
//! mixer belongs to the driver behind [`MixerControl`].

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::{Result, RouterError};

/// Value written to a mixer control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MixerValue {
    /// Integer control (volumes, switches).
    Int(i64),
    /// Enumerated control set by item name.
    Text(String),
}

impl From<i64> for MixerValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for MixerValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl std::fmt::Display for MixerValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

/// Named-control setter implemented by the codec driver.
pub trait MixerControl: Send + Sync {
    /// Sets `control` to `value`.
    ///
    /// A `deferred` set may be batched by the driver and applied with the
    /// next immediate one.
    ///
    /// # Errors
    ///
    /// `MixerControl` when the control does not exist or rejects the value.
    fn set(&self, control: &str, value: MixerValue, deferred: bool) -> Result<()>;
}

/// One recorded call to [`SoftMixer::set`](MixerControl::set).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixerSet {
    /// Control name.
    pub control: String,
    /// Value written.
    pub value: MixerValue,
    /// Whether the set was deferred.
    pub deferred: bool,
}

#[derive(Debug, Default)]
struct SoftMixerState {
    values: HashMap<String, MixerValue>,
    history: Vec<MixerSet>,
    failing: HashSet<String>,
}

/// In-memory mixer that remembers every control it is given.
///
/// Used where no codec driver is present, and by tests to observe the
/// routing the device applies.
#[derive(Debug, Default)]
pub struct SoftMixer {
    state: Mutex<SoftMixerState>,
}

impl SoftMixer {
    /// Creates an empty mixer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `control`.
    pub fn value(&self, control: &str) -> Option<MixerValue> {
        self.state.lock().values.get(control).cloned()
    }

    /// Every set so far, oldest first.
    pub fn history(&self) -> Vec<MixerSet> {
        self.state.lock().history.clone()
    }

    /// Makes sets of `control` fail until [`clear_failure`](Self::clear_failure).
    pub fn fail_control(&self, control: &str) {
        self.state.lock().failing.insert(control.to_string());
    }

    /// Lets sets of `control` succeed again.
    pub fn clear_failure(&self, control: &str) {
        self.state.lock().failing.remove(control);
    }
}

impl MixerControl for SoftMixer {
    fn set(&self, control: &str, value: MixerValue, deferred: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing.contains(control) {
            return Err(RouterError::MixerControl {
                control: control.to_string(),
                reason: "control rejected the value".to_string(),
            });
        }
        tracing::trace!(control, %value, deferred, "mixer set");
        state.values.insert(control.to_string(), value.clone());
        state.history.push(MixerSet {
            control: control.to_string(),
            value,
            deferred,
        });
        Ok(())
    }
}

/// Maps a 0.0..=1.0 voice volume onto the DAC volume register.
///
/// The volume is spread linearly over `(min_db, max_db)` and converted to
/// the codec's half-dB steps, which start at -59 dB.
#[must_use]
pub fn voice_volume_register(volume: f32, (min_db, max_db): (f32, f32)) -> i64 {
    let db = min_db + (max_db - min_db) * volume.clamp(0.0, 1.0);
    (2.0 * (db + 59.0)).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_mixer_records() {
        let mixer = SoftMixer::new();
        mixer.set("Bluetooth Mode", "Master".into(), false).unwrap();
        mixer.set("HP DAC Playback Volume", 118.into(), true).unwrap();

        assert_eq!(
            mixer.value("Bluetooth Mode"),
            Some(MixerValue::Text("Master".to_string()))
        );
        let history = mixer.history();
        assert_eq!(history.len(), 2);
        assert!(history[1].deferred);
    }

    #[test]
    fn test_soft_mixer_failure_injection() {
        let mixer = SoftMixer::new();
        mixer.fail_control("Bluetooth Mode");
        assert!(matches!(
            mixer.set("Bluetooth Mode", "Master".into(), false),
            Err(RouterError::MixerControl { .. })
        ));
        assert_eq!(mixer.value("Bluetooth Mode"), None);

        mixer.clear_failure("Bluetooth Mode");
        assert!(mixer.set("Bluetooth Mode", "Master".into(), false).is_ok());
    }

    #[test]
    fn test_voice_volume_register() {
        let range = (-24.0, 0.0);
        // 0 dB
        assert_eq!(voice_volume_register(1.0, range), 118);
        // -24 dB
        assert_eq!(voice_volume_register(0.0, range), 70);
        // -12 dB
        assert_eq!(voice_volume_register(0.5, range), 94);
        // Clamped
        assert_eq!(voice_volume_register(2.0, range), 118);
    }

    #[test]
    fn test_mixer_value_display() {
        assert_eq!(MixerValue::Int(3).to_string(), "3");
        assert_eq!(MixerValue::from("Slave").to_string(), "Slave");
    }
}

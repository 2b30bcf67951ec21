//! Synthetic ports for testing without hardware.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{InPort, OutPort, PortSet, PortTimestamp};
use crate::config::{DeviceConfig, PortId};
use crate::params::PcmParams;
use crate::{Result, RouterError};

/// What a [`MockInPort`] captures.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// All zeros.
    Silence,
    /// Frame counter (wrapping), identical on every slot.
    Ramp,
    /// A constant per slot; slots past the end of the list read zero.
    PerSlot(Vec<i16>),
    /// Sine wave on every slot.
    Sine {
        /// Frequency in Hz.
        frequency: f64,
        /// Peak amplitude, 0.0..=1.0.
        amplitude: f64,
    },
}

impl Signal {
    fn sample(&self, frame: u64, slot: usize, rate: u32) -> i16 {
        match self {
            Self::Silence => 0,
            Self::Ramp => frame as i16,
            Self::PerSlot(values) => values.get(slot).copied().unwrap_or(0),
            Self::Sine {
                frequency,
                amplitude,
            } => {
                let t = frame as f64 / f64::from(rate.max(1));
                let value = (2.0 * std::f64::consts::PI * frequency * t).sin();
                (value * amplitude * 32767.0) as i16
            }
        }
    }
}

const CATCH_UP_SLACK: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
struct PortState {
    params: Option<PcmParams>,
    stopped: bool,
    frames: u64,
    next_deadline: Option<Instant>,
}

/// Shared open/stop/pacing logic of both mock directions.
#[derive(Debug)]
struct MockCore {
    name: String,
    realtime: bool,
    fail_open: AtomicBool,
    failures: AtomicUsize,
    opens: AtomicUsize,
    state: Mutex<PortState>,
    wake: Condvar,
}

impl MockCore {
    fn new(name: String, realtime: bool) -> Self {
        Self {
            name,
            realtime,
            fail_open: AtomicBool::new(false),
            failures: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
            state: Mutex::new(PortState::default()),
            wake: Condvar::new(),
        }
    }

    fn open(&self, params: &PcmParams) -> Result<()> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(RouterError::unavailable(&self.name, "injected open failure"));
        }
        let mut state = self.state.lock();
        state.params = Some(*params);
        state.stopped = false;
        state.next_deadline = None;
        self.opens.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(port = %self.name, %params, "mock port opened");
        Ok(())
    }

    /// Runs one transfer of `frames` frames: checks state, injects faults,
    /// sleeps out the period when real-time, then hands the first frame
    /// index and parameters to `transfer`.
    fn transfer<T>(&self, frames: usize, transfer: impl FnOnce(u64, &PcmParams) -> T) -> Result<T> {
        let mut state = self.state.lock();
        let Some(params) = state.params else {
            return Err(RouterError::transient(&self.name, "port is closed"));
        };
        if state.stopped {
            return Err(RouterError::transient(&self.name, "port is stopped"));
        }
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RouterError::transient(&self.name, "injected I/O failure"));
        }

        if self.realtime {
            let now = Instant::now();
            // A reader that fell behind may catch up on what the clock
            // already produced, but never by more than the slack.
            let base = match state.next_deadline {
                Some(due) if due + CATCH_UP_SLACK > now => due,
                _ => now,
            };
            let deadline = base + params.frames_duration(frames);
            state.next_deadline = Some(deadline);
            while !state.stopped && Instant::now() < deadline {
                self.wake.wait_until(&mut state, deadline);
            }
            if state.stopped {
                return Err(RouterError::transient(&self.name, "port is stopped"));
            }
        }

        let first = state.frames;
        state.frames += frames as u64;
        Ok(transfer(first, &params))
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        self.wake.notify_all();
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.params.take().is_some() {
            tracing::debug!(port = %self.name, "mock port closed");
        }
        state.stopped = false;
        self.wake.notify_all();
    }

    fn is_open(&self) -> bool {
        self.state.lock().params.is_some()
    }

    fn timestamp(&self) -> Result<PortTimestamp> {
        let state = self.state.lock();
        match state.params {
            Some(params) if !state.stopped => Ok(PortTimestamp {
                available: params.frame_count,
                time: Instant::now(),
            }),
            _ => Err(RouterError::NoDevice),
        }
    }
}

/// Capture port that generates a [`Signal`].
///
/// # Example
///
/// ```
/// use pcm_router::port::{InPort, MockInPort, Signal};
/// use pcm_router::PcmParams;
///
/// let port = MockInPort::new("mic", Signal::PerSlot(vec![1, 2]));
/// port.open(&PcmParams::new(2, 16, 8000, 160)).unwrap();
///
/// let mut buf = [0i16; 4];
/// assert_eq!(port.read(&mut buf, 2).unwrap(), 2);
/// assert_eq!(buf, [1, 2, 1, 2]);
/// ```
#[derive(Debug)]
pub struct MockInPort {
    core: MockCore,
    signal: Mutex<Signal>,
}

impl MockInPort {
    /// Creates a free-running capture port.
    pub fn new(name: impl Into<String>, signal: Signal) -> Self {
        Self {
            core: MockCore::new(name.into(), false),
            signal: Mutex::new(signal),
        }
    }

    /// Creates a capture port that delivers frames at the real rate.
    pub fn realtime(name: impl Into<String>, signal: Signal) -> Self {
        Self {
            core: MockCore::new(name.into(), true),
            signal: Mutex::new(signal),
        }
    }

    /// Replaces the generated signal.
    pub fn set_signal(&self, signal: Signal) {
        *self.signal.lock() = signal;
    }

    /// Makes the next `open` calls fail until cleared.
    pub fn set_fail_open(&self, fail: bool) {
        self.core.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` reads fail.
    pub fn fail_next(&self, count: usize) {
        self.core.failures.store(count, Ordering::SeqCst);
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.core.opens.load(Ordering::SeqCst)
    }

    /// Frames delivered since construction.
    pub fn frames_read(&self) -> u64 {
        self.core.state.lock().frames
    }
}

impl InPort for MockInPort {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn open(&self, params: &PcmParams) -> Result<()> {
        self.core.open(params)
    }

    fn read(&self, buf: &mut [i16], frames: usize) -> Result<usize> {
        let signal = self.signal.lock().clone();
        self.core.transfer(frames, |first, params| {
            let ch = params.channels;
            let frames = frames.min(buf.len() / ch);
            for (i, frame) in buf[..frames * ch].chunks_exact_mut(ch).enumerate() {
                for (slot, sample) in frame.iter_mut().enumerate() {
                    *sample = signal.sample(first + i as u64, slot, params.sample_rate);
                }
            }
            frames
        })
    }

    fn stop(&self) {
        self.core.stop();
    }

    fn close(&self) {
        self.core.close();
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn timestamp(&self) -> Result<PortTimestamp> {
        self.core.timestamp()
    }
}

/// Playback port that records what it is given.
#[derive(Debug)]
pub struct MockOutPort {
    core: MockCore,
    recorded: Mutex<Vec<i16>>,
    record_limit: usize,
}

impl MockOutPort {
    /// Samples kept by default before recording stops growing.
    pub const DEFAULT_RECORD_LIMIT: usize = 1 << 20;

    /// Creates a free-running playback port.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: MockCore::new(name.into(), false),
            recorded: Mutex::new(Vec::new()),
            record_limit: Self::DEFAULT_RECORD_LIMIT,
        }
    }

    /// Creates a playback port that consumes frames at the real rate.
    pub fn realtime(name: impl Into<String>) -> Self {
        Self {
            core: MockCore::new(name.into(), true),
            recorded: Mutex::new(Vec::new()),
            record_limit: Self::DEFAULT_RECORD_LIMIT,
        }
    }

    /// Makes the next `open` calls fail until cleared.
    pub fn set_fail_open(&self, fail: bool) {
        self.core.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` writes fail.
    pub fn fail_next(&self, count: usize) {
        self.core.failures.store(count, Ordering::SeqCst);
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.core.opens.load(Ordering::SeqCst)
    }

    /// Frames accepted since construction.
    pub fn frames_written(&self) -> u64 {
        self.core.state.lock().frames
    }

    /// Copy of the recorded samples.
    pub fn recorded(&self) -> Vec<i16> {
        self.recorded.lock().clone()
    }

    /// Takes the recorded samples, leaving the record empty.
    pub fn take_recorded(&self) -> Vec<i16> {
        std::mem::take(&mut *self.recorded.lock())
    }
}

impl OutPort for MockOutPort {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn open(&self, params: &PcmParams) -> Result<()> {
        self.core.open(params)
    }

    fn write(&self, buf: &[i16], frames: usize) -> Result<usize> {
        self.core.transfer(frames, |_, params| {
            let frames = frames.min(buf.len() / params.channels);
            let samples = &buf[..frames * params.channels];
            let mut recorded = self.recorded.lock();
            let room = self.record_limit.saturating_sub(recorded.len());
            recorded.extend_from_slice(&samples[..samples.len().min(room)]);
            frames
        })
    }

    fn stop(&self) {
        self.core.stop();
    }

    fn close(&self) {
        self.core.close();
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn timestamp(&self) -> Result<PortTimestamp> {
        self.core.timestamp()
    }
}

/// One mock capture and playback port per [`PortId`].
#[derive(Debug, Clone)]
pub struct MockPorts {
    /// Capture ports, indexed by [`PortId::index`].
    pub inputs: [Arc<MockInPort>; 3],
    /// Playback ports, indexed by [`PortId::index`].
    pub outputs: [Arc<MockOutPort>; 3],
}

impl MockPorts {
    /// Free-running ports; media capture carries a ramp, the far end a
    /// constant per slot.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Ports paced by the wall clock, as real hardware would be.
    pub fn realtime() -> Self {
        Self::build(true)
    }

    fn build(realtime: bool) -> Self {
        let input = |id: PortId, signal: Signal| {
            let name = format!("{id}-in");
            Arc::new(if realtime {
                MockInPort::realtime(name, signal)
            } else {
                MockInPort::new(name, signal)
            })
        };
        let output = |id: PortId| {
            let name = format!("{id}-out");
            Arc::new(if realtime {
                MockOutPort::realtime(name)
            } else {
                MockOutPort::new(name)
            })
        };
        Self {
            inputs: [
                input(PortId::Onboard, Signal::Ramp),
                input(PortId::Expansion, Signal::Ramp),
                input(PortId::FarEnd, Signal::PerSlot(vec![1000, 0])),
            ],
            outputs: [
                output(PortId::Onboard),
                output(PortId::Expansion),
                output(PortId::FarEnd),
            ],
        }
    }

    /// Capture side of `id`.
    pub fn input(&self, id: PortId) -> &Arc<MockInPort> {
        &self.inputs[id.index()]
    }

    /// Playback side of `id`.
    pub fn output(&self, id: PortId) -> &Arc<MockOutPort> {
        &self.outputs[id.index()]
    }

    /// Media capture port for `config`.
    pub fn media_input(&self, config: &DeviceConfig) -> &Arc<MockInPort> {
        self.input(config.media_port())
    }

    /// Media playback port for `config`.
    pub fn media_output(&self, config: &DeviceConfig) -> &Arc<MockOutPort> {
        self.output(config.media_port())
    }

    /// The ports as a [`PortSet`] for device construction.
    pub fn port_set(&self) -> PortSet {
        let [a, b, c] = self.inputs.clone();
        let [x, y, z] = self.outputs.clone();
        PortSet::new([a, b, c], [x, y, z])
    }
}

impl Default for MockPorts {
    fn default() -> Self {
        Self::new()
    }
}

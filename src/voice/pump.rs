//! Voice-call pump threads.
//!
//! A pump moves one far-end period per iteration between a logical stream
//! and a [`MonoPipe`]. Capture pumps fill a pipe from a port, playback pumps
//! empty a pipe onto a port. Each runs on its own named thread and walks an
//! explicit [`PumpPhase`] state machine.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::event::{emit, DeviceEvent, EventCallback};
use crate::pipe::{MonoPipe, PipeState};
use crate::stream::{InStream, OutStream};
use crate::{Result, RouterError};

/// Where a pump is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpPhase {
    /// Waiting for the port to deliver data (capture) or pre-filling the
    /// port with silence (playback).
    Priming,
    /// Moving one period per iteration.
    SteadyState,
    /// The pipe is draining: deliver what is left, then exit.
    Draining,
}

impl PumpPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::SteadyState,
            2 => Self::Draining,
            _ => Self::Priming,
        }
    }
}

/// The stream a pump drives.
pub(crate) enum Endpoint {
    /// Port to pipe.
    Capture(InStream),
    /// Pipe to port.
    Playback(OutStream),
}

impl Endpoint {
    fn register(&self) -> Result<()> {
        match self {
            Self::Capture(s) => s.register(),
            Self::Playback(s) => s.register(),
        }
    }

    fn unregister(&self) -> Result<()> {
        match self {
            Self::Capture(s) => s.unregister(),
            Self::Playback(s) => s.unregister(),
        }
    }

    fn is_registered(&self) -> bool {
        match self {
            Self::Capture(s) => s.is_registered(),
            Self::Playback(s) => s.is_registered(),
        }
    }

    fn start(&mut self) -> Result<()> {
        match self {
            Self::Capture(s) => s.start(),
            Self::Playback(s) => s.start(),
        }
    }

    fn stop(&mut self) -> Result<()> {
        match self {
            Self::Capture(s) => s.stop(),
            Self::Playback(s) => s.stop(),
        }
    }

    fn period(&self) -> (usize, usize, Duration) {
        let params = match self {
            Self::Capture(s) => s.params(),
            Self::Playback(s) => s.params(),
        };
        (params.frame_count, params.channels, params.period_duration())
    }
}

/// Shared between the control side and the pump thread.
struct PumpShared {
    name: String,
    pipe: Arc<MonoPipe>,
    stop: AtomicBool,
    phase: AtomicU8,
    prime_periods: usize,
    events: Option<EventCallback>,
}

impl PumpShared {
    fn set_phase(&self, phase: PumpPhase) {
        let previous = self.phase.swap(phase as u8, Ordering::AcqRel);
        if previous != phase as u8 {
            tracing::debug!(pump = %self.name, ?phase, "pump phase");
        }
    }

    fn should_exit(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.pipe.state().is_closed()
    }

    fn report_io(&self, err: &RouterError) {
        tracing::warn!(pump = %self.name, %err, "voice transfer failed");
        emit(
            self.events.as_ref(),
            DeviceEvent::TransientIo {
                stream: self.name.clone(),
                error: err.to_string(),
            },
        );
    }
}

/// One voice-call stream plus the thread that drives it.
///
/// The stream is registered and started from the control thread so that
/// open failures surface synchronously; the thread only moves data.
pub(crate) struct Pump {
    shared: Arc<PumpShared>,
    endpoint: Arc<Mutex<Endpoint>>,
    handle: Option<JoinHandle<()>>,
}

impl Pump {
    /// Pump reading `stream` into `pipe`.
    pub(crate) fn capture(
        name: impl Into<String>,
        stream: InStream,
        pipe: Arc<MonoPipe>,
        events: Option<EventCallback>,
    ) -> Self {
        Self::new(name.into(), Endpoint::Capture(stream), pipe, 0, events)
    }

    /// Pump writing `pipe` into `stream`, after `prime_periods` periods of
    /// silence.
    pub(crate) fn playback(
        name: impl Into<String>,
        stream: OutStream,
        pipe: Arc<MonoPipe>,
        prime_periods: usize,
        events: Option<EventCallback>,
    ) -> Self {
        Self::new(name.into(), Endpoint::Playback(stream), pipe, prime_periods, events)
    }

    fn new(
        name: String,
        endpoint: Endpoint,
        pipe: Arc<MonoPipe>,
        prime_periods: usize,
        events: Option<EventCallback>,
    ) -> Self {
        Self {
            shared: Arc::new(PumpShared {
                name,
                pipe,
                stop: AtomicBool::new(false),
                phase: AtomicU8::new(PumpPhase::Priming as u8),
                prime_periods,
                events,
            }),
            endpoint: Arc::new(Mutex::new(endpoint)),
            handle: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current phase of the thread.
    pub(crate) fn phase(&self) -> PumpPhase {
        PumpPhase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    #[cfg(test)]
    pub(crate) fn is_started(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn register(&self) -> Result<()> {
        self.endpoint.lock().register()
    }

    /// Unregisters if registered; a missing registration is not an error.
    pub(crate) fn unregister(&self) {
        let endpoint = self.endpoint.lock();
        if endpoint.is_registered() {
            if let Err(err) = endpoint.unregister() {
                tracing::warn!(pump = %self.shared.name, %err, "unregister failed");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_registered(&self) -> bool {
        self.endpoint.lock().is_registered()
    }

    /// Starts the stream and spawns the pump thread.
    ///
    /// # Errors
    ///
    /// The stream's start error, or `ThreadSpawn`; the stream is stopped
    /// again in the latter case.
    pub(crate) fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        self.endpoint.lock().start()?;
        self.shared.stop.store(false, Ordering::Release);
        self.shared.set_phase(PumpPhase::Priming);

        let shared = Arc::clone(&self.shared);
        let endpoint = Arc::clone(&self.endpoint);
        let spawned = std::thread::Builder::new()
            .name(self.shared.name.clone())
            .spawn(move || run(&shared, &endpoint));

        match spawned {
            Ok(handle) => {
                tracing::info!(pump = %self.shared.name, "pump started");
                self.handle = Some(handle);
                Ok(())
            }
            Err(err) => {
                if let Err(stop_err) = self.endpoint.lock().stop() {
                    tracing::warn!(pump = %self.shared.name, %stop_err, "stop after spawn failure");
                }
                Err(RouterError::ThreadSpawn {
                    name: self.shared.name.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Signals the thread, waits for it and stops the stream.
    ///
    /// The thread must be unblocked first, by shutting the pipe down or
    /// stopping the port, or this waits up to one pipe duration.
    pub(crate) fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);
        if handle.join().is_err() {
            tracing::error!(pump = %self.shared.name, "pump thread panicked");
        }
        if let Err(err) = self.endpoint.lock().stop() {
            tracing::warn!(pump = %self.shared.name, %err, "stream stop failed");
        }
        tracing::info!(pump = %self.shared.name, "pump stopped");
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &PumpShared, endpoint: &Mutex<Endpoint>) {
    let mut endpoint = endpoint.lock();
    let (period, channels, period_time) = endpoint.period();
    let mut buf = vec![0i16; period * channels];

    match &mut *endpoint {
        Endpoint::Capture(stream) => run_capture(shared, stream, &mut buf, period, period_time),
        Endpoint::Playback(stream) => run_playback(shared, stream, &mut buf, period, period_time),
    }
    tracing::debug!(pump = %shared.name, "pump thread exiting");
}

fn run_capture(
    shared: &PumpShared,
    stream: &mut InStream,
    buf: &mut [i16],
    period: usize,
    period_time: Duration,
) {
    let pipe = &shared.pipe;
    let mut phase = PumpPhase::Priming;

    while !shared.should_exit() {
        if pipe.state() == PipeState::Draining {
            // Nothing new is wanted once the consumer is draining.
            shared.set_phase(PumpPhase::Draining);
            break;
        }

        if phase == PumpPhase::Priming {
            match stream.timestamp() {
                Ok(ts) if ts.available > 0 => {
                    phase = PumpPhase::SteadyState;
                    shared.set_phase(phase);
                }
                _ => {
                    std::thread::sleep(period_time);
                    continue;
                }
            }
        }

        match stream.read(buf, period) {
            Ok(frames) => {
                let written = pipe.write(buf, frames);
                if written < frames && !shared.should_exit() {
                    emit(
                        shared.events.as_ref(),
                        DeviceEvent::PipeOverrun {
                            pipe: pipe.name().to_string(),
                            dropped_frames: frames - written,
                        },
                    );
                }
            }
            Err(err) => {
                if shared.should_exit() {
                    break;
                }
                shared.report_io(&err);
                std::thread::sleep(period_time);
            }
        }
    }
}

fn run_playback(
    shared: &PumpShared,
    stream: &mut OutStream,
    buf: &mut [i16],
    period: usize,
    period_time: Duration,
) {
    let pipe = &shared.pipe;
    let channels = pipe.channels();

    buf.fill(0);
    for _ in 0..shared.prime_periods {
        if shared.should_exit() {
            return;
        }
        if let Err(err) = stream.write(buf, period) {
            if shared.should_exit() {
                return;
            }
            shared.report_io(&err);
            std::thread::sleep(period_time);
        }
    }
    shared.set_phase(PumpPhase::SteadyState);

    while !shared.should_exit() {
        let draining = pipe.state() == PipeState::Draining;
        if draining {
            shared.set_phase(PumpPhase::Draining);
        }

        let frames = pipe.read(buf, period);
        let out_frames = if draining {
            if frames == 0 {
                break;
            }
            frames
        } else {
            if frames < period {
                if shared.should_exit() {
                    break;
                }
                buf[frames * channels..].fill(0);
                emit(
                    shared.events.as_ref(),
                    DeviceEvent::PipeUnderrun {
                        pipe: pipe.name().to_string(),
                        missing_frames: period - frames,
                    },
                );
            }
            period
        };

        if let Err(err) = stream.write(buf, out_frames) {
            if shared.should_exit() {
                break;
            }
            shared.report_io(&err);
            std::thread::sleep(period_time);
        }
    }
}

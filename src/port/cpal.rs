//! Host audio devices as hardware ports.
//!
//! A cpal stream runs its own callback thread and may not be `Send`, so each
//! open port owns a small worker thread that builds the stream, keeps it
//! alive and drops it on close. Samples cross between the callback and the
//! port through a `ringbuf` ring; `read`/`write` poll the ring at a fraction
//! of a period.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Instant;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use super::{InPort, OutPort, PortTimestamp};
use crate::params::PcmParams;
use crate::{Result, RouterError};

/// Symmetric i16 max for audio conversion (avoids asymmetric clipping).
const I16_MAX_SYMMETRIC: f32 = i16::MAX as f32;

/// Periods held by the ring between callback and port.
const RING_PERIODS: usize = 4;

/// A blocked transfer gives up after this many periods without progress.
const STALL_PERIODS: u32 = 4;

fn find_device(name: Option<&str>, input: bool) -> Result<Device> {
    let host = cpal::default_host();
    let label = name.unwrap_or("default");
    let unavailable = |reason: String| RouterError::unavailable(label, reason);

    match name {
        None if input => host
            .default_input_device()
            .ok_or_else(|| unavailable("no default input device".to_string())),
        None => host
            .default_output_device()
            .ok_or_else(|| unavailable("no default output device".to_string())),
        Some(name) => {
            let mut devices: Box<dyn Iterator<Item = Device>> = if input {
                Box::new(host.input_devices().map_err(|e| unavailable(e.to_string()))?)
            } else {
                Box::new(host.output_devices().map_err(|e| unavailable(e.to_string()))?)
            };
            devices
                .find(|device| device.name().is_ok_and(|n| n == name))
                .ok_or_else(|| unavailable("device not found".to_string()))
        }
    }
}

fn stream_config(params: &PcmParams) -> StreamConfig {
    StreamConfig {
        channels: params.channels as u16,
        sample_rate: cpal::SampleRate(params.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Keeps a cpal stream alive on its own thread until dropped.
struct StreamWorker {
    stop: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl StreamWorker {
    /// Spawns a thread that runs `build`, plays the stream and parks until
    /// the worker is dropped. Returns once the stream is playing.
    fn spawn<F>(name: &str, build: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Stream> + Send + 'static,
    {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let port = name.to_string();

        let handle = std::thread::Builder::new()
            .name(format!("cpal-{name}"))
            .spawn(move || {
                let stream = match build().and_then(|stream| {
                    stream
                        .play()
                        .map_err(|e| RouterError::unavailable(&port, e.to_string()))?;
                    Ok(stream)
                }) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                // Returns on an explicit stop or when the port drops the sender.
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!(port = %port, "cpal stream dropped");
            })
            .map_err(|e| RouterError::ThreadSpawn {
                name: format!("cpal-{name}"),
                reason: e.to_string(),
            })?;

        let mut worker = Self {
            stop,
            handle: Some(handle),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(worker),
            Ok(Err(err)) => {
                worker.join();
                Err(err)
            }
            Err(_) => {
                worker.join();
                Err(RouterError::unavailable(name, "stream thread exited"))
            }
        }
    }

    fn join(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("cpal stream thread panicked");
            }
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.join();
    }
}

struct InState {
    params: Option<PcmParams>,
    consumer: Option<HeapCons<i16>>,
    worker: Option<StreamWorker>,
    stopped: bool,
}

/// Capture port reading from a host input device.
pub struct CpalInPort {
    name: String,
    device: Option<String>,
    state: Mutex<InState>,
}

impl CpalInPort {
    /// Port on the host's default input device.
    pub fn default_device(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// Port on the input device called `device`.
    pub fn by_name(name: impl Into<String>, device: impl Into<String>) -> Self {
        Self::new(name, Some(device.into()))
    }

    fn new(name: impl Into<String>, device: Option<String>) -> Self {
        Self {
            name: name.into(),
            device,
            state: Mutex::new(InState {
                params: None,
                consumer: None,
                worker: None,
                stopped: false,
            }),
        }
    }
}

fn build_input(device: &Device, config: &StreamConfig, mut producer: HeapProd<i16>) -> Result<Stream> {
    let format = device
        .default_input_config()
        .map_err(|e| RouterError::unavailable("cpal", e.to_string()))?
        .sample_format();
    let on_error = |err: cpal::StreamError| tracing::error!("audio stream error: {}", err);

    let stream = match format {
        SampleFormat::I16 => device.build_input_stream(
            config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let _ = producer.push_slice(data);
            },
            on_error,
            None,
        ),
        SampleFormat::F32 => device.build_input_stream(
            config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    let scaled = (sample * I16_MAX_SYMMETRIC)
                        .clamp(-I16_MAX_SYMMETRIC, I16_MAX_SYMMETRIC);
                    let _ = producer.try_push(scaled as i16);
                }
            },
            on_error,
            None,
        ),
        other => {
            return Err(RouterError::UnsupportedFormat {
                bits: (other.sample_size() * 8) as u32,
            })
        }
    };
    stream.map_err(|e| RouterError::unavailable("cpal", e.to_string()))
}

impl InPort for CpalInPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_check(&self) -> Result<()> {
        find_device(self.device.as_deref(), true).map(|_| ())
    }

    fn open(&self, params: &PcmParams) -> Result<()> {
        let mut state = self.state.lock();
        let (producer, consumer) = HeapRb::<i16>::new(params.period_samples() * RING_PERIODS).split();
        let device_name = self.device.clone();
        let config = stream_config(params);
        let worker = StreamWorker::spawn(&self.name, move || {
            let device = find_device(device_name.as_deref(), true)?;
            build_input(&device, &config, producer)
        })?;

        state.params = Some(*params);
        state.consumer = Some(consumer);
        state.worker = Some(worker);
        state.stopped = false;
        tracing::info!(port = %self.name, %params, "cpal capture opened");
        Ok(())
    }

    fn read(&self, buf: &mut [i16], frames: usize) -> Result<usize> {
        let mut done = 0;
        let mut last_progress = Instant::now();
        loop {
            let poll = {
                let mut state = self.state.lock();
                let Some(params) = state.params else {
                    return Err(RouterError::transient(&self.name, "port is closed"));
                };
                if state.stopped {
                    return Err(RouterError::transient(&self.name, "port is stopped"));
                }
                let ch = params.channels;
                let frames = frames.min(buf.len() / ch);
                let Some(consumer) = state.consumer.as_mut() else {
                    return Err(RouterError::transient(&self.name, "port is closed"));
                };
                let n = (consumer.occupied_len() / ch).min(frames - done);
                if n > 0 {
                    consumer.pop_slice(&mut buf[done * ch..(done + n) * ch]);
                    done += n;
                    last_progress = Instant::now();
                }
                if done == frames {
                    return Ok(done);
                }
                params.period_duration()
            };
            if last_progress.elapsed() > poll * STALL_PERIODS {
                return Err(RouterError::transient(&self.name, "capture stalled"));
            }
            std::thread::sleep(poll / 4);
        }
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
    }

    fn close(&self) {
        let worker = {
            let mut state = self.state.lock();
            state.params = None;
            state.consumer = None;
            state.stopped = false;
            state.worker.take()
        };
        if worker.is_some() {
            drop(worker);
            tracing::info!(port = %self.name, "cpal capture closed");
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().params.is_some()
    }

    fn timestamp(&self) -> Result<PortTimestamp> {
        let state = self.state.lock();
        match (&state.params, &state.consumer) {
            (Some(params), Some(consumer)) if !state.stopped => Ok(PortTimestamp {
                available: consumer.occupied_len() / params.channels,
                time: Instant::now(),
            }),
            _ => Err(RouterError::NoDevice),
        }
    }
}

struct OutState {
    params: Option<PcmParams>,
    producer: Option<HeapProd<i16>>,
    worker: Option<StreamWorker>,
    stopped: bool,
}

/// Playback port writing to a host output device.
pub struct CpalOutPort {
    name: String,
    device: Option<String>,
    state: Mutex<OutState>,
}

impl CpalOutPort {
    /// Port on the host's default output device.
    pub fn default_device(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// Port on the output device called `device`.
    pub fn by_name(name: impl Into<String>, device: impl Into<String>) -> Self {
        Self::new(name, Some(device.into()))
    }

    fn new(name: impl Into<String>, device: Option<String>) -> Self {
        Self {
            name: name.into(),
            device,
            state: Mutex::new(OutState {
                params: None,
                producer: None,
                worker: None,
                stopped: false,
            }),
        }
    }
}

fn build_output(device: &Device, config: &StreamConfig, mut consumer: HeapCons<i16>) -> Result<Stream> {
    let format = device
        .default_output_config()
        .map_err(|e| RouterError::unavailable("cpal", e.to_string()))?
        .sample_format();
    let on_error = |err: cpal::StreamError| tracing::error!("audio stream error: {}", err);

    let stream = match format {
        SampleFormat::I16 => device.build_output_stream(
            config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                let n = consumer.pop_slice(data);
                data[n..].fill(0);
            },
            on_error,
            None,
        ),
        SampleFormat::F32 => device.build_output_stream(
            config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for out in data.iter_mut() {
                    *out = consumer
                        .try_pop()
                        .map_or(0.0, |s| f32::from(s) / I16_MAX_SYMMETRIC);
                }
            },
            on_error,
            None,
        ),
        other => {
            return Err(RouterError::UnsupportedFormat {
                bits: (other.sample_size() * 8) as u32,
            })
        }
    };
    stream.map_err(|e| RouterError::unavailable("cpal", e.to_string()))
}

impl OutPort for CpalOutPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn init_check(&self) -> Result<()> {
        find_device(self.device.as_deref(), false).map(|_| ())
    }

    fn open(&self, params: &PcmParams) -> Result<()> {
        let mut state = self.state.lock();
        let (producer, consumer) = HeapRb::<i16>::new(params.period_samples() * RING_PERIODS).split();
        let device_name = self.device.clone();
        let config = stream_config(params);
        let worker = StreamWorker::spawn(&self.name, move || {
            let device = find_device(device_name.as_deref(), false)?;
            build_output(&device, &config, consumer)
        })?;

        state.params = Some(*params);
        state.producer = Some(producer);
        state.worker = Some(worker);
        state.stopped = false;
        tracing::info!(port = %self.name, %params, "cpal playback opened");
        Ok(())
    }

    fn write(&self, buf: &[i16], frames: usize) -> Result<usize> {
        let mut done = 0;
        let mut last_progress = Instant::now();
        loop {
            let poll = {
                let mut state = self.state.lock();
                let Some(params) = state.params else {
                    return Err(RouterError::transient(&self.name, "port is closed"));
                };
                if state.stopped {
                    return Err(RouterError::transient(&self.name, "port is stopped"));
                }
                let ch = params.channels;
                let frames = frames.min(buf.len() / ch);
                let Some(producer) = state.producer.as_mut() else {
                    return Err(RouterError::transient(&self.name, "port is closed"));
                };
                let n = (producer.vacant_len() / ch).min(frames - done);
                if n > 0 {
                    producer.push_slice(&buf[done * ch..(done + n) * ch]);
                    done += n;
                    last_progress = Instant::now();
                }
                if done == frames {
                    return Ok(done);
                }
                params.period_duration()
            };
            if last_progress.elapsed() > poll * STALL_PERIODS {
                return Err(RouterError::transient(&self.name, "playback stalled"));
            }
            std::thread::sleep(poll / 4);
        }
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
    }

    fn close(&self) {
        let worker = {
            let mut state = self.state.lock();
            state.params = None;
            state.producer = None;
            state.stopped = false;
            state.worker.take()
        };
        if worker.is_some() {
            drop(worker);
            tracing::info!(port = %self.name, "cpal playback closed");
        }
    }

    fn is_open(&self) -> bool {
        self.state.lock().params.is_some()
    }

    fn timestamp(&self) -> Result<PortTimestamp> {
        let state = self.state.lock();
        match (&state.params, &state.producer) {
            (Some(params), Some(producer)) if !state.stopped => Ok(PortTimestamp {
                available: producer.vacant_len() / params.channels,
                time: Instant::now(),
            }),
            _ => Err(RouterError::NoDevice),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_port_refuses_io() {
        let port = CpalInPort::default_device("mic");
        let mut buf = [0i16; 4];
        assert!(port.read(&mut buf, 2).is_err());
        assert_eq!(port.timestamp(), Err(RouterError::NoDevice));
        assert!(!port.is_open());
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_default_devices_round_trip() {
        let params = PcmParams::new(2, 16, 48_000, 480);
        let input = CpalInPort::default_device("mic");
        let output = CpalOutPort::default_device("speaker");
        input.open(&params).unwrap();
        output.open(&params).unwrap();

        let mut buf = vec![0i16; params.period_samples()];
        for _ in 0..10 {
            let frames = input.read(&mut buf, 480).unwrap();
            output.write(&buf, frames).unwrap();
        }
        input.close();
        output.close();
    }
}

//! Capture-side logical stream.

use std::sync::Arc;

use crate::format::{copy_from_provider, BufferProvider, FrameBuffer, Remix, Resampler, SlotMap};
use crate::mux::{PcmReader, StreamId};
use crate::params::{PcmParams, SAMPLE_SIZE};
use crate::port::PortTimestamp;
use crate::{Result, RouterError};

/// Extra frames kept in the bridge buffer to absorb non-integer rate ratios.
const BRIDGE_HEADROOM: usize = 10;

/// Pulls hardware periods from a [`PcmReader`] and serves them, already
/// slot-mapped and remixed, to the resampler.
///
/// A period is read only once everything from the previous one has been
/// released. A failed read is kept in `status` until the owning stream
/// collects it.
struct CaptureBridge {
    reader: Arc<PcmReader>,
    id: StreamId,
    slots: SlotMap,
    remix: Remix,
    port_channels: usize,
    port_buf: Vec<i16>,
    frames: FrameBuffer,
    offset: usize,
    status: Option<RouterError>,
}

impl CaptureBridge {
    fn reset(&mut self) {
        self.frames.clear();
        self.offset = 0;
        self.status = None;
    }

    fn refill(&mut self) -> Result<()> {
        let read = self.reader.read_period(self.id, &mut self.port_buf)?;
        let fill = self.remix.fill_channels();
        let frames = read.min(self.frames.capacity_frames(fill));
        self.slots.map_frames(
            &self.port_buf,
            self.port_channels,
            self.frames.storage_mut(),
            fill,
            frames,
        );
        self.frames.set_layout(frames, fill);
        self.remix.apply(&mut self.frames);
        self.offset = 0;
        Ok(())
    }
}

impl BufferProvider for CaptureBridge {
    fn get_next_buffer(&mut self, frames: usize) -> Result<&[i16]> {
        let capacity = self.frames.capacity_frames(self.remix.out_channels());
        let frames = if frames > capacity {
            tracing::debug!(requested = frames, capacity, "bridge request clamped");
            capacity
        } else {
            frames
        };

        if self.offset >= self.frames.frames() {
            if let Err(err) = self.refill() {
                self.frames.clear();
                self.offset = 0;
                self.status = Some(err.clone());
                return Err(err);
            }
        }

        let ch = self.remix.out_channels();
        let n = frames.min(self.frames.frames() - self.offset);
        Ok(&self.frames.as_slice()[self.offset * ch..(self.offset + n) * ch])
    }

    fn release_buffer(&mut self, frames: usize) {
        self.offset = (self.offset + frames).min(self.frames.frames());
    }
}

/// A client capture stream attached to a [`PcmReader`].
///
/// Converts the port's slot layout and rate to the stream's own
/// [`PcmParams`]: port slots are picked through a [`SlotMap`], remixed to the
/// client channel count, then resampled when the rates differ.
pub struct InStream {
    id: StreamId,
    params: PcmParams,
    bridge: CaptureBridge,
    resampler: Option<Resampler>,
}

impl InStream {
    /// Builds a stream reading from `reader`, producing `params` frames.
    /// `slots` maps stream channels (destinations) to port slots (sources).
    ///
    /// # Errors
    ///
    /// Invalid parameters, a slot map outside the port layout, or an
    /// unsupported channel conversion. Nothing is registered on failure.
    pub fn new(reader: Arc<PcmReader>, params: PcmParams, slots: SlotMap) -> Result<Self> {
        params.validate()?;
        let port = *reader.params();
        let slot_channels = slots.dst_channels();
        slots.validate(port.channels, slot_channels)?;
        let remix = Remix::new(SAMPLE_SIZE, slot_channels, params.channels)?;

        let resampler = if port.sample_rate == params.sample_rate {
            None
        } else {
            Some(Resampler::new(port.sample_rate, params.sample_rate, params.channels)?)
        };

        let scaled = (params.frame_count as u64 * u64::from(port.sample_rate))
            .div_ceil(u64::from(params.sample_rate)) as usize;
        let capacity = port.frame_count.max(scaled + BRIDGE_HEADROOM);
        let width = slot_channels.max(params.channels);

        tracing::debug!(
            port = reader.name(),
            %params,
            %slots,
            capacity,
            "capture stream created"
        );

        let id = StreamId::next();
        Ok(Self {
            id,
            params,
            resampler,
            bridge: CaptureBridge {
                reader,
                id,
                slots,
                remix,
                port_channels: port.channels,
                port_buf: vec![0; port.period_samples()],
                frames: FrameBuffer::with_capacity(capacity, width),
                offset: 0,
                status: None,
            },
        })
    }

    /// Identity on the reader.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Stream-side parameters.
    pub fn params(&self) -> &PcmParams {
        &self.params
    }

    /// The reader this stream attaches to.
    pub fn reader(&self) -> &Arc<PcmReader> {
        &self.bridge.reader
    }

    /// Registers on the reader.
    ///
    /// # Errors
    ///
    /// See [`PcmReader::register_stream`].
    pub fn register(&self) -> Result<()> {
        self.bridge.reader.register_stream(self.id)
    }

    /// Unregisters from the reader.
    ///
    /// # Errors
    ///
    /// See [`PcmReader::unregister_stream`].
    pub fn unregister(&self) -> Result<()> {
        self.bridge.reader.unregister_stream(self.id)
    }

    /// Whether the stream is registered on its reader.
    pub fn is_registered(&self) -> bool {
        self.bridge.reader.is_stream_registered(self.id)
    }

    /// Starts capture, opening the port if needed. Buffered and resampler
    /// state from a previous run is dropped.
    ///
    /// # Errors
    ///
    /// See [`PcmReader::start_stream`].
    pub fn start(&mut self) -> Result<()> {
        self.bridge.reader.start_stream(self.id)?;
        self.bridge.reset();
        if let Some(resampler) = &mut self.resampler {
            resampler.reset();
        }
        Ok(())
    }

    /// Stops capture.
    ///
    /// # Errors
    ///
    /// See [`PcmReader::stop_stream`].
    pub fn stop(&mut self) -> Result<()> {
        self.bridge.reader.stop_stream(self.id)
    }

    /// Reads up to `frames` frames into `dst` and returns how many were
    /// produced.
    ///
    /// # Errors
    ///
    /// The first hardware failure hit while filling the request, including
    /// `NoDevice` when the stream is not running.
    pub fn read(&mut self, dst: &mut [i16], frames: usize) -> Result<usize> {
        let ch = self.params.channels;
        let frames = frames.min(dst.len() / ch);
        self.bridge.status = None;

        let produced = match &mut self.resampler {
            Some(resampler) => resampler.resample(&mut self.bridge, dst, frames),
            None => copy_from_provider(&mut self.bridge, dst, ch, frames),
        };

        if let Some(err) = self.bridge.status.take() {
            tracing::trace!(stream = %self.id, produced, %err, "capture read failed");
            return Err(err);
        }
        if produced < frames {
            tracing::warn!(stream = %self.id, produced, frames, "short capture read");
        }
        Ok(produced)
    }

    /// Timestamp of the underlying port.
    ///
    /// # Errors
    ///
    /// See [`PcmReader::timestamp`].
    pub fn timestamp(&self) -> Result<PortTimestamp> {
        self.bridge.reader.timestamp()
    }

    /// Frames dropped because the stream fell behind the port.
    pub fn frames_lost(&self) -> u64 {
        self.bridge.reader.frames_lost(self.id)
    }
}

impl std::fmt::Debug for InStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InStream")
            .field("id", &self.id)
            .field("port", &self.bridge.reader.name())
            .field("params", &self.params)
            .field("slots", &self.bridge.slots)
            .field("resampling", &self.resampler.is_some())
            .finish()
    }
}

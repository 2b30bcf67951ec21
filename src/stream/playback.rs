//! Playback-side logical stream.

use std::sync::Arc;

use crate::format::{copy_from_provider, FrameBuffer, Remix, Resampler, SliceProvider, SlotMap};
use crate::mux::{PcmWriter, StreamId};
use crate::params::{PcmParams, SAMPLE_SIZE};
use crate::port::PortTimestamp;
use crate::{Result, RouterError};

/// A client playback stream attached to a [`PcmWriter`].
///
/// Client frames are resampled to the port rate and collected until a full
/// port period is pending; the period is then remixed to the slot layout,
/// scattered onto the port slots (all other slots silent) and written.
///
/// The writer can be swapped with [`retarget`](Self::retarget) while the
/// stream is detached, which is how media output is diverted to a discard
/// sink during a call.
pub struct OutStream {
    id: StreamId,
    params: PcmParams,
    writer: Arc<PcmWriter>,
    slots: SlotMap,
    remix: Remix,
    resampler: Option<Resampler>,
    slot_channels: usize,
    port_channels: usize,
    period: usize,
    pending: FrameBuffer,
    pending_frames: usize,
    port_buf: Vec<i16>,
}

impl OutStream {
    /// Builds a stream writing `params` frames to `writer`. `slots` maps
    /// port slots (destinations) to stream channels (sources).
    ///
    /// # Errors
    ///
    /// Invalid parameters, a slot map outside the port layout, or an
    /// unsupported channel conversion.
    pub fn new(writer: Arc<PcmWriter>, params: PcmParams, slots: SlotMap) -> Result<Self> {
        params.validate()?;
        let port = *writer.params();

        // A mono client feeds every mapped slot directly.
        let slots = if params.channels == 1 && slots.src_channels() > 1 {
            slots.with_mono_source()
        } else {
            slots
        };
        let slot_channels = slots.src_channels();
        slots.validate(slot_channels, port.channels)?;
        let remix = Remix::new(SAMPLE_SIZE, params.channels, slot_channels)?;

        let resampler = if port.sample_rate == params.sample_rate {
            None
        } else {
            Some(Resampler::new(params.sample_rate, port.sample_rate, params.channels)?)
        };

        tracing::debug!(port = writer.name(), %params, %slots, "playback stream created");

        Ok(Self {
            id: StreamId::next(),
            params,
            writer,
            slots,
            remix,
            resampler,
            slot_channels,
            port_channels: port.channels,
            period: port.frame_count,
            pending: FrameBuffer::with_capacity(
                port.frame_count,
                params.channels.max(slot_channels),
            ),
            pending_frames: 0,
            port_buf: vec![0; port.period_samples()],
        })
    }

    /// Identity on the writer.
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Stream-side parameters.
    pub fn params(&self) -> &PcmParams {
        &self.params
    }

    /// The writer this stream is attached to.
    pub fn writer(&self) -> &Arc<PcmWriter> {
        &self.writer
    }

    /// Points the stream at another writer with the same port parameters.
    ///
    /// # Errors
    ///
    /// `InvalidParameters` if the stream is still registered on its current
    /// writer or the new writer runs different parameters.
    pub fn retarget(&mut self, writer: Arc<PcmWriter>) -> Result<()> {
        if Arc::ptr_eq(&self.writer, &writer) {
            return Ok(());
        }
        if self.writer.is_stream_registered(self.id) {
            return Err(RouterError::invalid(format!(
                "{} is still registered on {}",
                self.id,
                self.writer.name()
            )));
        }
        if writer.params() != self.writer.params() {
            return Err(RouterError::invalid(format!(
                "cannot move from {} ({}) to {} ({})",
                self.writer.name(),
                self.writer.params(),
                writer.name(),
                writer.params()
            )));
        }
        tracing::debug!(stream = %self.id, from = self.writer.name(), to = writer.name(), "retargeted");
        self.writer = writer;
        Ok(())
    }

    /// Registers on the current writer.
    ///
    /// # Errors
    ///
    /// See [`PcmWriter::register_stream`].
    pub fn register(&self) -> Result<()> {
        self.writer.register_stream(self.id)
    }

    /// Unregisters from the current writer.
    ///
    /// # Errors
    ///
    /// See [`PcmWriter::unregister_stream`].
    pub fn unregister(&self) -> Result<()> {
        self.writer.unregister_stream(self.id)
    }

    /// Whether the stream is registered on its current writer.
    pub fn is_registered(&self) -> bool {
        self.writer.is_stream_registered(self.id)
    }

    /// Starts playback, opening the port if needed. Partial periods and
    /// resampler state from a previous run are dropped.
    ///
    /// # Errors
    ///
    /// See [`PcmWriter::start_stream`].
    pub fn start(&mut self) -> Result<()> {
        self.writer.start_stream(self.id)?;
        self.pending_frames = 0;
        if let Some(resampler) = &mut self.resampler {
            resampler.reset();
        }
        Ok(())
    }

    /// Stops playback. A partial period still pending is dropped.
    ///
    /// # Errors
    ///
    /// See [`PcmWriter::stop_stream`].
    pub fn stop(&mut self) -> Result<()> {
        self.pending_frames = 0;
        self.writer.stop_stream(self.id)
    }

    /// Queues `frames` client frames from `src`, writing every port period
    /// that fills up. Returns the client frames consumed.
    ///
    /// # Errors
    ///
    /// The writer's error for the first failed period write; the period is
    /// dropped.
    pub fn write(&mut self, src: &[i16], frames: usize) -> Result<usize> {
        let ch = self.params.channels;
        let frames = frames.min(src.len() / ch);
        let mut provider = SliceProvider::new(&src[..frames * ch], ch);

        loop {
            let wanted = self.period - self.pending_frames;
            let out = &mut self.pending.storage_mut()[self.pending_frames * ch..self.period * ch];
            let produced = match &mut self.resampler {
                Some(resampler) => resampler.resample(&mut provider, out, wanted),
                None => copy_from_provider(&mut provider, out, ch, wanted),
            };
            self.pending_frames += produced;

            if self.pending_frames < self.period {
                break;
            }
            self.pending_frames = 0;
            self.write_period()?;
        }
        Ok(frames)
    }

    fn write_period(&mut self) -> Result<()> {
        let period = self.period;
        self.pending.set_layout(period, self.params.channels);
        self.remix.apply(&mut self.pending);
        self.slots.map_frames(
            self.pending.as_slice(),
            self.slot_channels,
            &mut self.port_buf,
            self.port_channels,
            period,
        );
        let written = self.writer.write_period(self.id, &self.port_buf, period)?;
        if written < period {
            tracing::warn!(stream = %self.id, written, period, "short period write");
        }
        Ok(())
    }

    /// Client frames waiting for a full port period.
    pub fn pending_frames(&self) -> usize {
        match &self.resampler {
            Some(r) => self.pending_frames * r.in_rate() as usize / r.out_rate() as usize,
            None => self.pending_frames,
        }
    }

    /// Timestamp of the underlying port.
    ///
    /// # Errors
    ///
    /// See [`PcmWriter::timestamp`].
    pub fn timestamp(&self) -> Result<PortTimestamp> {
        self.writer.timestamp()
    }
}

impl std::fmt::Debug for OutStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutStream")
            .field("id", &self.id)
            .field("port", &self.writer.name())
            .field("params", &self.params)
            .field("slots", &self.slots)
            .field("resampling", &self.resampler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MockOutPort;

    fn writer(params: PcmParams) -> (Arc<MockOutPort>, Arc<PcmWriter>) {
        let port = Arc::new(MockOutPort::new("out"));
        let writer = Arc::new(PcmWriter::new(port.clone(), params));
        (port, writer)
    }

    fn running(stream: &mut OutStream) {
        stream.register().unwrap();
        stream.start().unwrap();
    }

    #[test]
    fn test_stereo_onto_upper_slots() {
        let (port, writer) = writer(PcmParams::new(4, 16, 8000, 2));
        let slots = SlotMap::from_masks(0x03, 0x0c).unwrap();
        let mut stream = OutStream::new(writer, PcmParams::new(2, 16, 8000, 2), slots).unwrap();
        running(&mut stream);

        assert_eq!(stream.write(&[1, 2, 3, 4], 2).unwrap(), 2);
        assert_eq!(port.recorded(), vec![0, 0, 1, 2, 0, 0, 3, 4]);
    }

    #[test]
    fn test_mono_client_feeds_both_slots() {
        let (port, writer) = writer(PcmParams::new(2, 16, 8000, 2));
        let slots = SlotMap::identity(2).unwrap();
        let mut stream = OutStream::new(writer, PcmParams::new(1, 16, 8000, 2), slots).unwrap();
        running(&mut stream);

        stream.write(&[7, 8], 2).unwrap();
        assert_eq!(port.recorded(), vec![7, 7, 8, 8]);
    }

    #[test]
    fn test_stereo_truncated_onto_shared_slot() {
        let (port, writer) = writer(PcmParams::new(2, 16, 8000, 2));
        let slots = SlotMap::new([(0, 0), (1, 0)]).unwrap();
        let mut stream = OutStream::new(writer, PcmParams::new(2, 16, 8000, 2), slots).unwrap();
        running(&mut stream);

        stream.write(&[5, 9, 6, 9], 2).unwrap();
        assert_eq!(port.recorded(), vec![5, 5, 6, 6]);
    }

    #[test]
    fn test_partial_periods_accumulate() {
        let (port, writer) = writer(PcmParams::new(2, 16, 8000, 4));
        let mut stream = OutStream::new(
            writer,
            PcmParams::new(2, 16, 8000, 4),
            SlotMap::identity(2).unwrap(),
        )
        .unwrap();
        running(&mut stream);

        stream.write(&[1; 6], 3).unwrap();
        assert!(port.recorded().is_empty());
        assert_eq!(stream.pending_frames(), 3);
        stream.write(&[2; 6], 3).unwrap();
        assert_eq!(port.frames_written(), 4);
        assert_eq!(stream.pending_frames(), 2);
    }

    #[test]
    fn test_upsampled_playback() {
        let (port, writer) = writer(PcmParams::new(2, 16, 44_100, 1024));
        let mut stream = OutStream::new(
            writer,
            PcmParams::new(2, 16, 8000, 160),
            SlotMap::identity(2).unwrap(),
        )
        .unwrap();
        running(&mut stream);

        let block = [300i16; 320];
        for _ in 0..10 {
            assert_eq!(stream.write(&block, 160).unwrap(), 160);
        }
        // 1600 frames at 8kHz make about 8820 at 44.1kHz: eight full periods.
        assert_eq!(port.frames_written(), 8 * 1024);
        assert!(port.recorded().iter().all(|&s| s == 300));
    }

    #[test]
    fn test_write_failure_drops_period() {
        let (port, writer) = writer(PcmParams::new(2, 16, 8000, 2));
        let mut stream = OutStream::new(
            writer,
            PcmParams::new(2, 16, 8000, 2),
            SlotMap::identity(2).unwrap(),
        )
        .unwrap();
        running(&mut stream);

        port.fail_next(1);
        assert!(stream.write(&[1, 1, 2, 2], 2).unwrap_err().is_transient());
        assert_eq!(stream.pending_frames(), 0);
        stream.write(&[3, 3, 4, 4], 2).unwrap();
        assert_eq!(port.recorded(), vec![3, 3, 4, 4]);
    }

    #[test]
    fn test_retarget_requires_detached_stream() {
        let params = PcmParams::new(2, 16, 8000, 2);
        let (_, first) = writer(params);
        let (second_port, second) = writer(params);
        let mut stream =
            OutStream::new(Arc::clone(&first), params, SlotMap::identity(2).unwrap()).unwrap();

        stream.register().unwrap();
        assert!(stream.retarget(Arc::clone(&second)).is_err());
        stream.unregister().unwrap();
        stream.retarget(Arc::clone(&second)).unwrap();

        running(&mut stream);
        stream.write(&[1, 2, 3, 4], 2).unwrap();
        assert_eq!(second_port.recorded(), vec![1, 2, 3, 4]);
        assert!(!first.is_stream_registered(stream.id()));

        let (_, other_rate) = writer(PcmParams::new(2, 16, 16_000, 2));
        stream.stop().unwrap();
        stream.unregister().unwrap();
        assert!(stream.retarget(other_rate).is_err());
    }
}

//! Virtual audio driver
//!
//! Backs a device with an in-memory ring whose DMA position advances with a
//! [`Clock`]. Frames up to the current position are synthesized from a
//! [`Signal`] each time the ring is snapshotted, so readers always see a ring
//! that looks like hardware has been streaming into it.

use chorale_core::domain::audio::StreamFormat;
use chorale_core::domain::clock::Clock;
use chorale_core::domain::device::{AudioDriver, RingBuffer, RingBufferSnapshot};
use chorale_core::domain::timeline::{TimelineFunction, TimelineRate};
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::debug;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Content written into the ring
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    Silence,
    Constant(f32),
    Sine { frequency_hz: f32, amplitude: f32 },
}

impl Signal {
    /// Sample value at absolute frame index `frame`
    pub fn sample(&self, frame: i64, frames_per_second: u32) -> f32 {
        match *self {
            Signal::Silence => 0.0,
            Signal::Constant(value) => value,
            Signal::Sine {
                frequency_hz,
                amplitude,
            } => {
                let fps = f64::from(frames_per_second);
                let cycles = (f64::from(frequency_hz) * frame as f64 / fps).rem_euclid(1.0);
                (f64::from(amplitude) * (TAU * cycles).sin()) as f32
            }
        }
    }
}

#[derive(Debug)]
struct RingClock {
    start_time: i64,
    gen_id: u32,
    written_frames: i64,
}

/// Clock-driven ring buffer driver
pub struct VirtualRingDriver {
    format: StreamFormat,
    ring: Arc<RingBuffer>,
    clock: Arc<dyn Clock>,
    signal: Signal,
    fence_frames: u32,
    state: Mutex<RingClock>,
    /// Last published DMA position in frames
    dma_frames: CachePadded<AtomicI64>,
}

impl VirtualRingDriver {
    pub fn new(
        format: StreamFormat,
        ring_frames: usize,
        clock: Arc<dyn Clock>,
        signal: Signal,
    ) -> Arc<Self> {
        Self::with_fence(format, ring_frames, 0, clock, signal)
    }

    /// Driver whose newest `fence_frames` frames are still owned by hardware
    pub fn with_fence(
        format: StreamFormat,
        ring_frames: usize,
        fence_frames: u32,
        clock: Arc<dyn Clock>,
        signal: Signal,
    ) -> Arc<Self> {
        let ring_frames = ring_frames.max(1);
        let fence_frames = fence_frames.min(u32::try_from(ring_frames - 1).unwrap_or(u32::MAX));
        let start_time = clock.now();

        Arc::new(Self {
            format,
            ring: Arc::new(RingBuffer::new(ring_frames, format.bytes_per_frame())),
            clock,
            signal,
            fence_frames,
            state: Mutex::new(RingClock {
                start_time,
                gen_id: 1,
                written_frames: 0,
            }),
            dma_frames: CachePadded::new(AtomicI64::new(0)),
        })
    }

    pub fn ring(&self) -> &Arc<RingBuffer> {
        &self.ring
    }

    pub fn dma_position_frames(&self) -> i64 {
        self.dma_frames.load(Ordering::Acquire)
    }

    pub fn gen_id(&self) -> u32 {
        self.state.lock().gen_id
    }

    /// Restart the DMA engine at the current time, as after an underrun
    pub fn restart(&self) {
        let mut state = self.state.lock();
        state.start_time = self.clock.now();
        state.written_frames = 0;
        state.gen_id = state.gen_id.wrapping_add(1).max(1);
        self.dma_frames.store(0, Ordering::Release);
        debug!(gen_id = state.gen_id, "Virtual ring restarted");
    }

    fn clock_mono_to_ring_pos_bytes(&self, start_time: i64) -> TimelineFunction {
        let bytes_per_second =
            u64::from(self.format.frames_per_second) * self.format.bytes_per_frame() as u64;
        TimelineFunction::new(
            0,
            start_time,
            TimelineRate::new(bytes_per_second, NANOS_PER_SECOND),
        )
    }

    /// Synthesize frames up to `dma_frame`, keeping at most one ring's worth
    fn fill_to(&self, state: &mut RingClock, dma_frame: i64) {
        if dma_frame <= state.written_frames {
            return;
        }

        let ring_frames = self.ring.frames() as i64;
        let frame_size = self.ring.frame_size();
        let sample_size = self.format.sample_format.bytes_per_sample();
        let first = state.written_frames.max(dma_frame - ring_frames);

        let mut data = self.ring.write();
        for frame in first..dma_frame {
            let value = self.signal.sample(frame, self.format.frames_per_second);
            let offset = frame.rem_euclid(ring_frames) as usize * frame_size;
            for sample in data[offset..offset + frame_size].chunks_exact_mut(sample_size) {
                self.format.sample_format.encode(value, sample);
            }
        }

        state.written_frames = dma_frame;
    }
}

impl AudioDriver for VirtualRingDriver {
    fn format(&self) -> Option<StreamFormat> {
        Some(self.format)
    }

    fn snapshot_ring_buffer(&self) -> RingBufferSnapshot {
        let mut state = self.state.lock();
        let to_bytes = self.clock_mono_to_ring_pos_bytes(state.start_time);
        let frame_size = self.format.bytes_per_frame() as i64;
        let dma_frame = to_bytes
            .apply(self.clock.now())
            .map_or(0, |bytes| bytes / frame_size)
            .max(0);

        self.fill_to(&mut state, dma_frame);
        self.dma_frames.store(dma_frame, Ordering::Release);

        let ring_frames = u32::try_from(self.ring.frames()).unwrap_or(u32::MAX);
        RingBufferSnapshot {
            ring_buffer: Some(self.ring.clone()),
            clock_mono_to_ring_pos_bytes: to_bytes,
            position_to_end_fence_frames: self.fence_frames,
            end_fence_to_start_fence_frames: ring_frames - self.fence_frames,
            gen_id: state.gen_id,
        }
    }
}

impl std::fmt::Debug for VirtualRingDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualRingDriver")
            .field("format", &self.format)
            .field("ring_frames", &self.ring.frames())
            .field("signal", &self.signal)
            .field("dma_frames", &self.dma_position_frames())
            .finish()
    }
}

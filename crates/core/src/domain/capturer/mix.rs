//! Mix side of a capturer
//!
//! [`CaptureMixer`] is the capturer's mix-domain context. Whoever owns it is
//! the only code allowed to touch the frame→clock mapping, the intermediate
//! buffer and the per-link transforms, so every mix-only operation takes
//! `&mut self`. It is handed out once, by
//! [`AudioCapturer::add_payload_buffer`].

use super::{
    AudioCapturer, CaptureState, FormatInfo, MixEvent, MixEventKind, PayloadBuffer,
    PendingCaptureBuffer, FLAG_DISCONTINUITY, NO_TIMESTAMP,
};
use crate::domain::device::RingBufferSnapshot;
use crate::domain::filter::{FRAC_BITS, FRAC_ONE};
use crate::domain::gain::MUTED_GAIN_DB;
use crate::domain::mixer::{Bookkeeping, SourceStep, INVALID_GENERATION_ID};
use crate::domain::object::{remove_link, AudioLink, SourceType};
use crate::domain::timeline::{TimelineFunction, TimelineRate};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// What the mix domain should do after a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing to do until the request side wakes us
    Idle,
    /// Run again at this monotonic time, or earlier if woken
    WakeAt(i64),
    /// The capturer is gone; the domain should exit
    Stopped,
}

/// Contiguous span of a ring buffer, in frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct RingRegion {
    ring_pos: i64,
    len: i64,
    frac_pts: i64,
}

/// Split the safe frames `[start, end)` into at most two spans of a ring of
/// `ring_frames` frames
fn safe_read_regions(start: i64, end: i64, ring_frames: i64) -> [RingRegion; 2] {
    let mut regions = [RingRegion::default(); 2];
    let start = start.max(end - ring_frames);
    if end <= start || ring_frames <= 0 {
        return regions;
    }

    let start_mod = start.rem_euclid(ring_frames);
    let end_mod = end.rem_euclid(ring_frames);
    if start_mod < end_mod {
        regions[0] = RingRegion {
            ring_pos: start_mod,
            len: end_mod - start_mod,
            frac_pts: start << FRAC_BITS,
        };
    } else {
        let first_len = ring_frames - start_mod;
        regions[0] = RingRegion {
            ring_pos: start_mod,
            len: first_len,
            frac_pts: start << FRAC_BITS,
        };
        regions[1] = RingRegion {
            ring_pos: 0,
            len: end_mod,
            frac_pts: (start + first_len) << FRAC_BITS,
        };
    }
    regions
}

enum Severity {
    Error,
    Info,
    Trace,
    Silent,
}

/// Bump a rate-limited counter and pick the level for this occurrence
fn next_severity(counter: &AtomicU16, error_every: u16, info_every: u16, trace_every: u16) -> Severity {
    let count = counter.fetch_add(1, Ordering::Relaxed);
    let hits = |every: u16| every != 0 && count % every == 0;
    if hits(error_every) {
        Severity::Error
    } else if hits(info_every) {
        Severity::Info
    } else if hits(trace_every) {
        Severity::Trace
    } else {
        Severity::Silent
    }
}

pub struct CaptureMixer {
    capturer: Arc<AudioCapturer>,
    payload: Arc<PayloadBuffer>,
    info: FormatInfo,
    payload_frames: u32,
    mix_buf: Vec<f32>,
    dest_frames_to_clock_mono: TimelineFunction,
    dest_frames_to_clock_mono_gen: u32,
    frame_count: i64,
    async_next_frame_offset: u32,
    source_links: Vec<Arc<AudioLink>>,
    #[cfg(debug_assertions)]
    owner: Option<std::thread::ThreadId>,
}

impl CaptureMixer {
    pub(super) fn new(
        capturer: Arc<AudioCapturer>,
        payload: Arc<PayloadBuffer>,
        info: FormatInfo,
        payload_frames: u32,
    ) -> Self {
        let samples = info.max_frames_per_capture as usize * info.format.channels as usize;
        Self {
            capturer,
            payload,
            info,
            payload_frames,
            mix_buf: vec![0.0; samples],
            dest_frames_to_clock_mono: TimelineFunction::default(),
            dest_frames_to_clock_mono_gen: INVALID_GENERATION_ID + 1,
            frame_count: 0,
            async_next_frame_offset: 0,
            source_links: Vec::new(),
            #[cfg(debug_assertions)]
            owner: None,
        }
    }

    pub fn capturer(&self) -> &Arc<AudioCapturer> {
        &self.capturer
    }

    pub fn payload(&self) -> &Arc<PayloadBuffer> {
        &self.payload
    }

    /// Current frame→clock mapping of the capture timeline
    pub fn dest_frames_to_clock_mono(&self) -> TimelineFunction {
        self.dest_frames_to_clock_mono
    }

    fn assert_owner(&mut self) {
        #[cfg(debug_assertions)]
        {
            let me = std::thread::current().id();
            match self.owner {
                None => self.owner = Some(me),
                Some(owner) => debug_assert_eq!(owner, me, "CaptureMixer driven from two threads"),
            }
        }
    }

    fn bump_mapping_generation(&mut self) {
        self.dest_frames_to_clock_mono_gen = self.dest_frames_to_clock_mono_gen.wrapping_add(1);
        if self.dest_frames_to_clock_mono_gen == INVALID_GENERATION_ID {
            self.dest_frames_to_clock_mono_gen += 1;
        }
    }

    fn invalidate_mapping(&mut self) {
        self.dest_frames_to_clock_mono = TimelineFunction::default();
        self.bump_mapping_generation();
    }

    fn establish_mapping(&mut self, now: i64) {
        self.dest_frames_to_clock_mono =
            TimelineFunction::new(now, self.frame_count, self.info.frames_to_clock_mono_rate);
        self.bump_mapping_generation();
    }

    fn post(&self, kind: MixEventKind) {
        self.capturer.ctx.events.post(MixEvent {
            capturer: Arc::downgrade(&self.capturer),
            kind,
        });
    }

    fn shutdown_from_mix_domain(&self) -> ProcessOutcome {
        self.post(MixEventKind::ShutdownRequested);
        ProcessOutcome::Stopped
    }

    /// Run one mix pass
    ///
    /// Fills pending packets for as long as their frames are already
    /// captured by the sources, and reports when the next one will be.
    pub fn process(&mut self) -> ProcessOutcome {
        self.assert_owner();
        let clock = self.capturer.ctx.clock.clone();
        let fence_ns = self.capturer.ctx.tuning.assumed_worst_source_fence_ns();

        loop {
            let async_mode = match self.capturer.state() {
                CaptureState::Shutdown => return ProcessOutcome::Stopped,
                CaptureState::WaitingForVmo | CaptureState::AsyncStoppingCallbackPending => {
                    return ProcessOutcome::Idle
                }
                CaptureState::AsyncStopping => {
                    self.do_stop_async_capture();
                    return ProcessOutcome::Idle;
                }
                CaptureState::OperatingSync => false,
                CaptureState::OperatingAsync => true,
            };

            let mapping_valid = self.dest_frames_to_clock_mono.is_invertible();
            let job = {
                let mut queues = self.capturer.queues.lock();
                queues.pending.front_mut().map(|head| {
                    if !mapping_valid {
                        head.flags |= FLAG_DISCONTINUITY;
                    }
                    (
                        head.offset_frames + head.filled_frames,
                        head.num_frames - head.filled_frames,
                        head.sequence_number,
                    )
                })
            };

            let Some((job_offset, job_frames, sequence_number)) = job else {
                self.invalidate_mapping();
                self.frame_count = 0;
                if !async_mode {
                    return ProcessOutcome::Idle;
                }
                self.async_next_frame_offset = 0;
                self.queue_next_async_pending_buffer();
                continue;
            };

            let now = clock.now();
            if !mapping_valid {
                self.establish_mapping(now);
            }

            let mix_frames = job_frames.min(self.info.max_frames_per_capture);
            let Some(last_frame_time) = self
                .dest_frames_to_clock_mono
                .apply(self.frame_count + i64::from(mix_frames))
            else {
                error!(capturer = %self.capturer.id(), "Overflow computing capture deadline");
                return self.shutdown_from_mix_domain();
            };
            if last_frame_time > now {
                return ProcessOutcome::WakeAt(last_frame_time.saturating_add(fence_ns));
            }

            if !self.mix_to_intermediate(mix_frames) {
                return self.shutdown_from_mix_domain();
            }

            let bytes_per_frame = self.info.bytes_per_frame;
            let channels = self.info.format.channels as usize;
            {
                let start = job_offset as usize * bytes_per_frame;
                let end = start + mix_frames as usize * bytes_per_frame;
                let mut payload = self.payload.write();
                let Some(out) = payload.get_mut(start..end) else {
                    error!(capturer = %self.capturer.id(), start, end, "Capture job outside payload");
                    return self.shutdown_from_mix_domain();
                };
                self.info
                    .format
                    .produce_output(&self.mix_buf[..mix_frames as usize * channels], out);
            }

            let mut wake_request_side = false;
            let mut buffer_finished = false;
            let mut sequence_mismatch = false;
            {
                let mut queues = self.capturer.queues.lock();
                match queues.pending.front_mut() {
                    Some(head) if head.sequence_number == sequence_number => {
                        head.filled_frames += mix_frames;
                        if head.capture_timestamp == NO_TIMESTAMP {
                            head.capture_timestamp = self
                                .dest_frames_to_clock_mono
                                .apply(self.frame_count)
                                .unwrap_or(NO_TIMESTAMP);
                        }
                        if head.filled_frames >= head.num_frames {
                            if let Some(done) = queues.pending.pop_front() {
                                wake_request_side = queues.finished.is_empty();
                                queues.finished.push_back(done);
                                buffer_finished = true;
                            }
                        }
                    }
                    _ => sequence_mismatch = true,
                }
            }

            if sequence_mismatch {
                // The request side flushed underneath us; restart the timeline.
                self.establish_mapping(now);
            }
            self.frame_count += i64::from(mix_frames);

            if wake_request_side {
                self.post(MixEventKind::BuffersReady);
            }
            if buffer_finished && async_mode {
                self.queue_next_async_pending_buffer();
            }
        }
    }

    /// Mix every ring-buffer source into `mix_buf`
    ///
    /// Returns false on a fatal error; the capturer must be shut down.
    fn mix_to_intermediate(&mut self, mix_frames: u32) -> bool {
        let channels = self.info.format.channels as usize;
        let total = mix_frames as usize * channels;
        self.mix_buf[..total].fill(0.0);

        if self.capturer.muted() || self.capturer.stream_gain_db() <= MUTED_GAIN_DB {
            return true;
        }

        let mut links = std::mem::take(&mut self.source_links);
        links.clear();
        self.capturer.object.for_each_source_link(|link| {
            if link.source_type() == SourceType::RingBuffer && link.is_valid() {
                links.push(link.clone());
            }
        });

        let mut ok = true;
        let mut accumulate = false;
        let mut orphaned = Vec::new();
        for link in &links {
            if link.source().is_none() {
                orphaned.push(link.clone());
                continue;
            }
            match self.mix_link(link, mix_frames, accumulate) {
                Ok(true) => accumulate = true,
                Ok(false) => {}
                Err(()) => {
                    ok = false;
                    break;
                }
            }
        }

        links.clear();
        self.source_links = links;

        // Sources dropped without unlinking leave a dead edge behind
        for link in orphaned {
            debug!(
                capturer = %self.capturer.id(),
                source = %link.source_id(),
                "Pruning link to a dropped source"
            );
            remove_link(&link);
        }
        ok
    }

    /// Mix one source link; `Ok(true)` if it contributed to `mix_buf`
    fn mix_link(&mut self, link: &Arc<AudioLink>, mix_frames: u32, accumulate: bool) -> Result<bool, ()> {
        let Some(source) = link.source() else {
            return Ok(false);
        };
        let Some(device) = source.as_device() else {
            return Ok(false);
        };
        let Some(driver) = device.driver() else {
            error!(capturer = %self.capturer.id(), device = device.name(), "Capture source has no driver");
            return Err(());
        };

        let mut bookkeeping = link.bookkeeping();
        if bookkeeping.gain.is_silent() {
            trace!(capturer = %self.capturer.id(), "Skipping silent source");
            return Ok(false);
        }
        if !bookkeeping.has_mixer() {
            return Ok(false);
        }

        let snapshot = driver.snapshot_ring_buffer();
        let Some(ring_buffer) = snapshot.ring_buffer.clone() else {
            return Ok(false);
        };
        if !snapshot.clock_mono_to_ring_pos_bytes.is_invertible() {
            return Ok(false);
        }
        if !self.update_transformation(&mut bookkeeping, &snapshot) {
            error!(capturer = %self.capturer.id(), "Overflow composing capture transforms");
            return Err(());
        }

        let now = self.capturer.ctx.clock.now();
        let Some(end_fence_frac) = bookkeeping.clock_mono_to_frac_source_frames.apply(now) else {
            error!(capturer = %self.capturer.id(), "Overflow locating ring end fence");
            return Err(());
        };
        let end_fence_frames = end_fence_frac >> FRAC_BITS;
        if end_fence_frames < 0 {
            trace!(capturer = %self.capturer.id(), end_fence_frames, "Ring has no safe frames yet");
            return Ok(false);
        }
        let start_fence_frames =
            (end_fence_frames - i64::from(snapshot.end_fence_to_start_fence_frames)).max(0);
        let ring_frames = ring_buffer.frames() as i64;
        let frame_size = ring_buffer.frame_size();
        let regions = safe_read_regions(start_fence_frames, end_fence_frames, ring_frames);

        let (neg_width, pos_width) = match bookkeeping.mixer.as_ref() {
            Some(mixer) => (mixer.neg_width(), mixer.pos_width()),
            None => return Ok(false),
        };

        let channels = self.info.format.channels as usize;
        let mix_end = mix_frames as usize * channels;
        let data = ring_buffer.read();
        let mut frames_left = i64::from(mix_frames);
        let mut buf_offset = 0usize;

        for region in regions.iter().filter(|r| r.len > 0) {
            let dest_to_src = bookkeeping.dest_frames_to_frac_source_frames;
            let first_dest_frame = self.frame_count + i64::from(mix_frames) - frames_left;
            let (Some(job_start), Some(job_span)) = (
                dest_to_src.apply(first_dest_frame),
                dest_to_src.rate().scale(frames_left - 1),
            ) else {
                error!(capturer = %self.capturer.id(), "Overflow computing capture job window");
                return Err(());
            };
            let job_end = job_start + job_span;

            let region_last_frame_pts = region.frac_pts + ((region.len - 1) << FRAC_BITS);
            let ring_last_frame_pts = (end_fence_frames - 1) << FRAC_BITS;

            if region_last_frame_pts < job_start - neg_width {
                if ring_last_frame_pts < job_start - neg_width {
                    let late_ns = bookkeeping
                        .clock_mono_to_frac_source_frames
                        .rate()
                        .inverse()
                        .and_then(|rate| rate.scale(job_start - ring_last_frame_pts))
                        .unwrap_or(i64::MAX);
                    self.report_overflow(job_start - ring_last_frame_pts, late_ns);
                }
                continue;
            }
            if region.frac_pts > job_end + pos_width {
                break;
            }

            let mut frac_source_offset = job_start - region.frac_pts;
            let mut dest_offset: i64 = 0;
            let first_sample_pos_window_edge = job_start + pos_width;
            if region.frac_pts > first_sample_pos_window_edge {
                let src_to_skip = region.frac_pts - first_sample_pos_window_edge;
                let skipped = dest_to_src
                    .rate()
                    .inverse()
                    .and_then(|src_to_dest| src_to_dest.scale(src_to_skip - 1))
                    .map(|d| d + 1)
                    .and_then(|d| Some((d, dest_to_src.rate().scale(d)?)));
                let Some((skip_dest, skip_src)) = skipped else {
                    error!(capturer = %self.capturer.id(), "Overflow skipping ahead in ring");
                    return Err(());
                };
                dest_offset = skip_dest;
                frac_source_offset += skip_src;
                self.report_partial_overflow(frac_source_offset, dest_offset);
            }
            if dest_offset >= frames_left {
                break;
            }

            let start_byte = region.ring_pos as usize * frame_size;
            let end_byte = (region.ring_pos + region.len) as usize * frame_size;
            let Some(source) = data.get(start_byte..end_byte) else {
                error!(capturer = %self.capturer.id(), start_byte, end_byte, "Ring region out of bounds");
                return Err(());
            };

            let mut region_dest_offset = dest_offset as usize;
            let consumed = bookkeeping.mix(
                &mut self.mix_buf[buf_offset * channels..mix_end],
                frames_left as usize,
                &mut region_dest_offset,
                source,
                region.len << FRAC_BITS,
                &mut frac_source_offset,
                accumulate,
            );
            buf_offset += region_dest_offset;
            frames_left -= region_dest_offset as i64;
            if !consumed || frames_left <= 0 {
                break;
            }
        }

        Ok(true)
    }

    /// Rebuild the link's source transforms if either timeline moved
    ///
    /// Returns false on arithmetic overflow.
    fn update_transformation(
        &self,
        bookkeeping: &mut Bookkeeping,
        snapshot: &RingBufferSnapshot,
    ) -> bool {
        if bookkeeping.dest_trans_gen_id == self.dest_frames_to_clock_mono_gen
            && bookkeeping.source_trans_gen_id == snapshot.gen_id
        {
            return true;
        }
        let Some(ring_buffer) = snapshot.ring_buffer.as_ref() else {
            return false;
        };

        let bytes_to_frac_frames = TimelineRate::new(FRAC_ONE as u64, ring_buffer.frame_size() as u64);
        let Some(clock_mono_to_ring_frac) = TimelineFunction::compose(
            &TimelineFunction::from_rate(bytes_to_frac_frames),
            &snapshot.clock_mono_to_ring_pos_bytes,
        ) else {
            return false;
        };
        let Some(dest_to_frac_source) =
            TimelineFunction::compose(&clock_mono_to_ring_frac, &self.dest_frames_to_clock_mono)
        else {
            return false;
        };
        let end_fence_offset = i64::from(snapshot.position_to_end_fence_frames) << FRAC_BITS;
        let Some(clock_to_frac_source) = TimelineFunction::compose(
            &TimelineFunction::new(-end_fence_offset, 0, TimelineRate::IDENTITY),
            &clock_mono_to_ring_frac,
        ) else {
            return false;
        };

        let rate = dest_to_frac_source.rate();
        let Some(step_size) = rate.scale(1) else {
            return false;
        };
        let denominator = rate.reference_delta();
        let Some(rate_modulo) = (step_size as u64)
            .checked_mul(denominator)
            .and_then(|whole| rate.subject_delta().checked_sub(whole))
        else {
            return false;
        };
        let src_pos_modulo = if bookkeeping.step.src_pos_modulo < denominator {
            bookkeeping.step.src_pos_modulo
        } else {
            0
        };

        bookkeeping.dest_frames_to_frac_source_frames = dest_to_frac_source;
        bookkeeping.clock_mono_to_frac_source_frames = clock_to_frac_source;
        bookkeeping.step = SourceStep {
            step_size,
            rate_modulo,
            denominator,
            src_pos_modulo,
        };
        bookkeeping.dest_trans_gen_id = self.dest_frames_to_clock_mono_gen;
        bookkeeping.source_trans_gen_id = snapshot.gen_id;
        true
    }

    fn report_overflow(&self, frac_frames: i64, late_ns: i64) {
        let tuning = &self.capturer.ctx.tuning;
        let id = self.capturer.id();
        let late_ms = late_ns as f64 / 1_000_000.0;
        match next_severity(
            &self.capturer.overflow_count,
            tuning.overflow_error_interval,
            tuning.overflow_info_interval,
            tuning.overflow_trace_interval,
        ) {
            Severity::Error => error!(capturer = %id, frac_frames, late_ms, "Capture overflow"),
            Severity::Info => info!(capturer = %id, frac_frames, late_ms, "Capture overflow"),
            Severity::Trace => trace!(capturer = %id, frac_frames, late_ms, "Capture overflow"),
            Severity::Silent => {}
        }
    }

    fn report_partial_overflow(&self, frac_source_offset: i64, dest_offset: i64) {
        let tuning = &self.capturer.ctx.tuning;
        let id = self.capturer.id();
        if frac_source_offset.abs() < tuning.partial_overflow_frac_frames {
            trace!(capturer = %id, frac_source_offset, dest_offset, "Slipping by a fraction of a frame");
            return;
        }
        match next_severity(
            &self.capturer.partial_overflow_count,
            tuning.overflow_error_interval,
            tuning.overflow_info_interval,
            tuning.overflow_trace_interval,
        ) {
            Severity::Error => {
                warn!(capturer = %id, frac_source_offset, dest_offset, "Capture partial overflow")
            }
            Severity::Info => {
                info!(capturer = %id, frac_source_offset, dest_offset, "Capture partial overflow")
            }
            Severity::Trace => {
                trace!(capturer = %id, frac_source_offset, dest_offset, "Capture partial overflow")
            }
            Severity::Silent => {}
        }
    }

    fn do_stop_async_capture(&mut self) {
        {
            let mut queues = self.capturer.queues.lock();
            if let Some(head) = queues.pending.pop_front() {
                if head.filled_frames > 0 {
                    queues.finished.push_back(head);
                }
            }
            queues.pending.clear();
        }

        self.invalidate_mapping();
        self.frame_count = 0;

        let moved = self.capturer.state.compare_exchange(
            CaptureState::AsyncStopping as u8,
            CaptureState::AsyncStoppingCallbackPending as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if moved.is_ok() {
            self.post(MixEventKind::AsyncStopReady);
        }
    }

    fn queue_next_async_pending_buffer(&mut self) {
        let frames_per_packet = self.capturer.inner.lock().async_frames_per_packet;
        let offset = self.async_next_frame_offset;
        self.capturer
            .queues
            .lock()
            .pending
            .push_back(PendingCaptureBuffer::new(offset, frames_per_packet, None));

        self.async_next_frame_offset += frames_per_packet;
        if u64::from(self.async_next_frame_offset) + u64::from(frames_per_packet)
            > u64::from(self.payload_frames)
        {
            self.async_next_frame_offset = 0;
        }
        trace!(capturer = %self.capturer.id(), offset, frames_per_packet, "Queued async packet");
    }
}

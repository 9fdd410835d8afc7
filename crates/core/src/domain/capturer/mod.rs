//! Capture streams
//!
//! An [`AudioCapturer`] is a destination object that mixes its device
//! sources into a client-provided payload buffer. The request side (this
//! module) validates client calls, keeps the pending/finished packet queues
//! and delivers completed packets. The mix side is a [`CaptureMixer`] that
//! only the capturer's mix domain owns; see [`mix`].
//!
//! A client request that is not legal in the current state shuts the
//! capturer down and returns the error.

mod mix;

pub use mix::{CaptureMixer, ProcessOutcome};

use crate::domain::admin::{AudioAdmin, CaptureUsage, Usage};
use crate::domain::audio::{AudioError, AudioStreamType, Result, StreamFormat};
use crate::domain::clock::Clock;
use crate::domain::filter::FRAC_ONE;
use crate::domain::gain::{
    combine_gains, volume_to_db, MAX_GAIN_DB, MIN_GAIN_DB, MUTED_GAIN_DB, UNITY_GAIN_DB,
};
use crate::domain::mixer::{Mixer, MixerSettings};
use crate::domain::object::{
    remove_link, AudioLink, AudioNode, AudioObject, ObjectId, ObjectKind, SourceType,
};
use crate::domain::timeline::TimelineRate;
use crate::domain::volume::{StreamVolume, StreamVolumeManager, VolumeCommand};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

/// Timestamp of a packet that has not received any frames yet
pub const NO_TIMESTAMP: i64 = i64::MIN;

/// Packet flag: the capture timeline restarted at this packet
pub const FLAG_DISCONTINUITY: u32 = 0x01;

/// Depth of the mix to request event channel
pub const MIX_EVENT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
    WaitingForVmo = 0,
    OperatingSync = 1,
    OperatingAsync = 2,
    AsyncStopping = 3,
    AsyncStoppingCallbackPending = 4,
    Shutdown = 5,
}

impl CaptureState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CaptureState::WaitingForVmo,
            1 => CaptureState::OperatingSync,
            2 => CaptureState::OperatingAsync,
            3 => CaptureState::AsyncStopping,
            4 => CaptureState::AsyncStoppingCallbackPending,
            _ => CaptureState::Shutdown,
        }
    }

    /// A payload buffer is attached and the capturer can be linked to sources
    pub fn is_operating(&self) -> bool {
        matches!(
            self,
            CaptureState::OperatingSync
                | CaptureState::OperatingAsync
                | CaptureState::AsyncStopping
                | CaptureState::AsyncStoppingCallbackPending
        )
    }
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::WaitingForVmo => "waiting_for_vmo",
            CaptureState::OperatingSync => "operating_sync",
            CaptureState::OperatingAsync => "operating_async",
            CaptureState::AsyncStopping => "async_stopping",
            CaptureState::AsyncStoppingCallbackPending => "async_stopping_callback_pending",
            CaptureState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Capture timing and diagnostics knobs (`[capture]` config table)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureTuning {
    /// Longest span mixed in one pass
    pub max_time_per_capture_ms: u32,
    /// Extra delay after a packet's last frame before mixing it
    pub assumed_worst_source_fence_ms: u32,
    /// Skip-ahead below this many fractional frames is only traced
    pub partial_overflow_frac_frames: i64,
    pub overflow_trace_interval: u16,
    pub overflow_info_interval: u16,
    pub overflow_error_interval: u16,
}

impl CaptureTuning {
    pub fn max_time_per_capture_ns(&self) -> i64 {
        i64::from(self.max_time_per_capture_ms) * 1_000_000
    }

    pub fn assumed_worst_source_fence_ns(&self) -> i64 {
        i64::from(self.assumed_worst_source_fence_ms) * 1_000_000
    }
}

impl Default for CaptureTuning {
    fn default() -> Self {
        Self {
            max_time_per_capture_ms: 50,
            assumed_worst_source_fence_ms: 5,
            partial_overflow_frac_frames: 4 * FRAC_ONE,
            overflow_trace_interval: 1,
            overflow_info_interval: 10,
            overflow_error_interval: 100,
        }
    }
}

/// Client-shared memory the capturer writes packets into
pub struct PayloadBuffer {
    data: RwLock<Vec<u8>>,
}

impl PayloadBuffer {
    pub fn new(size_bytes: usize) -> Self {
        Self {
            data: RwLock::new(vec![0; size_bytes]),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }
}

impl fmt::Debug for PayloadBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadBuffer")
            .field("len", &self.len())
            .finish()
    }
}

/// A completed region of the payload buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePacket {
    /// Capture time of the first frame, or [`NO_TIMESTAMP`] if nothing was captured
    pub pts: i64,
    pub flags: u32,
    pub payload_offset: u64,
    pub payload_size: u64,
}

pub type CaptureCallback = Box<dyn FnOnce(CapturePacket) + Send>;
pub type CompletionCallback = Box<dyn FnOnce() + Send>;

/// Receives packets that have no per-request callback
pub trait CapturerClient: Send + Sync {
    fn on_packet_produced(&self, packet: CapturePacket);

    fn on_end_of_stream(&self);
}

static SEQUENCE_NUMBER: AtomicU32 = AtomicU32::new(1);

pub(crate) struct PendingCaptureBuffer {
    offset_frames: u32,
    num_frames: u32,
    filled_frames: u32,
    capture_timestamp: i64,
    flags: u32,
    sequence_number: u32,
    callback: Option<CaptureCallback>,
}

impl PendingCaptureBuffer {
    fn new(offset_frames: u32, num_frames: u32, callback: Option<CaptureCallback>) -> Self {
        Self {
            offset_frames,
            num_frames,
            filled_frames: 0,
            capture_timestamp: NO_TIMESTAMP,
            flags: 0,
            sequence_number: SEQUENCE_NUMBER.fetch_add(1, Ordering::Relaxed),
            callback,
        }
    }
}

#[derive(Default)]
struct CaptureQueues {
    pending: VecDeque<PendingCaptureBuffer>,
    finished: VecDeque<PendingCaptureBuffer>,
}

/// Queue depths, for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub finished: usize,
}

/// Format-derived values, fixed once a payload buffer is attached
#[derive(Debug, Clone, Copy)]
struct FormatInfo {
    format: StreamFormat,
    bytes_per_frame: usize,
    frames_to_clock_mono_rate: TimelineRate,
    max_frames_per_capture: u32,
}

impl FormatInfo {
    /// Jobs are capped at `max_time_per_capture` and never exceed one second
    fn compute(format: StreamFormat, tuning: &CaptureTuning) -> Self {
        let frames_to_clock_mono_rate = TimelineRate::ns_per_frame(format.frames_per_second);
        let one_second = i64::from(format.frames_per_second.max(1));
        let max_frames_per_capture = frames_to_clock_mono_rate
            .inverse()
            .and_then(|rate| rate.scale(tuning.max_time_per_capture_ns()))
            .unwrap_or(one_second)
            .clamp(1, one_second) as u32;
        Self {
            format,
            bytes_per_frame: format.bytes_per_frame(),
            frames_to_clock_mono_rate,
            max_frames_per_capture,
        }
    }
}

struct CapturerState {
    info: FormatInfo,
    usage: CaptureUsage,
    stream_gain_db: f32,
    payload: Option<Arc<PayloadBuffer>>,
    payload_frames: u32,
    async_frames_per_packet: u32,
    pending_async_stop: Option<CompletionCallback>,
    client: Option<Arc<dyn CapturerClient>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixEventKind {
    /// At least one packet moved to the finished queue
    BuffersReady,
    /// The mix side finished an async stop
    AsyncStopReady,
    /// The mix side hit an unrecoverable error
    ShutdownRequested,
}

/// Work posted from a mix domain back to the request thread
#[derive(Debug, Clone)]
pub struct MixEvent {
    pub capturer: Weak<AudioCapturer>,
    pub kind: MixEventKind,
}

impl MixEvent {
    /// Run the event on the request thread; a dropped capturer is ignored
    pub fn dispatch(self) {
        if let Some(capturer) = self.capturer.upgrade() {
            capturer.handle_mix_event(self.kind);
        }
    }
}

/// Sending half of the mix to request channel
#[derive(Debug, Clone)]
pub struct MixEventSender {
    tx: Sender<MixEvent>,
}

impl MixEventSender {
    pub fn post(&self, event: MixEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(kind = ?event.kind, "Mix event channel full, blocking");
                if self.tx.send(event).is_err() {
                    debug!("Request loop gone, dropping mix event");
                }
            }
            Err(TrySendError::Disconnected(event)) => {
                debug!(kind = ?event.kind, "Request loop gone, dropping mix event");
            }
        }
    }
}

/// Create the bounded channel mix domains use to reach the request thread
pub fn mix_event_channel() -> (MixEventSender, Receiver<MixEvent>) {
    let (tx, rx) = channel::bounded(MIX_EVENT_CHANNEL_DEPTH);
    (MixEventSender { tx }, rx)
}

/// Shared services a capturer needs
#[derive(Clone)]
pub struct CaptureContext {
    pub clock: Arc<dyn Clock>,
    pub admin: Arc<AudioAdmin>,
    pub volume: Arc<StreamVolumeManager>,
    pub events: MixEventSender,
    pub tuning: CaptureTuning,
    pub mixer_settings: MixerSettings,
}

pub struct AudioCapturer {
    object: AudioObject,
    weak_self: Weak<AudioCapturer>,
    loopback: bool,
    state: AtomicU8,
    muted: AtomicBool,
    inner: Mutex<CapturerState>,
    queues: Mutex<CaptureQueues>,
    wakeup: Arc<Notify>,
    overflow_count: AtomicU16,
    partial_overflow_count: AtomicU16,
    ctx: CaptureContext,
}

impl AudioCapturer {
    pub fn new(loopback: bool, usage: CaptureUsage, ctx: CaptureContext) -> Arc<Self> {
        let info = FormatInfo::compute(StreamFormat::default(), &ctx.tuning);
        let capturer = Arc::new_cyclic(|weak_self| Self {
            object: AudioObject::new(ObjectKind::Capturer),
            weak_self: weak_self.clone(),
            loopback,
            state: AtomicU8::new(CaptureState::WaitingForVmo as u8),
            muted: AtomicBool::new(false),
            inner: Mutex::new(CapturerState {
                info,
                usage,
                stream_gain_db: UNITY_GAIN_DB,
                payload: None,
                payload_frames: 0,
                async_frames_per_packet: 0,
                pending_async_stop: None,
                client: None,
            }),
            queues: Mutex::new(CaptureQueues::default()),
            wakeup: Arc::new(Notify::new()),
            overflow_count: AtomicU16::new(0),
            partial_overflow_count: AtomicU16::new(0),
            ctx,
        });
        let stream: Arc<dyn StreamVolume> = capturer.clone();
        capturer.ctx.volume.add_stream(Arc::downgrade(&stream));
        debug!(capturer = %capturer.id(), loopback, "Capturer created");
        capturer
    }

    pub fn id(&self) -> ObjectId {
        self.object.id()
    }

    pub fn loopback(&self) -> bool {
        self.loopback
    }

    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CaptureState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.state() == CaptureState::Shutdown
    }

    pub fn usage(&self) -> CaptureUsage {
        self.inner.lock().usage
    }

    pub fn stream_gain_db(&self) -> f32 {
        self.inner.lock().stream_gain_db
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Wakeup the mix domain waits on
    pub fn wakeup(&self) -> &Arc<Notify> {
        &self.wakeup
    }

    pub fn set_client(&self, client: Arc<dyn CapturerClient>) {
        self.inner.lock().client = Some(client);
    }

    pub fn stream_type(&self) -> AudioStreamType {
        AudioStreamType::pcm(self.inner.lock().info.format)
    }

    pub fn queue_status(&self) -> QueueStatus {
        let queues = self.queues.lock();
        QueueStatus {
            pending: queues.pending.len(),
            finished: queues.finished.len(),
        }
    }

    /// Log, shut down, and hand the error back to the caller
    fn fail<T>(&self, error: AudioError) -> Result<T> {
        warn!(capturer = %self.id(), state = %self.state(), error = %error, "Shutting down capturer");
        self.shutdown();
        Err(error)
    }

    fn bad_state<T>(&self, request: &str) -> Result<T> {
        let state = self.state();
        self.fail(AudioError::BadState(format!("{request} not allowed in state {state}")))
    }

    /// Adopt the format of the first source when the client has not chosen one
    pub fn set_initial_format(&self, format: StreamFormat) {
        if self.state() != CaptureState::WaitingForVmo {
            return;
        }
        if format.validate().is_ok() {
            self.inner.lock().info = FormatInfo::compute(format, &self.ctx.tuning);
        }
    }

    pub fn set_format(&self, format: StreamFormat) -> Result<()> {
        if self.state() != CaptureState::WaitingForVmo {
            return self.bad_state("set_format");
        }
        if let Err(e) = format.validate() {
            return self.fail(e);
        }
        self.inner.lock().info = FormatInfo::compute(format, &self.ctx.tuning);
        debug!(capturer = %self.id(), ?format, "Capture format set");
        self.notify_volume();
        Ok(())
    }

    /// Attach the payload buffer and return the context the mix domain drives
    pub fn add_payload_buffer(
        self: &Arc<Self>,
        id: u32,
        buffer: Arc<PayloadBuffer>,
    ) -> Result<CaptureMixer> {
        if id != 0 {
            return self.fail(AudioError::InvalidArgument(format!("payload buffer id {id}")));
        }
        if self.state() != CaptureState::WaitingForVmo {
            return self.bad_state("add_payload_buffer");
        }

        let info = self.inner.lock().info;
        let size = buffer.len();
        if size < info.bytes_per_frame || size % info.bytes_per_frame != 0 {
            return self.fail(AudioError::InvalidArgument(format!(
                "payload size {size} is not a whole number of {}-byte frames",
                info.bytes_per_frame
            )));
        }
        let Ok(payload_frames) = u32::try_from(size / info.bytes_per_frame) else {
            return self.fail(AudioError::InvalidArgument(format!("payload size {size} too large")));
        };

        {
            let mut inner = self.inner.lock();
            inner.payload = Some(buffer.clone());
            inner.payload_frames = payload_frames;
        }
        self.set_state(CaptureState::OperatingSync);

        let mut cleanup = Vec::new();
        self.object.for_each_source_link(|link| {
            if let Err(e) = self.choose_mixer(link) {
                debug!(capturer = %self.id(), link = ?link, error = %e, "Dropping unusable source");
                cleanup.push(link.clone());
            }
        });
        for link in &cleanup {
            remove_link(link);
        }

        info!(capturer = %self.id(), frames = payload_frames, "Payload buffer attached");
        Ok(CaptureMixer::new(self.clone(), buffer, info, payload_frames))
    }

    pub fn capture_at(
        &self,
        offset_frames: u32,
        num_frames: u32,
        callback: Option<CaptureCallback>,
    ) -> Result<()> {
        if self.state() != CaptureState::OperatingSync {
            return self.bad_state("capture_at");
        }
        let payload_frames = self.inner.lock().payload_frames;
        let end = u64::from(offset_frames) + u64::from(num_frames);
        if num_frames == 0 || end > u64::from(payload_frames) {
            return self.fail(AudioError::InvalidArgument(format!(
                "capture [{offset_frames}, {end}) outside payload of {payload_frames} frames"
            )));
        }

        let was_empty = {
            let mut queues = self.queues.lock();
            let was_empty = queues.pending.is_empty();
            queues
                .pending
                .push_back(PendingCaptureBuffer::new(offset_frames, num_frames, callback));
            was_empty
        };
        if was_empty {
            self.wakeup.notify_one();
        }
        trace!(capturer = %self.id(), offset_frames, num_frames, "Capture queued");
        self.report_start();
        Ok(())
    }

    /// Accepted in async mode, where packets are recycled implicitly
    pub fn release_packet(&self, payload_offset: u64, payload_size: u64) -> Result<()> {
        match self.state() {
            CaptureState::OperatingAsync | CaptureState::AsyncStopping => {
                trace!(capturer = %self.id(), payload_offset, payload_size, "Packet released");
                Ok(())
            }
            _ => self.bad_state("release_packet"),
        }
    }

    pub fn discard_all_packets(&self, callback: Option<CompletionCallback>) -> Result<()> {
        if self.state() != CaptureState::OperatingSync {
            return self.bad_state("discard_all_packets");
        }

        let discarded: Vec<PendingCaptureBuffer> = {
            let mut queues = self.queues.lock();
            let CaptureQueues { pending, finished } = &mut *queues;
            let mut all: Vec<_> = finished.drain(..).collect();
            all.extend(pending.drain(..));
            all
        };

        if !discarded.is_empty() {
            debug!(capturer = %self.id(), packets = discarded.len(), "Discarding packets");
            self.finish_buffers(discarded);
            if let Some(client) = self.client() {
                client.on_end_of_stream();
            }
        }
        self.report_stop();
        if let Some(callback) = callback {
            callback();
        }
        Ok(())
    }

    pub fn start_async_capture(&self, frames_per_packet: u32) -> Result<()> {
        if self.state() != CaptureState::OperatingSync {
            return self.bad_state("start_async_capture");
        }
        {
            let queues = self.queues.lock();
            if !queues.pending.is_empty() || !queues.finished.is_empty() {
                drop(queues);
                return self.bad_state("start_async_capture with queued packets");
            }
        }

        let payload_frames = self.inner.lock().payload_frames;
        if frames_per_packet == 0 || frames_per_packet > payload_frames / 2 {
            return self.fail(AudioError::InvalidArgument(format!(
                "{frames_per_packet} frames per packet with a {payload_frames}-frame payload"
            )));
        }

        self.inner.lock().async_frames_per_packet = frames_per_packet;
        self.set_state(CaptureState::OperatingAsync);
        info!(capturer = %self.id(), frames_per_packet, "Async capture started");
        self.report_start();
        self.wakeup.notify_one();
        Ok(())
    }

    pub fn stop_async_capture(&self, callback: Option<CompletionCallback>) -> Result<()> {
        match self.state() {
            CaptureState::OperatingSync => {
                if let Some(callback) = callback {
                    callback();
                }
                Ok(())
            }
            CaptureState::OperatingAsync => {
                self.inner.lock().pending_async_stop = callback;
                self.report_stop();
                self.set_state(CaptureState::AsyncStopping);
                self.wakeup.notify_one();
                Ok(())
            }
            _ => self.bad_state("stop_async_capture"),
        }
    }

    pub fn set_gain(&self, gain_db: f32) -> Result<()> {
        if gain_db.is_nan() || !(MIN_GAIN_DB..=MAX_GAIN_DB).contains(&gain_db) {
            return self.fail(AudioError::InvalidArgument(format!("gain {gain_db} dB")));
        }
        {
            let mut inner = self.inner.lock();
            if inner.stream_gain_db == gain_db {
                return Ok(());
            }
            inner.stream_gain_db = gain_db;
        }
        self.notify_volume();
        Ok(())
    }

    pub fn set_mute(&self, muted: bool) {
        if self.muted.swap(muted, Ordering::AcqRel) != muted {
            self.notify_volume();
        }
    }

    pub fn set_usage(&self, usage: CaptureUsage) -> Result<()> {
        if self.is_shutdown() {
            return Err(AudioError::BadState("capturer is shut down".into()));
        }
        if self.usage() == usage {
            return Ok(());
        }

        self.report_stop();
        self.inner.lock().usage = usage;
        self.notify_volume();
        match self.state() {
            CaptureState::OperatingAsync => self.report_start(),
            CaptureState::OperatingSync if !self.queues.lock().pending.is_empty() => {
                self.report_start()
            }
            _ => {}
        }
        Ok(())
    }

    /// Tear the capturer down; safe to call more than once
    pub fn shutdown(&self) {
        let previous = CaptureState::from_u8(
            self.state
                .swap(CaptureState::Shutdown as u8, Ordering::AcqRel),
        );
        if previous == CaptureState::Shutdown {
            return;
        }

        self.report_stop();
        self.object.prevent_new_links();
        self.object.unlink();
        self.ctx.volume.remove_stream(self.id());
        {
            let mut queues = self.queues.lock();
            queues.pending.clear();
            queues.finished.clear();
        }
        {
            let mut inner = self.inner.lock();
            inner.pending_async_stop = None;
            inner.client = None;
        }
        self.wakeup.notify_one();
        info!(capturer = %self.id(), from = %previous, "Capturer shut down");
    }

    /// Request-side half of the mix to request handoff
    pub fn handle_mix_event(&self, kind: MixEventKind) {
        match kind {
            MixEventKind::BuffersReady => self.finish_buffers_thunk(),
            MixEventKind::AsyncStopReady => self.finish_async_stop(),
            MixEventKind::ShutdownRequested => self.shutdown(),
        }
    }

    fn finish_buffers_thunk(&self) {
        if self.is_shutdown() {
            return;
        }
        let (finished, idle) = {
            let mut queues = self.queues.lock();
            let finished: Vec<_> = queues.finished.drain(..).collect();
            (finished, queues.pending.is_empty())
        };
        self.finish_buffers(finished);
        if idle && self.state() == CaptureState::OperatingSync {
            self.report_stop();
        }
    }

    fn finish_async_stop(&self) {
        if self.state() != CaptureState::AsyncStoppingCallbackPending {
            return;
        }
        let finished: Vec<_> = self.queues.lock().finished.drain(..).collect();
        self.finish_buffers(finished);
        if let Some(client) = self.client() {
            client.on_end_of_stream();
        }
        let callback = self.inner.lock().pending_async_stop.take();
        if let Some(callback) = callback {
            callback();
        }
        self.report_stop();
        self.set_state(CaptureState::OperatingSync);
        debug!(capturer = %self.id(), "Async capture stopped");
    }

    /// Deliver packets in order, through their callback or the client
    fn finish_buffers(&self, buffers: Vec<PendingCaptureBuffer>) {
        let (bytes_per_frame, client) = {
            let inner = self.inner.lock();
            (inner.info.bytes_per_frame as u64, inner.client.clone())
        };

        for buffer in buffers {
            if buffer.callback.is_none() && buffer.filled_frames == 0 {
                continue;
            }
            let packet = CapturePacket {
                pts: buffer.capture_timestamp,
                flags: buffer.flags,
                payload_offset: u64::from(buffer.offset_frames) * bytes_per_frame,
                payload_size: u64::from(buffer.filled_frames) * bytes_per_frame,
            };
            trace!(capturer = %self.id(), sequence = buffer.sequence_number, ?packet, "Packet produced");
            match buffer.callback {
                Some(callback) => callback(packet),
                None => {
                    if let Some(client) = &client {
                        client.on_packet_produced(packet);
                    }
                }
            }
        }
    }

    fn client(&self) -> Option<Arc<dyn CapturerClient>> {
        self.inner.lock().client.clone()
    }

    fn report_start(&self) {
        self.ctx
            .admin
            .update_capturer_state(self.usage(), true, self.id());
    }

    fn report_stop(&self) {
        self.ctx
            .admin
            .update_capturer_state(self.usage(), false, self.id());
    }

    fn notify_volume(&self) {
        if let Some(me) = self.weak_self.upgrade() {
            let stream: Arc<dyn StreamVolume> = me;
            self.ctx.volume.notify_stream_changed(&stream);
        }
    }

    /// Pick a mixer for a device source link
    fn choose_mixer(&self, link: &Arc<AudioLink>) -> Result<()> {
        if link.source_type() != SourceType::RingBuffer {
            return Err(AudioError::Unsupported(format!(
                "capturers cannot mix {:?} sources",
                link.source_type()
            )));
        }
        let Some(source) = link.source() else {
            return Err(AudioError::BadState("link source is gone".into()));
        };
        let Some(device) = source.as_device() else {
            return Err(AudioError::Unsupported("capture source is not a device".into()));
        };
        if device.driver().is_none() {
            return Err(AudioError::Unsupported(format!(
                "device {} has no driver",
                device.name()
            )));
        }
        let Some(source_format) = device.format() else {
            return Err(AudioError::BadState(format!(
                "device {} has no format yet",
                device.name()
            )));
        };

        let dest_format = self.inner.lock().info.format;
        let Some(mixer) = Mixer::select(&source_format, &dest_format, &self.ctx.mixer_settings)
        else {
            return Err(AudioError::Unsupported(format!(
                "no mixer for {source_format:?} -> {dest_format:?}"
            )));
        };

        if device.is_input() {
            let gain = device.gain_info();
            link.gain().set_source_gain(if gain.muted {
                MUTED_GAIN_DB
            } else {
                gain.gain_db
            });
        }

        let mut bookkeeping = link.bookkeeping();
        bookkeeping.mixer = Some(mixer);
        bookkeeping.invalidate_transforms();
        bookkeeping.reset_positions();
        trace!(capturer = %self.id(), device = device.name(), "Mixer chosen");
        Ok(())
    }
}

impl AudioNode for AudioCapturer {
    fn as_object(&self) -> &AudioObject {
        &self.object
    }

    fn format(&self) -> Option<StreamFormat> {
        Some(self.inner.lock().info.format)
    }

    fn initialize_source_link(&self, link: &Arc<AudioLink>) -> Result<()> {
        match self.state() {
            CaptureState::WaitingForVmo => Ok(()),
            CaptureState::Shutdown => {
                Err(AudioError::BadState("capturer is shut down".into()))
            }
            _ => self.choose_mixer(link),
        }
    }

    fn on_link_added(&self) {
        self.notify_volume();
    }
}

impl StreamVolume for AudioCapturer {
    fn stream_id(&self) -> ObjectId {
        self.id()
    }

    fn stream_usage(&self) -> Usage {
        Usage::Capture(self.usage())
    }

    fn stream_muted(&self) -> bool {
        self.muted()
    }

    fn realize_volume(&self, command: VolumeCommand) {
        let db = combine_gains(
            combine_gains(volume_to_db(command.volume), self.stream_gain_db()),
            command.gain_db_adjustment,
        );
        self.object
            .for_each_source_link(|link| link.gain().set_dest_gain(db));
    }
}

impl fmt::Debug for AudioCapturer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioCapturer")
            .field("id", &self.id())
            .field("loopback", &self.loopback)
            .field("state", &self.state())
            .finish()
    }
}

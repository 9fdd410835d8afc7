//! Per-stream volume realization
//!
//! Streams register a weak handle here. Usage gain adjustments from the
//! admin, and per-usage base gain and volume, are combined into a
//! [`VolumeCommand`] that each affected stream realizes on its own links.

use crate::domain::admin::{CaptureUsage, GainAdjustmentSink, RenderUsage, Usage};
use crate::domain::gain::{combine_gains, UNITY_GAIN_DB};
use crate::domain::object::ObjectId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::trace;

/// What a stream should apply on top of its own gain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeCommand {
    /// Volume in [0.0, 1.0]
    pub volume: f32,
    pub gain_db_adjustment: f32,
}

/// A stream whose gain follows usage policy
pub trait StreamVolume: Send + Sync {
    fn stream_id(&self) -> ObjectId;

    fn stream_usage(&self) -> Usage;

    fn stream_muted(&self) -> bool;

    fn realize_volume(&self, command: VolumeCommand);
}

#[derive(Default)]
struct VolumeState {
    streams: HashMap<ObjectId, Weak<dyn StreamVolume>>,
    adjustments: HashMap<Usage, f32>,
    usage_gain: HashMap<Usage, f32>,
    usage_volume: HashMap<Usage, f32>,
}

impl VolumeState {
    fn command_for(&self, usage: Usage, muted: bool) -> VolumeCommand {
        let adjustment = self.adjustments.get(&usage).copied().unwrap_or(UNITY_GAIN_DB);
        let base = self.usage_gain.get(&usage).copied().unwrap_or(UNITY_GAIN_DB);
        let volume = self.usage_volume.get(&usage).copied().unwrap_or(1.0);
        VolumeCommand {
            volume: if muted { 0.0 } else { volume },
            gain_db_adjustment: combine_gains(base, adjustment),
        }
    }
}

#[derive(Default)]
pub struct StreamVolumeManager {
    state: Mutex<VolumeState>,
}

impl StreamVolumeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream and push its current volume
    pub fn add_stream(&self, stream: Weak<dyn StreamVolume>) {
        let Some(strong) = stream.upgrade() else {
            return;
        };
        self.state.lock().streams.insert(strong.stream_id(), stream);
        self.realize(&strong);
    }

    pub fn remove_stream(&self, id: ObjectId) {
        self.state.lock().streams.remove(&id);
    }

    pub fn stream_count(&self) -> usize {
        self.state.lock().streams.len()
    }

    pub fn set_usage_gain(&self, usage: Usage, gain_db: f32) {
        self.state.lock().usage_gain.insert(usage, gain_db);
        self.notify_usage(usage);
    }

    pub fn set_usage_volume(&self, usage: Usage, volume: f32) {
        self.state
            .lock()
            .usage_volume
            .insert(usage, volume.clamp(0.0, 1.0));
        self.notify_usage(usage);
    }

    pub fn usage_gain_adjustment(&self, usage: Usage) -> f32 {
        self.state
            .lock()
            .adjustments
            .get(&usage)
            .copied()
            .unwrap_or(UNITY_GAIN_DB)
    }

    /// Re-realize one stream after its own gain, mute or usage changed
    pub fn notify_stream_changed(&self, stream: &Arc<dyn StreamVolume>) {
        self.realize(stream);
    }

    fn realize(&self, stream: &Arc<dyn StreamVolume>) {
        let command = self
            .state
            .lock()
            .command_for(stream.stream_usage(), stream.stream_muted());
        trace!(stream = %stream.stream_id(), ?command, "Realizing stream volume");
        stream.realize_volume(command);
    }

    fn notify_usage(&self, usage: Usage) {
        // Streams are called with the lock released.
        let streams: Vec<Arc<dyn StreamVolume>> = {
            let mut state = self.state.lock();
            state.streams.retain(|_, s| s.strong_count() > 0);
            state.streams.values().filter_map(Weak::upgrade).collect()
        };
        for stream in streams {
            if stream.stream_usage() == usage {
                self.realize(&stream);
            }
        }
    }

    fn set_adjustment(&self, usage: Usage, gain_db: f32) {
        let previous = self.state.lock().adjustments.insert(usage, gain_db);
        if previous != Some(gain_db) {
            self.notify_usage(usage);
        }
    }
}

impl GainAdjustmentSink for StreamVolumeManager {
    fn set_render_usage_gain_adjustment(&self, usage: RenderUsage, gain_db: f32) {
        self.set_adjustment(Usage::Render(usage), gain_db);
    }

    fn set_capture_usage_gain_adjustment(&self, usage: CaptureUsage, gain_db: f32) {
        self.set_adjustment(Usage::Capture(usage), gain_db);
    }
}

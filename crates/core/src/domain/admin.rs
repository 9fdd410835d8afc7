//! Usage-based gain policy
//!
//! Streams report themselves active or inactive per usage. Whenever the
//! active set changes, the admin re-evaluates the whole table: the single
//! highest-priority active usage imposes its behavior (none, duck, mute) on
//! every other usage, and the result is pushed to a [`GainAdjustmentSink`].
//! Re-running the evaluation with no state change produces the same calls.

use crate::domain::object::ObjectId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderUsage {
    Background,
    Media,
    Interruption,
    SystemAgent,
    Communication,
}

impl RenderUsage {
    pub const ALL: [RenderUsage; 5] = [
        RenderUsage::Background,
        RenderUsage::Media,
        RenderUsage::Interruption,
        RenderUsage::SystemAgent,
        RenderUsage::Communication,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureUsage {
    Background,
    Foreground,
    SystemAgent,
    Communication,
}

impl CaptureUsage {
    pub const ALL: [CaptureUsage; 4] = [
        CaptureUsage::Background,
        CaptureUsage::Foreground,
        CaptureUsage::SystemAgent,
        CaptureUsage::Communication,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Usage {
    Render(RenderUsage),
    Capture(CaptureUsage),
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Usage::Render(u) => write!(f, "render:{u:?}"),
            Usage::Capture(u) => write!(f, "capture:{u:?}"),
        }
    }
}

/// Highest priority first
const PRIORITY: [Usage; 9] = [
    Usage::Capture(CaptureUsage::Communication),
    Usage::Render(RenderUsage::Communication),
    Usage::Capture(CaptureUsage::SystemAgent),
    Usage::Render(RenderUsage::SystemAgent),
    Usage::Render(RenderUsage::Interruption),
    Usage::Capture(CaptureUsage::Foreground),
    Usage::Render(RenderUsage::Media),
    Usage::Capture(CaptureUsage::Background),
    Usage::Render(RenderUsage::Background),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    #[default]
    None,
    Duck,
    Mute,
}

/// Gain adjustment applied for each behavior
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorGain {
    pub none_gain_db: f32,
    pub duck_gain_db: f32,
    pub mute_gain_db: f32,
}

impl Default for BehaviorGain {
    fn default() -> Self {
        Self {
            none_gain_db: 0.0,
            duck_gain_db: -35.0,
            mute_gain_db: -160.0,
        }
    }
}

impl BehaviorGain {
    pub fn gain_db(&self, behavior: Behavior) -> f32 {
        match behavior {
            Behavior::None => self.none_gain_db,
            Behavior::Duck => self.duck_gain_db,
            Behavior::Mute => self.mute_gain_db,
        }
    }
}

/// One entry of the interaction table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InteractionRule {
    pub active: Usage,
    pub affected: Usage,
    pub behavior: Behavior,
}

/// Receiver of per-usage gain adjustments
pub trait GainAdjustmentSink: Send + Sync {
    fn set_render_usage_gain_adjustment(&self, usage: RenderUsage, gain_db: f32);

    fn set_capture_usage_gain_adjustment(&self, usage: CaptureUsage, gain_db: f32);
}

#[derive(Default)]
struct AdminState {
    interactions: HashMap<(Usage, Usage), Behavior>,
    active_renderers: HashMap<RenderUsage, HashSet<ObjectId>>,
    active_capturers: HashMap<CaptureUsage, HashSet<ObjectId>>,
}

impl AdminState {
    fn is_active(&self, usage: Usage) -> bool {
        match usage {
            Usage::Render(u) => self.active_renderers.get(&u).is_some_and(|s| !s.is_empty()),
            Usage::Capture(u) => self.active_capturers.get(&u).is_some_and(|s| !s.is_empty()),
        }
    }
}

pub struct AudioAdmin {
    behavior_gain: BehaviorGain,
    sink: Arc<dyn GainAdjustmentSink>,
    state: Mutex<AdminState>,
}

impl AudioAdmin {
    pub fn new(behavior_gain: BehaviorGain, sink: Arc<dyn GainAdjustmentSink>) -> Self {
        Self {
            behavior_gain,
            sink,
            state: Mutex::new(AdminState::default()),
        }
    }

    pub fn set_interaction(&self, active: Usage, affected: Usage, behavior: Behavior) {
        self.state
            .lock()
            .interactions
            .insert((active, affected), behavior);
    }

    pub fn clear_interactions(&self) {
        self.state.lock().interactions.clear();
    }

    /// Replace the interaction table and re-evaluate
    pub fn load_rules(&self, rules: &[InteractionRule]) {
        {
            let mut state = self.state.lock();
            state.interactions.clear();
            for rule in rules {
                state
                    .interactions
                    .insert((rule.active, rule.affected), rule.behavior);
            }
        }
        info!(rules = rules.len(), "Loaded usage interaction rules");
        self.update_policy();
    }

    pub fn update_renderer_state(&self, usage: RenderUsage, active: bool, stream: ObjectId) {
        {
            let mut state = self.state.lock();
            let set = state.active_renderers.entry(usage).or_default();
            if active {
                set.insert(stream);
            } else {
                set.remove(&stream);
            }
        }
        debug!(?usage, active, %stream, "Renderer activity changed");
        self.update_policy();
    }

    pub fn update_capturer_state(&self, usage: CaptureUsage, active: bool, stream: ObjectId) {
        {
            let mut state = self.state.lock();
            let set = state.active_capturers.entry(usage).or_default();
            if active {
                set.insert(stream);
            } else {
                set.remove(&stream);
            }
        }
        debug!(?usage, active, %stream, "Capturer activity changed");
        self.update_policy();
    }

    pub fn is_active(&self, usage: Usage) -> bool {
        self.state.lock().is_active(usage)
    }

    /// Highest-priority usage with at least one active stream
    pub fn highest_priority_active(&self) -> Option<Usage> {
        let state = self.state.lock();
        PRIORITY.iter().copied().find(|u| state.is_active(*u))
    }

    /// Recompute and push every usage's adjustment
    pub fn update_policy(&self) {
        let adjustments = {
            let state = self.state.lock();
            let top = PRIORITY.iter().copied().find(|u| state.is_active(*u));

            let gain_for = |affected: Usage| -> f32 {
                match top {
                    Some(active) if active != affected => {
                        let behavior = state
                            .interactions
                            .get(&(active, affected))
                            .copied()
                            .unwrap_or_default();
                        self.behavior_gain.gain_db(behavior)
                    }
                    _ => self.behavior_gain.none_gain_db,
                }
            };

            let mut adjustments = Vec::with_capacity(PRIORITY.len());
            for usage in RenderUsage::ALL {
                adjustments.push((Usage::Render(usage), gain_for(Usage::Render(usage))));
            }
            for usage in CaptureUsage::ALL {
                adjustments.push((Usage::Capture(usage), gain_for(Usage::Capture(usage))));
            }
            debug!(top = ?top, "Updated usage policy");
            adjustments
        };

        for (usage, gain_db) in adjustments {
            match usage {
                Usage::Render(u) => self.sink.set_render_usage_gain_adjustment(u, gain_db),
                Usage::Capture(u) => self.sink.set_capture_usage_gain_adjustment(u, gain_db),
            }
        }
    }
}

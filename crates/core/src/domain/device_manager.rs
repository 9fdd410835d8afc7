//! Device lifecycle and routing policy
//!
//! The manager owns every device, renderer and capturer handle and keeps the
//! graph routed by a "last plugged wins" rule per category:
//! - renderers feed the default output (and always the throttle output)
//! - loopback capturers listen to the default output
//! - every other capturer listens to the default input
//!
//! All entry points run on the request thread. The manager lock is never held
//! while calling out to a stream's shutdown.

use crate::domain::audio::{AudioError, DeviceId, Result};
use crate::domain::capturer::AudioCapturer;
use crate::domain::device::{
    AudioDevice, AudioGainInfo, DeviceSettings, DeviceState, SetGainFlags,
};
use crate::domain::gain::{MAX_GAIN_DB, MIN_GAIN_DB};
use crate::domain::object::{link_objects, AudioNode, ObjectId, ObjectKind};
use crate::domain::renderer::AudioRenderer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// System-wide gain and mute shared by the manager and its outputs
#[derive(Debug)]
pub struct SystemAudioPolicy {
    gain_db: AtomicU32,
    muted: AtomicBool,
}

impl SystemAudioPolicy {
    pub fn new(gain_db: f32, muted: bool) -> Self {
        Self {
            gain_db: AtomicU32::new(gain_db.to_bits()),
            muted: AtomicBool::new(muted),
        }
    }

    pub fn gain_db(&self) -> f32 {
        f32::from_bits(self.gain_db.load(Ordering::Acquire))
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Returns true when the stored value changed
    fn set_gain_db(&self, db: f32) -> bool {
        let db = db.clamp(MIN_GAIN_DB, MAX_GAIN_DB);
        self.gain_db.swap(db.to_bits(), Ordering::AcqRel) != db.to_bits()
    }

    fn set_muted(&self, muted: bool) -> bool {
        self.muted.swap(muted, Ordering::AcqRel) != muted
    }
}

impl Default for SystemAudioPolicy {
    fn default() -> Self {
        Self::new(0.0, false)
    }
}

/// Persistence for opaque per-device settings blobs
pub trait DeviceSettingsStore: Send + Sync {
    fn load(&self, unique_id: &DeviceId) -> Result<Option<serde_json::Value>>;

    fn store(&self, unique_id: &DeviceId, value: serde_json::Value) -> Result<()>;
}

/// Settings store that forgets everything on exit
#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    entries: Mutex<HashMap<DeviceId, serde_json::Value>>,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceSettingsStore for InMemorySettingsStore {
    fn load(&self, unique_id: &DeviceId) -> Result<Option<serde_json::Value>> {
        Ok(self.entries.lock().get(unique_id).cloned())
    }

    fn store(&self, unique_id: &DeviceId, value: serde_json::Value) -> Result<()> {
        self.entries.lock().insert(unique_id.clone(), value);
        Ok(())
    }
}

/// Public description of an active device
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub token: ObjectId,
    pub name: String,
    pub unique_id: DeviceId,
    pub is_input: bool,
    pub gain_info: AudioGainInfo,
    pub is_default: bool,
}

/// Notifications for device enumerator clients
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    DeviceAdded(DeviceInfo),
    DeviceRemoved {
        token: ObjectId,
    },
    DefaultDeviceChanged {
        is_input: bool,
        old: Option<ObjectId>,
        new: Option<ObjectId>,
    },
    DeviceGainChanged {
        token: ObjectId,
        info: AudioGainInfo,
    },
}

#[derive(Default)]
struct ManagerState {
    pending_init: Vec<Arc<AudioDevice>>,
    devices: Vec<Arc<AudioDevice>>,
    renderers: Vec<Arc<AudioRenderer>>,
    capturers: Vec<Arc<AudioCapturer>>,
    default_output: Option<ObjectId>,
    default_input: Option<ObjectId>,
}

pub struct AudioDeviceManager {
    state: Mutex<ManagerState>,
    throttle: Arc<AudioDevice>,
    policy: Arc<SystemAudioPolicy>,
    store: Arc<dyn DeviceSettingsStore>,
    events: broadcast::Sender<DeviceEvent>,
}

impl AudioDeviceManager {
    pub fn new(policy: Arc<SystemAudioPolicy>, store: Arc<dyn DeviceSettingsStore>) -> Self {
        let (events, _events_rx) = broadcast::channel(64);
        info!("Audio device manager created");

        Self {
            state: Mutex::new(ManagerState::default()),
            throttle: AudioDevice::throttle_output(),
            policy,
            store,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn throttle_output(&self) -> &Arc<AudioDevice> {
        &self.throttle
    }

    pub fn system_policy(&self) -> &Arc<SystemAudioPolicy> {
        &self.policy
    }

    fn emit(&self, event: DeviceEvent) {
        // No subscribers is not an error.
        if self.events.send(event).is_err() {
            debug!("No device event subscribers");
        }
    }

    // ------------------------------------------------------------------------
    // Device lifecycle
    // ------------------------------------------------------------------------

    /// Register a freshly discovered device and activate it
    #[instrument(skip(self, device), fields(device = %device.unique_id()))]
    pub fn add_device(&self, device: Arc<AudioDevice>) {
        debug_assert!(!Arc::ptr_eq(&device, &self.throttle));
        device.set_state(DeviceState::PendingInit);
        self.state.lock().pending_init.push(device.clone());
        self.activate_device(&device);
    }

    /// Move a pending device to the active set and route it
    pub fn activate_device(&self, device: &Arc<AudioDevice>) {
        let pending = self
            .state
            .lock()
            .pending_init
            .iter()
            .any(|d| Arc::ptr_eq(d, device));
        if !pending {
            debug!(device = %device.unique_id(), "Device already left pending set");
            return;
        }

        let settings = self.load_settings(device);
        device.set_settings(settings.clone());
        if settings.ignored {
            info!(device = %device.unique_id(), "Ignoring device");
            self.remove_device(device);
            return;
        }

        {
            let mut state = self.state.lock();
            state.pending_init.retain(|d| !Arc::ptr_eq(d, device));
            state.devices.push(device.clone());
        }
        device.set_state(DeviceState::Active);

        device.set_gain_info(
            AudioGainInfo {
                gain_db: settings.gain_db,
                muted: settings.muted,
                agc_enabled: settings.agc_enabled,
            },
            SetGainFlags::ALL,
        );

        let is_default = self
            .find_last_plugged(device.kind(), false)
            .is_some_and(|d| Arc::ptr_eq(&d, device));
        self.emit(DeviceEvent::DeviceAdded(Self::device_info(device, is_default)));
        info!(
            device = %device.unique_id(),
            name = device.name(),
            is_input = device.is_input(),
            "Activated device"
        );

        if device.plugged() {
            self.on_device_plugged(device);
        }
        self.update_default_device(device.is_input());
    }

    fn load_settings(&self, device: &Arc<AudioDevice>) -> DeviceSettings {
        let colliding = self
            .state
            .lock()
            .devices
            .iter()
            .find(|d| d.unique_id() == device.unique_id())
            .cloned();
        if let Some(other) = colliding {
            debug!(device = %device.unique_id(), "Cloning settings from colliding device");
            return other.settings();
        }

        match self.store.load(device.unique_id()) {
            Ok(Some(value)) => match serde_json::from_value::<DeviceSettings>(value) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(device = %device.unique_id(), error = %e, "Corrupt device settings, using defaults");
                    DeviceSettings::default()
                }
            },
            Ok(None) => DeviceSettings::default(),
            Err(e) => {
                warn!(device = %device.unique_id(), error = %e, "Unable to load device settings");
                DeviceSettings::default()
            }
        }
    }

    fn persist_settings(&self, device: &AudioDevice) {
        let result = serde_json::to_value(device.settings())
            .map_err(|e| AudioError::Settings(e.to_string()))
            .and_then(|value| self.store.store(device.unique_id(), value));
        if let Err(e) = result {
            warn!(device = %device.unique_id(), error = %e, "Failed to persist device settings");
        }
    }

    /// Unlink and forget a device, rerouting if it was a default
    #[instrument(skip(self, device), fields(device = %device.unique_id()))]
    pub fn remove_device(&self, device: &Arc<AudioDevice>) {
        device.as_object().prevent_new_links();
        device.as_object().unlink();

        let was_active = device.is_active() || device.state() == DeviceState::Unplugged;
        if was_active {
            self.on_device_unplugged(device, device.plug_time());
        }
        self.persist_settings(device);

        {
            let mut state = self.state.lock();
            state.pending_init.retain(|d| !Arc::ptr_eq(d, device));
            state.devices.retain(|d| !Arc::ptr_eq(d, device));
        }
        device.set_state(DeviceState::Removed);

        if was_active {
            self.update_default_device(device.is_input());
            self.emit(DeviceEvent::DeviceRemoved {
                token: device.token(),
            });
        }
        info!("Removed device");
    }

    /// Driver-reported plug change
    pub fn on_plug_state_changed(&self, device: &Arc<AudioDevice>, plugged: bool, plug_time: i64) {
        if plugged {
            if !device.update_plug_state(true, plug_time) {
                return;
            }
            if device.state() == DeviceState::Unplugged {
                device.set_state(DeviceState::Active);
            }
            self.on_device_plugged(device);
        } else {
            if !device.plugged() {
                return;
            }
            self.on_device_unplugged(device, plug_time);
        }
        self.update_default_device(device.is_input());
    }

    fn on_device_plugged(&self, device: &Arc<AudioDevice>) {
        let Some(last_plugged) = self.find_last_plugged(device.kind(), false) else {
            return;
        };
        if !Arc::ptr_eq(&last_plugged, device) {
            debug!(device = %device.unique_id(), "Plugged device is not the default");
            return;
        }

        if device.is_output() {
            let (others, renderers) = {
                let state = self.state.lock();
                let others: Vec<_> = state
                    .devices
                    .iter()
                    .filter(|d| d.is_output() && !Arc::ptr_eq(d, device))
                    .cloned()
                    .collect();
                (others, state.renderers.clone())
            };
            for other in others {
                other.as_object().unlink_sources();
            }
            for renderer in &renderers {
                self.link_output_to_renderer(device, renderer);
            }
        }
        self.link_to_capturers(device);
    }

    fn on_device_unplugged(&self, device: &Arc<AudioDevice>, plug_time: i64) {
        let was_last_plugged = self
            .find_last_plugged(device.kind(), false)
            .is_some_and(|d| Arc::ptr_eq(&d, device));

        if !device.update_plug_state(false, plug_time) {
            return;
        }
        if device.is_active() {
            device.set_state(DeviceState::Unplugged);
        }
        device.as_object().unlink();

        if !was_last_plugged {
            return;
        }
        let Some(replacement) = self.find_last_plugged(device.kind(), false) else {
            debug!(device = %device.unique_id(), "No replacement for unplugged default");
            return;
        };

        if replacement.is_output() {
            let renderers = self.state.lock().renderers.clone();
            for renderer in &renderers {
                self.link_output_to_renderer(&replacement, renderer);
            }
        }
        self.link_to_capturers(&replacement);
    }

    /// Most recently plugged device of `kind` that allows auto-routing
    ///
    /// Plugged devices win over unplugged ones, later plug times win ties.
    pub fn find_last_plugged(
        &self,
        kind: ObjectKind,
        allow_unplugged: bool,
    ) -> Option<Arc<AudioDevice>> {
        debug_assert!(kind.is_device());
        let state = self.state.lock();
        let mut best: Option<&Arc<AudioDevice>> = None;

        for device in &state.devices {
            if device.kind() != kind || device.auto_routing_disabled() {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    (!b.plugged() && device.plugged())
                        || (b.plugged() == device.plugged() && b.plug_time() < device.plug_time())
                }
            };
            if better {
                best = Some(device);
            }
        }

        match best {
            Some(b) if !allow_unplugged && !b.plugged() => None,
            other => other.cloned(),
        }
    }

    fn update_default_device(&self, input: bool) {
        let kind = if input {
            ObjectKind::Input
        } else {
            ObjectKind::Output
        };
        let new = self.find_last_plugged(kind, false).map(|d| d.token());

        let old = {
            let mut state = self.state.lock();
            let slot = if input {
                &mut state.default_input
            } else {
                &mut state.default_output
            };
            if *slot == new {
                return;
            }
            std::mem::replace(slot, new)
        };

        info!(is_input = input, ?old, ?new, "Default device changed");
        self.emit(DeviceEvent::DefaultDeviceChanged {
            is_input: input,
            old,
            new,
        });
    }

    pub fn default_output_token(&self) -> Option<ObjectId> {
        self.state.lock().default_output
    }

    pub fn default_input_token(&self) -> Option<ObjectId> {
        self.state.lock().default_input
    }

    fn device_info(device: &AudioDevice, is_default: bool) -> DeviceInfo {
        DeviceInfo {
            token: device.token(),
            name: device.name().to_string(),
            unique_id: device.unique_id().clone(),
            is_input: device.is_input(),
            gain_info: device.gain_info(),
            is_default,
        }
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        let state = self.state.lock();
        state
            .devices
            .iter()
            .map(|d| {
                let default = if d.is_input() {
                    state.default_input
                } else {
                    state.default_output
                };
                Self::device_info(d, default == Some(d.token()))
            })
            .collect()
    }

    pub fn find_device(&self, token: ObjectId) -> Option<Arc<AudioDevice>> {
        self.state
            .lock()
            .devices
            .iter()
            .find(|d| d.token() == token)
            .cloned()
    }

    // ------------------------------------------------------------------------
    // Gain
    // ------------------------------------------------------------------------

    pub fn get_device_gain(&self, token: ObjectId) -> Option<AudioGainInfo> {
        self.find_device(token).map(|d| d.gain_info())
    }

    /// Per-device override; the device stops following system gain
    pub fn set_device_gain(
        &self,
        token: ObjectId,
        info: AudioGainInfo,
        flags: SetGainFlags,
    ) -> Result<()> {
        let device = self
            .find_device(token)
            .ok_or_else(|| AudioError::DeviceNotFound(token.to_string()))?;
        if flags.gain && info.gain_db.is_nan() {
            warn!(device = %device.unique_id(), "Invalid device gain, making no change");
            return Err(AudioError::InvalidArgument("gain is NaN".into()));
        }

        device.set_system_gain_dirty(true);
        device.set_gain_info(info, flags);
        self.emit(DeviceEvent::DeviceGainChanged {
            token,
            info: device.gain_info(),
        });
        Ok(())
    }

    pub fn set_system_gain(&self, gain_db: f32) {
        if gain_db.is_nan() {
            warn!("Invalid system gain, making no change");
            return;
        }
        let changed = self.policy.set_gain_db(gain_db);
        self.on_system_gain(changed);
    }

    pub fn set_system_mute(&self, muted: bool) {
        let changed = self.policy.set_muted(muted);
        self.on_system_gain(changed);
    }

    fn on_system_gain(&self, changed: bool) {
        if !changed {
            return;
        }
        let outputs: Vec<_> = self
            .state
            .lock()
            .devices
            .iter()
            .filter(|d| d.is_output() && !d.system_gain_dirty())
            .cloned()
            .collect();

        let info = AudioGainInfo {
            gain_db: self.policy.gain_db(),
            muted: self.policy.muted(),
            agc_enabled: false,
        };
        let flags = SetGainFlags {
            gain: true,
            mute: true,
            agc: false,
        };
        for device in outputs {
            device.set_gain_info(info, flags);
            self.emit(DeviceEvent::DeviceGainChanged {
                token: device.token(),
                info: device.gain_info(),
            });
        }
    }

    // ------------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------------

    pub fn add_renderer(&self, renderer: Arc<AudioRenderer>) {
        self.state.lock().renderers.push(renderer.clone());
        self.select_outputs_for_renderer(&renderer);
    }

    /// Link a renderer to the throttle output and the default output
    pub fn select_outputs_for_renderer(&self, renderer: &Arc<AudioRenderer>) {
        self.link_output_to_renderer(&self.throttle, renderer);
        if let Some(output) = self.find_last_plugged(ObjectKind::Output, false) {
            self.link_output_to_renderer(&output, renderer);
        }
    }

    fn link_output_to_renderer(&self, output: &Arc<AudioDevice>, renderer: &Arc<AudioRenderer>) {
        // Renderers without a format link once they get one.
        if renderer.format().is_none() {
            return;
        }
        let source: Arc<dyn AudioNode> = renderer.clone();
        let dest: Arc<dyn AudioNode> = output.clone();
        link_objects(&source, &dest);
    }

    pub fn remove_renderer(&self, renderer: &Arc<AudioRenderer>) {
        self.state
            .lock()
            .renderers
            .retain(|r| !Arc::ptr_eq(r, renderer));
        renderer.shutdown();
    }

    /// Track a capturer and link it to the current default source
    pub fn add_capturer(&self, capturer: Arc<AudioCapturer>) {
        self.state.lock().capturers.push(capturer.clone());

        let kind = if capturer.loopback() {
            ObjectKind::Output
        } else {
            ObjectKind::Input
        };
        let Some(source) = self.find_last_plugged(kind, true) else {
            debug!(capturer = %capturer.as_object().id(), "No source device for capturer yet");
            return;
        };

        if let Some(format) = source.format() {
            capturer.set_initial_format(format);
        }
        if source.plugged() {
            let source: Arc<dyn AudioNode> = source;
            let dest: Arc<dyn AudioNode> = capturer;
            link_objects(&source, &dest);
        }
    }

    pub fn remove_capturer(&self, capturer: &Arc<AudioCapturer>) {
        self.state
            .lock()
            .capturers
            .retain(|c| !Arc::ptr_eq(c, capturer));
        capturer.shutdown();
    }

    /// Point every capturer of the matching flavor at `device`
    fn link_to_capturers(&self, device: &Arc<AudioDevice>) {
        let link_to_loopbacks = device.is_output();
        let capturers = {
            let mut state = self.state.lock();
            state.capturers.retain(|c| !c.is_shutdown());
            state.capturers.clone()
        };

        for capturer in capturers {
            if capturer.loopback() != link_to_loopbacks {
                continue;
            }
            capturer.as_object().unlink_sources();
            let source: Arc<dyn AudioNode> = device.clone();
            let dest: Arc<dyn AudioNode> = capturer;
            link_objects(&source, &dest);
        }
    }

    pub fn renderer_count(&self) -> usize {
        self.state.lock().renderers.len()
    }

    pub fn capturer_count(&self) -> usize {
        let mut state = self.state.lock();
        state.capturers.retain(|c| !c.is_shutdown());
        state.capturers.len()
    }

    /// Tear everything down and persist device settings
    pub fn shutdown(&self) {
        let state = std::mem::take(&mut *self.state.lock());

        for capturer in &state.capturers {
            capturer.shutdown();
        }
        for renderer in &state.renderers {
            renderer.shutdown();
        }
        for device in &state.pending_init {
            device.as_object().prevent_new_links();
            device.as_object().unlink();
            device.set_state(DeviceState::Removed);
        }
        for device in &state.devices {
            device.as_object().prevent_new_links();
            device.as_object().unlink();
            self.persist_settings(device);
            device.set_state(DeviceState::Removed);
        }
        self.throttle.as_object().unlink();
        info!(
            devices = state.devices.len(),
            capturers = state.capturers.len(),
            renderers = state.renderers.len(),
            "Audio device manager shut down"
        );
    }
}

//! Audio devices and their driver boundary
//!
//! A device is an [`AudioObject`] of kind Output or Input backed by an
//! [`AudioDriver`]. The driver exposes the hardware ring buffer only as a
//! [`RingBufferSnapshot`], taken fresh on every mix pass.

use crate::domain::audio::{DeviceId, Result, StreamFormat};
use crate::domain::gain::{MAX_GAIN_DB, MIN_GAIN_DB, MUTED_GAIN_DB};
use crate::domain::object::{AudioLink, AudioNode, AudioObject, ObjectId, ObjectKind};
use crate::domain::timeline::TimelineFunction;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Shared memory ring of whole frames
#[derive(Debug)]
pub struct RingBuffer {
    frames: usize,
    frame_size: usize,
    data: RwLock<Vec<u8>>,
}

impl RingBuffer {
    pub fn new(frames: usize, frame_size: usize) -> Self {
        Self {
            frames,
            frame_size,
            data: RwLock::new(vec![0; frames * frame_size]),
        }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn size_bytes(&self) -> usize {
        self.frames * self.frame_size
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }
}

/// Immutable view of a driver ring buffer at one instant
#[derive(Debug, Clone, Default)]
pub struct RingBufferSnapshot {
    pub ring_buffer: Option<Arc<RingBuffer>>,
    /// Maps monotonic time to the DMA position in bytes, unwrapped
    pub clock_mono_to_ring_pos_bytes: TimelineFunction,
    /// Frames between the DMA position and the newest safe frame
    pub position_to_end_fence_frames: u32,
    /// Frames between the newest and oldest safe frames
    pub end_fence_to_start_fence_frames: u32,
    /// Changes whenever the clock mapping changes
    pub gen_id: u32,
}

/// Hardware (or virtual) driver behind a device
pub trait AudioDriver: Send + Sync {
    /// Format of frames in the ring buffer, once configured
    fn format(&self) -> Option<StreamFormat>;

    fn snapshot_ring_buffer(&self) -> RingBufferSnapshot;
}

/// Persisted per-device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub gain_db: f32,
    pub muted: bool,
    pub agc_enabled: bool,
    /// Ignored devices are removed as soon as they activate
    pub ignored: bool,
    /// Never chosen as the default for its category
    pub auto_routing_disabled: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            gain_db: 0.0,
            muted: false,
            agc_enabled: false,
            ignored: false,
            auto_routing_disabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioGainInfo {
    pub gain_db: f32,
    pub muted: bool,
    pub agc_enabled: bool,
}

/// Which fields of an [`AudioGainInfo`] to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetGainFlags {
    pub gain: bool,
    pub mute: bool,
    pub agc: bool,
}

impl SetGainFlags {
    pub const ALL: SetGainFlags = SetGainFlags {
        gain: true,
        mute: true,
        agc: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    PendingInit,
    Active,
    Unplugged,
    Removed,
}

#[derive(Debug, Clone, Copy)]
struct PlugState {
    plugged: bool,
    plug_time: i64,
}

/// Output or input device
pub struct AudioDevice {
    object: AudioObject,
    name: String,
    unique_id: DeviceId,
    driver: Option<Arc<dyn AudioDriver>>,
    state: Mutex<DeviceState>,
    plug: Mutex<PlugState>,
    settings: Mutex<DeviceSettings>,
    system_gain_dirty: AtomicBool,
}

impl AudioDevice {
    fn new(
        kind: ObjectKind,
        name: impl Into<String>,
        unique_id: DeviceId,
        driver: Option<Arc<dyn AudioDriver>>,
    ) -> Self {
        Self {
            object: AudioObject::new(kind),
            name: name.into(),
            unique_id,
            driver,
            state: Mutex::new(DeviceState::PendingInit),
            plug: Mutex::new(PlugState {
                plugged: false,
                plug_time: 0,
            }),
            settings: Mutex::new(DeviceSettings::default()),
            system_gain_dirty: AtomicBool::new(false),
        }
    }

    pub fn new_output(
        name: impl Into<String>,
        unique_id: DeviceId,
        driver: Arc<dyn AudioDriver>,
    ) -> Arc<Self> {
        Arc::new(Self::new(ObjectKind::Output, name, unique_id, Some(driver)))
    }

    pub fn new_input(
        name: impl Into<String>,
        unique_id: DeviceId,
        driver: Arc<dyn AudioDriver>,
    ) -> Arc<Self> {
        Arc::new(Self::new(ObjectKind::Input, name, unique_id, Some(driver)))
    }

    /// Driverless output that keeps renderers flowing with no real device
    pub fn throttle_output() -> Arc<Self> {
        let device = Self::new(
            ObjectKind::Output,
            "throttle",
            DeviceId::new("throttle"),
            None,
        );
        *device.state.lock() = DeviceState::Active;
        *device.plug.lock() = PlugState {
            plugged: true,
            plug_time: 0,
        };
        Arc::new(device)
    }

    /// Token clients use to address this device
    pub fn token(&self) -> ObjectId {
        self.object.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique_id(&self) -> &DeviceId {
        &self.unique_id
    }

    pub fn kind(&self) -> ObjectKind {
        self.object.kind()
    }

    pub fn is_output(&self) -> bool {
        self.object.is_output()
    }

    pub fn is_input(&self) -> bool {
        self.object.is_input()
    }

    pub fn driver(&self) -> Option<&Arc<dyn AudioDriver>> {
        self.driver.as_ref()
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: DeviceState) {
        *self.state.lock() = state;
    }

    pub fn is_active(&self) -> bool {
        self.state() == DeviceState::Active
    }

    pub fn plugged(&self) -> bool {
        self.plug.lock().plugged
    }

    pub fn plug_time(&self) -> i64 {
        self.plug.lock().plug_time
    }

    /// Record a plug change; returns false when the state did not change
    pub fn update_plug_state(&self, plugged: bool, plug_time: i64) -> bool {
        let mut plug = self.plug.lock();
        if plug.plugged == plugged {
            return false;
        }
        plug.plugged = plugged;
        plug.plug_time = plug_time;
        true
    }

    pub fn settings(&self) -> DeviceSettings {
        self.settings.lock().clone()
    }

    pub fn set_settings(&self, settings: DeviceSettings) {
        *self.settings.lock() = settings;
    }

    pub fn auto_routing_disabled(&self) -> bool {
        self.settings.lock().auto_routing_disabled
    }

    pub fn system_gain_dirty(&self) -> bool {
        self.system_gain_dirty.load(Ordering::Acquire)
    }

    pub fn set_system_gain_dirty(&self, dirty: bool) {
        self.system_gain_dirty.store(dirty, Ordering::Release);
    }

    pub fn gain_info(&self) -> AudioGainInfo {
        let settings = self.settings.lock();
        AudioGainInfo {
            gain_db: settings.gain_db,
            muted: settings.muted,
            agc_enabled: settings.agc_enabled,
        }
    }

    /// Apply the flagged fields, clamping gain to the supported range
    pub fn set_gain_info(&self, info: AudioGainInfo, flags: SetGainFlags) {
        {
            let mut settings = self.settings.lock();
            if flags.gain && !info.gain_db.is_nan() {
                settings.gain_db = info.gain_db.clamp(MIN_GAIN_DB, MAX_GAIN_DB);
            }
            if flags.mute {
                settings.muted = info.muted;
            }
            if flags.agc {
                settings.agc_enabled = info.agc_enabled;
            }
        }
        self.apply_gain_to_links();
    }

    /// Gain this device contributes to its links
    pub fn effective_gain_db(&self) -> f32 {
        let settings = self.settings.lock();
        if settings.muted {
            MUTED_GAIN_DB
        } else {
            settings.gain_db
        }
    }

    fn apply_gain_to_links(&self) {
        let db = self.effective_gain_db();
        if self.is_input() {
            self.object
                .for_each_dest_link(|link| link.gain().set_source_gain(db));
        } else if self.is_output() {
            self.object
                .for_each_source_link(|link| link.gain().set_dest_gain(db));
        }
        debug!(device = %self.unique_id, gain_db = db, "Applied device gain to links");
    }
}

impl AudioNode for AudioDevice {
    fn as_object(&self) -> &AudioObject {
        &self.object
    }

    fn format(&self) -> Option<StreamFormat> {
        self.driver.as_ref().and_then(|d| d.format())
    }

    fn as_device(&self) -> Option<&AudioDevice> {
        Some(self)
    }

    fn initialize_dest_link(&self, link: &Arc<AudioLink>) -> Result<()> {
        if self.is_input() {
            link.gain().set_source_gain(self.effective_gain_db());
        }
        Ok(())
    }

    fn initialize_source_link(&self, link: &Arc<AudioLink>) -> Result<()> {
        if self.driver.is_some() {
            link.gain().set_dest_gain(self.effective_gain_db());
        }
        Ok(())
    }
}

impl fmt::Debug for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioDevice")
            .field("id", &self.object.id())
            .field("kind", &self.kind())
            .field("name", &self.name)
            .field("unique_id", &self.unique_id)
            .field("state", &self.state())
            .field("plugged", &self.plugged())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audio::SampleFormat;
    use crate::domain::object::link_objects;

    struct FixedDriver;

    impl AudioDriver for FixedDriver {
        fn format(&self) -> Option<StreamFormat> {
            Some(StreamFormat::new(SampleFormat::Signed16, 2, 48_000))
        }

        fn snapshot_ring_buffer(&self) -> RingBufferSnapshot {
            RingBufferSnapshot::default()
        }
    }

    struct Sink(AudioObject);

    impl AudioNode for Sink {
        fn as_object(&self) -> &AudioObject {
            &self.0
        }
    }

    #[test]
    fn test_plug_state_changes_once() {
        let device = AudioDevice::new_input("mic", DeviceId::new("mic-0"), Arc::new(FixedDriver));
        assert!(!device.plugged());
        assert!(device.update_plug_state(true, 10));
        assert!(!device.update_plug_state(true, 20));
        assert_eq!(device.plug_time(), 10);
        assert!(device.update_plug_state(false, 30));
        assert_eq!(device.plug_time(), 30);
    }

    #[test]
    fn test_throttle_output() {
        let throttle = AudioDevice::throttle_output();
        assert!(throttle.is_output());
        assert!(throttle.plugged());
        assert!(throttle.driver().is_none());
        assert!(throttle.format().is_none());
    }

    #[test]
    fn test_set_gain_info_respects_flags() {
        let device = AudioDevice::new_input("mic", DeviceId::new("mic-0"), Arc::new(FixedDriver));
        device.set_gain_info(
            AudioGainInfo {
                gain_db: 100.0,
                muted: true,
                agc_enabled: true,
            },
            SetGainFlags {
                gain: true,
                ..Default::default()
            },
        );

        let info = device.gain_info();
        assert_eq!(info.gain_db, MAX_GAIN_DB);
        assert!(!info.muted);
        assert!(!info.agc_enabled);
    }

    #[test]
    fn test_input_gain_flows_to_dest_links() {
        let device = AudioDevice::new_input("mic", DeviceId::new("mic-0"), Arc::new(FixedDriver));
        let source: Arc<dyn AudioNode> = device.clone();
        let sink: Arc<dyn AudioNode> = Arc::new(Sink(AudioObject::new(ObjectKind::Capturer)));
        let link = link_objects(&source, &sink).expect("link");

        device.set_gain_info(
            AudioGainInfo {
                gain_db: -12.0,
                muted: false,
                agc_enabled: false,
            },
            SetGainFlags::ALL,
        );
        assert_eq!(link.gain().source_gain_db(), -12.0);

        device.set_gain_info(
            AudioGainInfo {
                gain_db: -12.0,
                muted: true,
                agc_enabled: false,
            },
            SetGainFlags::ALL,
        );
        assert!(link.gain().is_silent());
    }

    #[test]
    fn test_settings_serde_defaults() {
        let settings: DeviceSettings = serde_json::from_str(r#"{"gain_db": -3.0}"#).expect("json");
        assert_eq!(settings.gain_db, -3.0);
        assert!(!settings.muted);
        assert!(!settings.ignored);
    }
}

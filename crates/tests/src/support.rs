//! Shared fixtures for the integration tests

use chorale_core::domain::admin::{AudioAdmin, CaptureUsage};
use chorale_core::domain::audio::{DeviceId, SampleFormat, StreamFormat};
use chorale_core::domain::capturer::{
    mix_event_channel, AudioCapturer, CaptureContext, CapturePacket, CaptureTuning,
    CapturerClient, MixEvent,
};
use chorale_core::domain::clock::{Clock, ManualClock};
use chorale_core::domain::config::ChoraleConfig;
use chorale_core::domain::device::{AudioDevice, DeviceState};
use chorale_core::domain::device_manager::{
    AudioDeviceManager, DeviceSettingsStore, InMemorySettingsStore, SystemAudioPolicy,
};
use chorale_core::domain::mixer::MixerSettings;
use chorale_core::domain::volume::StreamVolumeManager;
use chorale_infra::{Signal, VirtualRingDriver};
use crossbeam::channel::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Start of every manual timeline
pub const T0: i64 = 1_000_000_000;

/// Ring length of fixture devices, in milliseconds
pub const RING_MS: u32 = 100;

pub fn device_format() -> StreamFormat {
    StreamFormat::new(SampleFormat::Float, 2, 48_000)
}

pub fn voice_format() -> StreamFormat {
    StreamFormat::new(SampleFormat::Signed16, 1, 8_000)
}

pub struct Fixture {
    pub clock: Arc<ManualClock>,
    pub volume: Arc<StreamVolumeManager>,
    pub admin: Arc<AudioAdmin>,
    pub manager: AudioDeviceManager,
    pub events: Receiver<MixEvent>,
    pub ctx: CaptureContext,
}

pub fn fixture() -> Fixture {
    fixture_with_store(Arc::new(InMemorySettingsStore::new()))
}

pub fn fixture_with_store(store: Arc<dyn DeviceSettingsStore>) -> Fixture {
    let config = ChoraleConfig::factory_default();
    let clock = Arc::new(ManualClock::new(T0));
    let volume = Arc::new(StreamVolumeManager::new());
    let admin = Arc::new(AudioAdmin::new(config.policy.behavior_gain, volume.clone()));
    admin.load_rules(&config.policy.rules);

    let (events, rx) = mix_event_channel();
    let ctx = CaptureContext {
        clock: clock.clone(),
        admin: admin.clone(),
        volume: volume.clone(),
        events,
        tuning: CaptureTuning::default(),
        mixer_settings: MixerSettings::default(),
    };

    Fixture {
        clock,
        volume,
        admin,
        manager: AudioDeviceManager::new(Arc::new(SystemAudioPolicy::default()), store),
        events: rx,
        ctx,
    }
}

impl Fixture {
    pub fn driver(&self, format: StreamFormat, signal: Signal) -> Arc<VirtualRingDriver> {
        let ring_frames = (format.frames_per_second * RING_MS / 1_000) as usize;
        VirtualRingDriver::new(format, ring_frames, self.clock.clone(), signal)
    }

    pub fn input(&self, id: &str, signal: Signal) -> Arc<AudioDevice> {
        AudioDevice::new_input(id, DeviceId::new(id), self.driver(device_format(), signal))
    }

    pub fn output(&self, id: &str, signal: Signal) -> Arc<AudioDevice> {
        AudioDevice::new_output(id, DeviceId::new(id), self.driver(device_format(), signal))
    }

    /// Add `device` to the manager and plug it at `plug_time`
    pub fn plug(&self, device: &Arc<AudioDevice>, plug_time: i64) {
        if device.state() == DeviceState::PendingInit {
            self.manager.add_device(device.clone());
        }
        self.manager.on_plug_state_changed(device, true, plug_time);
    }

    pub fn capturer(&self, loopback: bool, usage: CaptureUsage) -> Arc<AudioCapturer> {
        AudioCapturer::new(loopback, usage, self.ctx.clone())
    }

    pub fn advance_ms(&self, ms: u64) {
        self.clock.advance(Duration::from_millis(ms));
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Deliver every pending mix event, as the request loop would
    pub fn drain(&self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.events.try_recv() {
            event.dispatch();
            count += 1;
        }
        count
    }
}

/// Client that keeps every packet it is handed
#[derive(Default)]
pub struct Recorder {
    packets: Mutex<Vec<CapturePacket>>,
    end_of_stream: Mutex<bool>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn packets(&self) -> Vec<CapturePacket> {
        self.packets.lock().unwrap().clone()
    }

    pub fn saw_end_of_stream(&self) -> bool {
        *self.end_of_stream.lock().unwrap()
    }
}

impl CapturerClient for Recorder {
    fn on_packet_produced(&self, packet: CapturePacket) {
        self.packets.lock().unwrap().push(packet);
    }

    fn on_end_of_stream(&self) {
        *self.end_of_stream.lock().unwrap() = true;
    }
}

/// Signed 16-bit samples from a payload byte range
pub fn s16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|s| i16::from_le_bytes([s[0], s[1]]))
        .collect()
}

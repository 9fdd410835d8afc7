//! Domain entities and business rules

pub mod admin;
pub mod audio;
pub mod capturer;
pub mod clock;
pub mod config;
pub mod device;
pub mod device_manager;
pub mod filter;
pub mod gain;
pub mod mixer;
pub mod object;
pub mod renderer;
pub mod timeline;
pub mod volume;

// Re-export specific items to avoid ambiguous glob imports
pub use admin::{AudioAdmin, Behavior, BehaviorGain, CaptureUsage, InteractionRule, RenderUsage, Usage};
pub use audio::{AudioError, AudioStreamType, DeviceId, SampleFormat, StreamFormat};
pub use capturer::{
    mix_event_channel, AudioCapturer, CaptureContext, CaptureMixer, CapturePacket, CaptureState,
    CaptureTuning, CapturerClient, MixEvent, MixEventKind, PayloadBuffer, ProcessOutcome,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ChoraleConfig, ConfigError, ConfigManager, ConfigWatcher};
pub use device::{AudioDevice, AudioDriver, AudioGainInfo, RingBuffer, RingBufferSnapshot};
pub use device_manager::{AudioDeviceManager, DeviceEvent, DeviceInfo, DeviceSettingsStore, SystemAudioPolicy};
pub use mixer::{Mixer, MixerSettings};
pub use object::{link_objects, AudioLink, AudioNode, AudioObject, ObjectId, ObjectKind};
pub use renderer::AudioRenderer;
pub use timeline::{TimelineFunction, TimelineRate};
pub use volume::StreamVolumeManager;

//! Device routing through the manager
//!
//! Capturers and renderers follow the most recently plugged device of the
//! matching kind; device settings persist through the JSON store.

use crate::support::{fixture, fixture_with_store, voice_format};
use chorale_core::domain::admin::{CaptureUsage, RenderUsage};
use chorale_core::domain::device::{AudioGainInfo, SetGainFlags};
use chorale_core::domain::device_manager::DeviceEvent;
use chorale_core::domain::object::AudioNode;
use chorale_core::domain::renderer::AudioRenderer;
use chorale_infra::{JsonFileSettingsStore, Signal};
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn test_capturer_follows_last_plugged_input() {
    let f = fixture();
    let (m1, m2, m3) = (
        f.input("mic-1", Signal::Silence),
        f.input("mic-2", Signal::Silence),
        f.input("mic-3", Signal::Silence),
    );
    let capturer = f.capturer(false, CaptureUsage::Foreground);
    f.manager.add_capturer(capturer.clone());
    assert_eq!(capturer.as_object().source_link_count(), 0);

    f.plug(&m1, 1);
    f.plug(&m2, 2);
    assert_eq!(f.manager.default_input_token(), Some(m2.token()));
    assert!(capturer.as_object().has_source(m2.token()));
    assert!(!capturer.as_object().has_source(m1.token()));

    f.plug(&m3, 3);
    assert!(capturer.as_object().has_source(m3.token()));
    assert_eq!(capturer.as_object().source_link_count(), 1);

    // Unplugging a non-default device changes nothing
    f.manager.on_plug_state_changed(&m1, false, 4);
    assert!(capturer.as_object().has_source(m3.token()));

    // Unplugging the default falls back to the next most recent
    f.manager.on_plug_state_changed(&m3, false, 5);
    assert_eq!(f.manager.default_input_token(), Some(m2.token()));
    assert!(capturer.as_object().has_source(m2.token()));
    assert_eq!(capturer.as_object().source_link_count(), 1);
}

#[test]
fn test_loopback_capturer_follows_output() {
    let f = fixture();
    let mic = f.input("mic", Signal::Silence);
    let speakers = f.output("speakers", Signal::Silence);
    let headphones = f.output("headphones", Signal::Silence);
    f.plug(&mic, 1);
    f.plug(&speakers, 2);

    let loopback = f.capturer(true, CaptureUsage::Background);
    let regular = f.capturer(false, CaptureUsage::Background);
    f.manager.add_capturer(loopback.clone());
    f.manager.add_capturer(regular.clone());

    assert!(loopback.as_object().has_source(speakers.token()));
    assert!(!loopback.as_object().has_source(mic.token()));
    assert!(regular.as_object().has_source(mic.token()));

    f.plug(&headphones, 3);
    assert!(loopback.as_object().has_source(headphones.token()));
    assert!(!loopback.as_object().has_source(speakers.token()));
    assert!(regular.as_object().has_source(mic.token()));
}

#[test]
fn test_capturer_takes_source_format_until_set() {
    let f = fixture();
    let mic = f.input("mic", Signal::Silence);
    f.plug(&mic, 1);

    let capturer = f.capturer(false, CaptureUsage::Foreground);
    f.manager.add_capturer(capturer.clone());
    assert_eq!(capturer.stream_type().format, crate::support::device_format());

    capturer.set_format(voice_format()).unwrap();
    assert_eq!(capturer.stream_type().format, voice_format());
}

#[test]
fn test_renderer_links_throttle_and_default_output() {
    let f = fixture();
    let speakers = f.output("speakers", Signal::Silence);
    let headphones = f.output("headphones", Signal::Silence);
    f.plug(&speakers, 1);

    let renderer = AudioRenderer::new(RenderUsage::Media, f.admin.clone(), f.volume.clone());
    renderer.set_format(crate::support::device_format()).unwrap();
    f.manager.add_renderer(renderer.clone());

    let throttle = f.manager.throttle_output().token();
    assert!(renderer.as_object().has_dest(throttle));
    assert!(renderer.as_object().has_dest(speakers.token()));

    f.plug(&headphones, 2);
    assert!(renderer.as_object().has_dest(throttle));
    assert!(renderer.as_object().has_dest(headphones.token()));
    assert!(!renderer.as_object().has_dest(speakers.token()));
}

#[test]
fn test_default_change_is_announced() {
    let f = fixture();
    let mut events = f.manager.subscribe();
    let mic = f.input("mic", Signal::Silence);
    f.plug(&mic, 1);

    let mut saw_default = false;
    while let Ok(event) = events.try_recv() {
        if let DeviceEvent::DefaultDeviceChanged { is_input, new, .. } = event {
            assert!(is_input);
            assert_eq!(new, Some(mic.token()));
            saw_default = true;
        }
    }
    assert!(saw_default);
}

#[test]
fn test_device_gain_survives_restart() {
    let temp = TempDir::new().unwrap();
    let gain = AudioGainInfo {
        gain_db: -12.0,
        muted: true,
        agc_enabled: false,
    };

    {
        let f = fixture_with_store(Arc::new(JsonFileSettingsStore::new(temp.path())));
        let mic = f.input("usb-mic", Signal::Silence);
        f.plug(&mic, 1);
        f.manager
            .set_device_gain(mic.token(), gain, SetGainFlags::ALL)
            .unwrap();
        f.manager.shutdown();
    }

    let f = fixture_with_store(Arc::new(JsonFileSettingsStore::new(temp.path())));
    let mic = f.input("usb-mic", Signal::Silence);
    f.plug(&mic, 1);
    assert_eq!(f.manager.get_device_gain(mic.token()), Some(gain));
}

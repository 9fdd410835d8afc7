//! Usage policy driven by live streams and by the config file

use crate::support::{device_format, fixture};
use chorale_core::domain::admin::{Behavior, CaptureUsage, InteractionRule, RenderUsage, Usage};
use chorale_core::domain::config::{ChoraleConfig, ConfigManager};
use chorale_core::domain::object::{AudioNode, ObjectId};
use chorale_core::domain::renderer::AudioRenderer;
use chorale_infra::Signal;
use tempfile::TempDir;

fn media() -> Usage {
    Usage::Render(RenderUsage::Media)
}

#[test]
fn test_communication_renderer_ducks_media() {
    let f = fixture();
    let music = AudioRenderer::new(RenderUsage::Media, f.admin.clone(), f.volume.clone());
    let call = AudioRenderer::new(RenderUsage::Communication, f.admin.clone(), f.volume.clone());

    music.play();
    assert_eq!(f.volume.usage_gain_adjustment(media()), 0.0);

    call.play();
    assert_eq!(f.admin.highest_priority_active(), Some(Usage::Render(RenderUsage::Communication)));
    assert_eq!(f.volume.usage_gain_adjustment(media()), -35.0);
    assert_eq!(
        f.volume
            .usage_gain_adjustment(Usage::Render(RenderUsage::Communication)),
        0.0
    );

    call.pause();
    assert_eq!(f.volume.usage_gain_adjustment(media()), 0.0);
}

#[test]
fn test_capturer_usage_change_moves_activity() {
    let f = fixture();
    let mic = f.input("mic", Signal::Silence);
    f.plug(&mic, 1);

    let capturer = f.capturer(false, CaptureUsage::Foreground);
    f.manager.add_capturer(capturer.clone());
    let payload = chorale_core::domain::capturer::PayloadBuffer::new(
        device_format().bytes_per_frame() * 480,
    );
    let _mixer = capturer
        .add_payload_buffer(0, std::sync::Arc::new(payload))
        .unwrap();
    capturer.capture_at(0, 480, None).unwrap();
    assert!(f.admin.is_active(Usage::Capture(CaptureUsage::Foreground)));

    capturer.set_usage(CaptureUsage::Communication).unwrap();
    assert!(!f.admin.is_active(Usage::Capture(CaptureUsage::Foreground)));
    assert!(f.admin.is_active(Usage::Capture(CaptureUsage::Communication)));
    assert_eq!(f.volume.usage_gain_adjustment(media()), -35.0);

    f.manager.remove_capturer(&capturer);
    assert!(!f.admin.is_active(Usage::Capture(CaptureUsage::Communication)));
    assert_eq!(f.volume.usage_gain_adjustment(media()), 0.0);
}

#[test]
fn test_ducking_reaches_capture_links() {
    let f = fixture();
    let mic = f.input("mic", Signal::Silence);
    f.plug(&mic, 1);

    let capturer = f.capturer(false, CaptureUsage::Background);
    f.manager.add_capturer(capturer.clone());
    let link = capturer.as_object().source_links()[0].clone();
    assert_eq!(link.gain().dest_gain_db(), 0.0);

    f.admin.load_rules(&[InteractionRule {
        active: Usage::Capture(CaptureUsage::Communication),
        affected: Usage::Capture(CaptureUsage::Background),
        behavior: Behavior::Duck,
    }]);
    f.admin
        .update_capturer_state(CaptureUsage::Communication, true, ObjectId::next());
    assert_eq!(link.gain().dest_gain_db(), -35.0);

    capturer.set_gain(-6.0).unwrap();
    assert_eq!(link.gain().dest_gain_db(), -41.0);
}

#[tokio::test]
async fn test_rules_reload_from_config_file() {
    let temp = TempDir::new().unwrap();
    let manager = ConfigManager::new(temp.path().to_path_buf());

    let f = fixture();
    f.admin
        .update_capturer_state(CaptureUsage::SystemAgent, true, ObjectId::next());
    assert_eq!(f.volume.usage_gain_adjustment(media()), 0.0);

    tokio::fs::write(
        manager.config_path(),
        r#"
[[policy.rules]]
active = { capture = "system_agent" }
affected = { render = "media" }
behavior = "mute"
"#,
    )
    .await
    .unwrap();

    let config: ChoraleConfig = manager.load().await;
    assert_eq!(config.policy.rules.len(), 1);
    f.admin.load_rules(&config.policy.rules);
    assert_eq!(f.volume.usage_gain_adjustment(media()), -160.0);

    f.admin.load_rules(&[]);
    assert_eq!(f.volume.usage_gain_adjustment(media()), 0.0);
}

//! Example walking through configuration and the usage policy it drives
//!
//! Run with: cargo run --package chorale-core --example config_demo

use chorale_core::domain::admin::{AudioAdmin, CaptureUsage, RenderUsage, Usage};
use chorale_core::domain::config::{ChoraleConfig, ConfigManager};
use chorale_core::domain::object::ObjectId;
use chorale_core::domain::volume::StreamVolumeManager;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("chorale_core=debug,info")
        .init();

    println!("=== Chorale Configuration Demo ===\n");

    // 1. Factory defaults, saved into a scratch config directory
    let dir = tempfile::tempdir()?;
    let manager = ConfigManager::new(dir.path().to_path_buf());
    let config = ChoraleConfig::factory_default();
    manager.save(&config).await?;
    println!("1. Saved factory defaults to {}", manager.config_path().display());

    // 2. Load them back
    let loaded = manager.load().await;
    println!(
        "2. Loaded {} interaction rules (duck {} dB, mute {} dB)",
        loaded.policy.rules.len(),
        loaded.policy.behavior_gain.duck_gain_db,
        loaded.policy.behavior_gain.mute_gain_db
    );
    for rule in &loaded.policy.rules {
        println!(
            "   {} active -> {} {:?}",
            rule.active, rule.affected, rule.behavior
        );
    }

    // 3. Drive the policy with them
    let volume = Arc::new(StreamVolumeManager::new());
    let admin = AudioAdmin::new(loaded.policy.behavior_gain, volume.clone());
    admin.load_rules(&loaded.policy.rules);

    let media = Usage::Render(RenderUsage::Media);
    println!("\n3. Media adjustment while idle: {} dB", volume.usage_gain_adjustment(media));

    let call = ObjectId::next();
    admin.update_capturer_state(CaptureUsage::Communication, true, call);
    println!(
        "   Media adjustment during a call capture: {} dB",
        volume.usage_gain_adjustment(media)
    );

    admin.update_capturer_state(CaptureUsage::Communication, false, call);
    println!(
        "   Media adjustment after the call: {} dB",
        volume.usage_gain_adjustment(media)
    );

    // 4. Capture tuning and resampler choice
    println!(
        "\n4. Capture tuning: {} ms per capture, {} ms assumed source fence",
        loaded.capture.max_time_per_capture_ns() / 1_000_000,
        loaded.capture.assumed_worst_source_fence_ns() / 1_000_000
    );
    println!("   Resampler: {:?}", loaded.mixer.resampler);

    println!("\n=== Demo Complete ===");
    Ok(())
}

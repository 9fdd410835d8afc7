//! Chorale CLI Application
//!
//! Runs the capture pipeline against virtual devices: a microphone and a
//! speaker whose rings are driven by the system clock. One capturer records
//! from the default input (or the default output with `--loopback`) and the
//! packets it produces are logged.

use anyhow::Context;
use chorale_core::domain::admin::{AudioAdmin, CaptureUsage};
use chorale_core::domain::audio::{DeviceId, SampleFormat, StreamFormat};
use chorale_core::domain::capturer::{
    mix_event_channel, AudioCapturer, CaptureContext, CapturePacket, CapturerClient,
    PayloadBuffer, NO_TIMESTAMP,
};
use chorale_core::domain::clock::{Clock, SystemClock};
use chorale_core::domain::config::{ChoraleConfig, ConfigManager, ConfigWatcher};
use chorale_core::domain::device::AudioDevice;
use chorale_core::domain::device_manager::{AudioDeviceManager, SystemAudioPolicy};
use chorale_core::domain::volume::StreamVolumeManager;
use chorale_infra::{JsonFileSettingsStore, MixDomain, RequestLoop, Signal, VirtualRingDriver};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Ring length of the virtual devices
const VIRTUAL_RING_MS: usize = 100;

#[derive(Parser)]
#[command(name = "chorale")]
#[command(about = "Audio capture and routing core", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration directory (defaults to the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Capture from a virtual device and log the packets
    Run {
        /// Capture what the default output plays instead of the default input
        #[arg(long)]
        loopback: bool,

        /// Capture frame rate
        #[arg(long, default_value_t = 16_000)]
        rate: u32,

        /// Capture channel count
        #[arg(long, default_value_t = 1)]
        channels: u32,

        /// Frames per packet in async mode
        #[arg(long, default_value_t = 160)]
        frames_per_packet: u32,

        /// Stop after this many seconds (runs until Ctrl-C if omitted)
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Write the factory default configuration
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => ConfigManager::default_config_dir()?,
    };
    let manager = ConfigManager::new(config_dir);

    match cli.command.unwrap_or(Command::Run {
        loopback: false,
        rate: 16_000,
        channels: 1,
        frames_per_packet: 160,
        seconds: None,
    }) {
        Command::InitConfig { force } => init_config(&manager, force).await,
        Command::Run {
            loopback,
            rate,
            channels,
            frames_per_packet,
            seconds,
        } => {
            let format = StreamFormat::new(SampleFormat::Signed16, channels, rate);
            run(&manager, loopback, format, frames_per_packet, seconds).await
        }
    }
}

async fn init_config(manager: &ConfigManager, force: bool) -> anyhow::Result<()> {
    if manager.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite",
            manager.config_path().display()
        );
    }
    manager.save(&ChoraleConfig::factory_default()).await?;
    println!("Wrote {}", manager.config_path().display());
    Ok(())
}

/// Logs packets and tracks the peak level of what was captured
struct PacketLogger {
    payload: Arc<PayloadBuffer>,
    format: StreamFormat,
    packets: AtomicU64,
    frames: AtomicU64,
}

impl PacketLogger {
    fn peak(&self, packet: &CapturePacket) -> f32 {
        let data = self.payload.read();
        let start = usize::try_from(packet.payload_offset).unwrap_or(usize::MAX);
        let len = usize::try_from(packet.payload_size).unwrap_or(0);
        let Some(bytes) = data.get(start..start.saturating_add(len)) else {
            return 0.0;
        };
        let sample_size = self.format.sample_format.bytes_per_sample();
        bytes
            .chunks_exact(sample_size)
            .map(|s| self.format.sample_format.decode(s).abs())
            .fold(0.0, f32::max)
    }
}

impl CapturerClient for PacketLogger {
    fn on_packet_produced(&self, packet: CapturePacket) {
        let count = self.packets.fetch_add(1, Ordering::Relaxed) + 1;
        let frames = packet.payload_size / self.format.bytes_per_frame() as u64;
        self.frames.fetch_add(frames, Ordering::Relaxed);

        let pts = (packet.pts != NO_TIMESTAMP).then_some(packet.pts);
        debug!(
            pts = ?pts,
            offset = packet.payload_offset,
            size = packet.payload_size,
            flags = packet.flags,
            "Packet"
        );
        if count % 100 == 1 {
            info!(packets = count, peak = self.peak(&packet), "Capturing");
        }
    }

    fn on_end_of_stream(&self) {
        info!("Capture stopped");
    }
}

async fn run(
    manager: &ConfigManager,
    loopback: bool,
    format: StreamFormat,
    frames_per_packet: u32,
    seconds: Option<u64>,
) -> anyhow::Result<()> {
    info!("Chorale starting...");
    format.validate()?;

    let config = manager.load().await;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());

    let volume = Arc::new(StreamVolumeManager::new());
    let admin = Arc::new(AudioAdmin::new(config.policy.behavior_gain, volume.clone()));
    admin.load_rules(&config.policy.rules);

    let store = JsonFileSettingsStore::new(manager.device_settings_dir(&config));
    let devices = Arc::new(AudioDeviceManager::new(
        Arc::new(SystemAudioPolicy::default()),
        Arc::new(store),
    ));

    let (events, events_rx) = mix_event_channel();
    let requests = Arc::new(RequestLoop::spawn(events_rx)?);
    let mut mix = MixDomain::spawn("capture", clock.clone())?;

    // Virtual hardware
    let device_format = StreamFormat::new(SampleFormat::Float, 2, 48_000);
    let ring_frames = device_format.frames_per_second as usize * VIRTUAL_RING_MS / 1_000;
    let microphone = AudioDevice::new_input(
        "Virtual Microphone",
        DeviceId::new("virtual-mic-0"),
        VirtualRingDriver::new(
            device_format,
            ring_frames,
            clock.clone(),
            Signal::Sine {
                frequency_hz: 440.0,
                amplitude: 0.5,
            },
        ),
    );
    let speakers = AudioDevice::new_output(
        "Virtual Speakers",
        DeviceId::new("virtual-speakers-0"),
        VirtualRingDriver::new(
            device_format,
            ring_frames,
            clock.clone(),
            Signal::Sine {
                frequency_hz: 1_000.0,
                amplitude: 0.25,
            },
        ),
    );

    let ctx = CaptureContext {
        clock: clock.clone(),
        admin: admin.clone(),
        volume: volume.clone(),
        events,
        tuning: config.capture,
        mixer_settings: config.mixer,
    };

    let payload = Arc::new(PayloadBuffer::new(
        format.frames_per_second as usize * format.bytes_per_frame(),
    ));
    let logger = Arc::new(PacketLogger {
        payload: payload.clone(),
        format,
        packets: AtomicU64::new(0),
        frames: AtomicU64::new(0),
    });

    let (capturer, mixer) = {
        let devices = devices.clone();
        let logger = logger.clone();
        let plug_time = clock.now();
        requests.call(move || -> anyhow::Result<_> {
            for device in [microphone, speakers] {
                devices.add_device(device.clone());
                devices.on_plug_state_changed(&device, true, plug_time);
            }

            let capturer = AudioCapturer::new(loopback, CaptureUsage::Foreground, ctx);
            capturer.set_client(logger);
            devices.add_capturer(capturer.clone());
            capturer.set_format(format)?;
            let mixer = capturer.add_payload_buffer(0, payload)?;
            capturer.start_async_capture(frames_per_packet)?;
            Ok((capturer, mixer))
        })??
    };
    let mix_task = mix.run_capturer(mixer);

    info!(
        loopback,
        rate = format.frames_per_second,
        channels = format.channels,
        frames_per_packet,
        "Capture running"
    );

    // Policy hot reload
    let watcher = ConfigWatcher::new(manager.config_dir().to_path_buf()).await;
    let reload = match watcher {
        Ok(watcher) => {
            let mut changes = watcher.subscribe();
            let config_path = manager.config_path().to_path_buf();
            let admin = admin.clone();
            let requests = requests.clone();
            Some(tokio::spawn(async move {
                let _watcher = watcher;
                while let Ok(path) = changes.recv().await {
                    if path != config_path {
                        continue;
                    }
                    match ChoraleConfig::load_from_file(&path).await {
                        Ok(config) => {
                            let admin = admin.clone();
                            let rules = config.policy.rules;
                            if requests.post(move || admin.load_rules(&rules)).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring invalid config change"),
                    }
                }
            }))
        }
        Err(e) => {
            warn!(error = %e, "Config hot reload unavailable");
            None
        }
    };

    match seconds {
        Some(seconds) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
        }
    }

    info!("Chorale shutting down...");
    if let Some(reload) = reload {
        reload.abort();
    }

    let (stopped_tx, stopped_rx) = tokio::sync::oneshot::channel();
    {
        let capturer = capturer.clone();
        requests.post(move || {
            let result = capturer.stop_async_capture(Some(Box::new(move || {
                let _ = stopped_tx.send(());
            })));
            if let Err(e) = result {
                warn!(error = %e, "Stop failed");
            }
        })?;
    }
    if tokio::time::timeout(Duration::from_secs(1), stopped_rx)
        .await
        .is_err()
    {
        warn!("Capture did not stop in time");
    }

    {
        let devices = devices.clone();
        requests.call(move || devices.shutdown())?;
    }
    if let Err(e) = mix_task.await {
        warn!(error = %e, "Mix task ended abnormally");
    }
    mix.shutdown();

    info!(
        packets = logger.packets.load(Ordering::Relaxed),
        frames = logger.frames.load(Ordering::Relaxed),
        "Capture summary"
    );
    Ok(())
}

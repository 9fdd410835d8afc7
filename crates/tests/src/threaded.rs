//! Capture on real threads: the request loop and a mix domain on the system clock

use crate::support::voice_format;
use chorale_core::domain::admin::{AudioAdmin, CaptureUsage};
use chorale_core::domain::audio::{DeviceId, SampleFormat, StreamFormat};
use chorale_core::domain::capturer::{
    mix_event_channel, AudioCapturer, CaptureContext, CapturePacket, CaptureState,
    CaptureTuning, CapturerClient, PayloadBuffer,
};
use chorale_core::domain::clock::{Clock, SystemClock};
use chorale_core::domain::config::ChoraleConfig;
use chorale_core::domain::device::AudioDevice;
use chorale_core::domain::device_manager::{
    AudioDeviceManager, InMemorySettingsStore, SystemAudioPolicy,
};
use chorale_core::domain::mixer::MixerSettings;
use chorale_core::domain::volume::StreamVolumeManager;
use chorale_infra::{MixDomain, RequestLoop, Signal, VirtualRingDriver};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

struct ChannelClient {
    packets: Mutex<mpsc::Sender<(CapturePacket, ThreadId)>>,
}

impl CapturerClient for ChannelClient {
    fn on_packet_produced(&self, packet: CapturePacket) {
        let _ = self
            .packets
            .lock()
            .unwrap()
            .send((packet, thread::current().id()));
    }

    fn on_end_of_stream(&self) {}
}

#[test]
fn test_async_capture_on_threads() {
    let config = ChoraleConfig::factory_default();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let volume = Arc::new(StreamVolumeManager::new());
    let admin = Arc::new(AudioAdmin::new(config.policy.behavior_gain, volume.clone()));
    let manager = Arc::new(AudioDeviceManager::new(
        Arc::new(SystemAudioPolicy::default()),
        Arc::new(InMemorySettingsStore::new()),
    ));

    let (events, events_rx) = mix_event_channel();
    let mut requests = RequestLoop::spawn(events_rx).unwrap();
    let mut mix = MixDomain::spawn("test", clock.clone()).unwrap();

    let format = StreamFormat::new(SampleFormat::Signed16, 1, 16_000);
    let mic = AudioDevice::new_input(
        "mic",
        DeviceId::new("mic"),
        VirtualRingDriver::new(format, 1_600, clock.clone(), Signal::Constant(0.25)),
    );

    let ctx = CaptureContext {
        clock: clock.clone(),
        admin,
        volume,
        events,
        tuning: CaptureTuning::default(),
        mixer_settings: MixerSettings::default(),
    };
    let (packet_tx, packet_rx) = mpsc::channel();
    let client = Arc::new(ChannelClient {
        packets: Mutex::new(packet_tx),
    });

    let request_thread = requests.call(|| thread::current().id()).unwrap();
    let (capturer, mixer) = {
        let manager = manager.clone();
        let plug_time = clock.now();
        requests
            .call(move || {
                manager.add_device(mic.clone());
                manager.on_plug_state_changed(&mic, true, plug_time);

                let capturer = AudioCapturer::new(false, CaptureUsage::Foreground, ctx);
                capturer.set_client(client);
                manager.add_capturer(capturer.clone());
                capturer.set_format(voice_format()).unwrap();
                let payload = Arc::new(PayloadBuffer::new(800 * 2));
                let mixer = capturer.add_payload_buffer(0, payload).unwrap();
                capturer.start_async_capture(80).unwrap();
                (capturer, mixer)
            })
            .unwrap()
    };
    let _task = mix.run_capturer(mixer);

    let mut packets = Vec::new();
    for _ in 0..3 {
        let (packet, thread) = packet_rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(thread, request_thread);
        packets.push(packet);
    }
    assert_eq!(packets[1].pts - packets[0].pts, 10_000_000);
    assert_eq!(packets[2].pts - packets[1].pts, 10_000_000);
    assert_eq!(packets[1].payload_offset, 160);

    let (stopped_tx, stopped_rx) = mpsc::channel();
    {
        let capturer = capturer.clone();
        requests
            .call(move || {
                capturer
                    .stop_async_capture(Some(Box::new(move || {
                        let _ = stopped_tx.send(thread::current().id());
                    })))
                    .unwrap();
            })
            .unwrap();
    }
    assert_eq!(stopped_rx.recv_timeout(TIMEOUT).unwrap(), request_thread);
    let state = {
        let capturer = capturer.clone();
        requests.call(move || capturer.state()).unwrap()
    };
    assert_eq!(state, CaptureState::OperatingSync);

    {
        let manager = manager.clone();
        requests.call(move || manager.shutdown()).unwrap();
    }
    assert!(capturer.is_shutdown());

    mix.shutdown();
    requests.shutdown();
}

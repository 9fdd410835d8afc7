//! End-to-end capture on a manual clock
//!
//! Devices are virtual rings driven by the fixture clock, routed through the
//! manager. The test thread plays both execution domains: it runs mix passes
//! directly and drains mix events the way the request loop does.

use crate::support::{fixture, s16_samples, voice_format, Recorder};
use chorale_core::domain::admin::{CaptureUsage, RenderUsage, Usage};
use chorale_core::domain::capturer::{
    CaptureCallback, CapturePacket, CaptureState, PayloadBuffer, ProcessOutcome,
    FLAG_DISCONTINUITY,
};
use chorale_core::domain::object::AudioNode;
use chorale_infra::Signal;
use proptest::prelude::*;
use std::sync::{Arc, Mutex};

/// 0.5 full scale in S16, with room for resampler ripple
fn near_half_scale(sample: i16) -> bool {
    (15_500..=17_250).contains(&sample)
}

/// Packets collected from sync capture callbacks, and a callback factory
fn sync_packet_sink() -> (Arc<Mutex<Vec<CapturePacket>>>, impl Fn() -> Option<CaptureCallback>) {
    let packets = Arc::new(Mutex::new(Vec::new()));
    let sink = packets.clone();
    let make = move || -> Option<CaptureCallback> {
        let sink = sink.clone();
        Some(Box::new(move |packet| sink.lock().unwrap().push(packet)))
    };
    (packets, make)
}

#[test]
fn test_loopback_capture_resamples_output() {
    let f = fixture();
    let speakers = f.output("speakers", Signal::Constant(0.5));
    f.plug(&speakers, 1);
    f.advance_ms(50);

    let capturer = f.capturer(true, CaptureUsage::Foreground);
    f.manager.add_capturer(capturer.clone());
    capturer.set_format(voice_format()).unwrap();
    let payload = Arc::new(PayloadBuffer::new(160 * 2));
    let mut mixer = capturer.add_payload_buffer(0, payload.clone()).unwrap();

    let (packets, callback) = sync_packet_sink();
    let start = f.now();
    capturer.capture_at(0, 80, callback()).unwrap();

    // 80 frames at 8 kHz end 10 ms out; mixing waits for the 5 ms fence too
    assert_eq!(mixer.process(), ProcessOutcome::WakeAt(start + 15_000_000));
    f.advance_ms(15);
    assert_eq!(mixer.process(), ProcessOutcome::Idle);
    assert_eq!(f.drain(), 1);

    let packets = packets.lock().unwrap().clone();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].pts, start);
    assert_eq!(packets[0].payload_offset, 0);
    assert_eq!(packets[0].payload_size, 160);
    assert_ne!(packets[0].flags & FLAG_DISCONTINUITY, 0);

    let samples = s16_samples(&payload.read()[..160]);
    assert!(samples.iter().all(|s| near_half_scale(*s)), "{samples:?}");
}

#[test]
fn test_capture_switches_with_default_input() {
    let f = fixture();
    let low = f.input("low", Signal::Constant(-0.5));
    let high = f.input("high", Signal::Constant(0.5));
    f.plug(&low, 1);
    f.advance_ms(50);

    let capturer = f.capturer(false, CaptureUsage::Foreground);
    f.manager.add_capturer(capturer.clone());
    capturer.set_format(voice_format()).unwrap();
    let payload = Arc::new(PayloadBuffer::new(80 * 2));
    let mut mixer = capturer.add_payload_buffer(0, payload.clone()).unwrap();
    let (packets, callback) = sync_packet_sink();

    capturer.capture_at(0, 80, callback()).unwrap();
    mixer.process();
    f.advance_ms(15);
    mixer.process();
    f.drain();
    assert!(s16_samples(&payload.read()).iter().all(|s| near_half_scale(-*s)));

    f.plug(&high, 2);
    assert!(capturer.as_object().has_source(high.token()));

    capturer.capture_at(0, 80, callback()).unwrap();
    mixer.process();
    f.advance_ms(15);
    mixer.process();
    f.drain();
    assert!(s16_samples(&payload.read()).iter().all(|s| near_half_scale(*s)));

    let packets = packets.lock().unwrap().clone();
    assert_eq!(packets.len(), 2);
    // Each sync packet after an idle queue starts a new timeline
    assert!(packets.iter().all(|p| p.flags & FLAG_DISCONTINUITY != 0));
}

#[test]
fn test_async_capture_stream() {
    let f = fixture();
    let mic = f.input("mic", Signal::Constant(0.5));
    f.plug(&mic, 1);
    f.advance_ms(50);

    let capturer = f.capturer(false, CaptureUsage::Communication);
    f.manager.add_capturer(capturer.clone());
    capturer.set_format(voice_format()).unwrap();
    let payload = Arc::new(PayloadBuffer::new(400 * 2));
    let mut mixer = capturer.add_payload_buffer(0, payload.clone()).unwrap();
    let recorder = Recorder::new();
    capturer.set_client(recorder.clone());

    let start = f.now();
    capturer.start_async_capture(80).unwrap();
    assert!(f.admin.is_active(Usage::Capture(CaptureUsage::Communication)));
    assert_eq!(
        f.volume.usage_gain_adjustment(Usage::Render(RenderUsage::Media)),
        -35.0
    );

    let mut deadline = match mixer.process() {
        ProcessOutcome::WakeAt(t) => t,
        other => panic!("unexpected {other:?}"),
    };
    for _ in 0..6 {
        f.clock.set(deadline);
        deadline = match mixer.process() {
            ProcessOutcome::WakeAt(t) => t,
            other => panic!("unexpected {other:?}"),
        };
        f.drain();
    }

    let packets = recorder.packets();
    assert_eq!(packets.len(), 6);
    for (i, packet) in packets.iter().enumerate() {
        assert_eq!(packet.pts, start + i as i64 * 10_000_000);
        assert_eq!(packet.payload_size, 160);
        // Five 80-frame packets fit in 400 frames, then the ring wraps
        assert_eq!(packet.payload_offset, (i as u64 % 5) * 160);
    }
    assert_ne!(packets[0].flags & FLAG_DISCONTINUITY, 0);
    assert!(packets[1..].iter().all(|p| p.flags & FLAG_DISCONTINUITY == 0));

    let stopped = Arc::new(Mutex::new(false));
    let flag = stopped.clone();
    capturer
        .stop_async_capture(Some(Box::new(move || *flag.lock().unwrap() = true)))
        .unwrap();
    assert_eq!(capturer.state(), CaptureState::AsyncStopping);
    assert_eq!(mixer.process(), ProcessOutcome::Idle);
    f.drain();

    assert!(*stopped.lock().unwrap());
    assert!(recorder.saw_end_of_stream());
    assert_eq!(capturer.state(), CaptureState::OperatingSync);
    assert!(!f.admin.is_active(Usage::Capture(CaptureUsage::Communication)));
    assert_eq!(
        f.volume.usage_gain_adjustment(Usage::Render(RenderUsage::Media)),
        0.0
    );
}

#[test]
fn test_unplugged_source_captures_silence() {
    let f = fixture();
    let mic = f.input("mic", Signal::Constant(0.5));
    f.plug(&mic, 1);
    f.advance_ms(50);

    let capturer = f.capturer(false, CaptureUsage::Foreground);
    f.manager.add_capturer(capturer.clone());
    capturer.set_format(voice_format()).unwrap();
    let payload = Arc::new(PayloadBuffer::new(80 * 2));
    payload.write().fill(0x55);
    let mut mixer = capturer.add_payload_buffer(0, payload.clone()).unwrap();

    f.manager.on_plug_state_changed(&mic, false, 2);
    assert_eq!(capturer.as_object().source_link_count(), 0);

    let (packets, callback) = sync_packet_sink();
    capturer.capture_at(0, 80, callback()).unwrap();
    mixer.process();
    f.advance_ms(15);
    mixer.process();
    f.drain();

    assert_eq!(packets.lock().unwrap().len(), 1);
    assert!(payload.read().iter().all(|b| *b == 0));
}

#[test]
fn test_shutdown_stops_mix_domain() {
    let f = fixture();
    let mic = f.input("mic", Signal::Silence);
    f.plug(&mic, 1);

    let capturer = f.capturer(false, CaptureUsage::Foreground);
    f.manager.add_capturer(capturer.clone());
    let mut mixer = capturer
        .add_payload_buffer(
            0,
            Arc::new(PayloadBuffer::new(
                capturer.stream_type().format.bytes_per_frame() * 480,
            )),
        )
        .unwrap();
    assert_eq!(mixer.process(), ProcessOutcome::Idle);

    f.manager.remove_capturer(&capturer);
    assert!(capturer.is_shutdown());
    assert_eq!(mixer.process(), ProcessOutcome::Stopped);
    assert_eq!(mic.as_object().dest_link_count(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_async_packets_tile_the_payload(payload_frames in 8u32..400, fpp_seed in 0u32..1_000) {
        let frames_per_packet = 1 + fpp_seed % (payload_frames / 2);

        let f = fixture();
        let mic = f.input("mic", Signal::Silence);
        f.plug(&mic, 1);
        f.advance_ms(50);

        let capturer = f.capturer(false, CaptureUsage::Foreground);
        f.manager.add_capturer(capturer.clone());
        capturer.set_format(voice_format()).unwrap();
        let payload_bytes = u64::from(payload_frames) * 2;
        let mut mixer = capturer
            .add_payload_buffer(0, Arc::new(PayloadBuffer::new(payload_bytes as usize)))
            .unwrap();
        let recorder = Recorder::new();
        capturer.set_client(recorder.clone());

        let start = f.now();
        capturer.start_async_capture(frames_per_packet).unwrap();

        let wanted = (2 * payload_frames / frames_per_packet + 3) as usize;
        while recorder.packets().len() < wanted {
            match mixer.process() {
                ProcessOutcome::WakeAt(t) => f.clock.set(t),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
            f.drain();
        }

        let packet_bytes = u64::from(frames_per_packet) * 2;
        let packet_ns = i64::from(frames_per_packet) * 125_000;
        let mut expected_offset = 0u64;
        for (i, packet) in recorder.packets().iter().enumerate() {
            prop_assert_eq!(packet.payload_offset, expected_offset);
            prop_assert_eq!(packet.payload_size, packet_bytes);
            prop_assert!(packet.payload_offset + packet.payload_size <= payload_bytes);
            prop_assert_eq!(packet.pts, start + i as i64 * packet_ns);

            expected_offset += packet_bytes;
            if expected_offset + packet_bytes > payload_bytes {
                expected_offset = 0;
            }
        }
    }
}

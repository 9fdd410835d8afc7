//! Criterion benchmarks for sample rate conversion
//!
//! Covers the three filter kinds on their own and the mixer converting
//! common rate pairs (CD to device rate, device rate down to voice rates).

use chorale_benchmarks::{float_bytes, generate_sine_wave};
use chorale_core::domain::audio::{SampleFormat, StreamFormat};
use chorale_core::domain::filter::{Filter, FilterKind, FRAC_BITS, FRAC_ONE};
use chorale_core::domain::gain::Gain;
use chorale_core::domain::mixer::{Mixer, MixerSettings, SourceStep};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

const DEST_FRAMES: usize = 480;

/// Step for one destination frame, exact to the remainder
fn step_for(source_rate: u32, dest_rate: u32) -> SourceStep {
    let numerator = u64::from(source_rate) << FRAC_BITS;
    let denominator = u64::from(dest_rate);
    SourceStep {
        step_size: (numerator / denominator) as i64,
        rate_modulo: numerator % denominator,
        denominator,
        src_pos_modulo: 0,
    }
}

/// Benchmark single-sample evaluation for each filter kind
fn bench_filter_kinds(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter_compute_sample");
    let window = generate_sine_wave(1_000.0, 48_000, 256, 1);
    let center = 128i64;

    for kind in [FilterKind::Point, FilterKind::Linear, FilterKind::Sinc] {
        let filter = Filter::new(kind, 44_100, 48_000);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{kind:?}")),
            &filter,
            |b, filter| {
                b.iter(|| {
                    black_box(filter.compute_sample(
                        black_box(FRAC_ONE / 3),
                        center,
                        |i| window.get(i as usize).copied().unwrap_or(0.0),
                    ))
                })
            },
        );
    }

    group.finish();
}

/// Benchmark filter table construction for sinc rate pairs
fn bench_sinc_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("sinc_table");

    for (source_rate, dest_rate) in [(44_100u32, 48_000u32), (48_000, 16_000), (48_000, 8_000)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{source_rate}_to_{dest_rate}")),
            &(source_rate, dest_rate),
            |b, &(s, d)| b.iter(|| black_box(Filter::new(FilterKind::Sinc, s, d))),
        );
    }

    group.finish();
}

/// Benchmark mixer conversion of one destination buffer
fn bench_rate_conversion(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_conversion");
    group.throughput(Throughput::Elements(DEST_FRAMES as u64));

    for (source_rate, dest_rate) in [(44_100u32, 48_000u32), (48_000, 16_000), (48_000, 8_000)] {
        let source = StreamFormat::new(SampleFormat::Float, 2, source_rate);
        let dest = StreamFormat::new(SampleFormat::Float, 2, dest_rate);
        let Some(mut mixer) = Mixer::select(&source, &dest, &MixerSettings::default()) else {
            continue;
        };

        // Enough source for the whole destination buffer plus filter support
        let source_frames = DEST_FRAMES * source_rate as usize / dest_rate as usize + 64;
        let bytes = float_bytes(&generate_sine_wave(440.0, source_rate, source_frames, 2));
        let frac_source_frames = source_frames as i64 * FRAC_ONE;
        let gain = Gain::new();
        let mut out = vec![0.0f32; DEST_FRAMES * 2];

        group.bench_function(
            BenchmarkId::from_parameter(format!("{source_rate}_to_{dest_rate}")),
            |b| {
                b.iter(|| {
                    let mut dest_offset = 0;
                    let mut source_offset = 0;
                    let mut step = step_for(source_rate, dest_rate);
                    mixer.mix(
                        &mut out,
                        DEST_FRAMES,
                        &mut dest_offset,
                        black_box(&bytes),
                        frac_source_frames,
                        &mut source_offset,
                        false,
                        &gain,
                        &mut step,
                    );
                    black_box(dest_offset)
                })
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_filter_kinds,
    bench_sinc_table,
    bench_rate_conversion
);
criterion_main!(benches);

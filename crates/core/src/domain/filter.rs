//! Resampling filters
//!
//! Source positions are tracked in fixed point with [`FRAC_BITS`] fractional
//! bits. Every filter is a symmetric coefficient table indexed in those
//! fractional units, built once per link. Evaluating a sample is a table walk:
//!
//! ```text
//! out = sum(k >= 0) src[c - k] * T[frac + k * FRAC_ONE]
//!     + sum(k >= 1) src[c + k] * T[k * FRAC_ONE - frac]
//! ```
//!
//! where only indices below the table's side length contribute.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::debug;

pub const FRAC_BITS: u32 = 13;
pub const FRAC_ONE: i64 = 1 << FRAC_BITS;
pub const FRAC_HALF: i64 = FRAC_ONE >> 1;
pub const FRAC_MASK: i64 = FRAC_ONE - 1;

/// Number of source frames on each side of the sampling point for sinc filters
pub const SINC_SIDE_TAPS: i64 = 13;

/// Rate ratios at or below this use linear interpolation by default
pub const DEFAULT_LINEAR_RATIO_THRESHOLD: f64 = 1.10;

/// Requested resampler for a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resampler {
    /// Pick based on the rate pair
    #[default]
    Default,
    Point,
    Linear,
    Sinc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Point,
    Linear,
    Sinc,
}

impl FilterKind {
    /// Choose a filter for a rate pair
    ///
    /// Equal rates sample directly, adjacent rates (ratio at or below
    /// `linear_ratio_threshold`) interpolate, everything else band-limits.
    pub fn select(
        source_rate: u32,
        dest_rate: u32,
        resampler: Resampler,
        linear_ratio_threshold: f64,
    ) -> Self {
        match resampler {
            Resampler::Point => return FilterKind::Point,
            Resampler::Linear => return FilterKind::Linear,
            Resampler::Sinc => return FilterKind::Sinc,
            Resampler::Default => {}
        }

        if source_rate == dest_rate {
            return FilterKind::Point;
        }
        let hi = f64::from(source_rate.max(dest_rate));
        let lo = f64::from(source_rate.min(dest_rate).max(1));
        if hi / lo <= linear_ratio_threshold {
            FilterKind::Linear
        } else {
            FilterKind::Sinc
        }
    }
}

/// Precomputed coefficient table for one source/destination rate pair
#[derive(Debug, Clone)]
pub struct Filter {
    kind: FilterKind,
    source_rate: u32,
    dest_rate: u32,
    side_length: usize,
    table: Vec<f32>,
}

impl Filter {
    pub fn new(kind: FilterKind, source_rate: u32, dest_rate: u32) -> Self {
        let table = match kind {
            FilterKind::Point => point_table(),
            FilterKind::Linear => linear_table(),
            FilterKind::Sinc => sinc_table(source_rate, dest_rate),
        };
        debug!(
            ?kind,
            source_rate,
            dest_rate,
            side_length = table.len(),
            "Built filter table"
        );

        Self {
            kind,
            source_rate,
            dest_rate,
            side_length: table.len(),
            table,
        }
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn source_rate(&self) -> u32 {
        self.source_rate
    }

    pub fn dest_rate(&self) -> u32 {
        self.dest_rate
    }

    pub fn side_length(&self) -> usize {
        self.side_length
    }

    /// Source support after the sampling point, in fractional frames
    pub fn pos_width(&self) -> i64 {
        self.side_length as i64 - 1
    }

    /// Source support before the sampling point, in fractional frames
    pub fn neg_width(&self) -> i64 {
        self.side_length as i64 - 1
    }

    /// Whole source frames needed before the sampling point
    pub fn neg_frames(&self) -> usize {
        (self.neg_width() >> FRAC_BITS) as usize + 1
    }

    pub fn coefficient(&self, index: usize) -> f32 {
        self.table.get(index).copied().unwrap_or(0.0)
    }

    /// Evaluate one output sample at `center + frac / FRAC_ONE`
    ///
    /// `read` returns the source sample at a frame index relative to the
    /// current window; it is only asked for indices inside the filter support.
    #[inline]
    pub fn compute_sample(&self, frac: i64, center: i64, read: impl Fn(i64) -> f32) -> f32 {
        debug_assert!((0..FRAC_ONE).contains(&frac));
        let mut result = 0.0f32;

        let mut index = frac as usize;
        let mut k = 0i64;
        while index < self.side_length {
            result += read(center - k) * self.table[index];
            k += 1;
            index += FRAC_ONE as usize;
        }

        let mut index = (FRAC_ONE - frac) as usize;
        let mut k = 1i64;
        while index < self.side_length {
            result += read(center + k) * self.table[index];
            k += 1;
            index += FRAC_ONE as usize;
        }

        result
    }
}

// ============================================================================
// COEFFICIENT TABLES
// ============================================================================

fn point_table() -> Vec<f32> {
    // Exactly halfway between two frames, both neighbours contribute half.
    let side_length = (FRAC_HALF + 1) as usize;
    let mut table = vec![1.0f32; side_length];
    table[FRAC_HALF as usize] = 0.5;
    table
}

fn linear_table() -> Vec<f32> {
    (0..FRAC_ONE)
        .map(|i| (FRAC_ONE - i) as f32 / FRAC_ONE as f32)
        .collect()
}

fn sinc_side_length(source_rate: u32, dest_rate: u32) -> usize {
    let base = SINC_SIDE_TAPS * FRAC_ONE;
    if source_rate > dest_rate && dest_rate > 0 {
        let numerator = base as u128 * u128::from(source_rate);
        let denominator = u128::from(dest_rate);
        numerator.div_ceil(denominator) as usize
    } else {
        base as usize
    }
}

fn sinc_table(source_rate: u32, dest_rate: u32) -> Vec<f32> {
    let side_length = sinc_side_length(source_rate, dest_rate);
    let cutoff = if source_rate > dest_rate && source_rate > 0 {
        f64::from(dest_rate) / f64::from(source_rate)
    } else {
        1.0
    };

    let raw: Vec<f64> = (0..side_length)
        .map(|i| {
            let t = i as f64 / FRAC_ONE as f64;
            let x = PI * cutoff * t;
            let sinc = if i == 0 { 1.0 } else { x.sin() / x };
            let window = 0.5 * (1.0 + (PI * i as f64 / side_length as f64).cos());
            cutoff * sinc * window
        })
        .collect();

    // Normalize the integer lattice to unity DC gain.
    let step = FRAC_ONE as usize;
    let dc: f64 = raw[0] + 2.0 * raw.iter().step_by(step).skip(1).sum::<f64>();
    let norm = if dc.abs() > f64::EPSILON { 1.0 / dc } else { 1.0 };

    raw.into_iter().map(|v| (v * norm) as f32).collect()
}

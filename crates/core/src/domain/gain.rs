//! Gain stages in decibels
//!
//! Each link carries a two-stage [`Gain`]: a source stage (device or renderer
//! gain) and a destination stage (stream gain plus policy adjustments). The
//! stages are set from the request thread and read on the mix thread, so they
//! live in atomics rather than behind the bookkeeping lock.

use std::sync::atomic::{AtomicU32, Ordering};

pub const MIN_GAIN_DB: f32 = -160.0; // -160 dB (fully silent)
pub const MUTED_GAIN_DB: f32 = MIN_GAIN_DB;
pub const UNITY_GAIN_DB: f32 = 0.0; // 0 dB (no change)
pub const MAX_GAIN_DB: f32 = 24.0; // +24 dB

/// Combine two gains, saturating at the silent floor and the maximum
pub fn combine_gains(a: f32, b: f32) -> f32 {
    if a <= MIN_GAIN_DB || b <= MIN_GAIN_DB {
        return MIN_GAIN_DB;
    }
    (a + b).clamp(MIN_GAIN_DB, MAX_GAIN_DB)
}

/// Convert decibels to a linear amplitude factor
pub fn db_to_scale(db: f32) -> f32 {
    if db <= MIN_GAIN_DB {
        0.0
    } else {
        10.0_f32.powf(db / 20.0)
    }
}

/// Convert a linear amplitude factor to decibels
pub fn scale_to_db(scale: f32) -> f32 {
    if scale <= 0.0 {
        MIN_GAIN_DB
    } else {
        (20.0 * scale.log10()).clamp(MIN_GAIN_DB, MAX_GAIN_DB)
    }
}

/// Default volume curve: 1.0 is unity, 0.0 is muted, amplitude-linear in between
pub fn volume_to_db(volume: f32) -> f32 {
    if volume <= 0.0 || volume.is_nan() {
        MUTED_GAIN_DB
    } else if volume >= 1.0 {
        UNITY_GAIN_DB
    } else {
        scale_to_db(volume)
    }
}

#[derive(Debug)]
struct AtomicDb(AtomicU32);

impl AtomicDb {
    fn new(db: f32) -> Self {
        Self(AtomicU32::new(db.to_bits()))
    }

    fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, db: f32) {
        self.0.store(db.to_bits(), Ordering::Release);
    }
}

/// Two-stage gain of a single link
#[derive(Debug)]
pub struct Gain {
    source_db: AtomicDb,
    dest_db: AtomicDb,
}

impl Gain {
    pub fn new() -> Self {
        Self {
            source_db: AtomicDb::new(UNITY_GAIN_DB),
            dest_db: AtomicDb::new(UNITY_GAIN_DB),
        }
    }

    pub fn set_source_gain(&self, db: f32) {
        self.source_db.store(db.clamp(MIN_GAIN_DB, MAX_GAIN_DB));
    }

    pub fn set_dest_gain(&self, db: f32) {
        self.dest_db.store(db.clamp(MIN_GAIN_DB, MAX_GAIN_DB));
    }

    pub fn source_gain_db(&self) -> f32 {
        self.source_db.load()
    }

    pub fn dest_gain_db(&self) -> f32 {
        self.dest_db.load()
    }

    /// Combined gain of both stages
    pub fn gain_db(&self) -> f32 {
        combine_gains(self.source_db.load(), self.dest_db.load())
    }

    /// Linear amplitude factor of both stages
    pub fn scale(&self) -> f32 {
        db_to_scale(self.gain_db())
    }

    pub fn is_unity(&self) -> bool {
        self.gain_db() == UNITY_GAIN_DB
    }

    pub fn is_silent(&self) -> bool {
        self.gain_db() <= MUTED_GAIN_DB
    }
}

impl Default for Gain {
    fn default() -> Self {
        Self::new()
    }
}

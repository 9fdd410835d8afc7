//! Exact affine maps between monotonic counters
//!
//! A [`TimelineRate`] is a reduced ratio of two 64-bit deltas. A
//! [`TimelineFunction`] maps a reference timeline onto a subject timeline:
//!
//! ```text
//! subject = (reference - reference_time) * rate + subject_time
//! ```
//!
//! All scaling is overflow-checked and returns `None` instead of wrapping.

use serde::{Deserialize, Serialize};

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Ratio `subject_delta / reference_delta`, always kept reduced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimelineRate {
    subject_delta: u64,
    reference_delta: u64,
}

impl TimelineRate {
    pub const ZERO: TimelineRate = TimelineRate {
        subject_delta: 0,
        reference_delta: 1,
    };

    pub const IDENTITY: TimelineRate = TimelineRate {
        subject_delta: 1,
        reference_delta: 1,
    };

    /// Nanoseconds per second, as a rate
    pub const NS_PER_SECOND: TimelineRate = TimelineRate {
        subject_delta: 1_000_000_000,
        reference_delta: 1,
    };

    /// Create a reduced rate. A zero `reference_delta` yields [`TimelineRate::ZERO`].
    pub fn new(subject_delta: u64, reference_delta: u64) -> Self {
        debug_assert!(reference_delta != 0, "reference_delta must be non-zero");
        if reference_delta == 0 {
            return Self::ZERO;
        }
        if subject_delta == 0 {
            return Self::ZERO;
        }

        let divisor = gcd(subject_delta as u128, reference_delta as u128) as u64;
        Self {
            subject_delta: subject_delta / divisor,
            reference_delta: reference_delta / divisor,
        }
    }

    /// Rate converting frame counts at `frames_per_second` into nanoseconds
    pub fn ns_per_frame(frames_per_second: u32) -> Self {
        Self::new(1_000_000_000, u64::from(frames_per_second))
    }

    pub fn subject_delta(&self) -> u64 {
        self.subject_delta
    }

    pub fn reference_delta(&self) -> u64 {
        self.reference_delta
    }

    /// Swap subject and reference. `None` when the rate is zero.
    pub fn inverse(&self) -> Option<Self> {
        if self.subject_delta == 0 {
            return None;
        }
        Some(Self {
            subject_delta: self.reference_delta,
            reference_delta: self.subject_delta,
        })
    }

    /// Scale `value` by this rate, rounding toward negative infinity
    pub fn scale(&self, value: i64) -> Option<i64> {
        if self.reference_delta == 0 {
            return None;
        }
        let product = i128::from(value) * i128::from(self.subject_delta);
        let scaled = product.div_euclid(i128::from(self.reference_delta));
        i64::try_from(scaled).ok()
    }

    /// Exact product `a * b`, or `None` if the reduced result needs more than 64 bits
    pub fn product(a: &TimelineRate, b: &TimelineRate) -> Option<TimelineRate> {
        let subject = u128::from(a.subject_delta) * u128::from(b.subject_delta);
        let reference = u128::from(a.reference_delta) * u128::from(b.reference_delta);
        if subject == 0 {
            return Some(Self::ZERO);
        }

        let divisor = gcd(subject, reference);
        let subject = u64::try_from(subject / divisor).ok()?;
        let reference = u64::try_from(reference / divisor).ok()?;
        Some(Self {
            subject_delta: subject,
            reference_delta: reference,
        })
    }

    pub fn is_zero(&self) -> bool {
        self.subject_delta == 0
    }
}

impl Default for TimelineRate {
    fn default() -> Self {
        Self::ZERO
    }
}

/// Affine map from a reference timeline onto a subject timeline
///
/// The default instance has a zero rate and is therefore not invertible. It
/// stands for "no known mapping yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimelineFunction {
    subject_time: i64,
    reference_time: i64,
    rate: TimelineRate,
}

impl TimelineFunction {
    pub fn new(subject_time: i64, reference_time: i64, rate: TimelineRate) -> Self {
        Self {
            subject_time,
            reference_time,
            rate,
        }
    }

    /// Pure scaling through the origin
    pub fn from_rate(rate: TimelineRate) -> Self {
        Self::new(0, 0, rate)
    }

    pub fn subject_time(&self) -> i64 {
        self.subject_time
    }

    pub fn reference_time(&self) -> i64 {
        self.reference_time
    }

    pub fn rate(&self) -> TimelineRate {
        self.rate
    }

    pub fn is_invertible(&self) -> bool {
        !self.rate.is_zero()
    }

    /// Map a reference value onto the subject timeline
    pub fn apply(&self, reference_input: i64) -> Option<i64> {
        let delta = reference_input.checked_sub(self.reference_time)?;
        self.rate.scale(delta)?.checked_add(self.subject_time)
    }

    /// Map a subject value back onto the reference timeline
    pub fn apply_inverse(&self, subject_input: i64) -> Option<i64> {
        let inverse_rate = self.rate.inverse()?;
        let delta = subject_input.checked_sub(self.subject_time)?;
        inverse_rate.scale(delta)?.checked_add(self.reference_time)
    }

    pub fn inverse(&self) -> Option<Self> {
        Some(Self::new(
            self.reference_time,
            self.subject_time,
            self.rate.inverse()?,
        ))
    }

    /// Compose `bc` after `ab`, producing a map from a to c
    pub fn compose(bc: &TimelineFunction, ab: &TimelineFunction) -> Option<TimelineFunction> {
        Some(Self::new(
            bc.apply(ab.subject_time)?,
            ab.reference_time,
            TimelineRate::product(&ab.rate, &bc.rate)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rate_is_reduced() {
        let rate = TimelineRate::new(48_000, 1_000_000_000);
        // gcd(48_000, 1_000_000_000) = 16_000
        assert_eq!(rate.subject_delta(), 3);
        assert_eq!(rate.reference_delta(), 62_500);
    }

    #[test]
    fn test_zero_rate_is_not_invertible() {
        assert!(TimelineRate::ZERO.inverse().is_none());
        assert!(!TimelineFunction::default().is_invertible());
        assert!(TimelineFunction::default().apply_inverse(10).is_none());
        assert!(TimelineFunction::default().inverse().is_none());
    }

    #[test]
    fn test_scale_overflow_is_reported() {
        let rate = TimelineRate::new(u64::MAX, 1);
        assert!(rate.scale(i64::MAX).is_none());
        assert_eq!(rate.scale(0), Some(0));
    }

    #[test]
    fn test_scale_floors_negative_values() {
        let rate = TimelineRate::new(1, 2);
        assert_eq!(rate.scale(3), Some(1));
        assert_eq!(rate.scale(-3), Some(-2));
    }

    #[test]
    fn test_product_of_rates() {
        let a = TimelineRate::new(8192, 4);
        let b = TimelineRate::new(192_000, 1_000_000_000);
        let p = TimelineRate::product(&a, &b).unwrap();
        assert_eq!(p.subject_delta(), 6_144);
        assert_eq!(p.reference_delta(), 15_625);
    }

    #[test]
    fn test_product_overflow() {
        let a = TimelineRate::new(u64::MAX, 1);
        let b = TimelineRate::new(u64::MAX - 2, 1);
        assert!(TimelineRate::product(&a, &b).is_none());
    }

    #[test]
    fn test_apply_and_inverse() {
        let frames_to_ns = TimelineFunction::new(1_000, 0, TimelineRate::ns_per_frame(8_000));
        assert_eq!(frames_to_ns.apply(0), Some(1_000));
        assert_eq!(frames_to_ns.apply(80), Some(10_001_000));
        assert_eq!(frames_to_ns.apply_inverse(10_001_000), Some(80));
    }

    #[test]
    fn test_compose() {
        // frames -> ns, then ns -> bytes at 48k frames/s * 4 bytes
        let frames_to_ns = TimelineFunction::new(0, 0, TimelineRate::ns_per_frame(8_000));
        let ns_to_bytes = TimelineFunction::new(0, 0, TimelineRate::new(192_000, 1_000_000_000));
        let frames_to_bytes = TimelineFunction::compose(&ns_to_bytes, &frames_to_ns).unwrap();
        assert_eq!(frames_to_bytes.apply(1), Some(24));
        assert_eq!(frames_to_bytes.apply(8_000), Some(192_000));
    }

    proptest! {
        #[test]
        fn prop_inverse_round_trip(
            subject_time in -1_000_000_000i64..1_000_000_000,
            reference_time in -1_000_000_000i64..1_000_000_000,
            subject_delta in 1u64..1_000_000,
            x in -1_000_000i64..1_000_000,
        ) {
            // Integer rates round-trip exactly
            let f = TimelineFunction::new(subject_time, reference_time, TimelineRate::new(subject_delta, 1));
            let y = f.apply(x).unwrap();
            prop_assert_eq!(f.apply_inverse(y), Some(x));
        }

        #[test]
        fn prop_scale_never_panics(value in any::<i64>(), s in 0u64..u64::MAX, r in 1u64..u64::MAX) {
            let _ = TimelineRate::new(s, r).scale(value);
        }
    }
}

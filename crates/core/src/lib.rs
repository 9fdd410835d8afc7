//! Chorale core
//!
//! Real-time audio mixing and routing: the object graph linking renderers and
//! devices to outputs and capturers, the resampling mixer, timeline math, the
//! usage policy, and the capture state machine.

pub mod domain;

pub use domain::audio::{AudioError, Result};

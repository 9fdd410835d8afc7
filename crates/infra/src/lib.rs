//! Chorale infrastructure layer
//!
//! Execution domains, the virtual device driver and file-backed settings
//! persistence for the core audio graph.

pub mod settings_store;
pub mod threading;
pub mod virtual_device;

pub use settings_store::JsonFileSettingsStore;
pub use threading::{MixDomain, RequestLoop, ThreadingError};
pub use virtual_device::{Signal, VirtualRingDriver};

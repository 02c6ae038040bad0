//! Prelude module for common re-exports.
//!
//! `use guider_common::prelude::*;` brings in the names, layouts and
//! configuration types most consumers need.

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, GuiderConfig, LogLevel, SharedConfig, ShmConfig};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{INVALID_INDEX, MAX_INSTANCES, MAX_ITEMS, MAX_OPTIONS};

// ─── Shared Memory ──────────────────────────────────────────────────
pub use crate::shm::layout::{CameraListShm, MountListShm, OptionTableShm, RegistryLayout, ShmLayout};
pub use crate::shm::names::{EquipmentClass, RegistryEvent, ShmNames};

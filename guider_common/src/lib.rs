//! Guider Common Library
//!
//! This crate provides the shared constants, binary layouts, well-known
//! names and configuration loading utilities for all guider workspace crates.
//! It performs no OS calls: everything here is plain data that every
//! participating process must agree on byte-for-byte.
//!
//! # Module Structure
//!
//! - [`consts`] - Capacities, sentinels and layout version stamps
//! - [`shm`] - Shared memory layouts, names and fixed-width string helpers
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use guider_common::consts::{INVALID_INDEX, MAX_ITEMS};
//! use guider_common::shm::names::{EquipmentClass, ShmNames};
//!
//! let names = ShmNames::default();
//! assert_eq!(names.segment(EquipmentClass::Camera), "/phd2_cameras");
//! assert_eq!(MAX_ITEMS, 64);
//! assert_eq!(INVALID_INDEX, u32::MAX);
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
pub mod shm;

//! Shared memory subsystem definitions.
//!
//! This module contains:
//! - `layout`: The `#[repr(C)]` registry and option table structs.
//! - `names`: Equipment classes, event kinds and well-known object names.
//! - `fixed_str`: NUL-terminated fixed-width name encoding helpers.

pub mod fixed_str;
pub mod layout;
pub mod names;

//! System-wide constants for the guider workspace.
//!
//! Single source of truth for capacities, sentinels and layout stamps.
//! Changing any value here changes the cross-process binary contract.

use std::time::Duration;

/// Maximum number of equipment items in one registry segment.
pub const MAX_ITEMS: usize = 64;

/// Capacity of an item name field in bytes, including the terminating NUL.
pub const ITEM_NAME_LEN: usize = 256;

/// Maximum number of camera sub-instances in the camera extension block.
pub const MAX_INSTANCES: usize = 64;

/// Maximum number of options in the camera option table.
pub const MAX_OPTIONS: usize = 8;

/// Capacity of an option name field in bytes, including the terminating NUL.
pub const OPTION_NAME_LEN: usize = 32;

/// Sentinel selection index meaning "no selection".
pub const INVALID_INDEX: u32 = u32::MAX;

/// Registry layout version stamped into every registry segment.
pub const REGISTRY_LAYOUT_VERSION: u32 = 1;

/// Option table magic (`"CA"`).
pub const OPTION_TABLE_MAGIC: u32 = 0x4341;

/// Option table format version.
pub const OPTION_TABLE_FORMAT: u32 = 1;

/// Lower bound given to an option first created through the client path.
pub const DEFAULT_OPTION_MIN: i32 = 0;

/// Upper bound given to an option first created through the client path.
pub const DEFAULT_OPTION_MAX: i32 = 255;

/// Default namespace prefix for every segment and semaphore name.
pub const DEFAULT_NAMESPACE: &str = "phd2";

/// Default bound on a single notification wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default interval of the multi-domain polling monitor.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum attempts of a consistent multi-field read before giving up.
pub const MAX_READ_RETRIES: u32 = 10;

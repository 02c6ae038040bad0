//! Error types for shared memory operations

use thiserror::Error;

/// Errors that can occur during registry, option table and notification operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment absent without create rights, initialisation still in
    /// progress, or the OS refused the object
    #[error("Failed to attach segment {name}: {reason}")]
    AttachFailed {
        /// Segment name
        name: String,
        /// Human readable cause
        reason: String,
    },

    /// Existing segment is smaller than the compiled layout
    #[error("Segment {name} is {actual} bytes, layout requires {expected}")]
    SizeMismatch {
        /// Segment name
        name: String,
        /// Bytes required by the layout
        expected: usize,
        /// Bytes reported by the OS
        actual: usize,
    },

    /// Layout version or magic stamp not understood
    #[error("Segment {name} has stamp {found:#x}, expected {expected:#x}")]
    VersionMismatch {
        /// Segment name
        name: String,
        /// Stamp this build understands
        expected: u32,
        /// Stamp found in the segment
        found: u32,
    },

    /// The owner unlinked the segment while it was still mapped here
    #[error("Segment {name} was retired by its owner")]
    Retired {
        /// Segment name
        name: String,
    },

    /// Too many items, instances or options
    #[error("Capacity exceeded for {what}: {requested} > {capacity}")]
    CapacityExceeded {
        /// What overflowed
        what: &'static str,
        /// Requested count
        requested: usize,
        /// Fixed capacity
        capacity: usize,
    },

    /// Name longer than its fixed field or containing a NUL byte
    #[error("Invalid name {name:?}: must be at most {max_len} bytes without NUL")]
    InvalidName {
        /// Offending name
        name: String,
        /// Maximum length in bytes
        max_len: usize,
    },

    /// Selection index outside the current item count
    #[error("Invalid index {index} (item count {count})")]
    InvalidIndex {
        /// Rejected index
        index: u32,
        /// Item count at the time of the call
        count: u32,
    },

    /// Option lookup miss
    #[error("Not found: {name}")]
    NotFound {
        /// Name looked up
        name: String,
    },

    /// Named semaphore could not be opened or created
    #[error("Notification {name} unavailable: {source}")]
    NotificationUnavailable {
        /// Semaphore name
        name: String,
        /// OS error
        source: std::io::Error,
    },

    /// Consistent read kept colliding with a writer
    #[error("Read conflict on {name} after {attempts} attempts")]
    ReadConflict {
        /// Segment name
        name: String,
        /// Attempts made
        attempts: u32,
    },

    /// Write attempted through a read-only attachment
    #[error("Segment {name} is attached read-only")]
    ReadOnly {
        /// Segment name
        name: String,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

impl ShmError {
    /// `true` for the "equipment list unavailable" family: the segment is
    /// absent, skewed, or retired, as opposed to a rejected operation.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::AttachFailed { .. }
                | Self::SizeMismatch { .. }
                | Self::VersionMismatch { .. }
                | Self::Retired { .. }
        )
    }
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;

//! OS primitives: POSIX shared memory objects and named semaphores.

pub mod linux;

pub use linux::{NamedSemaphore, create_exclusive, open_existing, unlink_segment};

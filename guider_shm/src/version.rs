//! Write sequence word for optimistic cross-process reads
//!
//! Writers move the word to an odd value, write the payload, then move it to
//! the next even value. Readers copy the payload between two observations of
//! the word and accept the copy only if both are equal and even.

use crate::error::{ShmError, ShmResult};
use guider_common::consts::MAX_READ_RETRIES;
use std::sync::atomic::{AtomicU32, Ordering, fence};
use std::time::Duration;
use tracing::warn;

/// Backoff rounds a writer waits on an unchanged odd word before stepping
/// over it.
const STALE_WRITER_ATTEMPTS: u32 = 20;

/// Borrowed view of a `write_seq` header word.
#[derive(Clone, Copy)]
pub struct WriteSeq<'a> {
    seq: &'a AtomicU32,
}

impl<'a> WriteSeq<'a> {
    /// Wrap a `write_seq` word living in a mapped header.
    pub fn new(seq: &'a AtomicU32) -> Self {
        Self { seq }
    }

    /// Current raw value.
    pub fn load(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    /// Check if value is stable (even)
    pub fn is_stable(value: u32) -> bool {
        value % 2 == 0
    }

    /// Check if value indicates write in progress (odd)
    pub fn is_writing(value: u32) -> bool {
        value % 2 == 1
    }

    /// Run `write` with the word held odd.
    ///
    /// The window is claimed with a compare-exchange from the committed even
    /// value, so writers in different processes exclude each other. While
    /// another writer holds the word odd this backs off; after
    /// `STALE_WRITER_ATTEMPTS` unchanged observations the odd value is taken
    /// to belong to a writer that died mid-update and is stepped over.
    pub fn write<R>(&self, write: impl FnOnce() -> R) -> R {
        let odd = self.claim();
        fence(Ordering::Release);

        let result = write();

        self.seq.store(odd.wrapping_add(1), Ordering::Release);
        result
    }

    fn claim(&self) -> u32 {
        let mut attempt = 0;
        let mut current = self.seq.load(Ordering::Relaxed);
        loop {
            let target = if Self::is_stable(current) {
                Some(current.wrapping_add(1))
            } else if attempt >= STALE_WRITER_ATTEMPTS {
                warn!(seq = current, "stepping over stale write window");
                Some(current.wrapping_add(2))
            } else {
                None
            };

            if let Some(target) = target {
                match self.seq.compare_exchange(current, target, Ordering::Acquire, Ordering::Relaxed) {
                    Ok(_) => return target,
                    Err(actual) => {
                        current = actual;
                        attempt = 0;
                        continue;
                    }
                }
            }

            backoff(attempt);
            attempt += 1;
            let observed = self.seq.load(Ordering::Relaxed);
            if observed != current {
                current = observed;
                attempt = 0;
            }
        }
    }

    /// Run `read` until it observes a committed, unchanged payload.
    ///
    /// `read` must only copy; it may run several times. After
    /// `MAX_READ_RETRIES` colliding attempts the read fails with
    /// [`ShmError::ReadConflict`].
    pub fn read<R>(&self, segment: &str, mut read: impl FnMut() -> R) -> ShmResult<R> {
        for attempt in 0..MAX_READ_RETRIES {
            let before = self.seq.load(Ordering::Acquire);
            if Self::is_stable(before) {
                let value = read();
                fence(Ordering::Acquire);
                let after = self.seq.load(Ordering::Relaxed);
                if before == after {
                    return Ok(value);
                }
            }
            backoff(attempt);
        }

        Err(ShmError::ReadConflict {
            name: segment.to_string(),
            attempts: MAX_READ_RETRIES,
        })
    }
}

fn backoff(attempt: u32) {
    if attempt < 3 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_micros(100 << attempt.min(6)));
    }
}

//! Helpers shared by the integration tests.

#![allow(dead_code)]

use guider_common::prelude::ShmNames;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Names under a namespace no other test (or test process) uses.
pub fn unique_names(tag: &str) -> ShmNames {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    ShmNames::new(&format!("it_{tag}_{}_{n}", std::process::id()))
}

/// Spin until `condition` holds or two seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

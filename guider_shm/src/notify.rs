//! Named wake-up events
//!
//! Each event is a named POSIX semaphore used as a hint that some counter
//! moved. Counters stay the source of truth: multiple posts may coalesce
//! into a single wake-up, and a post made while nobody waits satisfies the
//! next wait.
//!
//! Failing to open an event is never fatal to registry operations. The
//! handle degrades to "no event" and callers fall back to polling.

use crate::error::{ShmError, ShmResult};
use crate::platform::NamedSemaphore;
use guider_common::shm::names::{EquipmentClass, RegistryEvent, ShmNames};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Result of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// At least one post was consumed.
    Signaled,
    /// The timeout elapsed; re-check exit conditions and wait again.
    TimedOut,
}

/// A process-shared, named wake-up event.
#[derive(Debug)]
pub struct NamedEvent {
    sem: NamedSemaphore,
}

impl NamedEvent {
    /// Open or create the event `name`.
    pub fn open(name: &str) -> ShmResult<Self> {
        NamedSemaphore::open(name)
            .map(|sem| Self { sem })
            .map_err(|source| ShmError::NotificationUnavailable {
                name: name.to_string(),
                source,
            })
    }

    /// Open the event, logging and returning `None` if that is impossible.
    pub fn open_or_degrade(name: &str) -> Option<Self> {
        match Self::open(name) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "notification unavailable, falling back to polling");
                None
            }
        }
    }

    /// Event name.
    pub fn name(&self) -> &str {
        self.sem.name()
    }

    /// Wake current or future waiters. Never blocks.
    pub fn signal(&self) -> ShmResult<()> {
        trace!(name = self.name(), "signal");
        self.sem
            .post()
            .map_err(|source| ShmError::NotificationUnavailable {
                name: self.name().to_string(),
                source,
            })
    }

    /// Block up to `timeout` for a signal.
    ///
    /// A successful wait also consumes every other pending post, so a burst
    /// of signals produces one wake-up.
    pub fn wait(&self, timeout: Duration) -> ShmResult<WaitOutcome> {
        let map_err = |source| ShmError::NotificationUnavailable {
            name: self.name().to_string(),
            source,
        };
        if self.sem.timed_wait(timeout).map_err(map_err)? {
            self.sem.drain().map_err(map_err)?;
            Ok(WaitOutcome::Signaled)
        } else {
            Ok(WaitOutcome::TimedOut)
        }
    }

    /// Discard pending signals without blocking.
    pub fn clear(&self) -> ShmResult<()> {
        self.sem
            .drain()
            .map(|_| ())
            .map_err(|source| ShmError::NotificationUnavailable {
                name: self.name().to_string(),
                source,
            })
    }

    /// Remove the event name from the system.
    pub fn unlink(name: &str) -> ShmResult<()> {
        NamedSemaphore::unlink(name).map_err(|source| ShmError::NotificationUnavailable {
            name: name.to_string(),
            source,
        })
    }
}

/// The three events of one equipment class registry.
#[derive(Debug)]
pub struct RegistryEvents {
    list_changed: Option<NamedEvent>,
    selection_changed: Option<NamedEvent>,
    client_request: Option<NamedEvent>,
}

impl RegistryEvents {
    /// Open every event of `class`, degrading individually.
    pub fn open(names: &ShmNames, class: EquipmentClass) -> Self {
        let open = |event| NamedEvent::open_or_degrade(&names.registry_event(class, event));
        Self {
            list_changed: open(RegistryEvent::ListChanged),
            selection_changed: open(RegistryEvent::SelectionChanged),
            client_request: open(RegistryEvent::ClientRequest),
        }
    }

    /// The event of kind `event`, if it could be opened.
    pub fn get(&self, event: RegistryEvent) -> Option<&NamedEvent> {
        match event {
            RegistryEvent::ListChanged => self.list_changed.as_ref(),
            RegistryEvent::SelectionChanged => self.selection_changed.as_ref(),
            RegistryEvent::ClientRequest => self.client_request.as_ref(),
        }
    }

    /// Signal `event`. Failures are logged, never returned: the counter
    /// already moved and pollers will see it.
    pub fn signal(&self, event: RegistryEvent) {
        if let Some(handle) = self.get(event) {
            if let Err(e) = handle.signal() {
                warn!(error = %e, "failed to signal event");
            }
        }
    }

    /// Signal every event of the class.
    pub fn signal_all(&self) {
        for event in RegistryEvent::ALL {
            self.signal(event);
        }
    }

    /// Unlink every event name of `class`.
    pub fn unlink(names: &ShmNames, class: EquipmentClass) {
        for event in RegistryEvent::ALL {
            let name = names.registry_event(class, event);
            match NamedEvent::unlink(&name) {
                Ok(()) => debug!(name, "unlinked event"),
                Err(e) => warn!(error = %e, "failed to unlink event"),
            }
        }
    }
}

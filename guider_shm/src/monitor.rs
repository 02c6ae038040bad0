//! Change monitoring
//!
//! Turns counter advances into [`ChangeEvent`]s delivered to a sink on a
//! dedicated background thread.
//!
//! A [`ChangeSource`] remembers the last counter value it reported and
//! knows which named event, if any, hints at its changes. The remembered
//! value only moves once the payload for it was read, so a failed read is
//! retried on the next check. Two loops drive
//! sources:
//!
//! * [`EventMonitor`] blocks on one source's event with a bounded timeout
//!   and re-checks the counter after every wake-up or timeout.
//! * [`PollingMonitor`] samples several sources at a fixed interval.
//!
//! Delivery is "at least once after each advance", never "exactly once per
//! write": bursts of writes between two checks coalesce into one event
//! carrying the latest value.
//!
//! ```no_run
//! use guider_shm::monitor::{ChangeEvent, EventMonitor, SelectionChanges};
//! use guider_shm::registry::RegistryReader;
//! use guider_common::prelude::*;
//!
//! # fn main() -> guider_shm::error::ShmResult<()> {
//! let names = ShmNames::default();
//! let reader = RegistryReader::<CameraListShm>::attach(&names)?;
//! let source = SelectionChanges::new(reader, &names)?;
//!
//! let config = ShmConfig::default();
//! let mut handle = EventMonitor::spawn(Box::new(source), &config, |event: ChangeEvent| {
//!     println!("{event:?}");
//! })?;
//! handle.stop();
//! # Ok(())
//! # }
//! ```

use crate::camera::CameraAccess;
use crate::error::ShmResult;
use crate::notify::NamedEvent;
use crate::options::OptionTable;
use crate::registry::{RegistryAccess, RegistryReader};
use guider_common::config::ShmConfig;
use guider_common::shm::layout::{CameraListShm, RegistryLayout};
use guider_common::shm::names::{EquipmentClass, RegistryEvent, ShmNames};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// A detected change, carrying the value current at detection time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeEvent {
    /// The published list was replaced.
    ListChanged {
        /// Equipment class of the registry.
        class: EquipmentClass,
        /// Names at detection time.
        items: Vec<String>,
        /// Counter value observed.
        list_version: u32,
    },
    /// The server's selection moved.
    SelectionChanged {
        /// Equipment class of the registry.
        class: EquipmentClass,
        /// Selected index, `INVALID_INDEX` for none.
        selected_index: u32,
        /// Counter value observed.
        selection_version: u32,
    },
    /// A client asked the server to select an index.
    SelectionRequested {
        /// Equipment class of the registry.
        class: EquipmentClass,
        /// Requested index.
        requested_index: u32,
        /// Counter value observed.
        request_version: u32,
    },
    /// The camera sub-instances or the active sub-instance changed.
    InstanceChanged {
        /// Active sub-instance id, empty for none.
        selected_id: String,
        /// Counter value observed.
        instance_version: u32,
    },
    /// A watched camera option changed value.
    OptionChanged {
        /// Option name.
        name: String,
        /// New value.
        value: i32,
        /// Counter value observed.
        update_version: u32,
    },
    /// The source became unusable; its monitor stops after delivering this.
    Unavailable {
        /// Source label.
        source: String,
        /// Error text.
        reason: String,
    },
}

/// Something whose changes can be detected by comparing a counter.
pub trait ChangeSource: Send {
    /// Short label for logs and thread names.
    fn label(&self) -> &str;

    /// Wake-up hint for this source, if one could be opened.
    fn event(&self) -> Option<&NamedEvent>;

    /// Report a change if the counter moved since the last report.
    fn poll(&mut self) -> ShmResult<Option<ChangeEvent>>;
}

/// Receiver of detected changes.
///
/// Implemented for closures and for [`mpsc::Sender`], so an embedding
/// application can marshal events onto its own thread.
pub trait ChangeSink: Send {
    /// Handle one event.
    fn deliver(&mut self, event: ChangeEvent);
}

impl<F: FnMut(ChangeEvent) + Send> ChangeSink for F {
    fn deliver(&mut self, event: ChangeEvent) {
        self(event)
    }
}

impl ChangeSink for mpsc::Sender<ChangeEvent> {
    fn deliver(&mut self, event: ChangeEvent) {
        if self.send(event).is_err() {
            debug!("change receiver dropped");
        }
    }
}

fn class_event(
    names: &ShmNames,
    class: EquipmentClass,
    event: RegistryEvent,
) -> Option<NamedEvent> {
    NamedEvent::open_or_degrade(&names.registry_event(class, event))
}

/// List replacements of one registry.
pub struct ListChanges<L: RegistryLayout> {
    reader: RegistryReader<L>,
    event: Option<NamedEvent>,
    label: String,
    last_seen: u32,
}

impl<L: RegistryLayout> ListChanges<L> {
    /// Watch `reader`, starting from its current list version.
    pub fn new(reader: RegistryReader<L>, names: &ShmNames) -> ShmResult<Self> {
        let last_seen = reader.list_version()?;
        Ok(Self {
            event: class_event(names, L::CLASS, RegistryEvent::ListChanged),
            label: format!("{}-list", L::CLASS),
            reader,
            last_seen,
        })
    }
}

impl<L: RegistryLayout> ChangeSource for ListChanges<L> {
    fn label(&self) -> &str {
        &self.label
    }

    fn event(&self) -> Option<&NamedEvent> {
        self.event.as_ref()
    }

    fn poll(&mut self) -> ShmResult<Option<ChangeEvent>> {
        if self.reader.list_version()? == self.last_seen {
            return Ok(None);
        }
        let snapshot = self.reader.snapshot()?;
        self.last_seen = snapshot.list_version;
        Ok(Some(ChangeEvent::ListChanged {
            class: L::CLASS,
            items: snapshot.items,
            list_version: snapshot.list_version,
        }))
    }
}

/// Selection moves of one registry.
pub struct SelectionChanges<L: RegistryLayout> {
    reader: RegistryReader<L>,
    event: Option<NamedEvent>,
    label: String,
    last_seen: u32,
}

impl<L: RegistryLayout> SelectionChanges<L> {
    /// Watch `reader`, starting from its current selection version.
    pub fn new(reader: RegistryReader<L>, names: &ShmNames) -> ShmResult<Self> {
        let last_seen = reader.selection_version()?;
        Ok(Self {
            event: class_event(names, L::CLASS, RegistryEvent::SelectionChanged),
            label: format!("{}-selection", L::CLASS),
            reader,
            last_seen,
        })
    }
}

impl<L: RegistryLayout> ChangeSource for SelectionChanges<L> {
    fn label(&self) -> &str {
        &self.label
    }

    fn event(&self) -> Option<&NamedEvent> {
        self.event.as_ref()
    }

    fn poll(&mut self) -> ShmResult<Option<ChangeEvent>> {
        if self.reader.selection_version()? == self.last_seen {
            return Ok(None);
        }
        let (selected_index, selection_version) = self.reader.selection()?;
        self.last_seen = selection_version;
        Ok(Some(ChangeEvent::SelectionChanged {
            class: L::CLASS,
            selected_index,
            selection_version,
        }))
    }
}

/// Client selection requests of one registry.
pub struct RequestChanges<L: RegistryLayout> {
    reader: RegistryReader<L>,
    event: Option<NamedEvent>,
    label: String,
    last_seen: u32,
}

impl<L: RegistryLayout> RequestChanges<L> {
    /// Watch `reader`, ignoring requests made before now.
    pub fn new(reader: RegistryReader<L>, names: &ShmNames) -> ShmResult<Self> {
        let last_seen = reader.request_version()?;
        Ok(Self {
            event: class_event(names, L::CLASS, RegistryEvent::ClientRequest),
            label: format!("{}-request", L::CLASS),
            reader,
            last_seen,
        })
    }
}

impl<L: RegistryLayout> ChangeSource for RequestChanges<L> {
    fn label(&self) -> &str {
        &self.label
    }

    fn event(&self) -> Option<&NamedEvent> {
        self.event.as_ref()
    }

    fn poll(&mut self) -> ShmResult<Option<ChangeEvent>> {
        Ok(self
            .reader
            .take_request(&mut self.last_seen)?
            .map(|requested_index| ChangeEvent::SelectionRequested {
                class: L::CLASS,
                requested_index,
                request_version: self.last_seen,
            }))
    }
}

/// Camera sub-instance changes.
pub struct InstanceChanges {
    reader: RegistryReader<CameraListShm>,
    event: Option<NamedEvent>,
    last_seen: u32,
}

impl InstanceChanges {
    /// Watch the camera registry behind `reader`.
    pub fn new(reader: RegistryReader<CameraListShm>, names: &ShmNames) -> ShmResult<Self> {
        let last_seen = reader.instance_version()?;
        Ok(Self {
            event: class_event(names, EquipmentClass::Camera, RegistryEvent::SelectionChanged),
            reader,
            last_seen,
        })
    }
}

impl ChangeSource for InstanceChanges {
    fn label(&self) -> &str {
        "camera-instance"
    }

    fn event(&self) -> Option<&NamedEvent> {
        self.event.as_ref()
    }

    fn poll(&mut self) -> ShmResult<Option<ChangeEvent>> {
        if self.reader.instance_version()? == self.last_seen {
            return Ok(None);
        }
        let (selected_id, instance_version) = self.reader.selected_instance()?;
        self.last_seen = instance_version;
        Ok(Some(ChangeEvent::InstanceChanged {
            selected_id,
            instance_version,
        }))
    }
}

/// Value changes of one named camera option.
pub struct OptionChanges {
    table: Arc<OptionTable>,
    name: String,
    label: String,
    last_seen: u32,
}

impl OptionChanges {
    /// Watch `name`, starting from the table's current update version.
    pub fn new(table: Arc<OptionTable>, name: &str) -> ShmResult<Self> {
        let last_seen = table.update_version()?;
        Ok(Self {
            table,
            name: name.to_string(),
            label: format!("option-{name}"),
            last_seen,
        })
    }
}

impl ChangeSource for OptionChanges {
    fn label(&self) -> &str {
        &self.label
    }

    fn event(&self) -> Option<&NamedEvent> {
        self.table.event()
    }

    fn poll(&mut self) -> ShmResult<Option<ChangeEvent>> {
        Ok(self
            .table
            .get_if_changed(&self.name, &mut self.last_seen)?
            .map(|value| ChangeEvent::OptionChanged {
                name: self.name.clone(),
                value,
                update_version: self.last_seen,
            }))
    }
}

/// Poll `source` once and forward the outcome. Returns `false` once the
/// source is unusable.
fn check(source: &mut dyn ChangeSource, sink: &mut dyn ChangeSink) -> bool {
    match source.poll() {
        Ok(Some(event)) => {
            trace!(source = source.label(), ?event, "change detected");
            sink.deliver(event);
            true
        }
        Ok(None) => true,
        Err(e) if e.is_unavailable() => {
            warn!(source = source.label(), error = %e, "source unavailable, stopping");
            sink.deliver(ChangeEvent::Unavailable {
                source: source.label().to_string(),
                reason: e.to_string(),
            });
            false
        }
        Err(e) => {
            warn!(source = source.label(), error = %e, "poll failed");
            true
        }
    }
}

/// Handle to a running monitor thread.
///
/// Dropping the handle stops the monitor and joins its thread.
#[derive(Debug)]
pub struct MonitorHandle {
    label: String,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    fn spawn<F>(label: String, body: F) -> ShmResult<Self>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name(format!("monitor-{label}"))
            .spawn(move || body(flag))?;
        info!(monitor = %label, "monitor started");
        Ok(Self {
            label,
            running,
            thread: Some(thread),
        })
    }

    /// `true` until stopped or until the thread gave up on its sources.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
            && self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Ask the thread to exit and wait for it.
    ///
    /// Returns within one wait timeout or poll interval.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                warn!(monitor = %self.label, "monitor thread panicked");
            }
            info!(monitor = %self.label, "monitor stopped");
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Blocks on one source's event, re-checking its counter after every
/// wake-up or timeout.
pub struct EventMonitor;

impl EventMonitor {
    /// Start monitoring `source` with the timeouts from `config`.
    pub fn spawn<S>(
        source: Box<dyn ChangeSource>,
        config: &ShmConfig,
        sink: S,
    ) -> ShmResult<MonitorHandle>
    where
        S: ChangeSink + 'static,
    {
        Self::spawn_with(source, config.wait_timeout(), config.poll_interval(), sink)
    }

    /// Start monitoring `source`. Without an event the loop sleeps for
    /// `poll_interval` between checks.
    pub fn spawn_with<S>(
        mut source: Box<dyn ChangeSource>,
        wait_timeout: Duration,
        poll_interval: Duration,
        mut sink: S,
    ) -> ShmResult<MonitorHandle>
    where
        S: ChangeSink + 'static,
    {
        if source.event().is_none() {
            warn!(source = source.label(), "no event, polling instead");
        }
        let label = source.label().to_string();
        MonitorHandle::spawn(label, move |running| {
            while running.load(Ordering::Acquire) {
                match source.event() {
                    Some(event) => {
                        if let Err(e) = event.wait(wait_timeout) {
                            warn!(source = source.label(), error = %e, "wait failed");
                            thread::park_timeout(poll_interval);
                        }
                    }
                    None => thread::park_timeout(poll_interval),
                }
                if !running.load(Ordering::Acquire) {
                    break;
                }
                if !check(source.as_mut(), &mut sink) {
                    running.store(false, Ordering::Release);
                }
            }
        })
    }
}

/// Samples several sources on one thread at a fixed interval.
pub struct PollingMonitor;

impl PollingMonitor {
    /// Start polling `sources` every `interval`. A source that becomes
    /// unavailable is dropped; the thread exits when none remain.
    pub fn spawn<S>(
        mut sources: Vec<Box<dyn ChangeSource>>,
        interval: Duration,
        mut sink: S,
    ) -> ShmResult<MonitorHandle>
    where
        S: ChangeSink + 'static,
    {
        let label = format!("poll{}", sources.len());
        MonitorHandle::spawn(label, move |running| {
            while running.load(Ordering::Acquire) && !sources.is_empty() {
                sources.retain_mut(|source| check(source.as_mut(), &mut sink));
                thread::park_timeout(interval);
            }
            running.store(false, Ordering::Release);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShmError;

    struct Counter {
        value: u32,
        last_seen: u32,
        fail_after: Option<u32>,
    }

    impl ChangeSource for Counter {
        fn label(&self) -> &str {
            "counter"
        }

        fn event(&self) -> Option<&NamedEvent> {
            None
        }

        fn poll(&mut self) -> ShmResult<Option<ChangeEvent>> {
            if self.fail_after.is_some_and(|n| self.value >= n) {
                return Err(ShmError::Retired {
                    name: "counter".to_string(),
                });
            }
            self.value += 1;
            if self.value == self.last_seen {
                return Ok(None);
            }
            self.last_seen = self.value;
            Ok(Some(ChangeEvent::OptionChanged {
                name: "n".to_string(),
                value: self.value as i32,
                update_version: self.value,
            }))
        }
    }

    #[test]
    fn test_polling_monitor_delivers_over_channel() {
        let (tx, rx) = mpsc::channel();
        let source = Counter {
            value: 0,
            last_seen: 0,
            fail_after: None,
        };
        let mut handle =
            PollingMonitor::spawn(vec![Box::new(source)], Duration::from_millis(5), tx)
                .expect("spawn");

        let first = rx.recv_timeout(Duration::from_secs(2)).expect("event");
        assert!(matches!(first, ChangeEvent::OptionChanged { value: 1, .. }));
        handle.stop();
        assert!(!handle.is_running());
    }

    #[test]
    fn test_unavailable_source_stops_monitor() {
        let (tx, rx) = mpsc::channel();
        let source = Counter {
            value: 0,
            last_seen: 0,
            fail_after: Some(2),
        };
        let handle = EventMonitor::spawn_with(
            Box::new(source),
            Duration::from_millis(5),
            Duration::from_millis(5),
            tx,
        )
        .expect("spawn");

        let events: Vec<_> = rx.iter().take(3).collect();
        assert!(matches!(events[2], ChangeEvent::Unavailable { .. }));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while handle.is_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!handle.is_running());
    }

    #[test]
    fn test_change_event_serializes_with_kind_tag() {
        let event = ChangeEvent::SelectionChanged {
            class: EquipmentClass::Mount,
            selected_index: 2,
            selection_version: 7,
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(json["kind"], "selection_changed");
        assert_eq!(json["class"], "mount");
    }
}

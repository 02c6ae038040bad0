//! Equipment registries
//!
//! One registry segment per equipment class holds the published item names,
//! the server-side selection, a client request slot and the change counters.
//!
//! ```text
//!   server                        segment                         clients
//! ┌──────────────────┐   update_list / set_selected   ┌──────────────────┐
//! │ RegistryManager  ├──────────►[ header | items ]◄──┤ RegistryReader   │
//! │  (owner)         │◄── request_selection ──────────┤ RegistryManager  │
//! └──────────────────┘        + named events          └──────────────────┘
//! ```
//!
//! Reads that return more than one field go through the segment's
//! `write_seq` and either see one committed state or fail with
//! [`ShmError::ReadConflict`]. Counters are bumped inside the same window
//! as the payload they describe, so a consistent read pairs every counter
//! with its payload.

use crate::error::{ShmError, ShmResult};
use crate::notify::RegistryEvents;
use crate::segment::SharedSegment;
use crate::version::WriteSeq;
use guider_common::config::ShmConfig;
use guider_common::consts::{INVALID_INDEX, ITEM_NAME_LEN, MAX_ITEMS};
use guider_common::shm::fixed_str;
use guider_common::shm::layout::{
    CameraListShm, ItemEntry, MountListShm, RegistryHeader, RegistryLayout,
};
use guider_common::shm::names::{EquipmentClass, RegistryEvent, ShmNames};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Camera registry manager.
pub type CameraRegistry = RegistryManager<CameraListShm>;

/// Mount registry manager.
pub type MountRegistry = RegistryManager<MountListShm>;

/// Consistent copy of a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    /// Equipment class.
    pub class: EquipmentClass,
    /// Published names, in order.
    pub items: Vec<String>,
    /// Selected index or `INVALID_INDEX`.
    pub selected_index: u32,
    /// Seconds since the Unix epoch of the last mutation.
    pub timestamp: u32,
    /// List publication counter.
    pub list_version: u32,
    /// Selection change counter.
    pub selection_version: u32,
}

impl RegistrySnapshot {
    /// The selected index, if any.
    pub fn selected(&self) -> Option<usize> {
        (self.selected_index != INVALID_INDEX).then_some(self.selected_index as usize)
    }

    /// Name of the selected item, if any.
    pub fn selected_name(&self) -> Option<&str> {
        self.selected().and_then(|i| self.items.get(i)).map(String::as_str)
    }
}

pub(crate) fn unix_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Read operations shared by every registry handle.
///
/// Every method fails with [`ShmError::Retired`] once the owner retired the
/// segment.
pub trait RegistryAccess {
    /// Layout of the underlying segment.
    type Layout: RegistryLayout;

    /// The mapped segment.
    fn segment(&self) -> &SharedSegment<Self::Layout>;

    /// Live header of the segment.
    fn header(&self) -> ShmResult<&RegistryHeader> {
        let segment = self.segment();
        segment.ensure_live()?;
        // SAFETY: in-bounds projection of a live mapping; atomics only.
        Ok(unsafe { &*Self::Layout::header(segment.as_ptr()) })
    }

    /// Segment name.
    fn name(&self) -> &str {
        self.segment().name()
    }

    /// Selected index or `INVALID_INDEX`.
    fn get_selected(&self) -> ShmResult<u32> {
        Ok(self.header()?.selected_index.load(Ordering::Acquire))
    }

    /// Number of published items.
    fn item_count(&self) -> ShmResult<u32> {
        Ok(self.header()?.item_count.load(Ordering::Acquire))
    }

    /// List publication counter.
    fn list_version(&self) -> ShmResult<u32> {
        Ok(self.header()?.list_version.load(Ordering::Acquire))
    }

    /// Selection change counter.
    fn selection_version(&self) -> ShmResult<u32> {
        Ok(self.header()?.selection_version.load(Ordering::Acquire))
    }

    /// Client request counter.
    fn request_version(&self) -> ShmResult<u32> {
        Ok(self.header()?.request_version.load(Ordering::Acquire))
    }

    /// `true` if the list changed since `*last_seen`; advances `*last_seen`.
    fn has_list_changed(&self, last_seen: &mut u32) -> ShmResult<bool> {
        let current = self.list_version()?;
        let changed = current != *last_seen;
        *last_seen = current;
        Ok(changed)
    }

    /// `true` if the selection changed since `*last_seen`; advances
    /// `*last_seen`.
    fn has_selection_changed(&self, last_seen: &mut u32) -> ShmResult<bool> {
        let current = self.selection_version()?;
        let changed = current != *last_seen;
        *last_seen = current;
        Ok(changed)
    }

    /// The most recent client request if `request_version` moved since
    /// `*last_seen`; advances `*last_seen`.
    fn take_request(&self, last_seen: &mut u32) -> ShmResult<Option<u32>> {
        if self.request_version()? == *last_seen {
            return Ok(None);
        }
        let (requested, current) = self.consistent(|header, _| {
            (
                header.requested_index.load(Ordering::Relaxed),
                header.request_version.load(Ordering::Relaxed),
            )
        })?;
        *last_seen = current;
        Ok(Some(requested))
    }

    /// Selected index and selection counter from one committed state.
    fn selection(&self) -> ShmResult<(u32, u32)> {
        self.consistent(|header, _| {
            (
                header.selected_index.load(Ordering::Relaxed),
                header.selection_version.load(Ordering::Relaxed),
            )
        })
    }

    /// Up to `max` published names, copied from one committed state.
    fn read_list(&self, max: usize) -> ShmResult<Vec<String>> {
        let raw = self.consistent(|header, items| {
            let count = (header.item_count.load(Ordering::Relaxed) as usize)
                .min(MAX_ITEMS)
                .min(max);
            copy_names(items, count)
        })?;
        Ok(raw.iter().map(|name| fixed_str::decode(name)).collect())
    }

    /// All fields of the registry, copied from one committed state.
    fn snapshot(&self) -> ShmResult<RegistrySnapshot> {
        let (raw, selected_index, timestamp, list_version, selection_version) =
            self.consistent(|header, items| {
                let count = (header.item_count.load(Ordering::Relaxed) as usize).min(MAX_ITEMS);
                (
                    copy_names(items, count),
                    header.selected_index.load(Ordering::Relaxed),
                    header.timestamp.load(Ordering::Relaxed),
                    header.list_version.load(Ordering::Relaxed),
                    header.selection_version.load(Ordering::Relaxed),
                )
            })?;
        Ok(RegistrySnapshot {
            class: Self::Layout::CLASS,
            items: raw.iter().map(|name| fixed_str::decode(name)).collect(),
            selected_index,
            timestamp,
            list_version,
            selection_version,
        })
    }

    /// Run `read` under the segment's write sequence.
    fn consistent<R>(
        &self,
        mut read: impl FnMut(&RegistryHeader, *const ItemEntry) -> R,
    ) -> ShmResult<R> {
        let header = self.header()?;
        let items = Self::Layout::items(self.segment().as_ptr() as *mut Self::Layout) as *const ItemEntry;
        let result = WriteSeq::new(&header.write_seq).read(self.name(), || read(header, items))?;
        self.segment().ensure_live()?;
        Ok(result)
    }
}

fn copy_names(items: *const ItemEntry, count: usize) -> Vec<[u8; ITEM_NAME_LEN]> {
    (0..count)
        // SAFETY: i < MAX_ITEMS; volatile because another process may write.
        .map(|i| unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*items.add(i)).name)) })
        .collect()
}

/// Read-write handle on one registry segment.
///
/// Local writers serialise on an internal lock; across processes writers
/// exclude each other through the segment's `write_seq`. Only the
/// equipment-owning server publishes lists; clients use
/// [`RegistryManager::request_selection`].
pub struct RegistryManager<L: RegistryLayout> {
    segment: Arc<SharedSegment<L>>,
    events: RegistryEvents,
    names: ShmNames,
    write_lock: Mutex<()>,
}

impl<L: RegistryLayout> RegistryAccess for RegistryManager<L> {
    type Layout = L;

    fn segment(&self) -> &SharedSegment<L> {
        &self.segment
    }
}

impl<L: RegistryLayout> RegistryManager<L> {
    /// Attach the registry of `L::CLASS`, creating it if absent and
    /// `create_if_missing` is set.
    pub fn attach(names: &ShmNames, create_if_missing: bool) -> ShmResult<Self> {
        let segment = SharedSegment::<L>::open(&names.segment(L::CLASS), create_if_missing)?;
        let events = RegistryEvents::open(names, L::CLASS);
        info!(
            class = %L::CLASS,
            name = segment.name(),
            owner = segment.is_owner(),
            "registry attached"
        );
        Ok(Self {
            segment: Arc::new(segment),
            events,
            names: names.clone(),
            write_lock: Mutex::new(()),
        })
    }

    /// Attach using the namespace and create policy of `config`.
    pub fn from_config(config: &ShmConfig) -> ShmResult<Self> {
        Self::attach(&config.names(), config.create_if_missing)
    }

    /// `true` if this handle created the segment and may unlink it.
    pub fn is_owner(&self) -> bool {
        self.segment.is_owner()
    }

    /// Events of this registry.
    pub fn events(&self) -> &RegistryEvents {
        &self.events
    }

    /// Names this registry was attached with.
    pub fn names(&self) -> &ShmNames {
        &self.names
    }

    pub(crate) fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    pub(crate) fn base_mut(&self) -> ShmResult<*mut L> {
        self.segment.ensure_live()?;
        self.segment.as_mut_ptr()
    }

    /// Replace the published item list.
    ///
    /// Fails without touching the segment if there are more than `MAX_ITEMS`
    /// names or any name does not fit its field. Deselects if the current
    /// selection falls outside the new list.
    pub fn update_list<S: AsRef<str>>(&self, names: &[S]) -> ShmResult<()> {
        if names.len() > MAX_ITEMS {
            return Err(ShmError::CapacityExceeded {
                what: "items",
                requested: names.len(),
                capacity: MAX_ITEMS,
            });
        }
        let encoded = names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                fixed_str::encode::<ITEM_NAME_LEN>(name).ok_or_else(|| ShmError::InvalidName {
                    name: name.to_string(),
                    max_len: ITEM_NAME_LEN - 1,
                })
            })
            .collect::<ShmResult<Vec<_>>>()?;

        let _guard = self.lock_writes();
        let base = self.base_mut()?;
        let header = self.header()?;
        let items = L::items(base) as *mut ItemEntry;
        let count = encoded.len() as u32;

        let (list_version, deselected) = WriteSeq::new(&header.write_seq).write(|| {
            for i in 0..MAX_ITEMS {
                let name = encoded.get(i).copied().unwrap_or([0u8; ITEM_NAME_LEN]);
                // SAFETY: i < MAX_ITEMS, writable mapping.
                unsafe { std::ptr::write_volatile(std::ptr::addr_of_mut!((*items.add(i)).name), name) };
            }
            header.item_count.store(count, Ordering::Relaxed);

            let selected = header.selected_index.load(Ordering::Relaxed);
            let deselected = selected != INVALID_INDEX && selected >= count;
            if deselected {
                header.selected_index.store(INVALID_INDEX, Ordering::Relaxed);
            }
            header.timestamp.store(unix_seconds(), Ordering::Relaxed);
            if deselected {
                header.selection_version.fetch_add(1, Ordering::Release);
            }
            let list_version = header.list_version.fetch_add(1, Ordering::Release).wrapping_add(1);
            (list_version, deselected)
        });

        info!(class = %L::CLASS, count, list_version, deselected, "published list");
        self.events.signal(RegistryEvent::ListChanged);
        if deselected {
            self.events.signal(RegistryEvent::SelectionChanged);
        }
        Ok(())
    }

    /// Select `index`, or clear the selection with `INVALID_INDEX`.
    ///
    /// Returns `false` without bumping the counter or signalling if `index`
    /// is already selected.
    pub fn set_selected(&self, index: u32) -> ShmResult<bool> {
        let _guard = self.lock_writes();
        self.base_mut()?;
        let header = self.header()?;

        // Checked inside the window so another process cannot shrink the
        // list between the range check and the store.
        let outcome = WriteSeq::new(&header.write_seq).write(|| {
            let count = header.item_count.load(Ordering::Relaxed);
            if index != INVALID_INDEX && index >= count {
                return Err(ShmError::InvalidIndex { index, count });
            }
            if header.selected_index.load(Ordering::Relaxed) == index {
                return Ok(None);
            }
            header.selected_index.store(index, Ordering::Relaxed);
            header.timestamp.store(unix_seconds(), Ordering::Relaxed);
            Ok(Some(header.selection_version.fetch_add(1, Ordering::Release).wrapping_add(1)))
        })?;
        let Some(selection_version) = outcome else {
            debug!(class = %L::CLASS, index, "selection unchanged");
            return Ok(false);
        };

        info!(class = %L::CLASS, index, selection_version, "selection changed");
        self.events.signal(RegistryEvent::SelectionChanged);
        Ok(true)
    }

    /// Clear the selection.
    pub fn clear_selection(&self) -> ShmResult<bool> {
        self.set_selected(INVALID_INDEX)
    }

    /// Ask the server to select `index` (or deselect with `INVALID_INDEX`).
    ///
    /// Writes only the request slot, bumps `request_version` and signals the
    /// client-request event.
    pub fn request_selection(&self, index: u32) -> ShmResult<()> {
        let _guard = self.lock_writes();
        self.base_mut()?;
        let header = self.header()?;

        let request_version = WriteSeq::new(&header.write_seq).write(|| {
            let count = header.item_count.load(Ordering::Relaxed);
            if index != INVALID_INDEX && index >= count {
                return Err(ShmError::InvalidIndex { index, count });
            }
            header.requested_index.store(index, Ordering::Relaxed);
            Ok(header.request_version.fetch_add(1, Ordering::Release).wrapping_add(1))
        })?;

        debug!(class = %L::CLASS, index, request_version, "selection requested");
        self.events.signal(RegistryEvent::ClientRequest);
        Ok(())
    }

    /// Read-only handle sharing this manager's mapping.
    pub fn snapshot_readonly(&self) -> RegistryReader<L> {
        RegistryReader {
            segment: Arc::clone(&self.segment),
        }
    }

    /// Release this handle.
    ///
    /// With `unlink` on the owning handle: retire the segment, wake every
    /// waiter of the class so they observe the retirement, then remove the
    /// segment and event names. A non-owner never unlinks.
    pub fn shutdown(self, unlink: bool) -> ShmResult<()> {
        if !unlink {
            debug!(class = %L::CLASS, "registry released");
            return Ok(());
        }
        if !self.segment.is_owner() {
            warn!(class = %L::CLASS, "shutdown(unlink) on a non-owning handle ignored");
            return Ok(());
        }

        let _guard = self.lock_writes();
        self.segment.retire();
        self.events.signal_all();
        self.segment.unlink()?;
        RegistryEvents::unlink(&self.names, L::CLASS);
        info!(class = %L::CLASS, "registry retired");
        Ok(())
    }
}

/// Read-only handle on one registry segment.
///
/// Dropping it releases the mapping without side effects.
pub struct RegistryReader<L: RegistryLayout> {
    segment: Arc<SharedSegment<L>>,
}

impl<L: RegistryLayout> RegistryReader<L> {
    /// Map the registry of `L::CLASS` read-only.
    pub fn attach(names: &ShmNames) -> ShmResult<Self> {
        let segment = SharedSegment::<L>::attach_readonly(&names.segment(L::CLASS))?;
        Ok(Self {
            segment: Arc::new(segment),
        })
    }
}

impl<L: RegistryLayout> Clone for RegistryReader<L> {
    fn clone(&self) -> Self {
        Self {
            segment: Arc::clone(&self.segment),
        }
    }
}

impl<L: RegistryLayout> RegistryAccess for RegistryReader<L> {
    type Layout = L;

    fn segment(&self) -> &SharedSegment<L> {
        &self.segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_names() -> ShmNames {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        ShmNames::new(&format!("regunit{}_{}", std::process::id(), n))
    }

    #[test]
    fn test_snapshot_selected_name() {
        let snapshot = RegistrySnapshot {
            class: EquipmentClass::Mount,
            items: vec!["EQ6".to_string(), "AZ-GTi".to_string()],
            selected_index: 1,
            timestamp: 0,
            list_version: 1,
            selection_version: 1,
        };
        assert_eq!(snapshot.selected(), Some(1));
        assert_eq!(snapshot.selected_name(), Some("AZ-GTi"));

        let none = RegistrySnapshot {
            selected_index: INVALID_INDEX,
            ..snapshot
        };
        assert_eq!(none.selected_name(), None);
    }

    #[test]
    fn test_failed_update_leaves_state() -> ShmResult<()> {
        let names = test_names();
        let registry = MountRegistry::attach(&names, true)?;
        registry.update_list(&["A", "B"])?;

        let long = "x".repeat(ITEM_NAME_LEN);
        let result = registry.update_list(&["ok", long.as_str()]);
        assert!(matches!(result, Err(ShmError::InvalidName { max_len: 255, .. })));

        let too_many: Vec<String> = (0..=MAX_ITEMS).map(|i| format!("m{i}")).collect();
        assert!(matches!(
            registry.update_list(&too_many),
            Err(ShmError::CapacityExceeded { requested: 65, .. })
        ));

        assert_eq!(registry.read_list(MAX_ITEMS)?, vec!["A", "B"]);
        assert_eq!(registry.list_version()?, 1);

        registry.shutdown(true)
    }

    #[test]
    fn test_read_list_respects_max() -> ShmResult<()> {
        let names = test_names();
        let registry = CameraRegistry::attach(&names, true)?;
        registry.update_list(&["a", "b", "c"])?;

        assert_eq!(registry.read_list(2)?, vec!["a", "b"]);
        assert_eq!(registry.read_list(0)?, Vec::<String>::new());

        registry.shutdown(true)
    }

    #[test]
    fn test_request_does_not_touch_selection() -> ShmResult<()> {
        let names = test_names();
        let server = MountRegistry::attach(&names, true)?;
        server.update_list(&["a", "b"])?;
        let client = MountRegistry::attach(&names, false)?;

        let mut seen = server.request_version()?;
        client.request_selection(1)?;
        assert_eq!(server.get_selected()?, INVALID_INDEX);
        assert_eq!(server.take_request(&mut seen)?, Some(1));
        assert_eq!(server.take_request(&mut seen)?, None);

        assert!(matches!(
            client.request_selection(2),
            Err(ShmError::InvalidIndex { index: 2, count: 2 })
        ));

        server.shutdown(true)
    }
}

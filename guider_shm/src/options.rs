//! Camera option table
//!
//! A small keyed table of named integer options with advisory bounds, in
//! its own segment with one `update_version` counter and one "options
//! changed" event.
//!
//! Two write paths exist and they differ on purpose:
//!
//! - [`OptionTable::publish`]: the server mirrors its own state. Neither the
//!   counter nor the event moves.
//! - [`OptionTable::set`] / [`OptionTable::set_with_bounds`]: a client asks
//!   for a change. The counter is bumped and the event signalled so the
//!   server's monitor reacts.

use crate::error::{ShmError, ShmResult};
use crate::notify::NamedEvent;
use crate::segment::SharedSegment;
use crate::version::WriteSeq;
use guider_common::config::ShmConfig;
use guider_common::consts::{DEFAULT_OPTION_MAX, DEFAULT_OPTION_MIN, MAX_OPTIONS, OPTION_NAME_LEN};
use guider_common::shm::fixed_str;
use guider_common::shm::layout::{OptionEntry, OptionTableHeader, OptionTableShm};
use guider_common::shm::names::ShmNames;
use parking_lot::Mutex;
use serde::Serialize;
use std::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// One option as read from the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraOption {
    /// Option name.
    pub name: String,
    /// Current value.
    pub value: i32,
    /// Advisory lower bound.
    pub min: i32,
    /// Advisory upper bound.
    pub max: i32,
}

/// All options of the table, in slot order.
pub type OptionSnapshot = heapless::Vec<CameraOption, MAX_OPTIONS>;

#[derive(Clone, Copy)]
struct RawOption {
    name: [u8; OPTION_NAME_LEN],
    value: i32,
    min: i32,
    max: i32,
}

enum Bounds {
    Keep,
    Set(i32, i32),
}

/// Handle on the camera option table.
pub struct OptionTable {
    segment: SharedSegment<OptionTableShm>,
    event: Option<NamedEvent>,
    names: ShmNames,
    write_lock: Mutex<()>,
}

impl OptionTable {
    /// Attach the table read-write, creating it if absent and
    /// `create_if_missing` is set.
    pub fn attach(names: &ShmNames, create_if_missing: bool) -> ShmResult<Self> {
        let segment = SharedSegment::open(&names.option_table(), create_if_missing)?;
        Ok(Self::with_segment(names, segment))
    }

    /// Attach an existing table read-only.
    pub fn attach_readonly(names: &ShmNames) -> ShmResult<Self> {
        let segment = SharedSegment::attach_readonly(&names.option_table())?;
        Ok(Self::with_segment(names, segment))
    }

    /// Attach using the namespace and create policy of `config`.
    pub fn from_config(config: &ShmConfig) -> ShmResult<Self> {
        Self::attach(&config.names(), config.create_if_missing)
    }

    fn with_segment(names: &ShmNames, segment: SharedSegment<OptionTableShm>) -> Self {
        info!(name = segment.name(), owner = segment.is_owner(), "option table attached");
        Self {
            segment,
            event: NamedEvent::open_or_degrade(&names.options_event()),
            names: names.clone(),
            write_lock: Mutex::new(()),
        }
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// `true` if this handle created the table and may unlink it.
    pub fn is_owner(&self) -> bool {
        self.segment.is_owner()
    }

    /// The "options changed" event, if it could be opened.
    pub fn event(&self) -> Option<&NamedEvent> {
        self.event.as_ref()
    }

    fn header(&self) -> ShmResult<&OptionTableHeader> {
        self.segment.ensure_live()?;
        // SAFETY: in-bounds projection of a live mapping; atomics only.
        Ok(unsafe { &*addr_of!((*self.segment.as_ptr()).header) })
    }

    fn entries(&self) -> *const OptionEntry {
        // SAFETY: projection only.
        unsafe { addr_of!((*self.segment.as_ptr()).options) as *const OptionEntry }
    }

    /// Change counter, bumped by client writes and `clear_all`.
    pub fn update_version(&self) -> ShmResult<u32> {
        Ok(self.header()?.update_version.load(Ordering::Acquire))
    }

    /// Number of options in the table.
    pub fn option_count(&self) -> ShmResult<u32> {
        Ok(self.header()?.option_count.load(Ordering::Acquire))
    }

    /// `true` if the table changed since `*last_seen`; advances `*last_seen`.
    pub fn has_changed(&self, last_seen: &mut u32) -> ShmResult<bool> {
        let current = self.update_version()?;
        let changed = current != *last_seen;
        *last_seen = current;
        Ok(changed)
    }

    /// Options and `update_version` from one committed state.
    fn read_raw(&self) -> ShmResult<(heapless::Vec<RawOption, MAX_OPTIONS>, u32)> {
        let header = self.header()?;
        let entries = self.entries();
        WriteSeq::new(&header.write_seq).read(self.name(), || {
            let count = (header.option_count.load(Ordering::Relaxed) as usize).min(MAX_OPTIONS);
            let mut out = heapless::Vec::new();
            for i in 0..count {
                // SAFETY: i < MAX_OPTIONS; another process may write.
                let raw = unsafe {
                    let entry = entries.add(i);
                    RawOption {
                        name: read_volatile(addr_of!((*entry).name)),
                        value: (*entry).value.load(Ordering::Relaxed),
                        min: (*entry).min.load(Ordering::Relaxed),
                        max: (*entry).max.load(Ordering::Relaxed),
                    }
                };
                // Capacity equals MAX_OPTIONS, cannot overflow.
                let _ = out.push(raw);
            }
            (out, header.update_version.load(Ordering::Relaxed))
        })
    }

    fn find(&self, name: &str) -> ShmResult<CameraOption> {
        Self::lookup(&self.read_raw()?.0, name)
    }

    fn lookup(raw: &[RawOption], name: &str) -> ShmResult<CameraOption> {
        raw.iter()
            .find(|raw| fixed_str::decode(&raw.name) == name)
            .map(|raw| CameraOption {
                name: name.to_string(),
                value: raw.value,
                min: raw.min,
                max: raw.max,
            })
            .ok_or_else(|| ShmError::NotFound {
                name: name.to_string(),
            })
    }

    /// Every option, copied from one committed state.
    pub fn snapshot(&self) -> ShmResult<OptionSnapshot> {
        let mut out = OptionSnapshot::new();
        for raw in self.read_raw()?.0 {
            let _ = out.push(CameraOption {
                name: fixed_str::decode(&raw.name),
                value: raw.value,
                min: raw.min,
                max: raw.max,
            });
        }
        Ok(out)
    }

    /// Current value of `name`.
    pub fn get(&self, name: &str) -> ShmResult<i32> {
        Ok(self.find(name)?.value)
    }

    /// Value, bounds and name of `name`.
    pub fn get_option(&self, name: &str) -> ShmResult<CameraOption> {
        self.find(name)
    }

    /// Current value of `name` if the table changed since `*last_seen`.
    ///
    /// `*last_seen` advances only when the option exists, so a caller
    /// watching an option that appears later still catches its first value.
    pub fn get_if_changed(&self, name: &str, last_seen: &mut u32) -> ShmResult<Option<i32>> {
        if self.update_version()? == *last_seen {
            return Ok(None);
        }
        let (raw, current) = self.read_raw()?;
        match Self::lookup(&raw, name) {
            Ok(option) => {
                *last_seen = current;
                Ok(Some(option.value))
            }
            Err(ShmError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Server path: upsert `name` with explicit bounds without bumping the
    /// counter or signalling.
    pub fn publish(&self, name: &str, value: i32, min: i32, max: i32) -> ShmResult<()> {
        let changed = self.upsert(name, value, Bounds::Set(min, max), false)?.is_some();
        debug!(name, value, min, max, changed, "published option");
        Ok(())
    }

    /// Client path: set `name` to `value`.
    ///
    /// An unknown name is created with the default bounds. Returns `false`
    /// (no counter bump, no signal) if the stored value already equals
    /// `value`.
    pub fn set(&self, name: &str, value: i32) -> ShmResult<bool> {
        self.client_write(name, value, Bounds::Keep)
    }

    /// Client path with explicit bounds.
    pub fn set_with_bounds(&self, name: &str, value: i32, min: i32, max: i32) -> ShmResult<bool> {
        self.client_write(name, value, Bounds::Set(min, max))
    }

    fn client_write(&self, name: &str, value: i32, bounds: Bounds) -> ShmResult<bool> {
        let Some(version) = self.upsert(name, value, bounds, true)? else {
            return Ok(false);
        };
        self.signal();
        info!(name, value, update_version = version, "option set");
        Ok(true)
    }

    /// Remove every option, bump the counter and signal.
    pub fn clear_all(&self) -> ShmResult<()> {
        let guard = self.write_lock.lock();
        let base = self.segment.as_mut_ptr()?;
        let header = self.header()?;

        let version = WriteSeq::new(&header.write_seq).write(|| {
            for i in 0..MAX_OPTIONS {
                // SAFETY: i < MAX_OPTIONS, writable mapping.
                unsafe {
                    let entry = (addr_of_mut!((*base).options) as *mut OptionEntry).add(i);
                    write_volatile(addr_of_mut!((*entry).name), [0u8; OPTION_NAME_LEN]);
                    (*entry).value.store(0, Ordering::Relaxed);
                    (*entry).min.store(0, Ordering::Relaxed);
                    (*entry).max.store(0, Ordering::Relaxed);
                }
            }
            header.option_count.store(0, Ordering::Relaxed);
            header.update_version.fetch_add(1, Ordering::Release).wrapping_add(1)
        });
        drop(guard);

        self.signal();
        info!(update_version = version, "cleared options");
        Ok(())
    }

    fn signal(&self) {
        if let Some(event) = &self.event {
            if let Err(e) = event.signal() {
                warn!(error = %e, "failed to signal options event");
            }
        }
    }

    /// Insert or update `name`, bumping `update_version` in the same write
    /// window when `bump` is set.
    ///
    /// Returns `None` if nothing changed, otherwise the counter value after
    /// the write. The lookup runs inside the window so writers in other
    /// processes cannot append to the same slot.
    fn upsert(&self, name: &str, value: i32, bounds: Bounds, bump: bool) -> ShmResult<Option<u32>> {
        let encoded = fixed_str::encode::<OPTION_NAME_LEN>(name).ok_or_else(|| ShmError::InvalidName {
            name: name.to_string(),
            max_len: OPTION_NAME_LEN - 1,
        })?;

        let _guard = self.write_lock.lock();
        let base = self.segment.as_mut_ptr()?;
        let header = self.header()?;
        // SAFETY: projection only.
        let entries = unsafe { addr_of_mut!((*base).options) } as *mut OptionEntry;

        WriteSeq::new(&header.write_seq).write(|| {
            let count = (header.option_count.load(Ordering::Relaxed) as usize).min(MAX_OPTIONS);
            // SAFETY: every index below is < MAX_OPTIONS on a writable mapping.
            let existing = (0..count).find(|&i| unsafe {
                read_volatile(addr_of!((*entries.add(i)).name)) == encoded
            });

            match existing {
                Some(i) => {
                    // SAFETY: i < count <= MAX_OPTIONS.
                    let entry = unsafe { &*entries.add(i) };
                    let (min, max) = match bounds {
                        Bounds::Keep => (entry.min.load(Ordering::Relaxed), entry.max.load(Ordering::Relaxed)),
                        Bounds::Set(min, max) => (min, max),
                    };
                    let unchanged = entry.value.load(Ordering::Relaxed) == value
                        && entry.min.load(Ordering::Relaxed) == min
                        && entry.max.load(Ordering::Relaxed) == max;
                    if unchanged {
                        return Ok(None);
                    }
                    entry.value.store(value, Ordering::Relaxed);
                    entry.min.store(min, Ordering::Relaxed);
                    entry.max.store(max, Ordering::Relaxed);
                }
                None => {
                    if count >= MAX_OPTIONS {
                        return Err(ShmError::CapacityExceeded {
                            what: "options",
                            requested: count + 1,
                            capacity: MAX_OPTIONS,
                        });
                    }
                    let (min, max) = match bounds {
                        Bounds::Keep => (DEFAULT_OPTION_MIN, DEFAULT_OPTION_MAX),
                        Bounds::Set(min, max) => (min, max),
                    };
                    // SAFETY: count < MAX_OPTIONS, writable mapping.
                    unsafe {
                        let entry = entries.add(count);
                        write_volatile(addr_of_mut!((*entry).name), encoded);
                        (*entry).value.store(value, Ordering::Relaxed);
                        (*entry).min.store(min, Ordering::Relaxed);
                        (*entry).max.store(max, Ordering::Relaxed);
                    }
                    header.option_count.store(count as u32 + 1, Ordering::Relaxed);
                }
            }

            let version = if bump {
                header.update_version.fetch_add(1, Ordering::Release).wrapping_add(1)
            } else {
                header.update_version.load(Ordering::Relaxed)
            };
            Ok(Some(version))
        })
    }

    /// Release this handle; with `unlink` on the owner, retire the table,
    /// wake waiters and remove the segment and event names.
    pub fn shutdown(self, unlink: bool) -> ShmResult<()> {
        if !unlink {
            return Ok(());
        }
        if !self.segment.is_owner() {
            warn!(name = self.name(), "shutdown(unlink) on a non-owning handle ignored");
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        self.segment.retire();
        self.signal();
        self.segment.unlink()?;
        if let Err(e) = NamedEvent::unlink(&self.names.options_event()) {
            warn!(error = %e, "failed to unlink options event");
        }
        info!(name = self.name(), "option table retired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_names() -> ShmNames {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        ShmNames::new(&format!("optunit{}_{}", std::process::id(), n))
    }

    #[test]
    fn test_new_option_gets_default_bounds() -> ShmResult<()> {
        let table = OptionTable::attach(&test_names(), true)?;
        assert!(table.set("gain", 40)?);

        let option = table.get_option("gain")?;
        assert_eq!((option.value, option.min, option.max), (40, 0, 255));

        table.shutdown(true)
    }

    #[test]
    fn test_unchanged_set_is_noop() -> ShmResult<()> {
        let table = OptionTable::attach(&test_names(), true)?;
        table.set("gain", 40)?;
        let version = table.update_version()?;

        assert!(!table.set("gain", 40)?);
        assert_eq!(table.update_version()?, version);

        table.shutdown(true)
    }

    #[test]
    fn test_capacity_and_name_limits() -> ShmResult<()> {
        let table = OptionTable::attach(&test_names(), true)?;
        for i in 0..MAX_OPTIONS {
            table.publish(&format!("opt{i}"), i as i32, 0, 10)?;
        }
        assert!(matches!(
            table.publish("overflow", 1, 0, 1),
            Err(ShmError::CapacityExceeded { capacity: MAX_OPTIONS, .. })
        ));
        // Updating an existing entry still works when full.
        table.publish("opt3", 7, 0, 10)?;
        assert_eq!(table.get("opt3")?, 7);

        let long = "n".repeat(OPTION_NAME_LEN);
        assert!(matches!(table.set(&long, 1), Err(ShmError::InvalidName { max_len: 31, .. })));

        table.shutdown(true)
    }

    #[test]
    fn test_get_if_changed_waits_for_option() -> ShmResult<()> {
        let table = OptionTable::attach(&test_names(), true)?;
        let mut seen = table.update_version()?;

        table.set("other", 1)?;
        assert_eq!(table.get_if_changed("binning", &mut seen)?, None);
        assert_eq!(seen, 0);

        table.set("binning", 2)?;
        assert_eq!(table.get_if_changed("binning", &mut seen)?, Some(2));
        assert_eq!(seen, 2);

        table.shutdown(true)
    }

    #[test]
    fn test_get_missing_is_not_found() -> ShmResult<()> {
        let table = OptionTable::attach(&test_names(), true)?;
        assert!(matches!(table.get("absent"), Err(ShmError::NotFound { .. })));
        table.shutdown(true)
    }
}

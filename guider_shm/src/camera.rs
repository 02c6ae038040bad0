//! Camera sub-instance extension
//!
//! Some camera drivers expose several physical devices behind one entry.
//! The camera registry carries a trailer describing those sub-instances of
//! the selected camera and which one is active. Changes bump
//! `instance_version` and signal the camera selection-changed event.

use crate::error::{ShmError, ShmResult};
use crate::registry::{CameraRegistry, RegistryAccess, unix_seconds};
use crate::version::WriteSeq;
use guider_common::consts::{ITEM_NAME_LEN, MAX_INSTANCES};
use guider_common::shm::fixed_str;
use guider_common::shm::layout::{CameraExtension, CameraInstance, CameraListShm};
use guider_common::shm::names::RegistryEvent;
use serde::Serialize;
use std::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile};
use std::sync::atomic::Ordering;
use tracing::{debug, info};

/// One camera sub-instance as published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CameraInstanceInfo {
    /// Human readable name.
    pub display_name: String,
    /// Stable identifier.
    pub id: String,
}

fn extension<A: RegistryAccess<Layout = CameraListShm> + ?Sized>(
    access: &A,
) -> ShmResult<&CameraExtension> {
    access.segment().ensure_live()?;
    let base = access.segment().as_ptr();
    // SAFETY: projection into a live mapping; only the atomics are read by
    // reference, byte arrays go through volatile copies.
    Ok(unsafe { &*addr_of!((*base).ext) })
}

/// Camera-only reads, available on every camera registry handle.
pub trait CameraAccess: RegistryAccess<Layout = CameraListShm> {
    /// Identifier of the selected sub-instance, empty if none.
    fn selected_instance_id(&self) -> ShmResult<String> {
        Ok(self.selected_instance()?.0)
    }

    /// Identifier of the selected sub-instance together with
    /// `instance_version`, from one committed state.
    fn selected_instance(&self) -> ShmResult<(String, u32)> {
        let ext = extension(self)?;
        let (raw, version) = self.consistent(|_, _| {
            // SAFETY: in-bounds field of a live mapping.
            let raw = unsafe { read_volatile(addr_of!(ext.selected_instance_id)) };
            (raw, ext.instance_version.load(Ordering::Relaxed))
        })?;
        Ok((fixed_str::decode(&raw), version))
    }

    /// `true` if the selected camera supports sub-instance selection.
    fn instance_selection_supported(&self) -> ShmResult<bool> {
        Ok(extension(self)?.can_select_instance.load(Ordering::Acquire) != 0)
    }

    /// Sub-instance change counter.
    fn instance_version(&self) -> ShmResult<u32> {
        Ok(extension(self)?.instance_version.load(Ordering::Acquire))
    }

    /// `true` if the sub-instances or the selected id changed since
    /// `*last_seen`; advances `*last_seen`.
    fn has_instance_changed(&self, last_seen: &mut u32) -> ShmResult<bool> {
        let current = self.instance_version()?;
        let changed = current != *last_seen;
        *last_seen = current;
        Ok(changed)
    }

    /// Published sub-instances, copied from one committed state.
    fn instances(&self) -> ShmResult<Vec<CameraInstanceInfo>> {
        let ext = extension(self)?;
        let raw = self.consistent(|_, _| {
            let count = (ext.instance_count.load(Ordering::Relaxed) as usize).min(MAX_INSTANCES);
            let base = addr_of!(ext.instances) as *const CameraInstance;
            (0..count)
                .map(|i| {
                    // SAFETY: i < MAX_INSTANCES; another process may write.
                    unsafe {
                        let entry = base.add(i);
                        (
                            read_volatile(addr_of!((*entry).display_name)),
                            read_volatile(addr_of!((*entry).id)),
                        )
                    }
                })
                .collect::<Vec<_>>()
        })?;
        Ok(raw
            .iter()
            .map(|(display_name, id)| CameraInstanceInfo {
                display_name: fixed_str::decode(display_name),
                id: fixed_str::decode(id),
            })
            .collect())
    }
}

impl<T: RegistryAccess<Layout = CameraListShm>> CameraAccess for T {}

fn encode_name(name: &str) -> ShmResult<[u8; ITEM_NAME_LEN]> {
    fixed_str::encode::<ITEM_NAME_LEN>(name).ok_or_else(|| ShmError::InvalidName {
        name: name.to_string(),
        max_len: ITEM_NAME_LEN - 1,
    })
}

impl CameraRegistry {
    fn extension_mut(&self) -> ShmResult<*mut CameraExtension> {
        let base = self.base_mut()?;
        // SAFETY: projection only.
        Ok(unsafe { addr_of_mut!((*base).ext) })
    }

    /// Bump `instance_version`; call inside the write window.
    fn bump_instance_version(ext: *mut CameraExtension) -> u32 {
        // SAFETY: atomic field of a writable mapping.
        unsafe { &*ext }
            .instance_version
            .fetch_add(1, Ordering::Release)
            .wrapping_add(1)
    }

    /// Publish the active sub-instance id (empty string for none).
    ///
    /// Returns `false` without signalling if `id` is already published.
    pub fn set_selected_instance_id(&self, id: &str) -> ShmResult<bool> {
        let encoded = encode_name(id)?;
        let _guard = self.lock_writes();
        let ext = self.extension_mut()?;
        let header = self.header()?;

        let version = WriteSeq::new(&header.write_seq).write(|| {
            // SAFETY: writable mapping, in-bounds field.
            unsafe {
                if read_volatile(addr_of!((*ext).selected_instance_id)) == encoded {
                    return None;
                }
                write_volatile(addr_of_mut!((*ext).selected_instance_id), encoded);
            }
            header.timestamp.store(unix_seconds(), Ordering::Relaxed);
            Some(Self::bump_instance_version(ext))
        });
        let Some(version) = version else {
            return Ok(false);
        };
        self.events().signal(RegistryEvent::SelectionChanged);
        info!(id, instance_version = version, "selected camera instance");
        Ok(true)
    }

    /// Publish whether the selected camera supports sub-instance selection.
    pub fn set_instance_selection_supported(&self, supported: bool) -> ShmResult<()> {
        let _guard = self.lock_writes();
        let ext = self.extension_mut()?;
        // SAFETY: atomic field of a writable mapping.
        unsafe { &*ext }
            .can_select_instance
            .store(u32::from(supported), Ordering::Release);
        debug!(supported, "instance selection support");
        Ok(())
    }

    /// Replace the sub-instance table with `(display_name, id)` pairs.
    ///
    /// Fails without touching the segment on more than `MAX_INSTANCES`
    /// entries or any name that does not fit.
    pub fn update_instances<S: AsRef<str>>(&self, instances: &[(S, S)]) -> ShmResult<()> {
        if instances.len() > MAX_INSTANCES {
            return Err(ShmError::CapacityExceeded {
                what: "camera instances",
                requested: instances.len(),
                capacity: MAX_INSTANCES,
            });
        }
        let encoded = instances
            .iter()
            .map(|(display, id)| Ok((encode_name(display.as_ref())?, encode_name(id.as_ref())?)))
            .collect::<ShmResult<Vec<_>>>()?;

        let _guard = self.lock_writes();
        let ext = self.extension_mut()?;
        let header = self.header()?;
        let count = encoded.len() as u32;

        let version = WriteSeq::new(&header.write_seq).write(|| {
            // SAFETY: writable mapping, in-bounds fields.
            unsafe {
                let entries = addr_of_mut!((*ext).instances) as *mut CameraInstance;
                for i in 0..MAX_INSTANCES {
                    let (display, id) = encoded
                        .get(i)
                        .copied()
                        .unwrap_or(([0u8; ITEM_NAME_LEN], [0u8; ITEM_NAME_LEN]));
                    let entry = entries.add(i);
                    write_volatile(addr_of_mut!((*entry).display_name), display);
                    write_volatile(addr_of_mut!((*entry).id), id);
                }
                (*ext).instance_count.store(count, Ordering::Relaxed);
            }
            header.timestamp.store(unix_seconds(), Ordering::Relaxed);
            Self::bump_instance_version(ext)
        });
        self.events().signal(RegistryEvent::SelectionChanged);
        info!(count, instance_version = version, "published camera instances");
        Ok(())
    }
}

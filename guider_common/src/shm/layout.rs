//! Binary layouts of the shared segments.
//!
//! Three segment kinds exist:
//!
//! | Segment            | Struct             | Size    |
//! |--------------------|--------------------|---------|
//! | `/<ns>_cameras`    | [`CameraListShm`]  | 49536 B |
//! | `/<ns>_mounts`     | [`MountListShm`]   | 16448 B |
//! | `/<ns>_camera_config` | [`OptionTableShm`] | 568 B |
//!
//! All structs are `#[repr(C)]`, contain only fixed-size fields and are valid
//! when zero-filled, which is what `ftruncate` produces on a fresh segment.
//! Header counters are atomics so they can be accessed through a shared
//! reference into the mapping; byte arrays are only ever copied in or out
//! through raw pointers under the `write_seq` protocol.
//!
//! The first 24 bytes of [`RegistryHeader`] and the first 16 bytes of
//! [`OptionTableHeader`] keep the historical guider field order; every field
//! added since lives in what used to be reserved space.

use crate::consts::{
    INVALID_INDEX, ITEM_NAME_LEN, MAX_INSTANCES, MAX_ITEMS, MAX_OPTIONS, OPTION_NAME_LEN,
    OPTION_TABLE_FORMAT, OPTION_TABLE_MAGIC, REGISTRY_LAYOUT_VERSION,
};
use crate::shm::names::EquipmentClass;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use static_assertions::const_assert_eq;

/// `state` word of a live segment.
pub const STATE_ACTIVE: u32 = 0;

/// `state` word after the owner unlinked the segment.
pub const STATE_RETIRED: u32 = 1;

// ─── Registry ───────────────────────────────────────────────────────

/// Registry header, 64 bytes.
///
/// ## Write protocol
///
/// `write_seq` is odd while the owner rewrites items or the selection and
/// even once committed. Readers copy what they need, then re-check
/// `write_seq`; a mismatch means the copy is torn and must be retried.
///
/// `version` is stamped last, with `Release`, once the creator finished
/// initialising. A zero `version` means initialisation is still in progress.
#[repr(C)]
pub struct RegistryHeader {
    /// Layout version, `REGISTRY_LAYOUT_VERSION` once initialised.
    pub version: AtomicU32,
    /// Number of valid entries in the item array.
    pub item_count: AtomicU32,
    /// Selected index or `INVALID_INDEX`.
    pub selected_index: AtomicU32,
    /// Seconds since the Unix epoch (truncated) of the last update.
    pub timestamp: AtomicU32,
    /// Bumped on every list publication.
    pub list_version: AtomicU32,
    /// Bumped on every selection change.
    pub selection_version: AtomicU32,
    /// Odd = write in progress, even = committed.
    pub write_seq: AtomicU32,
    /// `STATE_ACTIVE` or `STATE_RETIRED`.
    pub state: AtomicU32,
    /// Index most recently requested by a client.
    pub requested_index: AtomicU32,
    /// Bumped on every client request.
    pub request_version: AtomicU32,
    /// Zero.
    pub _reserved: [u8; 24],
}

const_assert_eq!(core::mem::size_of::<RegistryHeader>(), 64);

/// One equipment name slot.
#[repr(C)]
pub struct ItemEntry {
    /// NUL-terminated UTF-8 name.
    pub name: [u8; ITEM_NAME_LEN],
}

const_assert_eq!(core::mem::size_of::<ItemEntry>(), ITEM_NAME_LEN);

/// Mount registry segment.
#[repr(C)]
pub struct MountListShm {
    /// Counters and selection.
    pub header: RegistryHeader,
    /// Item names, `header.item_count` of them valid.
    pub items: [ItemEntry; MAX_ITEMS],
}

const_assert_eq!(core::mem::size_of::<MountListShm>(), 64 + MAX_ITEMS * ITEM_NAME_LEN);

// ─── Camera extension ───────────────────────────────────────────────

/// One selectable camera sub-instance (e.g. one of several identical
/// sensors behind a single driver).
#[repr(C)]
pub struct CameraInstance {
    /// Human readable name.
    pub display_name: [u8; ITEM_NAME_LEN],
    /// Stable identifier.
    pub id: [u8; ITEM_NAME_LEN],
}

const_assert_eq!(core::mem::size_of::<CameraInstance>(), 2 * ITEM_NAME_LEN);

/// Camera-only trailer following the item array.
///
/// Covered by the registry `write_seq`.
#[repr(C)]
pub struct CameraExtension {
    /// Identifier of the selected sub-instance, empty if none.
    pub selected_instance_id: [u8; ITEM_NAME_LEN],
    /// Non-zero if the selected camera supports sub-instance selection.
    pub can_select_instance: AtomicU32,
    /// Number of valid entries in `instances`.
    pub instance_count: AtomicU32,
    /// Bumped on every instance list or selected id change.
    pub instance_version: AtomicU32,
    /// Zero.
    pub _reserved: [u8; 52],
    /// Sub-instance table.
    pub instances: [CameraInstance; MAX_INSTANCES],
}

const_assert_eq!(
    core::mem::size_of::<CameraExtension>(),
    ITEM_NAME_LEN + 64 + MAX_INSTANCES * 2 * ITEM_NAME_LEN
);

/// Camera registry segment.
#[repr(C)]
pub struct CameraListShm {
    /// Counters and selection.
    pub header: RegistryHeader,
    /// Item names, `header.item_count` of them valid.
    pub items: [ItemEntry; MAX_ITEMS],
    /// Sub-instance block.
    pub ext: CameraExtension,
}

const_assert_eq!(
    core::mem::size_of::<CameraListShm>(),
    core::mem::size_of::<MountListShm>() + core::mem::size_of::<CameraExtension>()
);

// ─── Option table ───────────────────────────────────────────────────

/// Option table header, 56 bytes.
///
/// `magic` is stamped last by the creator, with `Release`.
#[repr(C)]
pub struct OptionTableHeader {
    /// `OPTION_TABLE_MAGIC` once initialised.
    pub magic: AtomicU32,
    /// `OPTION_TABLE_FORMAT`.
    pub format_version: AtomicU32,
    /// Number of valid entries.
    pub option_count: AtomicU32,
    /// Bumped on every effective change.
    pub update_version: AtomicU32,
    /// Odd = write in progress, even = committed.
    pub write_seq: AtomicU32,
    /// `STATE_ACTIVE` or `STATE_RETIRED`.
    pub state: AtomicU32,
    /// Zero.
    pub _reserved: [u8; 32],
}

const_assert_eq!(core::mem::size_of::<OptionTableHeader>(), 56);

/// One named integer option with inclusive bounds.
#[repr(C)]
pub struct OptionEntry {
    /// NUL-terminated option name.
    pub name: [u8; OPTION_NAME_LEN],
    /// Current value. `min`/`max` are advisory and not enforced.
    pub value: AtomicI32,
    /// Inclusive lower bound.
    pub min: AtomicI32,
    /// Inclusive upper bound.
    pub max: AtomicI32,
    /// Zero.
    pub _reserved: [u8; 20],
}

const_assert_eq!(core::mem::size_of::<OptionEntry>(), 64);

/// Camera option table segment.
#[repr(C)]
pub struct OptionTableShm {
    /// Counters.
    pub header: OptionTableHeader,
    /// Options, `header.option_count` of them valid.
    pub options: [OptionEntry; MAX_OPTIONS],
}

const_assert_eq!(core::mem::size_of::<OptionTableShm>(), 56 + MAX_OPTIONS * 64);

// ─── Layout traits ──────────────────────────────────────────────────

/// A struct that may back a shared mapping.
///
/// Every segment carries a stamp word (zero until the creator finished
/// initialising) and a state word (`STATE_ACTIVE` / `STATE_RETIRED`).
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no pointers, and be valid when
/// every byte is zero. `stamp` and `state` must return in-bounds projections
/// of `this`.
pub unsafe trait ShmLayout: Sized + Send + Sync + 'static {
    /// Bytes the mapping must provide.
    const SIZE: usize = core::mem::size_of::<Self>();

    /// Stamp value of an initialised segment of this layout.
    const STAMP: u32;

    /// Pointer to the stamp word.
    fn stamp(this: *const Self) -> *const AtomicU32;

    /// Pointer to the state word.
    fn state(this: *const Self) -> *const AtomicU32;

    /// Store every non-zero initial value except the stamp.
    ///
    /// Called by the creator on a freshly zeroed mapping, before the stamp.
    fn initialize(this: *const Self);
}

/// A registry segment: a [`RegistryHeader`] followed by the item array.
///
/// # Safety
///
/// `header` and `items` must return in-bounds projections of `this`.
pub unsafe trait RegistryLayout: ShmLayout {
    /// Equipment class this layout is published for.
    const CLASS: EquipmentClass;

    /// Pointer to the header.
    fn header(this: *const Self) -> *const RegistryHeader;

    /// Pointer to the item array.
    fn items(this: *mut Self) -> *mut [ItemEntry; MAX_ITEMS];
}

fn initialize_registry_header(header: *const RegistryHeader) {
    // SAFETY: caller passes a projection into a live mapping; atomics only.
    let header = unsafe { &*header };
    header.selected_index.store(INVALID_INDEX, Ordering::Relaxed);
    header.requested_index.store(INVALID_INDEX, Ordering::Relaxed);
    header.state.store(STATE_ACTIVE, Ordering::Relaxed);
}

macro_rules! registry_layout {
    ($ty:ty, $class:expr) => {
        // SAFETY: repr(C), only atomics and byte arrays, all-zero is valid;
        // accessors are plain field projections.
        unsafe impl ShmLayout for $ty {
            const STAMP: u32 = REGISTRY_LAYOUT_VERSION;

            #[inline]
            fn stamp(this: *const Self) -> *const AtomicU32 {
                // SAFETY: projection only, no dereference.
                unsafe { core::ptr::addr_of!((*this).header.version) }
            }

            #[inline]
            fn state(this: *const Self) -> *const AtomicU32 {
                // SAFETY: projection only, no dereference.
                unsafe { core::ptr::addr_of!((*this).header.state) }
            }

            fn initialize(this: *const Self) {
                initialize_registry_header(Self::header(this));
            }
        }

        // SAFETY: plain field projections.
        unsafe impl RegistryLayout for $ty {
            const CLASS: EquipmentClass = $class;

            #[inline]
            fn header(this: *const Self) -> *const RegistryHeader {
                // SAFETY: projection only, no dereference.
                unsafe { core::ptr::addr_of!((*this).header) }
            }

            #[inline]
            fn items(this: *mut Self) -> *mut [ItemEntry; MAX_ITEMS] {
                // SAFETY: projection only, no dereference.
                unsafe { core::ptr::addr_of_mut!((*this).items) }
            }
        }
    };
}

registry_layout!(MountListShm, EquipmentClass::Mount);
registry_layout!(CameraListShm, EquipmentClass::Camera);

// SAFETY: repr(C), only atomics and byte arrays, all-zero is valid.
unsafe impl ShmLayout for OptionTableShm {
    const STAMP: u32 = OPTION_TABLE_MAGIC;

    #[inline]
    fn stamp(this: *const Self) -> *const AtomicU32 {
        // SAFETY: projection only, no dereference.
        unsafe { core::ptr::addr_of!((*this).header.magic) }
    }

    #[inline]
    fn state(this: *const Self) -> *const AtomicU32 {
        // SAFETY: projection only, no dereference.
        unsafe { core::ptr::addr_of!((*this).header.state) }
    }

    fn initialize(this: *const Self) {
        // SAFETY: caller passes a live mapping; atomics only.
        let header = unsafe { &*core::ptr::addr_of!((*this).header) };
        header.format_version.store(OPTION_TABLE_FORMAT, Ordering::Relaxed);
        header.state.store(STATE_ACTIVE, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn registry_header_keeps_historical_prefix() {
        assert_eq!(offset_of!(RegistryHeader, version), 0);
        assert_eq!(offset_of!(RegistryHeader, item_count), 4);
        assert_eq!(offset_of!(RegistryHeader, selected_index), 8);
        assert_eq!(offset_of!(RegistryHeader, timestamp), 12);
        assert_eq!(offset_of!(RegistryHeader, list_version), 16);
        assert_eq!(offset_of!(RegistryHeader, selection_version), 20);
    }

    #[test]
    fn option_table_keeps_historical_prefix() {
        assert_eq!(offset_of!(OptionTableHeader, magic), 0);
        assert_eq!(offset_of!(OptionTableHeader, format_version), 4);
        assert_eq!(offset_of!(OptionTableHeader, option_count), 8);
        assert_eq!(offset_of!(OptionTableHeader, update_version), 12);
        assert_eq!(offset_of!(OptionTableShm, options), 56);
        assert_eq!(offset_of!(OptionEntry, value), OPTION_NAME_LEN);
    }

    #[test]
    fn items_follow_header() {
        assert_eq!(offset_of!(MountListShm, items), 64);
        assert_eq!(offset_of!(CameraListShm, items), 64);
        assert_eq!(offset_of!(CameraListShm, ext), 64 + MAX_ITEMS * ITEM_NAME_LEN);
    }

    #[test]
    fn layout_sizes() {
        assert_eq!(MountListShm::SIZE, 16448);
        assert_eq!(CameraListShm::SIZE, 49536);
        assert_eq!(OptionTableShm::SIZE, 568);
    }

    #[test]
    fn initialize_sets_sentinels_but_not_stamp() {
        let seg: Box<MountListShm> = Box::new(unsafe { core::mem::zeroed() });
        let ptr: *const MountListShm = &*seg;
        MountListShm::initialize(ptr);

        assert_eq!(seg.header.selected_index.load(Ordering::Relaxed), INVALID_INDEX);
        assert_eq!(seg.header.requested_index.load(Ordering::Relaxed), INVALID_INDEX);
        assert_eq!(seg.header.version.load(Ordering::Relaxed), 0);
        assert_eq!(MountListShm::STAMP, REGISTRY_LAYOUT_VERSION);
    }

    #[test]
    fn option_table_initialize() {
        let table: Box<OptionTableShm> = Box::new(unsafe { core::mem::zeroed() });
        let ptr: *const OptionTableShm = &*table;
        OptionTableShm::initialize(ptr);

        assert_eq!(table.header.format_version.load(Ordering::Relaxed), OPTION_TABLE_FORMAT);
        assert_eq!(table.header.magic.load(Ordering::Relaxed), 0);
        assert_eq!(OptionTableShm::STAMP, OPTION_TABLE_MAGIC);
    }

    #[test]
    fn layout_classes() {
        assert_eq!(MountListShm::CLASS, EquipmentClass::Mount);
        assert_eq!(CameraListShm::CLASS, EquipmentClass::Camera);
    }
}

//! Typed shared memory segment lifecycle
//!
//! A [`SharedSegment<T>`] is one mapping of a named POSIX shared memory object
//! whose bytes are interpreted as the `#[repr(C)]` layout `T`.
//!
//! Creation is exclusive (`O_CREAT | O_EXCL`): exactly one process wins,
//! initialises the zeroed object, and publishes it by storing the layout
//! stamp last. Everyone else attaches and validates size and stamp before
//! trusting a single field.

use crate::error::{ShmError, ShmResult};
use crate::platform;
use guider_common::shm::layout::{STATE_RETIRED, ShmLayout};
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::File;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

enum Mapping {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

/// One mapping of a named segment with layout `T`.
pub struct SharedSegment<T: ShmLayout> {
    name: String,
    mapping: Mapping,
    owner: bool,
    _layout: PhantomData<T>,
}

impl<T: ShmLayout> SharedSegment<T> {
    /// Attach read-write, creating the segment if it does not exist and
    /// `create_if_missing` is set.
    ///
    /// The process whose exclusive create succeeds becomes the owner. A
    /// process losing the creation race falls back to attaching.
    pub fn open(name: &str, create_if_missing: bool) -> ShmResult<Self> {
        if create_if_missing {
            if let Some(file) = platform::create_exclusive(name, T::SIZE)? {
                return Self::initialize(name, file);
            }
            debug!(name, "segment exists, attaching");
        }
        Self::attach(name)
    }

    /// Attach an existing segment read-write.
    pub fn attach(name: &str) -> ShmResult<Self> {
        let file = platform::open_existing(name, true)?;
        let len = Self::checked_len(name, &file)?;
        // SAFETY: the object is at least T::SIZE bytes; concurrent
        // modification is governed by the layout's atomics and write_seq.
        let mmap = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let segment = Self {
            name: name.to_string(),
            mapping: Mapping::ReadWrite(mmap),
            owner: false,
            _layout: PhantomData,
        };
        segment.validate()?;
        info!(name, len, "attached segment");
        Ok(segment)
    }

    /// Attach an existing segment read-only.
    pub fn attach_readonly(name: &str) -> ShmResult<Self> {
        let file = platform::open_existing(name, false)?;
        let len = Self::checked_len(name, &file)?;
        // SAFETY: as in `attach`, the mapping is never written through.
        let mmap = unsafe { MmapOptions::new().len(len).map(&file)? };
        let segment = Self {
            name: name.to_string(),
            mapping: Mapping::ReadOnly(mmap),
            owner: false,
            _layout: PhantomData,
        };
        segment.validate()?;
        debug!(name, len, "attached segment read-only");
        Ok(segment)
    }

    fn initialize(name: &str, file: File) -> ShmResult<Self> {
        // SAFETY: freshly sized to T::SIZE, nobody else can trust it before the stamp.
        let mmap = match unsafe { MmapOptions::new().len(T::SIZE).map_mut(&file) } {
            Ok(mmap) => mmap,
            Err(e) => {
                let _ = platform::unlink_segment(name);
                return Err(e.into());
            }
        };
        let segment = Self {
            name: name.to_string(),
            mapping: Mapping::ReadWrite(mmap),
            owner: true,
            _layout: PhantomData,
        };

        T::initialize(segment.as_ptr());
        segment.stamp().store(T::STAMP, Ordering::Release);

        info!(name, size = T::SIZE, "created segment");
        Ok(segment)
    }

    fn checked_len(name: &str, file: &File) -> ShmResult<usize> {
        let actual = file.metadata()?.len() as usize;
        if actual == 0 {
            // Creator won the race but has not sized the object yet.
            return Err(ShmError::AttachFailed {
                name: name.to_string(),
                reason: "initialization in progress".to_string(),
            });
        }
        if actual < T::SIZE {
            return Err(ShmError::SizeMismatch {
                name: name.to_string(),
                expected: T::SIZE,
                actual,
            });
        }
        Ok(actual)
    }

    fn validate(&self) -> ShmResult<()> {
        match self.stamp().load(Ordering::Acquire) {
            0 => Err(ShmError::AttachFailed {
                name: self.name.clone(),
                reason: "initialization in progress".to_string(),
            }),
            stamp if stamp != T::STAMP => Err(ShmError::VersionMismatch {
                name: self.name.clone(),
                expected: T::STAMP,
                found: stamp,
            }),
            _ => self.ensure_live(),
        }
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` if this mapping created the segment.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// `true` if writes are permitted through this mapping.
    pub fn is_writable(&self) -> bool {
        matches!(self.mapping, Mapping::ReadWrite(_))
    }

    /// Base pointer of the layout.
    pub fn as_ptr(&self) -> *const T {
        match &self.mapping {
            Mapping::ReadWrite(m) => m.as_ptr() as *const T,
            Mapping::ReadOnly(m) => m.as_ptr() as *const T,
        }
    }

    /// Base pointer for writing, or [`ShmError::ReadOnly`].
    pub fn as_mut_ptr(&self) -> ShmResult<*mut T> {
        match &self.mapping {
            Mapping::ReadWrite(m) => Ok(m.as_ptr() as *mut T),
            Mapping::ReadOnly(_) => Err(ShmError::ReadOnly {
                name: self.name.clone(),
            }),
        }
    }

    fn stamp(&self) -> &AtomicU32 {
        // SAFETY: in-bounds projection of a live mapping of at least T::SIZE.
        unsafe { &*T::stamp(self.as_ptr()) }
    }

    fn state(&self) -> &AtomicU32 {
        // SAFETY: as above.
        unsafe { &*T::state(self.as_ptr()) }
    }

    /// [`ShmError::Retired`] once the owner has retired the segment.
    pub fn ensure_live(&self) -> ShmResult<()> {
        if self.state().load(Ordering::Acquire) == STATE_RETIRED {
            return Err(ShmError::Retired {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Mark the segment retired.
    ///
    /// Existing mappings stay valid but every operation through them reports
    /// [`ShmError::Retired`]. Only the owner may retire; on other mappings
    /// this logs a warning and returns `false`.
    pub fn retire(&self) -> bool {
        if !self.owner {
            warn!(name = %self.name, "not the owner, refusing to retire");
            return false;
        }
        self.state().store(STATE_RETIRED, Ordering::Release);
        debug!(name = %self.name, "retired segment");
        true
    }

    /// Remove the segment name so the next creator starts fresh.
    ///
    /// Owner only, like [`SharedSegment::retire`].
    pub fn unlink(&self) -> ShmResult<bool> {
        if !self.owner {
            warn!(name = %self.name, "not the owner, refusing to unlink");
            return Ok(false);
        }
        platform::unlink_segment(&self.name)?;
        info!(name = %self.name, "unlinked segment");
        Ok(true)
    }

    /// [`SharedSegment::retire`] followed by [`SharedSegment::unlink`].
    pub fn retire_and_unlink(&self) -> ShmResult<bool> {
        if !self.retire() {
            return Ok(false);
        }
        self.unlink()
    }
}

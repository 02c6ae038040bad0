//! Linux-specific shared memory and semaphore operations

use crate::error::{ShmError, ShmResult};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::sys::time::TimeSpec;
use nix::time::{ClockId, clock_gettime};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::time::Duration;
use tracing::{debug, trace};

/// Permissions of every object created here (`0666` before umask), so that
/// tools run by other users on the same host can attach.
fn object_mode() -> Mode {
    Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP | Mode::S_IROTH | Mode::S_IWOTH
}

/// Exclusively create shared memory object `name` and size it to `size`
/// zero bytes.
///
/// Returns `Ok(None)` if the object already exists; the caller lost the
/// creation race (or a previous owner never unlinked) and must attach.
pub fn create_exclusive(name: &str, size: usize) -> ShmResult<Option<File>> {
    let fd = match shm_open(name, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, object_mode()) {
        Ok(fd) => fd,
        Err(Errno::EEXIST) => return Ok(None),
        Err(e) => {
            return Err(ShmError::AttachFailed {
                name: name.to_string(),
                reason: format!("shm_open(O_CREAT|O_EXCL) failed: {e}"),
            });
        }
    };

    let file = File::from(fd);
    if let Err(e) = file.set_len(size as u64) {
        // Never leave a zero-sized object behind under a well-known name.
        let _ = shm_unlink(name);
        return Err(ShmError::Io { source: e });
    }
    debug!(name, size, "created shm object");
    Ok(Some(file))
}

/// Open existing shared memory object `name`.
pub fn open_existing(name: &str, writable: bool) -> ShmResult<File> {
    let flags = if writable { OFlag::O_RDWR } else { OFlag::O_RDONLY };
    match shm_open(name, flags, Mode::empty()) {
        Ok(fd) => Ok(File::from(fd)),
        Err(Errno::ENOENT) => Err(ShmError::AttachFailed {
            name: name.to_string(),
            reason: "segment does not exist".to_string(),
        }),
        Err(e) => Err(ShmError::AttachFailed {
            name: name.to_string(),
            reason: format!("shm_open failed: {e}"),
        }),
    }
}

/// Unlink shared memory object `name`. A missing object is not an error.
pub fn unlink_segment(name: &str) -> ShmResult<()> {
    match shm_unlink(name) {
        Ok(()) | Err(Errno::ENOENT) => Ok(()),
        Err(e) => Err(ShmError::Nix { source: e }),
    }
}

/// A named POSIX semaphore, opened with `O_CREAT` and initial value 0.
///
/// Any process knowing the name can post or wait. The handle closes the
/// semaphore on drop; the name itself lives until [`NamedSemaphore::unlink`].
pub struct NamedSemaphore {
    name: String,
    sem: *mut libc::sem_t,
}

// SAFETY: sem_t operations are thread-safe; the pointer is only closed in Drop.
unsafe impl Send for NamedSemaphore {}
// SAFETY: see above.
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Open or create the semaphore `name`.
    pub fn open(name: &str) -> io::Result<Self> {
        let cname = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: valid NUL-terminated name; variadic mode/value promoted to c_uint.
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT,
                0o666 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            name: name.to_string(),
            sem,
        })
    }

    /// Semaphore name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Increment the semaphore, waking one waiter or satisfying the next wait.
    pub fn post(&self) -> io::Result<()> {
        // SAFETY: sem is a live handle from sem_open.
        if unsafe { libc::sem_post(self.sem) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Block until posted or `timeout` elapses.
    ///
    /// Returns `Ok(true)` if a post was consumed, `Ok(false)` on timeout.
    pub fn timed_wait(&self, timeout: Duration) -> io::Result<bool> {
        let now = clock_gettime(ClockId::CLOCK_REALTIME).map_err(io::Error::from)?;
        let deadline = now + TimeSpec::from_duration(timeout);

        loop {
            // SAFETY: sem is live, deadline is a normalised timespec.
            let rc = unsafe { libc::sem_timedwait(self.sem, deadline.as_ref()) };
            if rc == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    /// Consume one pending post without blocking.
    pub fn try_wait(&self) -> io::Result<bool> {
        loop {
            // SAFETY: sem is a live handle from sem_open.
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Ok(false),
                _ => return Err(err),
            }
        }
    }

    /// Consume every pending post, returning how many there were.
    pub fn drain(&self) -> io::Result<u32> {
        let mut drained = 0;
        while self.try_wait()? {
            drained += 1;
        }
        if drained > 0 {
            trace!(name = %self.name, drained, "coalesced pending posts");
        }
        Ok(drained)
    }

    /// Remove `name` from the system. A missing semaphore is not an error.
    pub fn unlink(name: &str) -> io::Result<()> {
        let cname = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: valid NUL-terminated name.
        if unsafe { libc::sem_unlink(cname.as_ptr()) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: sem came from sem_open and is closed exactly once.
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore").field("name", &self.name).finish()
    }
}

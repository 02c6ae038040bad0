//! # Guider equipment registry over shared memory
//!
//! Lets a guiding server publish its camera and mount lists, the current
//! selection and a handful of camera options in named POSIX shared memory,
//! so that any local process can read them, request a different selection
//! or tweak an option without an RPC round-trip.
//!
//! ## Pieces
//!
//! - [`segment::SharedSegment`]: exclusive create, attach, read-only attach,
//!   retire and unlink of one typed segment.
//! - [`registry::RegistryManager`]: the writer side of a camera or mount
//!   registry; [`registry::RegistryReader`] is the read-only side. Both
//!   implement [`registry::RegistryAccess`].
//! - [`camera::CameraAccess`]: sub-instance extension of the camera registry.
//! - [`options::OptionTable`]: small table of named integer options.
//! - [`notify`]: named semaphores used as wake-up hints.
//! - [`monitor`]: background threads turning counter advances into
//!   [`monitor::ChangeEvent`]s.
//!
//! Every mutation follows the same protocol: a writer claims the
//! `write_seq` window (even to odd, atomically), writes the payload and
//! bumps the version counter, releases the window, then posts the matching
//! event. Counters are the source of truth; events only shorten the wait.
//!
//! ```text
//!  server process                    shared memory                 clients
//! ┌────────────────┐   update_list   ┌──────────────────┐  read   ┌────────────┐
//! │ RegistryManager├────────────────►│ header | items   ├────────►│ Reader     │
//! │ OptionTable    │   set/publish   │ option entries   │         │ Monitor    │
//! └───────▲────────┘                 └──────────────────┘         └─────┬──────┘
//!         │            request_selection / set (client path)             │
//!         └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use guider_shm::{MountRegistry, RegistryAccess, ShmResult};
//! use guider_common::prelude::*;
//!
//! # fn main() -> ShmResult<()> {
//! let names = ShmNames::new("demo");
//! let mounts = MountRegistry::attach(&names, true)?;
//! mounts.update_list(&["On-camera", "EQMOD ASCOM"])?;
//! mounts.set_selected(1)?;
//! assert_eq!(mounts.snapshot()?.selected_name(), Some("EQMOD ASCOM"));
//! mounts.shutdown(true)?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod camera;
pub mod error;
pub mod monitor;
pub mod notify;
pub mod options;
pub mod platform;
pub mod registry;
pub mod segment;
pub mod version;

pub use camera::{CameraAccess, CameraInstanceInfo};
pub use error::{ShmError, ShmResult};
pub use monitor::{
    ChangeEvent, ChangeSink, ChangeSource, EventMonitor, InstanceChanges, ListChanges,
    MonitorHandle, OptionChanges, PollingMonitor, RequestChanges, SelectionChanges,
};
pub use notify::{NamedEvent, RegistryEvents, WaitOutcome};
pub use options::{CameraOption, OptionSnapshot, OptionTable};
pub use registry::{
    CameraRegistry, MountRegistry, RegistryAccess, RegistryManager, RegistryReader,
    RegistrySnapshot,
};
pub use segment::SharedSegment;
pub use version::WriteSeq;

use guider_common::config::LogLevel;

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` takes precedence over `level`. Calling this more than once is
/// harmless; only the first subscriber is kept.
pub fn init_tracing(level: LogLevel, json: bool) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    let _ = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.compact().finish())
    };
}

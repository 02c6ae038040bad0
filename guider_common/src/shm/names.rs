//! Well-known segment and semaphore names.
//!
//! Names are a process-external contract: the server and every client must
//! derive byte-identical strings, so all of them come from [`ShmNames`].
//! With the default `phd2` namespace the derived names match the historical
//! guider names (`/phd2_cameras`, `/phd2_cam_list_changed`, ...).

use crate::consts::DEFAULT_NAMESPACE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Equipment class owning one registry segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquipmentClass {
    /// Cameras (carries the sub-instance extension block).
    Camera,
    /// Telescope mounts.
    Mount,
}

impl EquipmentClass {
    /// Every class, in publication order.
    pub const ALL: [Self; 2] = [Self::Camera, Self::Mount];

    /// Lowercase identifier used in logs and the CLI.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::Mount => "mount",
        }
    }

    const fn segment_suffix(self) -> &'static str {
        match self {
            Self::Camera => "cameras",
            Self::Mount => "mounts",
        }
    }

    const fn event_tag(self) -> &'static str {
        match self {
            Self::Camera => "cam",
            Self::Mount => "mount",
        }
    }
}

impl fmt::Display for EquipmentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EquipmentClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "camera" | "cam" => Ok(Self::Camera),
            "mount" => Ok(Self::Mount),
            other => Err(format!("unknown equipment class '{other}'")),
        }
    }
}

/// Registry event kinds, one named semaphore each per equipment class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryEvent {
    /// The item list was republished.
    ListChanged,
    /// The server-side selection changed.
    SelectionChanged,
    /// A client posted a selection request.
    ClientRequest,
}

impl RegistryEvent {
    /// Every registry event kind.
    pub const ALL: [Self; 3] = [Self::ListChanged, Self::SelectionChanged, Self::ClientRequest];

    const fn suffix(self) -> &'static str {
        match self {
            Self::ListChanged => "list_changed",
            Self::SelectionChanged => "selected_changed",
            Self::ClientRequest => "client_request",
        }
    }
}

/// Name factory for one deployment namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmNames {
    namespace: String,
}

impl ShmNames {
    /// Names under `namespace`. The caller is expected to have validated it
    /// with [`ShmNames::is_valid_namespace`] (config loading does).
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
        }
    }

    /// `true` for a non-empty ASCII `[A-Za-z0-9_]` string.
    pub fn is_valid_namespace(namespace: &str) -> bool {
        !namespace.is_empty()
            && namespace
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    }

    /// The namespace prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Registry segment name of `class`.
    pub fn segment(&self, class: EquipmentClass) -> String {
        format!("/{}_{}", self.namespace, class.segment_suffix())
    }

    /// Semaphore name of `event` for `class`.
    pub fn registry_event(&self, class: EquipmentClass, event: RegistryEvent) -> String {
        format!("/{}_{}_{}", self.namespace, class.event_tag(), event.suffix())
    }

    /// Camera option table segment name.
    pub fn option_table(&self) -> String {
        format!("/{}_camera_config", self.namespace)
    }

    /// Semaphore name of the "any option changed" event.
    pub fn options_event(&self) -> String {
        format!("/{}_camera_config_sem", self.namespace)
    }
}

impl Default for ShmNames {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

use serde::{Deserialize, Serialize};

use crate::ids::ProcessId;

/// Per-submission namespacing record for transient storage locations.
///
/// Created fresh for every submitted workflow; never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    id: ProcessId,
    default_work_directory: String,
    default_atom_container: String,
    default_channel_container: String,
}

impl ProcessInfo {
    #[must_use]
    pub fn new(
        default_work_directory: String,
        default_atom_container: String,
        default_channel_container: String,
    ) -> Self {
        Self {
            id: ProcessId::new(),
            default_work_directory,
            default_atom_container,
            default_channel_container,
        }
    }

    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.id
    }

    #[must_use]
    pub fn default_work_directory(&self) -> &str {
        &self.default_work_directory
    }

    #[must_use]
    pub fn default_atom_container(&self) -> &str {
        &self.default_atom_container
    }

    #[must_use]
    pub fn default_channel_container(&self) -> &str {
        &self.default_channel_container
    }
}

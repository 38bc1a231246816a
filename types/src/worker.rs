use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::ManagerId;
use crate::locator::NodeAddress;

/// Reference to one live worker.
///
/// Local workers are OS processes spawned by this driver; remote workers are
/// nodes whose worker manager acknowledged a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum WorkerRef {
    Local(u32),
    Remote(ManagerId),
}

impl WorkerRef {
    /// Identity string unique among live workers.
    #[must_use]
    pub fn identity(&self) -> String {
        match self {
            Self::Local(pid) => format!("pid:{pid}"),
            Self::Remote(manager) => manager.to_string(),
        }
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

impl fmt::Display for WorkerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

/// What a worker reports about itself when joining a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub identity: String,
    pub hostname: String,
    pub pid: u32,
    /// Address the worker serves its own endpoints on, if any.
    pub address: Option<NodeAddress>,
}

//! Content-addressed distribution of workflow code dependencies.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::error::RuntimeError;
use crate::store::{Serializer, StoreProvider};

/// A named, versioned code dependency of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    name: String,
    version: String,
}

impl Dependency {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn id(&self) -> AssemblyId {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"@");
        hasher.update(self.version.as_bytes());
        let digest = hasher.finalize();
        let hex = digest.iter().fold(String::with_capacity(64), |mut acc, byte| {
            acc.push_str(&format!("{byte:02x}"));
            acc
        });
        AssemblyId(hex)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// SHA-256 of `name@version`, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssemblyId(String);

impl AssemblyId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssemblyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize)]
struct Manifest<'a> {
    id: &'a AssemblyId,
    name: &'a str,
    version: &'a str,
    serializer: &'a str,
}

/// Uploads dependency manifests to the store, skipping ones already present.
pub struct AssemblyManager {
    store: Arc<dyn StoreProvider>,
    serializer: Arc<dyn Serializer>,
    uploaded: Mutex<HashSet<AssemblyId>>,
}

impl AssemblyManager {
    #[must_use]
    pub fn new(store: Arc<dyn StoreProvider>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            store,
            serializer,
            uploaded: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn manifest_path(id: &AssemblyId) -> String {
        format!("assemblies/{id}.manifest")
    }

    /// Ensure every dependency is in the store; returns their ids in order.
    pub async fn upload(&self, dependencies: &[Dependency]) -> Result<Vec<AssemblyId>, RuntimeError> {
        let mut uploaded = self.uploaded.lock().await;
        let mut ids = Vec::with_capacity(dependencies.len());

        for dependency in dependencies {
            let id = dependency.id();
            if !uploaded.contains(&id) {
                let path = Self::manifest_path(&id);
                if self.store.get(&path).await?.is_none() {
                    let manifest = serde_json::to_value(Manifest {
                        id: &id,
                        name: dependency.name(),
                        version: dependency.version(),
                        serializer: self.serializer.id(),
                    })
                    .map_err(|e| RuntimeError::Serialization(e.to_string()))?;
                    let bytes = self.serializer.serialize(&manifest)?;
                    self.store.put(&path, bytes).await?;
                    tracing::debug!(dependency = %dependency, assembly = %id, "Uploaded assembly");
                }
                uploaded.insert(id.clone());
            }
            ids.push(id);
        }

        Ok(ids)
    }

    pub async fn is_uploaded(&self, id: &AssemblyId) -> bool {
        self.uploaded.lock().await.contains(id)
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StoreProvider> {
        &self.store
    }

    #[must_use]
    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }
}

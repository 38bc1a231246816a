//! Typed resource registry.
//!
//! Resources are keyed by type: registering an `Arc<dyn StoreProvider>` makes
//! it retrievable as `dyn StoreProvider`. Iteration order is registration
//! order.

use std::any::{self, Any, TypeId};
use std::fmt;
use std::sync::Arc;

use crate::error::RuntimeError;

#[derive(Clone)]
struct ResourceEntry {
    key: TypeId,
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

#[derive(Clone, Default)]
pub struct ResourceRegistry {
    entries: Vec<ResourceEntry>,
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| entry.name))
            .finish()
    }
}

impl ResourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` unless a resource of type `T` is already present.
    /// Returns whether the value was stored.
    pub fn register<T>(&mut self, value: Arc<T>) -> bool
    where
        T: ?Sized + Send + Sync + 'static,
    {
        if self.contains::<T>() {
            return false;
        }
        self.entries.push(Self::entry(value));
        true
    }

    /// Store `value`, replacing any resource of type `T` in place.
    pub fn set<T>(&mut self, value: Arc<T>)
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let entry = Self::entry(value);
        match self.position(entry.key) {
            Some(index) => self.entries[index] = entry,
            None => self.entries.push(entry),
        }
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<T>(mut self, value: Arc<T>) -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.register(value);
        self
    }

    #[must_use]
    pub fn get<T>(&self) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let index = self.position(TypeId::of::<T>())?;
        self.entries[index]
            .value
            .downcast_ref::<Arc<T>>()
            .map(Arc::clone)
    }

    /// Like [`get`](Self::get), failing with `MissingCapability`.
    pub fn require<T>(&self) -> Result<Arc<T>, RuntimeError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.get::<T>()
            .ok_or(RuntimeError::MissingCapability(any::type_name::<T>()))
    }

    #[must_use]
    pub fn contains<T>(&self) -> bool
    where
        T: ?Sized + 'static,
    {
        self.position(TypeId::of::<T>()).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Type names of the registered resources, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.name).collect()
    }

    /// Union of `base` and `additions`; on a key conflict the addition wins.
    ///
    /// Base entries keep their positions; additions with new keys follow in
    /// their own order.
    #[must_use]
    pub fn merge(base: &ResourceRegistry, additions: &ResourceRegistry) -> Self {
        let mut merged = base.clone();
        for entry in &additions.entries {
            match merged.position(entry.key) {
                Some(index) => merged.entries[index] = entry.clone(),
                None => merged.entries.push(entry.clone()),
            }
        }
        merged
    }

    fn position(&self, key: TypeId) -> Option<usize> {
        self.entries.iter().position(|entry| entry.key == key)
    }

    fn entry<T>(value: Arc<T>) -> ResourceEntry
    where
        T: ?Sized + Send + Sync + 'static,
    {
        ResourceEntry {
            key: TypeId::of::<T>(),
            name: any::type_name::<T>(),
            value: Arc::new(value),
        }
    }
}

//! Generic name-keyed store.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::RegistryError;

/// What `register` does when the name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegisterPolicy {
    /// The new value replaces the old one; existing bindings observe it
    /// on their next call.
    #[default]
    Replace,
    /// Registration fails with `RegistryError::DuplicateName`.
    Reject,
}

/// Concurrent mapping from name to a shared capability instance.
pub struct Registry<T: ?Sized> {
    policy: RegisterPolicy,
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self::with_policy(RegisterPolicy::default())
    }

    pub fn with_policy(policy: RegisterPolicy) -> Self {
        Self {
            policy,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RegisterPolicy {
        self.policy
    }

    /// Store `value` under `name`.
    pub fn register(&self, name: &str, value: Arc<T>) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        let mut entries = self.entries.write();
        if self.policy == RegisterPolicy::Reject && entries.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        entries.insert(name.to_string(), value);
        Ok(())
    }

    /// Remove the value registered under `name`, returning it.
    pub fn unregister(&self, name: &str) -> Option<Arc<T>> {
        self.entries.write().remove(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// The value currently registered under `name`.
    ///
    /// This is a snapshot; use `binding` for a handle that follows
    /// later registrations.
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.read().get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Late-binding handle for `name`, or `None` for the empty name.
    ///
    /// The handle resolves the name on every call, so it observes values
    /// registered after it was created.
    pub fn binding(self: &Arc<Self>, name: &str) -> Option<Binding<T>> {
        if name.is_empty() {
            return None;
        }
        Some(Binding {
            name: name.to_string(),
            registry: Arc::clone(self),
        })
    }
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("policy", &self.policy)
            .field("names", &self.names())
            .finish()
    }
}

/// A `(name, registry)` pair that re-resolves on every use.
pub struct Binding<T: ?Sized> {
    name: String,
    registry: Arc<Registry<T>>,
}

impl<T: ?Sized> Binding<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value registered under the bound name right now.
    pub fn resolve(&self) -> Option<Arc<T>> {
        self.registry.get(&self.name)
    }
}

impl<T: ?Sized> Clone for Binding<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Binding<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding").field("name", &self.name).finish()
    }
}

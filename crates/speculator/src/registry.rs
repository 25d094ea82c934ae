//! Call-site registry and the safe-operation allow-list.
//!
//! Both are supplied by whoever decides where forks go: the registry maps a
//! call-site descriptor to a factory producing the deferred computation, and
//! the allow-list names the non-transactional operations speculative code may
//! perform without waiting for the commit token.

use crate::speculation::{task::Computation, types::Value};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;

pub type ComputationFactory = Arc<dyn Fn() -> Computation<Value> + Send + Sync>;

#[derive(Default)]
pub struct CallSiteRegistry {
    factories: DashMap<String, ComputationFactory>,
}

impl CallSiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` for `descriptor`, replacing any previous one.
    pub fn register<F>(&self, descriptor: impl Into<String>, factory: F)
    where
        F: Fn() -> Computation<Value> + Send + Sync + 'static,
    {
        self.factories.insert(descriptor.into(), Arc::new(factory));
    }

    pub fn resolve(&self, descriptor: &str) -> Option<Computation<Value>> {
        let factory = self.factories.get(descriptor).map(|entry| Arc::clone(entry.value()))?;
        Some(factory())
    }

    pub fn contains(&self, descriptor: &str) -> bool {
        self.factories.contains_key(descriptor)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for CallSiteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSiteRegistry")
            .field("call_sites", &self.factories.len())
            .finish()
    }
}

/// Operations speculative code may run outside its transaction.
#[derive(Debug, Default)]
pub struct SafeOperations {
    allowed: DashSet<String>,
}

impl SafeOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, operation: impl Into<String>) -> Self {
        self.allow(operation);
        self
    }

    pub fn allow(&self, operation: impl Into<String>) {
        self.allowed.insert(operation.into());
    }

    pub fn revoke(&self, operation: &str) -> bool {
        self.allowed.remove(operation).is_some()
    }

    pub fn is_safe(&self, operation: &str) -> bool {
        self.allowed.contains(operation)
    }
}

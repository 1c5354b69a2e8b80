//! `ServiceRegistry` — request path → service factory.

use csafe_core::service::Service;

use std::collections::HashMap;

/// Produces a fresh service instance per request.
pub type ServiceFactory = Box<dyn Fn() -> Box<dyn Service>>;

#[derive(Default)]
pub struct ServiceRegistry {
    factories: HashMap<&'static str, ServiceFactory>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under the path its services answer to.
    /// A later registration for the same path replaces the earlier one.
    pub fn register<F>(&mut self, path: &'static str, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn Service> + 'static,
    {
        self.factories.insert(path, Box::new(factory));
        self
    }

    pub fn create(&self, path: &str) -> Option<Box<dyn Service>> {
        self.factories.get(path).map(|f| f())
    }

    pub fn paths(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("paths", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

//! Maps a component `kind` name to the descriptor and body that instantiate
//! it, so a [`crate::graph::GraphDescription`] can name components by string
//! rather than requiring the caller to already hold a concrete
//! [`ComponentBody`].

use std::collections::HashMap;
use std::sync::Arc;

use fbp_core::component::{ComponentBody, ComponentDescriptor};
use fbp_core::error::{FbpError, Result};

/// Builds one component instance: a fresh descriptor and a fresh body.
///
/// Called once per `kind` named in a graph description's `components` map.
/// Each instance gets its own body — a registry entry is a factory, not a
/// singleton.
pub type ComponentFactory = Arc<dyn Fn() -> (ComponentDescriptor, Arc<dyn ComponentBody>) + Send + Sync>;

/// A lookup table from `kind` name to [`ComponentFactory`].
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    factories: HashMap<String, ComponentFactory>,
}

impl ComponentRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `kind`, overwriting any prior registration.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> (ComponentDescriptor, Arc<dyn ComponentBody>) + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
        self
    }

    /// The `kind` names currently registered, in no particular order.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    /// Describe the registered `kind` without instantiating it.
    ///
    /// # Errors
    ///
    /// Returns [`FbpError::UnknownComponent`] if `kind` isn't registered.
    pub fn describe(&self, kind: &str) -> Result<ComponentDescriptor> {
        self.instantiate(kind).map(|(d, _)| d)
    }

    /// Build one instance of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`FbpError::UnknownComponent`] if `kind` isn't registered.
    pub fn instantiate(&self, kind: &str) -> Result<(ComponentDescriptor, Arc<dyn ComponentBody>)> {
        self.factories.get(kind).map(|f| f()).ok_or_else(|| FbpError::UnknownComponent(kind.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fbp_core::component::ComponentContext;
    use fbp_core::port::PortSpec;
    use fbp_core::types::PortType;

    struct Noop;

    #[async_trait]
    impl ComponentBody for Noop {
        async fn run(&self, _ctx: &mut ComponentContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn instantiate_returns_fresh_bodies_per_call() {
        let mut registry = ComponentRegistry::new();
        registry.register("Noop", || {
            let descriptor = ComponentDescriptor::new("Noop").inport(PortSpec::new("IN", PortType::any()).optional());
            (descriptor, Arc::new(Noop) as Arc<dyn ComponentBody>)
        });

        let (d1, b1) = registry.instantiate("Noop").unwrap();
        let (d2, b2) = registry.instantiate("Noop").unwrap();
        assert_eq!(d1.kind, "Noop");
        assert_eq!(d2.kind, "Noop");
        assert!(!Arc::ptr_eq(&b1, &b2));
    }

    #[test]
    fn unregistered_kind_is_unknown_component() {
        let registry = ComponentRegistry::new();
        let err = registry.instantiate("Missing").unwrap_err();
        assert!(matches!(err, FbpError::UnknownComponent(_)));
    }
}

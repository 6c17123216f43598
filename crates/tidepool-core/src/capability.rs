//! Capability definitions and the capability registry.
//!
//! A capability is a named, schema-validated action the model may invoke
//! mid-generation. The registry is a static mapping from name to
//! implementation: pure lookup, no state. The pipeline never inspects a
//! capability's internals; concrete search/tool implementations live
//! outside this workspace and are registered at wiring time.

use crate::error::CapabilityError;
use crate::identifiers::CapabilityName;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A named action the model may invoke.
#[async_trait]
pub trait Capability: Send + Sync {
    /// The registered name (must parse as a [`CapabilityName`]).
    fn name(&self) -> &str;

    /// JSON-schema-shaped input description, also sent to the provider.
    fn input_schema(&self) -> &Value;

    /// Whether invoking this capability counts against the caller's
    /// premium-tool quota (e.g. deep multi-source research).
    fn premium(&self) -> bool {
        false
    }

    /// Execute the capability with validated input.
    async fn invoke(&self, input: Value) -> Result<Value, CapabilityError>;
}

/// Descriptor handed to the model provider so it can advertise the tool.
#[derive(Debug, Clone)]
pub struct CapabilityDescriptor {
    pub name: CapabilityName,
    pub input_schema: Value,
}

/// Static name → capability mapping.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<CapabilityName, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability, builder style.
    ///
    /// # Panics
    ///
    /// Panics if the capability's name fails validation. Registration
    /// happens at wiring time with names the author controls; use
    /// [`CapabilityRegistry::try_with_capability`] for dynamic names.
    pub fn with_capability(mut self, capability: Arc<dyn Capability>) -> Self {
        let name = CapabilityName::parse(capability.name()).expect("valid capability name");
        self.capabilities.insert(name, capability);
        self
    }

    /// Add a capability, validating its name.
    pub fn try_with_capability(
        mut self,
        capability: Arc<dyn Capability>,
    ) -> Result<Self, crate::identifiers::InvalidCapabilityName> {
        let name = CapabilityName::parse(capability.name())?;
        self.capabilities.insert(name, capability);
        Ok(self)
    }

    /// Typed lookup. `None` means the name is unknown; callers decide
    /// whether that is a repair case or a drop.
    pub fn get(&self, name: &CapabilityName) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    /// Descriptors for every registered capability, for the provider
    /// request. Order is unspecified.
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        self.capabilities
            .iter()
            .map(|(name, capability)| CapabilityDescriptor {
                name: name.clone(),
                input_schema: capability.input_schema().clone(),
            })
            .collect()
    }

    /// Whether any registered capability with this name is premium.
    pub fn is_premium(&self, name: &CapabilityName) -> bool {
        self.capabilities
            .get(name)
            .map(|capability| capability.premium())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoCapability {
        schema: Value,
    }

    impl EchoCapability {
        fn new() -> Self {
            Self {
                schema: json!({ "required": ["text"] }),
            }
        }
    }

    #[async_trait]
    impl Capability for EchoCapability {
        fn name(&self) -> &str {
            "echo"
        }

        fn input_schema(&self) -> &Value {
            &self.schema
        }

        async fn invoke(&self, input: Value) -> Result<Value, CapabilityError> {
            Ok(input)
        }
    }

    struct ResearchCapability {
        schema: Value,
    }

    #[async_trait]
    impl Capability for ResearchCapability {
        fn name(&self) -> &str {
            "deep_research"
        }

        fn input_schema(&self) -> &Value {
            &self.schema
        }

        fn premium(&self) -> bool {
            true
        }

        async fn invoke(&self, _input: Value) -> Result<Value, CapabilityError> {
            Ok(json!({ "sources": [] }))
        }
    }

    #[tokio::test]
    async fn registry_returns_registered_capability() {
        let registry = CapabilityRegistry::new().with_capability(Arc::new(EchoCapability::new()));
        let name = CapabilityName::parse("echo").unwrap();

        let capability = registry.get(&name).expect("echo is registered");
        let output = capability.invoke(json!({ "text": "hi" })).await.unwrap();
        assert_eq!(output, json!({ "text": "hi" }));
    }

    #[test]
    fn lookup_of_unknown_name_is_none() {
        let registry = CapabilityRegistry::new();
        let name = CapabilityName::parse("missing").unwrap();
        assert!(registry.get(&name).is_none());
    }

    #[test]
    fn premium_flag_is_visible_through_registry() {
        let registry = CapabilityRegistry::new()
            .with_capability(Arc::new(EchoCapability::new()))
            .with_capability(Arc::new(ResearchCapability {
                schema: json!({ "required": ["topic"] }),
            }));

        assert!(registry.is_premium(&CapabilityName::parse("deep_research").unwrap()));
        assert!(!registry.is_premium(&CapabilityName::parse("echo").unwrap()));
        assert!(!registry.is_premium(&CapabilityName::parse("missing").unwrap()));
    }

    #[test]
    fn descriptors_cover_all_capabilities() {
        let registry = CapabilityRegistry::new().with_capability(Arc::new(EchoCapability::new()));
        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name.as_str(), "echo");
    }
}

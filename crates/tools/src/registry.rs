//! Static tool registry.
//!
//! Tools are code-defined: each slug carries a descriptor (name, human
//! description, JSON-Schema parameters) and a table of integration classes
//! that can back it. The mapping is compiled in; an agent's `provider_tag`
//! strings resolve through these tables, never through dynamic lookup.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json::{json, Value};

use voice_broker_core::{ToolBinding, ToolSpec};

use crate::integrations::{ToolIntegration, WooOrderLookup, WooProductStock};
use crate::ToolError;

pub type IntegrationFactory = fn(&Value) -> Result<Arc<dyn ToolIntegration>, ToolError>;

/// Static, code-defined description of one tool.
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
    pub integrations: Vec<(&'static str, IntegrationFactory)>,
}

impl ToolDescriptor {
    pub fn to_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.to_string(),
            description: self.description.to_string(),
            parameters: self.parameters.clone(),
        }
    }
}

static TOOLS: Lazy<HashMap<&'static str, ToolDescriptor>> = Lazy::new(|| {
    let mut tools = HashMap::new();

    tools.insert(
        "product_stock",
        ToolDescriptor {
            name: "product_stock",
            description: "Check real-time stock and availability for a product. Use this \
                          only when the customer asks whether something is in stock.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Product name or keywords to look up"
                    },
                    "product_id": {
                        "type": "string",
                        "description": "Exact product id, if known"
                    }
                },
                "required": ["query"]
            }),
            integrations: vec![
                ("wordpress", WooProductStock::from_config as IntegrationFactory),
                ("woocommerce", WooProductStock::from_config as IntegrationFactory),
            ],
        },
    );

    tools.insert(
        "order_lookup",
        ToolDescriptor {
            name: "order_lookup",
            description: "Look up order status and details. Requires the order number AND a \
                          customer identifier (email or phone) for verification. If the \
                          caller's phone number is known from the call context, use that \
                          automatically.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "order_number": {
                        "type": "string",
                        "description": "The order number to look up"
                    },
                    "customer_email": {
                        "type": "string",
                        "description": "Customer email address for verification"
                    },
                    "customer_phone": {
                        "type": "string",
                        "description": "Customer phone number for verification (digits only)"
                    }
                },
                "required": ["order_number"]
            }),
            integrations: vec![
                ("woocommerce", WooOrderLookup::from_config as IntegrationFactory),
            ],
        },
    );

    tools
});

/// Lookup facade over the static tables.
pub struct ToolRegistry;

impl ToolRegistry {
    pub fn descriptor(tool_slug: &str) -> Option<&'static ToolDescriptor> {
        TOOLS.get(tool_slug)
    }

    pub fn tool_slugs() -> Vec<&'static str> {
        TOOLS.keys().copied().collect()
    }

    /// Instantiate the integration backing a binding.
    pub fn create_integration(binding: &ToolBinding) -> Result<Arc<dyn ToolIntegration>, ToolError> {
        let descriptor = Self::descriptor(&binding.tool_slug).ok_or(ToolError::NotAvailable)?;
        let factory = descriptor
            .integrations
            .iter()
            .find(|(slug, _)| *slug == binding.integration_slug)
            .map(|(_, f)| *f)
            .ok_or(ToolError::NotAvailable)?;
        factory(&binding.integration_config)
    }
}

/// The default resolver used by session executors: bindings resolve through
/// the static registry.
pub fn registry_resolver() -> crate::executor::IntegrationResolver {
    Arc::new(|binding: &ToolBinding| ToolRegistry::create_integration(binding))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_descriptors_present() {
        assert!(ToolRegistry::descriptor("product_stock").is_some());
        assert!(ToolRegistry::descriptor("order_lookup").is_some());
        assert!(ToolRegistry::descriptor("unknown_tool").is_none());
    }

    #[test]
    fn test_descriptor_parameters_are_schemas() {
        let descriptor = ToolRegistry::descriptor("order_lookup").unwrap();
        assert_eq!(descriptor.parameters["type"], "object");
        assert_eq!(descriptor.parameters["required"][0], "order_number");
    }

    #[test]
    fn test_unknown_integration_rejected() {
        let binding = ToolBinding {
            id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            tool_slug: "product_stock".into(),
            integration_slug: "shopify".into(),
            integration_config: json!({}),
            enabled: true,
        };
        assert!(matches!(
            ToolRegistry::create_integration(&binding),
            Err(ToolError::NotAvailable)
        ));
    }

    #[test]
    fn test_known_integration_with_config() {
        let binding = ToolBinding {
            id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            tool_slug: "product_stock".into(),
            integration_slug: "wordpress".into(),
            integration_config: json!({
                "store_url": "https://shop.example",
                "consumer_key": "ck",
                "consumer_secret": "cs",
            }),
            enabled: true,
        };
        assert!(ToolRegistry::create_integration(&binding).is_ok());
    }
}

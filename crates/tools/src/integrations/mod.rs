//! Integration contracts and shared types.
//!
//! An integration is a concrete implementation of a tool for a specific
//! backend. `execute` takes the model's argument object and returns a JSON
//! map that always carries `success`; catalog-capable integrations
//! additionally expose bulk product fetch for the sync pipeline.

mod order;
mod woocommerce;

pub use order::{OrderBackend, OrderItem, OrderLookupTool, OrderRecord};
pub use woocommerce::{WooCommerceConfig, WooOrderLookup, WooProductStock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ToolError;

/// A concrete tool implementation bound to one backend.
#[async_trait]
pub trait ToolIntegration: Send + Sync {
    /// Run the tool. The returned map must contain `success: bool`; errors
    /// the integration can describe should come back as
    /// `{success:false, error}` rather than `Err`.
    async fn execute(&self, arguments: &Value) -> Result<Value, ToolError>;

    /// Catalog-capable integrations return themselves here.
    fn as_catalog(&self) -> Option<&dyn CatalogSource> {
        None
    }

    /// Release connections. Called when the session ends.
    async fn close(&self) {}
}

/// Extended contract for integrations that can enumerate their catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Fetch products, optionally restricted to those modified after the
    /// given instant (incremental sync).
    async fn fetch_all_products(
        &self,
        modified_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<SourceProduct>, ToolError>;
}

/// A product variation attribute, e.g. `Color: red, blue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductAttribute {
    pub name: String,
    pub options: Vec<String>,
}

/// One product as the source system describes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceProduct {
    pub external_id: String,
    pub name: String,
    pub description: Option<String>,
    pub long_description: Option<String>,
    /// Price as the source formats it; never parsed into floats.
    pub price: Option<String>,
    pub currency: Option<String>,
    pub category: Option<String>,
    pub sku: Option<String>,
    pub url: Option<String>,
    pub image_url: Option<String>,
    pub in_stock: bool,
    pub on_sale: bool,
    pub regular_price: Option<String>,
    #[serde(default)]
    pub attributes: Vec<ProductAttribute>,
    /// Anything else the source returned, carried opaquely.
    #[serde(default)]
    pub extra: Value,
    pub source_updated_at: Option<DateTime<Utc>>,
}

impl SourceProduct {
    pub fn new(external_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            name: name.into(),
            description: None,
            long_description: None,
            price: None,
            currency: None,
            category: None,
            sku: None,
            url: None,
            image_url: None,
            in_stock: true,
            on_sale: false,
            regular_price: None,
            attributes: Vec::new(),
            extra: Value::Null,
            source_updated_at: None,
        }
    }
}

/// Strip markup from source-supplied descriptions. WooCommerce returns
/// HTML; the embedding text and spoken replies want plain words.
pub(crate) fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

//! Content hashing for change detection.
//!
//! The hash covers exactly the fields that feed the embedding text, so a
//! row re-embeds when and only when its spoken-about content changed. The
//! feature set must stay stable across releases; the schema version seed
//! exists for the one case where it intentionally must not.

use sha2::{Digest, Sha256};

use voice_broker_tools::SourceProduct;

/// Bump to intentionally invalidate every stored hash (forces a full
/// re-embed on the next sync).
pub const HASH_SCHEMA_VERSION: &str = "v1";

/// Digest over the canonical feature set, pipe-joined, SHA-256 hex.
pub fn content_hash(product: &SourceProduct) -> String {
    let mut fields: Vec<String> = vec![
        HASH_SCHEMA_VERSION.to_string(),
        product.name.clone(),
        product.description.clone().unwrap_or_default(),
        product.long_description.clone().unwrap_or_default(),
        product.price.clone().unwrap_or_default(),
        product.currency.clone().unwrap_or_default(),
        product.category.clone().unwrap_or_default(),
        product.sku.clone().unwrap_or_default(),
        product.in_stock.to_string(),
        product.url.clone().unwrap_or_default(),
    ];

    if product.on_sale {
        fields.push(product.regular_price.clone().unwrap_or_default());
        fields.push("on_sale".to_string());
    }

    for attr in &product.attributes {
        fields.push(format!("{}:{}", attr.name, attr.options.join(",")));
    }

    let joined = fields.join("|");
    let digest = Sha256::digest(joined.as_bytes());
    format!("{digest:x}")
}

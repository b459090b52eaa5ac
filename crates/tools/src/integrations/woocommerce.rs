//! WooCommerce integrations.
//!
//! Talks to the WooCommerce REST API (`/wp-json/wc/v3`) with consumer
//! key/secret query auth. Backs the `product_stock` tool, the bulk catalog
//! fetch used by the sync pipeline, and the `order_lookup` backend.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;

use super::order::{OrderBackend, OrderItem, OrderLookupTool, OrderRecord};
use super::{strip_html, CatalogSource, ProductAttribute, SourceProduct, ToolIntegration};
use crate::ToolError;

/// Connection settings shared by the WooCommerce integrations.
#[derive(Debug, Clone)]
pub struct WooCommerceConfig {
    pub store_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub currency: String,
    /// 0 means unlimited.
    pub max_products: usize,
}

impl WooCommerceConfig {
    pub fn from_value(config: &Value) -> Result<Self, ToolError> {
        let get = |key: &str| {
            config
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ToolError::Configuration(format!("{key} is required")))
        };

        Ok(Self {
            store_url: get("store_url")?.trim_end_matches('/').to_string(),
            consumer_key: get("consumer_key")?,
            consumer_secret: get("consumer_secret")?,
            currency: config
                .get("currency")
                .and_then(Value::as_str)
                .unwrap_or("EUR")
                .to_string(),
            max_products: config
                .get("max_products")
                .and_then(|v| match v {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.parse().ok(),
                    _ => None,
                })
                .unwrap_or(0) as usize,
        })
    }
}

struct WooClient {
    http: Client,
    config: WooCommerceConfig,
}

impl WooClient {
    fn new(config: WooCommerceConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> Result<Value, ToolError> {
        let url = format!("{}/wp-json/wc/v3{}", self.config.store_url, path);
        let mut query: Vec<(&str, String)> = vec![
            ("consumer_key", self.config.consumer_key.clone()),
            ("consumer_secret", self.config.consumer_secret.clone()),
        ];
        query.extend(params.iter().cloned());

        let response = self
            .http
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ToolError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Http(format!(
                "woocommerce returned {status}: {body}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| ToolError::Integration(format!("invalid woocommerce response: {e}")))
    }
}

fn parse_wc_datetime(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let s = value?.as_str()?;
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Product stock + catalog
// ---------------------------------------------------------------------------

/// `product_stock` backed by the WooCommerce products endpoint. Also the
/// catalog source for product sync.
pub struct WooProductStock {
    client: WooClient,
}

impl WooProductStock {
    pub fn from_config(config: &Value) -> Result<Arc<dyn ToolIntegration>, ToolError> {
        Ok(Arc::new(Self {
            client: WooClient::new(WooCommerceConfig::from_value(config)?),
        }))
    }

    fn stock_entry(product: &Value) -> Value {
        let stock_status = product
            .get("stock_status")
            .and_then(Value::as_str)
            .unwrap_or("outofstock");
        let in_stock = stock_status == "instock";
        json!({
            "id": product.get("id").cloned().unwrap_or(Value::Null),
            "name": product.get("name").and_then(Value::as_str).unwrap_or(""),
            "in_stock": in_stock,
            "availability": if in_stock { "In stock" } else { "Out of stock" },
            "stock_quantity": product.get("stock_quantity").cloned().unwrap_or(Value::Null),
            "price": product.get("price").cloned().unwrap_or(Value::Null),
        })
    }

    fn parse_for_sync(&self, product: &Value) -> SourceProduct {
        let external_id = product
            .get("id")
            .map(|v| match v {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => String::new(),
            })
            .unwrap_or_default();

        let mut out = SourceProduct::new(
            external_id,
            product.get("name").and_then(Value::as_str).unwrap_or(""),
        );
        out.description = product
            .get("short_description")
            .and_then(Value::as_str)
            .map(strip_html)
            .filter(|s| !s.is_empty());
        out.long_description = product
            .get("description")
            .and_then(Value::as_str)
            .map(strip_html)
            .filter(|s| !s.is_empty());
        out.price = product
            .get("price")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        out.currency = Some(self.client.config.currency.clone());
        out.category = product
            .get("categories")
            .and_then(Value::as_array)
            .and_then(|cats| cats.first())
            .and_then(|c| c.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        out.sku = product
            .get("sku")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        out.url = product
            .get("permalink")
            .and_then(Value::as_str)
            .map(str::to_string);
        out.image_url = product
            .get("images")
            .and_then(Value::as_array)
            .and_then(|imgs| imgs.first())
            .and_then(|i| i.get("src"))
            .and_then(Value::as_str)
            .map(str::to_string);
        out.in_stock = product
            .get("stock_status")
            .and_then(Value::as_str)
            .map_or(true, |s| s == "instock");
        out.on_sale = product
            .get("on_sale")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        out.regular_price = product
            .get("regular_price")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        out.attributes = product
            .get("attributes")
            .and_then(Value::as_array)
            .map(|attrs| {
                attrs
                    .iter()
                    .filter_map(|a| {
                        Some(ProductAttribute {
                            name: a.get("name")?.as_str()?.to_string(),
                            options: a
                                .get("options")
                                .and_then(Value::as_array)
                                .map(|opts| {
                                    opts.iter()
                                        .filter_map(Value::as_str)
                                        .map(str::to_string)
                                        .collect()
                                })
                                .unwrap_or_default(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.source_updated_at = parse_wc_datetime(product.get("date_modified_gmt"));
        out
    }
}

#[async_trait]
impl ToolIntegration for WooProductStock {
    async fn execute(&self, arguments: &Value) -> Result<Value, ToolError> {
        let product_id = arguments.get("product_id").and_then(Value::as_str);
        let query = arguments.get("query").and_then(Value::as_str);

        let products: Vec<Value> = if let Some(id) = product_id {
            let product = self.client.get(&format!("/products/{id}"), &[]).await?;
            vec![product]
        } else if let Some(query) = query {
            let results = self
                .client
                .get(
                    "/products",
                    &[
                        ("search", query.to_string()),
                        ("per_page", "5".to_string()),
                        ("status", "publish".to_string()),
                    ],
                )
                .await?;
            results.as_array().cloned().unwrap_or_default()
        } else {
            return Ok(json!({
                "success": false,
                "error": "query or product_id is required",
            }));
        };

        let entries: Vec<Value> = products.iter().map(Self::stock_entry).collect();
        Ok(json!({
            "success": true,
            "count": entries.len(),
            "products": entries,
        }))
    }

    fn as_catalog(&self) -> Option<&dyn CatalogSource> {
        Some(self)
    }
}

#[async_trait]
impl CatalogSource for WooProductStock {
    async fn fetch_all_products(
        &self,
        modified_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<SourceProduct>, ToolError> {
        let max_products = self.client.config.max_products;
        let per_page = 100usize;
        let mut all = Vec::new();
        let mut page = 1usize;

        if let Some(since) = modified_after {
            tracing::info!(%since, "incremental catalog fetch");
        }

        loop {
            let mut params = vec![
                ("per_page", per_page.to_string()),
                ("page", page.to_string()),
                ("status", "publish".to_string()),
            ];
            if let Some(since) = modified_after {
                params.push(("modified_after", since.format("%Y-%m-%dT%H:%M:%S").to_string()));
            }

            let body = self.client.get("/products", &params).await?;
            let products = body.as_array().cloned().unwrap_or_default();
            if products.is_empty() {
                break;
            }

            let parsed: Vec<SourceProduct> =
                products.iter().map(|p| self.parse_for_sync(p)).collect();
            let page_len = parsed.len();

            if max_products > 0 && all.len() + page_len >= max_products {
                let remaining = max_products - all.len();
                all.extend(parsed.into_iter().take(remaining));
                tracing::info!(max_products, "catalog fetch hit configured cap");
                break;
            }
            all.extend(parsed);
            tracing::debug!(page, total = all.len(), "fetched catalog page");

            if page_len < per_page {
                break;
            }
            page += 1;
        }

        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Order lookup
// ---------------------------------------------------------------------------

struct WooOrderBackend {
    client: WooClient,
}

impl WooOrderBackend {
    fn parse_order(&self, order: &Value) -> OrderRecord {
        let billing = order.get("billing").cloned().unwrap_or(Value::Null);
        let shipping = order.get("shipping").cloned().unwrap_or(Value::Null);

        let name = {
            let first = billing.get("first_name").and_then(Value::as_str).unwrap_or("");
            let last = billing.get("last_name").and_then(Value::as_str).unwrap_or("");
            let full = format!("{first} {last}").trim().to_string();
            (!full.is_empty()).then_some(full)
        };

        let address = {
            let parts: Vec<&str> = ["address_1", "city", "postcode", "country"]
                .iter()
                .filter_map(|k| shipping.get(*k).and_then(Value::as_str))
                .filter(|s| !s.is_empty())
                .collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        };

        OrderRecord {
            order_id: order
                .get("number")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| order.get("id").map(|v| v.to_string()))
                .unwrap_or_default(),
            status: order
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            customer_email: billing
                .get("email")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            customer_phone: billing
                .get("phone")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            customer_name: name,
            total: order
                .get("total")
                .and_then(Value::as_str)
                .and_then(|s| s.parse().ok()),
            currency: order
                .get("currency")
                .and_then(Value::as_str)
                .map(str::to_string),
            created_at: parse_wc_datetime(order.get("date_created_gmt")),
            shipping_address: address,
            tracking_number: None,
            tracking_url: None,
            items: order
                .get("line_items")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .map(|item| OrderItem {
                            name: item
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string(),
                            quantity: item
                                .get("quantity")
                                .and_then(Value::as_u64)
                                .unwrap_or(0) as u32,
                            price: item.get("price").and_then(Value::as_f64),
                            sku: item
                                .get("sku")
                                .and_then(Value::as_str)
                                .filter(|s| !s.is_empty())
                                .map(str::to_string),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl OrderBackend for WooOrderBackend {
    async fn lookup_by_order_number(
        &self,
        order_number: &str,
    ) -> Result<Option<OrderRecord>, ToolError> {
        match self.client.get(&format!("/orders/{order_number}"), &[]).await {
            Ok(order) => Ok(Some(self.parse_order(&order))),
            Err(ToolError::Http(msg)) if msg.contains("404") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn lookup_by_email(
        &self,
        email: &str,
        limit: usize,
    ) -> Result<Vec<OrderRecord>, ToolError> {
        let body = self
            .client
            .get(
                "/orders",
                &[
                    ("search", email.to_string()),
                    ("per_page", limit.to_string()),
                ],
            )
            .await?;
        Ok(body
            .as_array()
            .map(|orders| orders.iter().map(|o| self.parse_order(o)).collect())
            .unwrap_or_default())
    }
}

/// `order_lookup` backed by WooCommerce.
pub struct WooOrderLookup;

impl WooOrderLookup {
    pub fn from_config(config: &Value) -> Result<Arc<dyn ToolIntegration>, ToolError> {
        let backend = WooOrderBackend {
            client: WooClient::new(WooCommerceConfig::from_value(config)?),
        };
        Ok(Arc::new(OrderLookupTool::new(Arc::new(backend))))
    }
}

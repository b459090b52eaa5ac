//! Order lookup with customer verification.
//!
//! Backends supply the raw lookups; the tool layered on top enforces the
//! verification discipline: an order is only disclosed when the caller has
//! provided an identifier that matches the stored record. A found-but-
//! unverified order returns a message asking for verification, never the
//! order contents.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

use super::ToolIntegration;
use crate::ToolError;

/// One line item.
#[derive(Debug, Clone)]
pub struct OrderItem {
    pub name: String,
    pub quantity: u32,
    pub price: Option<f64>,
    pub sku: Option<String>,
}

impl OrderItem {
    fn to_json(&self) -> Value {
        let mut obj = json!({
            "name": self.name,
            "quantity": self.quantity,
        });
        if let Some(price) = self.price {
            obj["price"] = json!(price);
        }
        if let Some(ref sku) = self.sku {
            obj["sku"] = json!(sku);
        }
        obj
    }
}

/// A stored order as the backend returned it.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub order_id: String,
    pub status: String,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_name: Option<String>,
    pub total: Option<f64>,
    pub currency: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub shipping_address: Option<String>,
    pub tracking_number: Option<String>,
    pub tracking_url: Option<String>,
    pub items: Vec<OrderItem>,
}

impl OrderRecord {
    /// Does the provided email or phone match this order's customer?
    ///
    /// Phones compare on their last ten digits so country-code prefixes do
    /// not matter, and the provided number must itself carry at least ten
    /// digits.
    pub fn verify_customer(&self, email: Option<&str>, phone: Option<&str>) -> bool {
        if let (Some(provided), Some(stored)) = (email, self.customer_email.as_deref()) {
            if provided.trim().eq_ignore_ascii_case(stored.trim()) {
                return true;
            }
        }

        if let (Some(provided), Some(stored)) = (phone, self.customer_phone.as_deref()) {
            let provided_digits: String = provided.chars().filter(char::is_ascii_digit).collect();
            let stored_digits: String = stored.chars().filter(char::is_ascii_digit).collect();
            if provided_digits.len() >= 10
                && last_n(&provided_digits, 10) == last_n(&stored_digits, 10)
            {
                return true;
            }
        }

        false
    }

    /// The disclosable view of the order. The stored phone number is never
    /// echoed back.
    pub fn to_public_json(&self) -> Value {
        let mut obj = json!({
            "order_id": self.order_id,
            "status": self.status,
        });
        if let Some(ref name) = self.customer_name {
            obj["customer_name"] = json!(name);
        }
        if let Some(ref email) = self.customer_email {
            obj["customer_email"] = json!(email);
        }
        if let Some(total) = self.total {
            obj["total"] = json!(total);
        }
        if let Some(ref currency) = self.currency {
            obj["currency"] = json!(currency);
        }
        if let Some(created) = self.created_at {
            obj["created_at"] = json!(created.to_rfc3339());
        }
        if let Some(ref addr) = self.shipping_address {
            obj["shipping_address"] = json!(addr);
        }
        if let Some(ref tn) = self.tracking_number {
            obj["tracking_number"] = json!(tn);
        }
        if let Some(ref tu) = self.tracking_url {
            obj["tracking_url"] = json!(tu);
        }
        if !self.items.is_empty() {
            obj["items"] = Value::Array(self.items.iter().map(OrderItem::to_json).collect());
        }
        obj
    }
}

fn last_n(digits: &str, n: usize) -> &str {
    let len = digits.len();
    &digits[len.saturating_sub(n)..]
}

/// Raw order lookups against one commerce backend.
#[async_trait]
pub trait OrderBackend: Send + Sync {
    async fn lookup_by_order_number(
        &self,
        order_number: &str,
    ) -> Result<Option<OrderRecord>, ToolError>;

    async fn lookup_by_email(
        &self,
        email: &str,
        limit: usize,
    ) -> Result<Vec<OrderRecord>, ToolError>;

    async fn close(&self) {}
}

/// The `order_lookup` tool: backend lookups plus the verification gate.
pub struct OrderLookupTool {
    backend: Arc<dyn OrderBackend>,
}

impl OrderLookupTool {
    pub fn new(backend: Arc<dyn OrderBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ToolIntegration for OrderLookupTool {
    async fn execute(&self, arguments: &Value) -> Result<Value, ToolError> {
        let order_number = arguments.get("order_number").and_then(Value::as_str);
        let customer_email = arguments.get("customer_email").and_then(Value::as_str);
        let customer_phone = arguments.get("customer_phone").and_then(Value::as_str);

        if let Some(order_number) = order_number {
            let Some(record) = self.backend.lookup_by_order_number(order_number).await? else {
                return Ok(json!({
                    "success": true,
                    "found": false,
                    "message": format!("No order found with number {order_number}"),
                }));
            };

            if customer_email.is_some() || customer_phone.is_some() {
                if record.verify_customer(customer_email, customer_phone) {
                    return Ok(json!({
                        "success": true,
                        "found": true,
                        "verified": true,
                        "order": record.to_public_json(),
                    }));
                }
                return Ok(json!({
                    "success": true,
                    "found": true,
                    "verified": false,
                    "message": format!(
                        "Order {order_number} found but the provided email/phone does not \
                         match our records. Please verify your information."
                    ),
                }));
            }

            // No identifier offered yet: ask for one, disclose nothing.
            return Ok(json!({
                "success": true,
                "found": true,
                "verified": false,
                "message": format!(
                    "Order {order_number} found. For security, please provide your email \
                     address or phone number to verify your identity."
                ),
            }));
        }

        if let Some(email) = customer_email {
            let orders = self.backend.lookup_by_email(email, 5).await?;
            return Ok(json!({
                "success": true,
                "orders": orders.iter().map(OrderRecord::to_public_json).collect::<Vec<_>>(),
                "count": orders.len(),
            }));
        }

        Ok(json!({
            "success": false,
            "error": "Order number is required. Please also provide your email or phone \
                      number for verification.",
        }))
    }

    async fn close(&self) {
        self.backend.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> OrderRecord {
        OrderRecord {
            order_id: "12345".into(),
            status: "processing".into(),
            customer_email: Some("Jamie@Example.com".into()),
            customer_phone: Some("+1-555-111-2222".into()),
            customer_name: Some("Jamie Doe".into()),
            total: Some(42.5),
            currency: Some("USD".into()),
            created_at: None,
            shipping_address: Some("1 Main St".into()),
            tracking_number: None,
            tracking_url: None,
            items: vec![OrderItem {
                name: "Red Widget".into(),
                quantity: 2,
                price: Some(10.0),
                sku: None,
            }],
        }
    }

    struct OneOrder;

    #[async_trait]
    impl OrderBackend for OneOrder {
        async fn lookup_by_order_number(
            &self,
            order_number: &str,
        ) -> Result<Option<OrderRecord>, ToolError> {
            Ok((order_number == "12345").then(record))
        }

        async fn lookup_by_email(
            &self,
            email: &str,
            _limit: usize,
        ) -> Result<Vec<OrderRecord>, ToolError> {
            Ok(if email.eq_ignore_ascii_case("jamie@example.com") {
                vec![record()]
            } else {
                vec![]
            })
        }
    }

    #[test]
    fn test_verify_email_case_insensitive() {
        let r = record();
        assert!(r.verify_customer(Some("jamie@example.com"), None));
        assert!(!r.verify_customer(Some("other@example.com"), None));
    }

    #[test]
    fn test_verify_phone_last_ten_digits() {
        let r = record();
        assert!(r.verify_customer(None, Some("5551112222")));
        assert!(r.verify_customer(None, Some("+1 (555) 111-2222")));
        // Fewer than ten digits never verifies.
        assert!(!r.verify_customer(None, Some("1112222")));
    }

    #[test]
    fn test_public_json_never_contains_phone() {
        let json = record().to_public_json();
        assert!(json.get("customer_phone").is_none());
        assert_eq!(json["order_id"], "12345");
    }

    #[tokio::test]
    async fn test_found_without_identifier_withholds_order() {
        let tool = OrderLookupTool::new(Arc::new(OneOrder));
        let result = tool
            .execute(&json!({"order_number": "12345"}))
            .await
            .unwrap();
        assert_eq!(result["found"], true);
        assert_eq!(result["verified"], false);
        assert!(result.get("order").is_none());
        let message = result["message"].as_str().unwrap();
        assert!(message.contains("email"));
        assert!(message.contains("phone"));
    }

    #[tokio::test]
    async fn test_mismatched_identifier_withholds_order() {
        let tool = OrderLookupTool::new(Arc::new(OneOrder));
        let result = tool
            .execute(&json!({"order_number": "12345", "customer_phone": "9998887777"}))
            .await
            .unwrap();
        assert_eq!(result["verified"], false);
        assert!(result.get("order").is_none());
    }

    #[tokio::test]
    async fn test_verified_lookup_discloses_order() {
        let tool = OrderLookupTool::new(Arc::new(OneOrder));
        let result = tool
            .execute(&json!({"order_number": "12345", "customer_email": "jamie@example.com"}))
            .await
            .unwrap();
        assert_eq!(result["verified"], true);
        assert_eq!(result["order"]["status"], "processing");
    }

    #[tokio::test]
    async fn test_missing_order_number_is_tool_error_result() {
        let tool = OrderLookupTool::new(Arc::new(OneOrder));
        let result = tool.execute(&json!({})).await.unwrap();
        assert_eq!(result["success"], false);
    }

    #[tokio::test]
    async fn test_unknown_order_reports_not_found() {
        let tool = OrderLookupTool::new(Arc::new(OneOrder));
        let result = tool
            .execute(&json!({"order_number": "99999"}))
            .await
            .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["found"], false);
    }
}

//! Hosted-checkout payment gateway boundary.
//!
//! The core only relies on three gateway capabilities: creating a hosted
//! checkout session, reading a session back with its purchased lines, and
//! issuing a refund. [`StripeGateway`] implements them over the REST API.

pub mod stripe;
pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

pub use stripe::StripeGateway;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway unreachable: {0}")]
    Transport(String),
    #[error("payment gateway returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected payment gateway response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Transport(err.to_string())
        }
    }
}

/// One line of the cart as priced by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLine {
    pub product_id: Uuid,
    pub size: Option<String>,
    pub name: String,
    pub image_url: Option<String>,
    pub unit_amount: i64,
    pub quantity: i32,
}

/// Line reference carried in the session metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataItem {
    #[serde(rename = "p")]
    pub product_id: Uuid,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(rename = "q")]
    pub quantity: i32,
}

/// Information the checkout hands over to the reconciler through the
/// gateway session, the only durable carrier between the two.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionMetadata {
    pub user_id: Option<Uuid>,
    pub items: Vec<MetadataItem>,
    pub discount_code: Option<String>,
    pub discount_amount: i64,
}

impl SessionMetadata {
    const GUEST: &'static str = "guest";
    const ITEMS_PER_KEY: usize = 6;

    /// Flattens into the string map gateways accept as metadata.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(
            "user_id".to_string(),
            self.user_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| Self::GUEST.to_string()),
        );
        // Gateways cap metadata values (500 chars for Stripe), so the item
        // list is spread over `items_0`, `items_1`, ...
        for (index, chunk) in self.items.chunks(Self::ITEMS_PER_KEY).enumerate() {
            map.insert(
                format!("items_{index}"),
                serde_json::to_string(chunk).unwrap_or_else(|_| "[]".to_string()),
            );
        }
        if let Some(code) = &self.discount_code {
            map.insert("discount_code".to_string(), code.clone());
        }
        map.insert(
            "discount_amount".to_string(),
            self.discount_amount.to_string(),
        );
        map
    }

    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, GatewayError> {
        let user_id = match map.get("user_id").map(String::as_str) {
            None | Some(Self::GUEST) | Some("") => None,
            Some(raw) => Some(
                Uuid::parse_str(raw)
                    .map_err(|e| GatewayError::Decode(format!("metadata user_id: {e}")))?,
            ),
        };
        let mut items = Vec::new();
        for index in 0.. {
            let Some(raw) = map.get(&format!("items_{index}")) else {
                break;
            };
            let chunk: Vec<MetadataItem> = serde_json::from_str(raw)
                .map_err(|e| GatewayError::Decode(format!("metadata items: {e}")))?;
            items.extend(chunk);
        }
        let discount_amount = map
            .get("discount_amount")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(Self {
            user_id,
            items,
            discount_code: map.get("discount_code").filter(|c| !c.is_empty()).cloned(),
            discount_amount,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub lines: Vec<SessionLine>,
    /// Applied as a one-off amount coupon on the gateway side.
    pub discount_amount: i64,
    pub currency: String,
    pub customer_email: Option<String>,
    pub shipping_countries: Vec<String>,
    pub metadata: SessionMetadata,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerDetails {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub shipping_name: Option<String>,
    pub address: Option<Address>,
}

/// A purchased line as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchasedLine {
    pub product_id: Option<Uuid>,
    pub size: Option<String>,
    pub description: String,
    pub quantity: i32,
    pub unit_amount: i64,
    pub amount_total: i64,
}

/// Authoritative view of a checkout session, read back from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub payment_status: String,
    pub payment_intent: Option<String>,
    pub currency: String,
    pub amount_subtotal: i64,
    pub amount_total: i64,
    pub amount_discount: i64,
    pub amount_shipping: i64,
    pub amount_tax: i64,
    pub customer: CustomerDetails,
    pub metadata: SessionMetadata,
    pub line_items: Vec<PurchasedLine>,
}

impl CheckoutSession {
    pub fn is_paid(&self) -> bool {
        self.payment_status == "paid"
    }

    /// Correlation key for the order: the payment reference when the
    /// gateway exposes one, otherwise the session id.
    pub fn payment_reference(&self) -> &str {
        self.payment_intent.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub payment_id: String,
    pub amount: i64,
    pub idempotency_key: String,
    pub order_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub amount: i64,
    pub status: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreatedSession, GatewayError>;

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, GatewayError>;

    async fn create_refund(&self, request: &RefundRequest) -> Result<Refund, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_survives_the_string_map() {
        let meta = SessionMetadata {
            user_id: Some(Uuid::new_v4()),
            items: (0..9)
                .map(|i| MetadataItem {
                    product_id: Uuid::new_v4(),
                    size: (i % 2 == 0).then(|| "M".to_string()),
                    quantity: i + 1,
                })
                .collect(),
            discount_code: Some("WELCOME10".into()),
            discount_amount: 450,
        };
        let map = meta.to_map();
        assert!(map.values().all(|v| v.len() <= 500));
        assert!(map.contains_key("items_1"));
        let decoded = SessionMetadata::from_map(&map).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn guest_metadata_has_no_user() {
        let mut map = HashMap::new();
        map.insert("user_id".to_string(), "guest".to_string());
        let decoded = SessionMetadata::from_map(&map).unwrap();
        assert_eq!(decoded.user_id, None);
        assert!(decoded.items.is_empty());
        assert_eq!(decoded.discount_amount, 0);
    }

    #[test]
    fn malformed_items_are_rejected() {
        let mut map = HashMap::new();
        map.insert("items_0".to_string(), "{not json".to_string());
        assert!(matches!(
            SessionMetadata::from_map(&map),
            Err(GatewayError::Decode(_))
        ));
    }
}

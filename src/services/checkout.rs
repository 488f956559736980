use crate::{
    config::PaymentConfig,
    db::DbPool,
    entities::product,
    errors::ServiceError,
    payments::{CreateSessionRequest, MetadataItem, PaymentGateway, SessionLine, SessionMetadata},
    services::{discounts, stock_ledger},
};
use chrono::Utc;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

pub const MAX_CART_LINES: usize = 50;

/// One cart line from the client. There is deliberately no price field.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct CartItem {
    /// Product id
    pub id: Uuid,
    #[validate(range(min = 1, max = 99, message = "Quantity must be between 1 and 99"))]
    pub quantity: i32,
    #[validate(length(max = 20))]
    pub size: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[validate]
    pub items: Vec<CartItem>,
    #[validate(length(max = 64))]
    pub discount_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutResponse {
    /// Hosted payment page to redirect to
    pub url: String,
    pub session_id: String,
    pub subtotal: i64,
    pub discount: i64,
    pub total: i64,
}

fn normalize_size(size: Option<&str>) -> Option<String> {
    size.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Folds repeated product/size lines together, keeping first-seen order.
fn aggregate(items: &[CartItem]) -> Vec<(Uuid, Option<String>, i32)> {
    let mut order: Vec<(Uuid, Option<String>)> = Vec::new();
    let mut totals: HashMap<(Uuid, Option<String>), i32> = HashMap::new();
    for item in items {
        let key = (item.id, normalize_size(item.size.as_deref()));
        let entry = totals.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            0
        });
        *entry += item.quantity;
    }
    order
        .into_iter()
        .map(|key| {
            let quantity = totals[&key];
            (key.0, key.1, quantity)
        })
        .collect()
}

/// Builds hosted payment sessions from untrusted carts. Read-only against
/// the stock ledger; no order exists until payment is confirmed.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    payment: PaymentConfig,
}

impl CheckoutService {
    pub fn new(db: Arc<DbPool>, gateway: Arc<dyn PaymentGateway>, payment: PaymentConfig) -> Self {
        Self { db, gateway, payment }
    }

    #[instrument(skip(self, request, customer_email), fields(lines = request.items.len()))]
    pub async fn create_session(
        &self,
        user_id: Option<Uuid>,
        customer_email: Option<String>,
        request: CheckoutRequest,
    ) -> Result<CheckoutResponse, ServiceError> {
        if request.items.is_empty() {
            return Err(ServiceError::BadRequest("Cart is empty".to_string()));
        }
        if request.items.len() > MAX_CART_LINES {
            return Err(ServiceError::ValidationError(format!(
                "Cart may contain at most {MAX_CART_LINES} lines"
            )));
        }
        request.validate()?;

        let db = &*self.db;
        let lines = aggregate(&request.items);
        let ids: Vec<Uuid> = lines.iter().map(|(id, _, _)| *id).collect();
        let products: HashMap<Uuid, product::Model> = product::Entity::find()
            .filter(product::Column::Id.is_in(ids))
            .all(db)
            .await?
            .into_iter()
            .map(|p| (p.id, p))
            .collect();

        let mut session_lines = Vec::with_capacity(lines.len());
        let mut subtotal: i64 = 0;
        for (product_id, size, quantity) in &lines {
            let product = products
                .get(product_id)
                .filter(|p| p.active)
                .ok_or_else(|| {
                    ServiceError::BadRequest(format!("Product {product_id} is not available"))
                })?;

            let available = stock_ledger::available(db, *product_id, size.as_deref())
                .await?
                .unwrap_or(0);
            if *quantity > available {
                return Err(ServiceError::InsufficientStock {
                    product_id: *product_id,
                    product_name: product.name.clone(),
                    size: size.clone().unwrap_or_else(|| "-".to_string()),
                    available: available.max(0),
                    requested: *quantity,
                });
            }

            let unit_amount = product.effective_price();
            subtotal += unit_amount * i64::from(*quantity);
            session_lines.push(SessionLine {
                product_id: *product_id,
                size: size.clone(),
                name: product.name.clone(),
                image_url: product.image_url.clone(),
                unit_amount,
                quantity: *quantity,
            });
        }

        let (discount_code, discount) = match request
            .discount_code
            .as_deref()
            .filter(|c| !c.trim().is_empty())
        {
            Some(raw) => {
                let (code, amount) = discounts::validate(db, raw, subtotal, Utc::now()).await?;
                (Some(code), amount)
            }
            None => (None, 0),
        };
        let total = subtotal - discount;

        let metadata = SessionMetadata {
            user_id,
            items: session_lines
                .iter()
                .map(|l| MetadataItem {
                    product_id: l.product_id,
                    size: l.size.clone(),
                    quantity: l.quantity,
                })
                .collect(),
            discount_code,
            discount_amount: discount,
        };

        let session = self
            .gateway
            .create_checkout_session(&CreateSessionRequest {
                lines: session_lines,
                discount_amount: discount,
                currency: self.payment.currency.clone(),
                customer_email,
                shipping_countries: self.payment.shipping_countries(),
                metadata,
                success_url: self.payment.success_url.clone(),
                cancel_url: self.payment.cancel_url.clone(),
            })
            .await
            .map_err(|e| {
                error!(error = %e, "checkout session creation failed");
                ServiceError::InternalError("Could not start the payment session".to_string())
            })?;

        info!(session_id = %session.id, subtotal, discount, total, "checkout session created");
        Ok(CheckoutResponse {
            url: session.url,
            session_id: session.id,
            subtotal,
            discount,
            total,
        })
    }
}

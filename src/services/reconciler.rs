use crate::{
    db::{is_unique_violation, is_unique_violation_on, DbPool},
    entities::{
        order::{self, append_note, OrderStatus, PaymentStatus},
        order_item, product,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    metrics,
    payments::{
        webhook::{WebhookEvent, CHECKOUT_COMPLETED},
        CheckoutSession, PaymentGateway,
    },
    services::{
        discounts,
        invoices::InvoiceService,
        stock_ledger::{LineResult, StockLedger, StockLine},
    },
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::{distributions::Alphanumeric, Rng};
use regex::Regex;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

static SESSION_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^cs_(test|live)_[A-Za-z0-9]{10,200}$").expect("session id pattern compiles")
});

/// Checks the shape of a client-supplied checkout session id before it is
/// used in any gateway call or query.
pub fn is_valid_session_id(session_id: &str) -> bool {
    SESSION_ID.is_match(session_id)
}

/// `ORD-YYYYMMDD-XXXXXX`
pub fn generate_order_number(now: DateTime<Utc>) -> String {
    format!("ORD-{}-{}", now.format("%Y%m%d"), random_suffix())
}

pub(crate) fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| char::from(b).to_ascii_uppercase())
        .collect()
}

/// Which path confirmed the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Webhook,
    Verifier,
}

impl Source {
    fn as_str(&self) -> &'static str {
        match self {
            Source::Webhook => "webhook",
            Source::Verifier => "verifier",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fulfillment {
    Created(order::Model),
    Existing(order::Model),
}

impl Fulfillment {
    pub fn order(&self) -> &order::Model {
        match self {
            Fulfillment::Created(o) | Fulfillment::Existing(o) => o,
        }
    }
}

/// What the webhook endpoint did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Ignored,
    Fulfilled(Fulfillment),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStatus {
    Pending,
    Exists,
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub status: VerifyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
}

/// Attempts at inserting an order before a colliding order number is
/// treated as an error.
const ORDER_NUMBER_ATTEMPTS: usize = 3;

/// A purchased line resolved to a local product.
struct ResolvedLine {
    item_id: Uuid,
    product: product::Model,
    size: Option<String>,
    quantity: i32,
    unit_price: i64,
}

/// Turns confirmed payments into orders exactly once, whether the
/// confirmation arrives by webhook or through the client-triggered verifier.
#[derive(Clone)]
pub struct Reconciler {
    db: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: StockLedger,
    invoices: InvoiceService,
    event_sender: EventSender,
}

impl Reconciler {
    pub fn new(
        db: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        ledger: StockLedger,
        invoices: InvoiceService,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            gateway,
            ledger,
            invoices,
            event_sender,
        }
    }

    /// Handles a signature-verified webhook event.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn handle_event(&self, event: &WebhookEvent) -> Result<WebhookOutcome, ServiceError> {
        if event.event_type != CHECKOUT_COMPLETED {
            info!("ignoring webhook event");
            return Ok(WebhookOutcome::Ignored);
        }
        let session_id = event
            .object_id()
            .ok_or_else(|| ServiceError::BadRequest("event carries no session id".to_string()))?;

        // The event body only tells us which session; line items and
        // amounts come from the gateway itself.
        let session = self.gateway.retrieve_checkout_session(session_id).await?;
        if !session.is_paid() {
            info!(%session_id, payment_status = %session.payment_status, "session not paid yet");
            return Ok(WebhookOutcome::Ignored);
        }
        self.fulfill(&session, Source::Webhook)
            .await
            .map(WebhookOutcome::Fulfilled)
    }

    /// Client-triggered safety net for lost or delayed webhooks.
    #[instrument(skip(self))]
    pub async fn verify_session(&self, session_id: &str) -> Result<VerifyResponse, ServiceError> {
        if !is_valid_session_id(session_id) {
            return Err(ServiceError::ValidationError("Invalid session id".to_string()));
        }

        let session = self.gateway.retrieve_checkout_session(session_id).await?;
        if !session.is_paid() {
            return Ok(VerifyResponse {
                status: VerifyStatus::Pending,
                order_number: None,
                order_id: None,
            });
        }

        let (status, order) = match self.fulfill(&session, Source::Verifier).await? {
            Fulfillment::Created(o) => (VerifyStatus::Created, o),
            Fulfillment::Existing(o) => (VerifyStatus::Exists, o),
        };
        Ok(VerifyResponse {
            status,
            order_number: Some(order.order_number),
            order_id: Some(order.id),
        })
    }

    /// Order already recorded for this payment, by payment reference or by
    /// session id. Both columns are uniquely indexed.
    pub async fn find_existing(
        &self,
        session: &CheckoutSession,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(
                Condition::any()
                    .add(order::Column::PaymentId.eq(session.payment_reference()))
                    .add(order::Column::CheckoutSessionId.eq(session.id.as_str())),
            )
            .one(&*self.db)
            .await?)
    }

    /// Canonical side effects of a confirmed payment: order and items, stock
    /// decrement, discount usage, invoice.
    #[instrument(skip(self, session), fields(session_id = %session.id, source = source.as_str()))]
    pub async fn fulfill(
        &self,
        session: &CheckoutSession,
        source: Source,
    ) -> Result<Fulfillment, ServiceError> {
        if let Some(existing) = self.find_existing(session).await? {
            metrics::DUPLICATE_PAYMENTS.inc();
            info!(order_id = %existing.id, "payment already reconciled");
            return Ok(Fulfillment::Existing(existing));
        }

        let now = Utc::now();
        let mut attempt = 0;
        let (created, review_notes, resolved) = loop {
            attempt += 1;
            match self.insert_order(session, source, now).await {
                Ok(inserted) => break inserted,
                Err(ServiceError::DatabaseError(e)) if is_unique_violation(&e) => {
                    // Lost the race against the other confirmation path.
                    if let Some(existing) = self.find_existing(session).await? {
                        metrics::DUPLICATE_PAYMENTS.inc();
                        info!(order_id = %existing.id, "order inserted concurrently");
                        return Ok(Fulfillment::Existing(existing));
                    }
                    if is_unique_violation_on(&e, "order_number") && attempt < ORDER_NUMBER_ATTEMPTS {
                        warn!(attempt, "order number collided; retrying with a fresh one");
                        continue;
                    }
                    return Err(ServiceError::DatabaseError(e));
                }
                Err(e) => return Err(e),
            }
        };

        let mut notes = review_notes;
        let stock_lines: Vec<StockLine> = resolved.iter().map(ResolvedLine::stock_line).collect();
        let mut unmarked: Vec<&ResolvedLine> = resolved.iter().collect();
        let mut decremented = Vec::new();
        for (line, result) in self.ledger.decrement_order_lines(&stock_lines).await {
            if !result.needs_review() {
                // Results may come back reordered; pair each with one item.
                if let Some(pos) = unmarked.iter().position(|r| r.stock_line() == line) {
                    decremented.push(unmarked.swap_remove(pos).item_id);
                }
                if result == LineResult::Forced {
                    notes.push(format!(
                        "Stock for product {} size {} qty {} decremented in degraded mode; verify counts",
                        line.product_id,
                        line.size.as_deref().unwrap_or("-"),
                        line.quantity
                    ));
                }
                continue;
            }
            let size = line.size.as_deref().unwrap_or("-");
            let detail = match &result {
                LineResult::Shortfall { available } => {
                    format!("only {} available", available.unwrap_or(0))
                }
                LineResult::Unresolved { error } => error.clone(),
                _ => String::new(),
            };
            error!(
                order_id = %created.id,
                product_id = %line.product_id,
                size,
                quantity = line.quantity,
                %detail,
                "stock decrement failed; manual reconciliation required"
            );
            metrics::STOCK_SHORTFALLS.inc();
            notes.push(format!(
                "Stock not decremented for product {} size {} qty {}: {}",
                line.product_id, size, line.quantity, detail
            ));
            self.event_sender
                .publish(Event::StockShortfall {
                    order_id: created.id,
                    product_id: line.product_id,
                    size: line.size.clone(),
                    quantity: line.quantity,
                })
                .await;
        }

        if let Err(e) = self.mark_decremented(&decremented).await {
            error!(order_id = %created.id, error = %e, "could not record which lines left stock");
            notes.push(format!(
                "Stock was decremented but not recorded on {} item(s); restocking needs a manual check",
                decremented.len()
            ));
        }

        let order = if notes.is_empty() {
            created
        } else {
            self.flag_for_review(created, &notes).await?
        };

        if let Some(code) = &order.discount_code {
            match discounts::record_use(&*self.db, code).await {
                Ok(true) => {}
                Ok(false) => warn!(%code, "discount usage not recorded (unknown or exhausted)"),
                Err(e) => warn!(%code, error = %e, "failed to record discount usage"),
            }
        }

        metrics::ORDERS_CREATED.with_label_values(&[source.as_str()]).inc();
        self.event_sender
            .publish(Event::OrderCreated {
                order_id: order.id,
                order_number: order.order_number.clone(),
                requires_review: order.requires_review,
            })
            .await;
        info!(order_id = %order.id, order_number = %order.order_number, "order created");

        if let Err(e) = self.invoices.issue_invoice(&order).await {
            error!(order_id = %order.id, error = %e, "invoice could not be issued");
        }

        Ok(Fulfillment::Created(order))
    }

    /// Inserts the order and its items in one transaction. Lines whose
    /// product cannot be resolved are skipped and reported as review notes.
    async fn insert_order(
        &self,
        session: &CheckoutSession,
        source: Source,
        now: DateTime<Utc>,
    ) -> Result<(order::Model, Vec<String>, Vec<ResolvedLine>), ServiceError> {
        let meta = &session.metadata;
        let customer = &session.customer;
        let txn = self.db.begin().await?;

        let mut review_notes = Vec::new();
        let mut resolved = Vec::new();
        for (index, line) in session.line_items.iter().enumerate() {
            let fallback = meta.items.get(index);
            let product_id = line.product_id.or(fallback.map(|i| i.product_id));
            let size = line
                .size
                .clone()
                .or_else(|| fallback.and_then(|i| i.size.clone()));

            let product = match product_id {
                Some(id) => product::Entity::find_by_id(id).one(&txn).await?,
                None => None,
            };
            let Some(product) = product else {
                error!(
                    product_id = ?product_id,
                    description = %line.description,
                    quantity = line.quantity,
                    "purchased line does not match a product; skipped"
                );
                review_notes.push(format!(
                    "Unknown product for line '{}' (qty {}); item not recorded",
                    line.description, line.quantity
                ));
                continue;
            };
            resolved.push(ResolvedLine {
                item_id: Uuid::new_v4(),
                product,
                size,
                quantity: line.quantity,
                unit_price: line.unit_amount,
            });
        }

        if let Some(mismatch) = line_mismatch(session) {
            error!(%mismatch, "purchased lines disagree with the cart");
            review_notes.push(format!("Purchased lines do not match the cart: {mismatch}"));
        }

        let address = serde_json::json!({
            "name": customer.shipping_name.clone().or_else(|| customer.name.clone()),
            "address": customer.address,
        });
        let created_note = append_note(
            None,
            &format!("Order created by {} for session {}", source.as_str(), session.id),
            now,
        );

        let order_id = Uuid::new_v4();
        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number(now)),
            user_id: Set(meta.user_id),
            customer_name: Set(customer
                .name
                .clone()
                .or_else(|| customer.shipping_name.clone())
                .unwrap_or_default()),
            customer_email: Set(customer.email.clone().unwrap_or_default()),
            customer_phone: Set(customer.phone.clone()),
            shipping_address: Set(Some(address.to_string())),
            subtotal: Set(session.amount_subtotal),
            shipping_cost: Set(session.amount_shipping),
            tax: Set(session.amount_tax),
            discount: Set(session.amount_discount),
            total: Set(session.amount_total),
            currency: Set(session.currency.clone()),
            discount_code: Set(meta.discount_code.clone()),
            payment_id: Set(Some(session.payment_reference().to_string())),
            checkout_session_id: Set(Some(session.id.clone())),
            payment_status: Set(PaymentStatus::Paid),
            status: Set(OrderStatus::Pending),
            previous_status: Set(None),
            requires_review: Set(false),
            admin_notes: Set(Some(created_note)),
            created_at: Set(now),
            updated_at: Set(now),
            shipped_at: Set(None),
            delivered_at: Set(None),
            cancelled_at: Set(None),
            refunded_at: Set(None),
        }
        .insert(&txn)
        .await?;

        for line in &resolved {
            order_item::ActiveModel {
                id: Set(line.item_id),
                order_id: Set(order_id),
                product_id: Set(line.product.id),
                product_name: Set(line.product.name.clone()),
                product_slug: Set(line.product.slug.clone()),
                product_image: Set(line.product.image_url.clone()),
                unit_price: Set(line.unit_price),
                quantity: Set(line.quantity),
                size: Set(line.size.clone()),
                subtotal: Set(line.unit_price * i64::from(line.quantity)),
                stock_decremented: Set(false),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit().await?;
        Ok((order, review_notes, resolved))
    }

    async fn mark_decremented(&self, item_ids: &[Uuid]) -> Result<(), ServiceError> {
        if item_ids.is_empty() {
            return Ok(());
        }
        order_item::Entity::update_many()
            .col_expr(order_item::Column::StockDecremented, Expr::value(true))
            .filter(order_item::Column::Id.is_in(item_ids.iter().copied()))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    async fn flag_for_review(
        &self,
        order: order::Model,
        notes: &[String],
    ) -> Result<order::Model, ServiceError> {
        let now = Utc::now();
        let mut admin_notes = order.admin_notes.clone();
        for note in notes {
            admin_notes = Some(append_note(admin_notes.as_deref(), &format!("REVIEW: {note}"), now));
        }

        let mut active: order::ActiveModel = order.into();
        active.requires_review = Set(true);
        active.admin_notes = Set(admin_notes);
        active.updated_at = Set(now);
        Ok(active.update(&*self.db).await?)
    }
}

impl ResolvedLine {
    fn stock_line(&self) -> StockLine {
        StockLine {
            product_id: self.product.id,
            size: self.size.clone(),
            quantity: self.quantity,
        }
    }
}

/// Compares what the gateway says was bought with the cart recorded in the
/// session metadata, per product and size. `None` when they agree.
fn line_mismatch(session: &CheckoutSession) -> Option<String> {
    let meta = &session.metadata.items;
    if meta.is_empty() {
        return None;
    }
    if session.line_items.len() != meta.len() {
        return Some(format!(
            "{} line(s) reported for {} in the cart",
            session.line_items.len(),
            meta.len()
        ));
    }

    let mut paid: BTreeMap<(Option<Uuid>, Option<String>), i64> = BTreeMap::new();
    for line in &session.line_items {
        *paid.entry((line.product_id, line.size.clone())).or_default() += i64::from(line.quantity);
    }
    let mut cart: BTreeMap<(Option<Uuid>, Option<String>), i64> = BTreeMap::new();
    for item in meta {
        *cart.entry((Some(item.product_id), item.size.clone())).or_default() +=
            i64::from(item.quantity);
    }
    // Lines without product identity fall back to the cart by position.
    if paid.keys().any(|(id, _)| id.is_none()) {
        return None;
    }
    (paid != cart).then(|| "quantities differ per product".to_string())
}

use crate::{
    db::{is_unique_violation, DbPool},
    entities::{
        invoice::{self, InvoiceKind},
        order, order_item,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    metrics,
    notifications::{Attachment, Email, Mailer},
};
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const NUMBER_ATTEMPTS: usize = 5;

/// Renders minor units as a decimal amount, e.g. `-1250` as `-12.50`.
pub fn format_minor(amount: i64) -> String {
    Decimal::new(amount, 2).to_string()
}

fn format_money(amount: i64, currency: &str) -> String {
    format!("{} {}", format_minor(amount), currency.to_uppercase())
}

/// Next sequential number for `kind` in `year`, e.g. `ABON-2026-000008`
/// after `ABON-2026-000007`. The suffix is zero-padded to six digits and
/// simply grows past `999999`, so the latest number is found by length first.
pub async fn next_number<C: ConnectionTrait>(
    conn: &C,
    kind: InvoiceKind,
    year: i32,
) -> Result<String, ServiceError> {
    let prefix = format!("{}-{}-", kind.prefix(), year);
    let latest = invoice::Entity::find()
        .filter(invoice::Column::InvoiceNumber.starts_with(prefix.as_str()))
        .order_by_desc(Expr::cust("LENGTH(invoice_number)"))
        .order_by_desc(invoice::Column::InvoiceNumber)
        .one(conn)
        .await?;

    let next = latest
        .and_then(|inv| inv.invoice_number[prefix.len()..].parse::<u32>().ok())
        .map_or(1, |n| n + 1);
    Ok(format!("{prefix}{next:06}"))
}

/// Plain-text rendering attached to the document email.
pub fn render_document(
    store_name: &str,
    doc: &invoice::Model,
    order: &order::Model,
    items: &[order_item::Model],
) -> String {
    let title = match doc.kind {
        InvoiceKind::Invoice => "INVOICE",
        InvoiceKind::CreditNote => "CREDIT NOTE",
    };
    let sign = if doc.kind == InvoiceKind::CreditNote { -1 } else { 1 };
    let currency = &doc.currency;

    let mut out = String::new();
    let _ = writeln!(out, "{store_name}");
    let _ = writeln!(out, "{title} {}", doc.invoice_number);
    let _ = writeln!(out, "Date: {}", doc.created_at.format("%Y-%m-%d"));
    let _ = writeln!(out, "Order: {}", order.order_number);
    let _ = writeln!(out, "Customer: {} <{}>", order.customer_name, order.customer_email);
    if let Some(reason) = &doc.reason {
        let _ = writeln!(out, "Reason: {reason}");
    }
    let _ = writeln!(out);
    for item in items {
        let size = item.size.as_deref().map(|s| format!(" ({s})")).unwrap_or_default();
        let _ = writeln!(
            out,
            "{} x {}{}  {}  {}",
            item.quantity,
            item.product_name,
            size,
            format_money(sign * item.unit_price, currency),
            format_money(sign * item.subtotal, currency),
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Subtotal: {}", format_money(doc.subtotal, currency));
    if doc.discount != 0 {
        let _ = writeln!(out, "Discount: {}", format_money(doc.discount, currency));
    }
    let _ = writeln!(out, "Shipping: {}", format_money(doc.shipping_cost, currency));
    let _ = writeln!(out, "Tax: {}", format_money(doc.tax, currency));
    let _ = writeln!(out, "Total: {}", format_money(doc.total, currency));
    out
}

/// Issues invoices and credit notes: persisted first, emailed best effort.
#[derive(Clone)]
pub struct InvoiceService {
    db: Arc<DbPool>,
    mailer: Arc<dyn Mailer>,
    event_sender: EventSender,
    store_name: String,
}

impl InvoiceService {
    pub fn new(
        db: Arc<DbPool>,
        mailer: Arc<dyn Mailer>,
        event_sender: EventSender,
        store_name: impl Into<String>,
    ) -> Self {
        Self {
            db,
            mailer,
            event_sender,
            store_name: store_name.into(),
        }
    }

    /// Issues the sales invoice for a freshly created order. Returns the
    /// existing one if the order already has it.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn issue_invoice(&self, order: &order::Model) -> Result<invoice::Model, ServiceError> {
        if let Some(existing) = invoice::Entity::find()
            .filter(invoice::Column::OrderId.eq(order.id))
            .filter(invoice::Column::Kind.eq(InvoiceKind::Invoice))
            .one(&*self.db)
            .await?
        {
            return Ok(existing);
        }

        let doc = self
            .persist(order, InvoiceKind::Invoice, None, None, Utc::now())
            .await?;
        self.deliver(doc, order).await
    }

    /// Issues a credit note mirroring `order` with negated amounts.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn issue_credit_note(
        &self,
        order: &order::Model,
        refund_id: &str,
        reason: &str,
    ) -> Result<invoice::Model, ServiceError> {
        let doc = self
            .persist(
                order,
                InvoiceKind::CreditNote,
                Some(refund_id.to_string()),
                Some(reason.to_string()),
                Utc::now(),
            )
            .await?;
        self.event_sender
            .publish(Event::CreditNoteIssued {
                order_id: order.id,
                number: doc.invoice_number.clone(),
            })
            .await;
        self.deliver(doc, order).await
    }

    async fn persist(
        &self,
        order: &order::Model,
        kind: InvoiceKind,
        refund_id: Option<String>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<invoice::Model, ServiceError> {
        let sign = match kind {
            InvoiceKind::Invoice => 1,
            InvoiceKind::CreditNote => -1,
        };

        for attempt in 1..=NUMBER_ATTEMPTS {
            let number = next_number(&*self.db, kind, now.year()).await?;
            let row = invoice::ActiveModel {
                id: Set(Uuid::new_v4()),
                invoice_number: Set(number.clone()),
                order_id: Set(order.id),
                kind: Set(kind),
                subtotal: Set(sign * order.subtotal),
                shipping_cost: Set(sign * order.shipping_cost),
                tax: Set(sign * order.tax),
                discount: Set(sign * order.discount),
                total: Set(sign * order.total),
                currency: Set(order.currency.clone()),
                refund_id: Set(refund_id.clone()),
                reason: Set(reason.clone()),
                emailed_at: Set(None),
                created_at: Set(now),
            };
            match row.insert(&*self.db).await {
                Ok(doc) => {
                    info!(number = %doc.invoice_number, "document persisted");
                    return Ok(doc);
                }
                // Another writer took this number; rescan and retry.
                Err(e) if is_unique_violation(&e) => {
                    warn!(%number, attempt, "document number already taken");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ServiceError::Conflict(format!(
            "could not allocate a {} number",
            kind.prefix()
        )))
    }

    /// Emails the document. Failures are logged; the persisted row is
    /// returned either way.
    async fn deliver(
        &self,
        doc: invoice::Model,
        order: &order::Model,
    ) -> Result<invoice::Model, ServiceError> {
        if order.customer_email.is_empty() {
            warn!(number = %doc.invoice_number, "order has no email; document not sent");
            return Ok(doc);
        }

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(&*self.db)
            .await?;
        let body = render_document(&self.store_name, &doc, order, &items);
        let (subject, text) = match doc.kind {
            InvoiceKind::Invoice => (
                format!("Your invoice {} for order {}", doc.invoice_number, order.order_number),
                format!("Thank you for your order {}. Your invoice is attached.", order.order_number),
            ),
            InvoiceKind::CreditNote => (
                format!("Credit note {} for order {}", doc.invoice_number, order.order_number),
                format!(
                    "We have refunded {} for order {}. The credit note is attached.",
                    format_money(-doc.total, &doc.currency),
                    order.order_number
                ),
            ),
        };
        let email = Email {
            to: order.customer_email.clone(),
            subject,
            text,
            attachments: vec![Attachment {
                filename: format!("{}.txt", doc.invoice_number),
                content_type: "text/plain".to_string(),
                content: body.into_bytes(),
            }],
        };

        if let Err(e) = self.mailer.send(&email).await {
            metrics::EMAIL_FAILURES.inc();
            error!(number = %doc.invoice_number, error = %e, "document email failed");
            return Ok(doc);
        }

        let mut active: invoice::ActiveModel = doc.clone().into();
        active.emailed_at = Set(Some(Utc::now()));
        match active.update(&*self.db).await {
            Ok(doc) => Ok(doc),
            Err(e) => {
                // The email went out; only the stamp is missing.
                warn!(number = %doc.invoice_number, error = %e, "failed to stamp emailed_at");
                Ok(doc)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::order::{OrderStatus, PaymentStatus};

    #[test]
    fn minor_units_render_with_two_decimals() {
        assert_eq!(format_minor(4_500), rust_decimal_macros::dec!(45.00).to_string());
        assert_eq!(format_minor(4_500), "45.00");
        assert_eq!(format_minor(-1_250), "-12.50");
        assert_eq!(format_minor(7), "0.07");
    }

    #[test]
    fn credit_note_renders_negated_lines() {
        let now = Utc::now();
        let order = order::Model {
            id: Uuid::new_v4(),
            order_number: "ORD-20260102-K3J9QZ".into(),
            user_id: None,
            customer_name: "Ana".into(),
            customer_email: "ana@example.com".into(),
            customer_phone: None,
            shipping_address: None,
            subtotal: 9_000,
            shipping_cost: 0,
            tax: 0,
            discount: 0,
            total: 9_000,
            currency: "eur".into(),
            discount_code: None,
            payment_id: Some("pi_123".into()),
            checkout_session_id: None,
            payment_status: PaymentStatus::Refunded,
            status: OrderStatus::Cancelled,
            previous_status: None,
            requires_review: false,
            admin_notes: None,
            created_at: now,
            updated_at: now,
            shipped_at: None,
            delivered_at: None,
            cancelled_at: Some(now),
            refunded_at: Some(now),
        };
        let item = order_item::Model {
            id: Uuid::new_v4(),
            order_id: order.id,
            product_id: Uuid::new_v4(),
            product_name: "Linen shirt".into(),
            product_slug: "linen-shirt".into(),
            product_image: None,
            unit_price: 4_500,
            quantity: 2,
            size: Some("M".into()),
            subtotal: 9_000,
            stock_decremented: true,
            created_at: now,
        };
        let doc = invoice::Model {
            id: Uuid::new_v4(),
            invoice_number: "ABON-2026-000007".into(),
            order_id: order.id,
            kind: InvoiceKind::CreditNote,
            subtotal: -9_000,
            shipping_cost: 0,
            tax: 0,
            discount: 0,
            total: -9_000,
            currency: "eur".into(),
            refund_id: Some("re_1".into()),
            reason: Some("customer cancellation".into()),
            emailed_at: None,
            created_at: now,
        };

        let text = render_document("Shop", &doc, &order, &[item]);
        assert!(text.contains("CREDIT NOTE ABON-2026-000007"));
        assert!(text.contains("2 x Linen shirt (M)  -45.00 EUR  -90.00 EUR"));
        assert!(text.contains("Total: -90.00 EUR"));
    }
}

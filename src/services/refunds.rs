use crate::{
    db::DbPool,
    entities::{
        invoice,
        order::{self, OrderStatus, PaymentStatus},
        order_item,
        return_request::{self, ReturnKind, ReturnStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    metrics,
    payments::{PaymentGateway, Refund, RefundRequest},
    services::{invoices::InvoiceService, reconciler::random_suffix, stock_ledger},
};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// `RET-YYYYMMDD-XXXXXX`
pub fn generate_return_number(now: DateTime<Utc>) -> String {
    format!("RET-{}-{}", now.format("%Y%m%d"), random_suffix())
}

/// Why money is going back to the customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundTrigger {
    /// Self-service cancellation inside the window; the order ends `cancelled`.
    CustomerCancellation,
    /// An admin confirmed the returned parcel arrived.
    ReturnReceived { return_id: Uuid },
    /// Direct refund from the back office.
    Admin,
}

impl RefundTrigger {
    fn final_status(&self) -> OrderStatus {
        match self {
            RefundTrigger::CustomerCancellation => OrderStatus::Cancelled,
            _ => OrderStatus::Refunded,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefundOutcome {
    pub order: order::Model,
    pub refund: Refund,
    /// `None` when the refund went through but the credit note could not
    /// be persisted; the failure is logged.
    pub credit_note: Option<invoice::Model>,
}

/// Refunds an order exactly once. A conditional update moves the order into
/// `refunding`; only the caller that wins it talks to the gateway.
#[derive(Clone)]
pub struct RefundService {
    db: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    invoices: InvoiceService,
    event_sender: EventSender,
}

impl RefundService {
    pub fn new(
        db: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        invoices: InvoiceService,
        event_sender: EventSender,
    ) -> Self {
        Self {
            db,
            gateway,
            invoices,
            event_sender,
        }
    }

    #[instrument(skip(self, allowed))]
    pub async fn refund_order(
        &self,
        order_id: Uuid,
        trigger: RefundTrigger,
        reason: &str,
        allowed: &[OrderStatus],
    ) -> Result<RefundOutcome, ServiceError> {
        let db = &*self.db;
        let order = order::Entity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;

        if order.payment_status != PaymentStatus::Paid
            || matches!(order.status, OrderStatus::Refunding | OrderStatus::Refunded)
        {
            return Err(ServiceError::Conflict(
                "Order is already being refunded or has been refunded".to_string(),
            ));
        }
        if !allowed.contains(&order.status) {
            return Err(ServiceError::InvalidTransition {
                from: order.status.to_string(),
                to: trigger.final_status().to_string(),
            });
        }
        let Some(payment_id) = order.payment_id.clone() else {
            return Err(ServiceError::BadRequest(
                "Order has no payment reference to refund".to_string(),
            ));
        };

        let prior = order.status;
        self.acquire_lock(order_id, prior).await?;

        let refund = match self
            .gateway
            .create_refund(&RefundRequest {
                payment_id,
                amount: order.total,
                idempotency_key: format!("refund-{order_id}"),
                order_number: order.order_number.clone(),
            })
            .await
        {
            Ok(refund) => refund,
            Err(e) => {
                metrics::REFUNDS.with_label_values(&["failed"]).inc();
                error!(%order_id, error = %e, "gateway refund failed; releasing lock");
                self.release_lock(order_id, prior).await;
                return Err(e.into());
            }
        };
        info!(%order_id, refund_id = %refund.id, amount = refund.amount, "gateway refund issued");

        let now = Utc::now();
        let txn = self.db.begin().await?;
        let applied = match self
            .apply_refund(&txn, &order, trigger, reason, &refund, now)
            .await
        {
            Ok(updated) => txn.commit().await.map(|_| updated).map_err(ServiceError::from),
            Err(e) => Err(e),
        };
        let updated = match applied {
            Ok(updated) => updated,
            Err(e) => {
                // Money has moved; keep the lock so nothing refunds twice.
                metrics::REFUNDS.with_label_values(&["unrecorded"]).inc();
                error!(
                    %order_id,
                    refund_id = %refund.id,
                    error = %e,
                    "refund issued but local state could not be updated; order left refunding"
                );
                return Err(e);
            }
        };
        metrics::REFUNDS.with_label_values(&["issued"]).inc();

        self.event_sender
            .publish(Event::PaymentRefunded {
                order_id,
                refund_id: refund.id.clone(),
                amount: refund.amount,
            })
            .await;
        if trigger == RefundTrigger::CustomerCancellation {
            self.event_sender.publish(Event::OrderCancelled(order_id)).await;
        }

        let credit_note = match self
            .invoices
            .issue_credit_note(&updated, &refund.id, reason)
            .await
        {
            Ok(doc) => Some(doc),
            Err(e) => {
                error!(%order_id, error = %e, "credit note could not be issued");
                None
            }
        };

        Ok(RefundOutcome {
            order: updated,
            refund,
            credit_note,
        })
    }

    /// `UPDATE orders SET status = 'refunding' WHERE id = ? AND status = ?
    /// AND payment_status = 'paid'`; losing callers get a conflict.
    async fn acquire_lock(&self, order_id: Uuid, prior: OrderStatus) -> Result<(), ServiceError> {
        let res = order::Entity::update_many()
            .set(order::ActiveModel {
                status: Set(OrderStatus::Refunding),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(prior))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Paid))
            .exec(&*self.db)
            .await?;

        if res.rows_affected != 1 {
            warn!(%order_id, "refund lock already taken");
            return Err(ServiceError::Conflict(
                "Order is already being refunded or has been refunded".to_string(),
            ));
        }
        Ok(())
    }

    async fn release_lock(&self, order_id: Uuid, prior: OrderStatus) {
        let res = order::Entity::update_many()
            .set(order::ActiveModel {
                status: Set(prior),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Refunding))
            .exec(&*self.db)
            .await;
        if let Err(e) = res {
            error!(%order_id, error = %e, "failed to release refund lock; order left refunding");
        }
    }

    /// Restores stock, finalises the order and records the refund on the
    /// return record, all inside `txn`.
    async fn apply_refund(
        &self,
        txn: &DatabaseTransaction,
        order: &order::Model,
        trigger: RefundTrigger,
        reason: &str,
        refund: &Refund,
        now: DateTime<Utc>,
    ) -> Result<order::Model, ServiceError> {
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(txn)
            .await?;

        let mut notes = order.clone();
        for item in &items {
            if !item.stock_decremented {
                // Never taken out of stock, so nothing to give back.
                info!(product_id = %item.product_id, quantity = item.quantity, "line was never decremented; stock not restored");
                continue;
            }
            let restored =
                stock_ledger::increment(txn, item.product_id, item.size.as_deref(), item.quantity)
                    .await?;
            if !restored {
                warn!(product_id = %item.product_id, "product gone; stock not restored");
                notes.admin_notes = Some(notes.notes_with(
                    &format!(
                        "Stock not restored for missing product {} qty {}",
                        item.product_id, item.quantity
                    ),
                    now,
                ));
            }
        }
        let entry = format!(
            "Refund {} of {} issued ({reason})",
            refund.id,
            crate::services::invoices::format_minor(refund.amount)
        );
        let admin_notes = notes.notes_with(&entry, now);

        let final_status = trigger.final_status();
        let mut active: order::ActiveModel = order.clone().into();
        active.status = Set(final_status);
        active.payment_status = Set(PaymentStatus::Refunded);
        active.admin_notes = Set(Some(admin_notes));
        active.refunded_at = Set(Some(now));
        active.updated_at = Set(now);
        if final_status == OrderStatus::Cancelled {
            active.cancelled_at = Set(Some(now));
        }
        let updated = active.update(txn).await?;

        match trigger {
            RefundTrigger::CustomerCancellation => {
                return_request::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    return_number: Set(generate_return_number(now)),
                    order_id: Set(order.id),
                    user_id: Set(order.user_id),
                    kind: Set(ReturnKind::Cancellation),
                    status: Set(ReturnStatus::Refunded),
                    reason: Set(reason.to_string()),
                    description: Set(None),
                    return_deadline: Set(now),
                    refund_id: Set(Some(refund.id.clone())),
                    refund_amount: Set(Some(refund.amount)),
                    admin_notes: Set(None),
                    created_at: Set(now),
                    updated_at: Set(now),
                    received_at: Set(None),
                    resolved_at: Set(Some(now)),
                }
                .insert(txn)
                .await?;
            }
            RefundTrigger::ReturnReceived { return_id } => {
                mark_return_refunded(txn, Some(return_id), order.id, refund, now).await?;
            }
            RefundTrigger::Admin => {
                mark_return_refunded(txn, None, order.id, refund, now).await?;
            }
        }

        Ok(updated)
    }
}

/// Closes the given return, or whichever return is active on the order.
async fn mark_return_refunded(
    txn: &DatabaseTransaction,
    return_id: Option<Uuid>,
    order_id: Uuid,
    refund: &Refund,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    let mut query = return_request::Entity::update_many()
        .set(return_request::ActiveModel {
            status: Set(ReturnStatus::Refunded),
            refund_id: Set(Some(refund.id.clone())),
            refund_amount: Set(Some(refund.amount)),
            resolved_at: Set(Some(now)),
            updated_at: Set(now),
            ..Default::default()
        })
        .filter(return_request::Column::OrderId.eq(order_id))
        .filter(return_request::Column::Status.is_in(ReturnStatus::ACTIVE));
    if let Some(id) = return_id {
        query = query.filter(return_request::Column::Id.eq(id));
    }
    let res = query.exec(txn).await?;
    if return_id.is_some() && res.rows_affected == 0 {
        warn!(%order_id, "return record was no longer active when the refund landed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellations_end_cancelled_everything_else_refunded() {
        assert_eq!(
            RefundTrigger::CustomerCancellation.final_status(),
            OrderStatus::Cancelled
        );
        assert_eq!(RefundTrigger::Admin.final_status(), OrderStatus::Refunded);
        assert_eq!(
            RefundTrigger::ReturnReceived {
                return_id: Uuid::nil()
            }
            .final_status(),
            OrderStatus::Refunded
        );
    }

    #[test]
    fn return_numbers_follow_the_order_format() {
        let number = generate_return_number(Utc::now());
        assert!(number.starts_with("RET-"));
        assert_eq!(number.len(), "RET-20260101-".len() + 6);
    }
}

use crate::{
    config::OrderPolicyConfig,
    db::DbPool,
    entities::{
        order::{self, append_note, OrderStatus},
        return_request::{self, ReturnKind, ReturnReason, ReturnStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    metrics,
    services::refunds::{generate_return_number, RefundOutcome, RefundService, RefundTrigger},
};
use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Shown to the customer once a return is registered.
pub const RETURN_INSTRUCTIONS: &str = "Pack the items in their original packaging, include the \
return number and send the parcel before the deadline. The refund is issued once we receive it.";

/// Back-office actions on a return record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReturnAction {
    Approve,
    Receive,
    Reject,
    ExpireCheck,
}

#[derive(Debug, Clone)]
pub enum ReturnActionOutcome {
    Updated(return_request::Model),
    Refunded {
        record: return_request::Model,
        refund: RefundOutcome,
    },
    Expired(u64),
}

/// Hours since `created_at`, for the cancellation window.
pub fn hours_elapsed(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - created_at).num_seconds() as f64 / 3600.0
}

/// Order state machine: customer cancellation and return requests, back
/// office return handling, manual status changes and the expiry sweep.
#[derive(Clone)]
pub struct LifecycleService {
    db: Arc<DbPool>,
    refunds: RefundService,
    event_sender: EventSender,
    policy: OrderPolicyConfig,
}

impl LifecycleService {
    pub fn new(
        db: Arc<DbPool>,
        refunds: RefundService,
        event_sender: EventSender,
        policy: OrderPolicyConfig,
    ) -> Self {
        Self {
            db,
            refunds,
            event_sender,
            policy,
        }
    }

    fn cancellation_window(&self) -> Duration {
        Duration::hours(self.policy.cancellation_window_hours)
    }

    fn within_window(&self, order: &order::Model, now: DateTime<Utc>) -> bool {
        now - order.created_at <= self.cancellation_window()
    }

    /// Loads an order on behalf of its owner. Someone else's order reads as
    /// missing.
    async fn owned_order(&self, user_id: Uuid, order_id: Uuid) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .filter(|o| o.is_owned_by(user_id))
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))
    }

    /// Self-service cancellation with an immediate refund, allowed for a
    /// short window after purchase.
    #[instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RefundOutcome, ServiceError> {
        let order = self.owned_order(user_id, order_id).await?;

        if !self.within_window(&order, now) {
            return Err(ServiceError::CancellationWindowClosed {
                hours_elapsed: hours_elapsed(order.created_at, now),
            });
        }
        if !OrderStatus::CANCELLABLE.contains(&order.status) {
            return Err(ServiceError::InvalidTransition {
                from: order.status.to_string(),
                to: OrderStatus::Cancelled.to_string(),
            });
        }

        self.refunds
            .refund_order(
                order_id,
                RefundTrigger::CustomerCancellation,
                "Cancelled by customer within the cancellation window",
                &OrderStatus::CANCELLABLE,
            )
            .await
    }

    /// Registers a return request. No money or stock moves until the parcel
    /// is received.
    #[instrument(skip(self, description))]
    pub async fn request_return(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        reason: ReturnReason,
        description: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<return_request::Model, ServiceError> {
        let order = self.owned_order(user_id, order_id).await?;

        if self.within_window(&order, now) && OrderStatus::CANCELLABLE.contains(&order.status) {
            return Err(ServiceError::BadRequest(
                "This order can still be cancelled; cancel it instead of requesting a return"
                    .to_string(),
            ));
        }
        if !OrderStatus::RETURNABLE.contains(&order.status) {
            return Err(ServiceError::InvalidTransition {
                from: order.status.to_string(),
                to: OrderStatus::ReturnRequested.to_string(),
            });
        }

        let description = description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        if reason.requires_description()
            && description.as_ref().map_or(0, |d| d.chars().count())
                < ReturnReason::MIN_OTHER_DESCRIPTION
        {
            return Err(ServiceError::ValidationError(format!(
                "Please describe the problem with at least {} characters",
                ReturnReason::MIN_OTHER_DESCRIPTION
            )));
        }

        let active = return_request::Entity::find()
            .filter(return_request::Column::OrderId.eq(order_id))
            .filter(return_request::Column::Status.is_in(ReturnStatus::ACTIVE))
            .count(&*self.db)
            .await?;
        if active > 0 {
            return Err(ServiceError::Conflict(
                "A return is already open for this order".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let record = return_request::ActiveModel {
            id: Set(Uuid::new_v4()),
            return_number: Set(generate_return_number(now)),
            order_id: Set(order_id),
            user_id: Set(Some(user_id)),
            kind: Set(ReturnKind::Return),
            status: Set(ReturnStatus::Pending),
            reason: Set(reason.to_string()),
            description: Set(description),
            return_deadline: Set(now + Duration::days(self.policy.return_window_days)),
            refund_id: Set(None),
            refund_amount: Set(None),
            admin_notes: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            received_at: Set(None),
            resolved_at: Set(None),
        }
        .insert(&txn)
        .await?;

        let moved = order::Entity::update_many()
            .set(order::ActiveModel {
                status: Set(OrderStatus::ReturnRequested),
                previous_status: Set(Some(order.status)),
                admin_notes: Set(Some(order.notes_with(
                    &format!("Return {} requested ({reason})", record.return_number),
                    now,
                ))),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(order.status))
            .exec(&txn)
            .await?;
        if moved.rows_affected != 1 {
            txn.rollback().await?;
            return Err(ServiceError::Conflict(
                "Order changed while the return was being registered".to_string(),
            ));
        }
        txn.commit().await?;

        info!(return_id = %record.id, return_number = %record.return_number, "return requested");
        self.event_sender
            .publish(Event::ReturnRequested {
                order_id,
                return_id: record.id,
            })
            .await;
        Ok(record)
    }

    #[instrument(skip(self, notes))]
    pub async fn admin_return_action(
        &self,
        action: ReturnAction,
        return_id: Option<Uuid>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ReturnActionOutcome, ServiceError> {
        let notes = notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());

        match action {
            ReturnAction::ExpireCheck => Ok(ReturnActionOutcome::Expired(
                self.expire_overdue_returns(now).await?,
            )),
            ReturnAction::Approve => {
                let record = self.managed_return(return_id).await?;
                let entry = notes.unwrap_or_else(|| "Return approved".to_string());
                self.move_return(&*self.db, &record, &[ReturnStatus::Pending], ReturnStatus::Approved, &entry, now)
                    .await?;
                Ok(ReturnActionOutcome::Updated(self.reload_return(record.id).await?))
            }
            ReturnAction::Receive => {
                let record = self.managed_return(return_id).await?;
                self.receive_return(record, notes, now).await
            }
            ReturnAction::Reject => {
                let record = self.managed_return(return_id).await?;
                let entry = notes.unwrap_or_else(|| "Return rejected".to_string());
                let txn = self.db.begin().await?;
                self.move_return(&txn, &record, &[ReturnStatus::Pending], ReturnStatus::Rejected, &entry, now)
                    .await?;
                revert_order(&txn, record.order_id, &format!("Return {} rejected", record.return_number), now)
                    .await?;
                txn.commit().await?;
                self.event_sender.publish(Event::ReturnRejected(record.id)).await;
                Ok(ReturnActionOutcome::Updated(self.reload_return(record.id).await?))
            }
        }
    }

    /// Loads a return record the back office may act on.
    async fn managed_return(&self, return_id: Option<Uuid>) -> Result<return_request::Model, ServiceError> {
        let return_id = return_id
            .ok_or_else(|| ServiceError::ValidationError("returnId is required".to_string()))?;
        let record = self.reload_return(return_id).await?;
        if record.kind != ReturnKind::Return {
            return Err(ServiceError::BadRequest(
                "Cancellation records cannot be managed".to_string(),
            ));
        }
        Ok(record)
    }

    /// Marks the parcel received and refunds the order. A record already in
    /// `received` is accepted so a failed refund can be retried.
    async fn receive_return(
        &self,
        record: return_request::Model,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ReturnActionOutcome, ServiceError> {
        let entry = notes.unwrap_or_else(|| "Parcel received".to_string());
        let received = return_request::Model {
            received_at: record.received_at.or(Some(now)),
            ..record.clone()
        };
        self.move_return(
            &*self.db,
            &received,
            &ReturnStatus::ACTIVE,
            ReturnStatus::Received,
            &entry,
            now,
        )
        .await?;

        let refund = self
            .refunds
            .refund_order(
                record.order_id,
                RefundTrigger::ReturnReceived {
                    return_id: record.id,
                },
                &format!("Return {} received", record.return_number),
                &[OrderStatus::ReturnRequested],
            )
            .await?;

        Ok(ReturnActionOutcome::Refunded {
            record: self.reload_return(record.id).await?,
            refund,
        })
    }

    /// Conditional status change on a return record; fails if it is no
    /// longer in one of `from`.
    async fn move_return<C: ConnectionTrait>(
        &self,
        conn: &C,
        record: &return_request::Model,
        from: &[ReturnStatus],
        to: ReturnStatus,
        entry: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let resolved = matches!(to, ReturnStatus::Rejected | ReturnStatus::Expired);
        let res = return_request::Entity::update_many()
            .set(return_request::ActiveModel {
                status: Set(to),
                admin_notes: Set(Some(append_note(record.admin_notes.as_deref(), entry, now))),
                received_at: Set(record.received_at),
                resolved_at: Set(if resolved { Some(now) } else { record.resolved_at }),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(return_request::Column::Id.eq(record.id))
            .filter(return_request::Column::Status.is_in(from.iter().copied()))
            .exec(conn)
            .await?;
        if res.rows_affected != 1 {
            return Err(ServiceError::InvalidTransition {
                from: format!("{:?}", record.status).to_lowercase(),
                to: format!("{to:?}").to_lowercase(),
            });
        }
        Ok(())
    }

    async fn reload_return(&self, return_id: Uuid) -> Result<return_request::Model, ServiceError> {
        return_request::Entity::find_by_id(return_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Return {return_id} not found")))
    }

    /// Expires pending or approved returns whose deadline passed. Orders go
    /// back to the status they had before the request. Nothing is refunded
    /// and stock is untouched.
    #[instrument(skip(self))]
    pub async fn expire_overdue_returns(&self, now: DateTime<Utc>) -> Result<u64, ServiceError> {
        let overdue = return_request::Entity::find()
            .filter(return_request::Column::Kind.eq(ReturnKind::Return))
            .filter(return_request::Column::Status.is_in([ReturnStatus::Pending, ReturnStatus::Approved]))
            .filter(return_request::Column::ReturnDeadline.lt(now))
            .all(&*self.db)
            .await?;

        let mut expired = 0;
        for record in overdue {
            let txn = self.db.begin().await?;
            let moved = self
                .move_return(
                    &txn,
                    &record,
                    &[ReturnStatus::Pending, ReturnStatus::Approved],
                    ReturnStatus::Expired,
                    "Return deadline passed without the parcel being received",
                    now,
                )
                .await;
            if let Err(e) = moved {
                // Handled concurrently (received or rejected meanwhile).
                warn!(return_id = %record.id, error = %e, "return not expired");
                txn.rollback().await?;
                continue;
            }
            revert_order(&txn, record.order_id, &format!("Return {} expired", record.return_number), now)
                .await?;
            txn.commit().await?;

            expired += 1;
            metrics::RETURNS_EXPIRED.inc();
            self.event_sender.publish(Event::ReturnExpired(record.id)).await;
        }

        if expired > 0 {
            info!(expired, "overdue returns expired");
        }
        Ok(expired)
    }

    /// Manual forward move along `pending → confirmed → processing →
    /// shipped → delivered`.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        next: OrderStatus,
        now: DateTime<Utc>,
    ) -> Result<order::Model, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))?;
        if !order.status.can_advance_to(next) {
            return Err(ServiceError::InvalidTransition {
                from: order.status.to_string(),
                to: next.to_string(),
            });
        }

        let mut changes = order::ActiveModel {
            status: Set(next),
            admin_notes: Set(Some(order.notes_with(
                &format!("Status changed from {} to {next}", order.status),
                now,
            ))),
            updated_at: Set(now),
            ..Default::default()
        };
        match next {
            OrderStatus::Shipped => changes.shipped_at = Set(Some(now)),
            OrderStatus::Delivered => changes.delivered_at = Set(Some(now)),
            _ => {}
        }
        let res = order::Entity::update_many()
            .set(changes)
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(order.status))
            .exec(&*self.db)
            .await?;
        if res.rows_affected != 1 {
            return Err(ServiceError::Conflict(
                "Order status changed concurrently".to_string(),
            ));
        }

        self.event_sender
            .publish(Event::OrderStatusChanged {
                order_id,
                old_status: order.status.to_string(),
                new_status: next.to_string(),
            })
            .await;
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))
    }
}

/// Moves an order out of `return_requested` back to the status recorded
/// when the return was opened.
async fn revert_order<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    entry: &str,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    let Some(order) = order::Entity::find_by_id(order_id).one(conn).await? else {
        error!(%order_id, "return points at a missing order");
        return Ok(());
    };
    if order.status != OrderStatus::ReturnRequested {
        warn!(%order_id, status = %order.status, "order not awaiting a return; left as is");
        return Ok(());
    }
    let restored = order.previous_status.unwrap_or_else(|| {
        warn!(%order_id, "no previous status recorded; assuming delivered");
        OrderStatus::Delivered
    });

    order::Entity::update_many()
        .set(order::ActiveModel {
            status: Set(restored),
            previous_status: Set(None),
            admin_notes: Set(Some(order.notes_with(entry, now))),
            updated_at: Set(now),
            ..Default::default()
        })
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::Status.eq(OrderStatus::ReturnRequested))
        .exec(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hours_elapsed_is_fractional() {
        let created = Utc::now();
        assert_eq!(hours_elapsed(created, created + Duration::minutes(90)), 1.5);
        let late = hours_elapsed(created, created + Duration::minutes(121));
        assert!(late > 2.0 && late < 2.02);
    }

    #[test]
    fn admin_actions_use_snake_case() {
        let action: ReturnAction = serde_json::from_str("\"expire_check\"").unwrap();
        assert_eq!(action, ReturnAction::ExpireCheck);
    }
}

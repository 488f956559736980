use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the loop is gone.
    /// Domain writes have already committed by the time events go out.
    pub async fn publish(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "event dropped");
        }
    }
}

/// Domain events emitted after the corresponding database change committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        requires_review: bool,
    },
    StockShortfall {
        order_id: Uuid,
        product_id: Uuid,
        size: Option<String>,
        quantity: i32,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderCancelled(Uuid),
    ReturnRequested {
        order_id: Uuid,
        return_id: Uuid,
    },
    ReturnRejected(Uuid),
    ReturnExpired(Uuid),
    PaymentRefunded {
        order_id: Uuid,
        refund_id: String,
        amount: i64,
    },
    CreditNoteIssued {
        order_id: Uuid,
        number: String,
    },
}

/// Drains the event channel, logging each event.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated {
                order_id,
                order_number,
                requires_review,
            } => {
                info!(%order_id, %order_number, requires_review, "order created");
            }
            Event::StockShortfall {
                order_id,
                product_id,
                size,
                quantity,
            } => {
                error!(
                    %order_id,
                    %product_id,
                    size = size.as_deref().unwrap_or("-"),
                    quantity,
                    "stock could not be decremented; order needs manual review"
                );
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, %old_status, %new_status, "order status changed");
            }
            Event::PaymentRefunded {
                order_id,
                refund_id,
                amount,
            } => {
                info!(%order_id, %refund_id, amount, "payment refunded");
            }
            Event::CreditNoteIssued { order_id, number } => {
                info!(%order_id, %number, "credit note issued");
            }
            other => info!(event = ?other, "event received"),
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_tolerates_a_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        assert!(sender.send(Event::OrderCancelled(Uuid::nil())).await.is_err());
        sender.publish(Event::OrderCancelled(Uuid::nil())).await;
    }

    #[tokio::test]
    async fn loop_drains_until_senders_drop() {
        let (tx, rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        sender.publish(Event::ReturnExpired(Uuid::new_v4())).await;
        drop(sender);
        tokio::time::timeout(std::time::Duration::from_secs(1), process_events(rx))
            .await
            .unwrap();
    }
}

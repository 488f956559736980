pub mod admin;
pub mod checkout;
pub mod health;
pub mod orders;
pub mod webhooks;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    notifications::Mailer,
    payments::PaymentGateway,
    services::{
        checkout::CheckoutService, invoices::InvoiceService, lifecycle::LifecycleService,
        reconciler::Reconciler, refunds::RefundService, stock_ledger::StockLedger,
    },
};
use std::sync::Arc;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub reconciler: Arc<Reconciler>,
    pub refunds: Arc<RefundService>,
    pub lifecycle: Arc<LifecycleService>,
}

impl AppServices {
    /// Wires every service over one pool, gateway and mailer.
    pub fn new(
        db_pool: Arc<DbPool>,
        config: &AppConfig,
        gateway: Arc<dyn PaymentGateway>,
        mailer: Arc<dyn Mailer>,
        event_sender: EventSender,
    ) -> Self {
        let invoices = InvoiceService::new(
            db_pool.clone(),
            mailer,
            event_sender.clone(),
            config.email.store_name.clone(),
        );
        let ledger = StockLedger::new(db_pool.clone(), config.orders.stock_degraded_mode);

        let checkout = CheckoutService::new(db_pool.clone(), gateway.clone(), config.payment.clone());
        let reconciler = Reconciler::new(
            db_pool.clone(),
            gateway.clone(),
            ledger,
            invoices.clone(),
            event_sender.clone(),
        );
        let refunds = RefundService::new(db_pool.clone(), gateway, invoices, event_sender.clone());
        let lifecycle = LifecycleService::new(
            db_pool,
            refunds.clone(),
            event_sender,
            config.orders.clone(),
        );

        Self {
            checkout: Arc::new(checkout),
            reconciler: Arc::new(reconciler),
            refunds: Arc::new(refunds),
            lifecycle: Arc::new(lifecycle),
        }
    }
}

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};
use serde_json::{json, Value};
use storefront_api::{
    auth::{AuthConfig, AuthService, ADMIN_ROLE},
    config::{AppConfig, PaymentConfig},
    db,
    entities::{
        discount_code::{self, DiscountKind},
        order, order_item, product, product_size_stock,
    },
    events::{self, EventSender},
    handlers::AppServices,
    notifications::{Email, MailError, Mailer},
    payments::{
        webhook::{sign_payload, CHECKOUT_COMPLETED, SIGNATURE_HEADER},
        CheckoutSession, CreateSessionRequest, CreatedSession, CustomerDetails, GatewayError,
        MetadataItem, PaymentGateway, PurchasedLine, Refund, RefundRequest, SessionMetadata,
    },
    services::stock_ledger,
    AppState,
};
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";
pub const CUSTOMER_EMAIL: &str = "ana@example.com";

/// In-process payment gateway. Sessions are registered by the test; calls
/// are recorded for assertions.
#[derive(Default)]
pub struct FakeGateway {
    sessions: Mutex<HashMap<String, CheckoutSession>>,
    created: Mutex<Vec<CreateSessionRequest>>,
    refunds: Mutex<Vec<RefundRequest>>,
    fail_refunds: AtomicBool,
    refund_delay_ms: AtomicU64,
}

impl FakeGateway {
    pub fn register_session(&self, session: CheckoutSession) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id.clone(), session);
    }

    pub fn created_sessions(&self) -> Vec<CreateSessionRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn refund_calls(&self) -> Vec<RefundRequest> {
        self.refunds.lock().unwrap().clone()
    }

    pub fn fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    /// Holds every refund call open for `ms`, so concurrent callers overlap.
    pub fn delay_refunds(&self, ms: u64) {
        self.refund_delay_ms.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<CreatedSession, GatewayError> {
        self.created.lock().unwrap().push(request.clone());
        let id = format!("cs_test_{}", Uuid::new_v4().simple());
        Ok(CreatedSession {
            url: format!("https://pay.example.test/{id}"),
            id,
        })
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> Result<CheckoutSession, GatewayError> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or_else(|| GatewayError::Api {
                status: 404,
                message: format!("No such checkout session: {session_id}"),
            })
    }

    async fn create_refund(&self, request: &RefundRequest) -> Result<Refund, GatewayError> {
        let delay = self.refund_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let call = {
            let mut calls = self.refunds.lock().unwrap();
            calls.push(request.clone());
            calls.len()
        };
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(GatewayError::Api {
                status: 402,
                message: "charge already disputed".to_string(),
            });
        }
        Ok(Refund {
            id: format!("re_test_{call}"),
            amount: request.amount,
            status: "succeeded".to_string(),
        })
    }
}

/// Keeps every email instead of sending it. Can be switched to reject
/// everything, like a provider outage.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<Email>>,
    failing: AtomicBool,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &Email) -> Result<(), MailError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MailError::Rejected {
                status: 503,
                body: "mail service unavailable".to_string(),
            });
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(())
    }
}

/// Application wired against a throwaway SQLite file and in-process fakes.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    pub mailer: Arc<RecordingMailer>,
    pub customer_id: Uuid,
    pub customer_token: String,
    pub admin_token: String,
    _db_dir: tempfile::TempDir,
    _event_task: tokio::task::JoinHandle<()>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Builds the app after letting the test adjust the configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let db_dir = tempfile::tempdir().expect("create temp dir");
        let db_path = db_dir.path().join("storefront_test.db");

        let mut payment = PaymentConfig::new("sk_test_fake", WEBHOOK_SECRET);
        payment.currency = "eur".to_string();
        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "test_secret_key_for_testing_purposes_only_32chars".to_string(),
            payment,
            "test".to_string(),
        );
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        adjust(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let gateway = Arc::new(FakeGateway::default());
        let mailer = Arc::new(RecordingMailer::default());
        let services = AppServices::new(
            db_arc.clone(),
            &cfg,
            gateway.clone(),
            mailer.clone(),
            event_sender.clone(),
        );

        let auth = Arc::new(AuthService::new(AuthConfig::from_app_config(&cfg)));
        let customer_id = Uuid::new_v4();
        let customer_token = auth
            .issue_token(&customer_id.to_string(), Some(CUSTOMER_EMAIL), &[])
            .expect("sign customer token");
        let admin_token = auth
            .issue_token(&Uuid::new_v4().to_string(), Some("staff@example.com"), &[ADMIN_ROLE])
            .expect("sign admin token");

        let state = AppState {
            db: db_arc,
            config: cfg,
            event_sender,
            services,
            auth,
        };
        let router = storefront_api::build_router(state.clone());

        Self {
            router,
            state,
            gateway,
            mailer,
            customer_id,
            customer_token,
            admin_token,
            _db_dir: db_dir,
            _event_task: event_task,
        }
    }

    pub fn db(&self) -> &sea_orm::DatabaseConnection {
        &self.state.db
    }

    /// Sends a JSON request through the full router.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("build request");
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        (status, value)
    }

    /// Posts a `checkout.session.completed` event, signed unless `signature`
    /// overrides the header.
    pub async fn deliver_webhook(
        &self,
        session_id: &str,
        signature: Option<&str>,
    ) -> (StatusCode, Value) {
        let payload = json!({
            "id": format!("evt_{}", Uuid::new_v4().simple()),
            "type": CHECKOUT_COMPLETED,
            "data": { "object": { "id": session_id } },
        })
        .to_string();
        let header = signature.map(str::to_string).unwrap_or_else(|| {
            sign_payload(payload.as_bytes(), WEBHOOK_SECRET, Utc::now().timestamp())
        });
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/webhooks/payments")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, header)
            .body(Body::from(payload))
            .expect("build webhook request");
        self.send(request).await
    }

    pub async fn seed_product(&self, name: &str, price: i64, stock: i32) -> product::Model {
        let now = Utc::now();
        let id = Uuid::new_v4();
        product::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            slug: Set(format!("{}-{}", name.to_lowercase().replace(' ', "-"), id.simple())),
            price: Set(price),
            sale_price: Set(None),
            on_sale: Set(false),
            stock: Set(stock),
            image_url: Set(None),
            active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(self.db())
        .await
        .expect("insert product")
    }

    /// Product tracked per size; the global counter is left at zero.
    pub async fn seed_sized_product(
        &self,
        name: &str,
        price: i64,
        sizes: &[(&str, i32)],
    ) -> product::Model {
        let product = self.seed_product(name, price, 0).await;
        for (size, stock) in sizes {
            product_size_stock::ActiveModel {
                id: Set(Uuid::new_v4()),
                product_id: Set(product.id),
                size: Set(size.to_string()),
                stock: Set(*stock),
            }
            .insert(self.db())
            .await
            .expect("insert size stock");
        }
        product
    }

    pub async fn seed_discount(
        &self,
        code: &str,
        kind: DiscountKind,
        value: i64,
        max_uses: Option<i32>,
    ) -> discount_code::Model {
        discount_code::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_string()),
            kind: Set(kind),
            value: Set(value),
            min_subtotal: Set(0),
            max_uses: Set(max_uses),
            used_count: Set(0),
            active: Set(true),
            expires_at: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(self.db())
        .await
        .expect("insert discount code")
    }

    pub async fn stock(&self, product_id: Uuid, size: Option<&str>) -> i32 {
        stock_ledger::available(self.db(), product_id, size)
            .await
            .expect("read stock")
            .expect("product exists")
    }

    /// Registers a paid session for `lines` (product, size, quantity) and
    /// returns its id.
    pub fn paid_session(&self, lines: &[(&product::Model, Option<&str>, i32)]) -> String {
        let id = format!("cs_test_{}", Uuid::new_v4().simple());
        let line_items: Vec<PurchasedLine> = lines
            .iter()
            .map(|(p, size, qty)| PurchasedLine {
                product_id: Some(p.id),
                size: size.map(str::to_string),
                description: p.name.clone(),
                quantity: *qty,
                unit_amount: p.effective_price(),
                amount_total: p.effective_price() * i64::from(*qty),
            })
            .collect();
        let subtotal: i64 = line_items.iter().map(|l| l.amount_total).sum();
        let session = CheckoutSession {
            id: id.clone(),
            payment_status: "paid".to_string(),
            payment_intent: Some(format!("pi_{}", Uuid::new_v4().simple())),
            currency: "eur".to_string(),
            amount_subtotal: subtotal,
            amount_total: subtotal,
            amount_discount: 0,
            amount_shipping: 0,
            amount_tax: 0,
            customer: CustomerDetails {
                name: Some("Ana Test".to_string()),
                email: Some(CUSTOMER_EMAIL.to_string()),
                ..Default::default()
            },
            metadata: SessionMetadata {
                user_id: Some(self.customer_id),
                items: lines
                    .iter()
                    .map(|(p, size, qty)| MetadataItem {
                        product_id: p.id,
                        size: size.map(str::to_string),
                        quantity: *qty,
                    })
                    .collect(),
                discount_code: None,
                discount_amount: 0,
            },
            line_items,
        };
        self.gateway.register_session(session);
        id
    }

    /// Places a paid order through the webhook and returns it.
    pub async fn place_order(&self, lines: &[(&product::Model, Option<&str>, i32)]) -> order::Model {
        let session_id = self.paid_session(lines);
        let (status, _) = self.deliver_webhook(&session_id, None).await;
        assert_eq!(status, StatusCode::OK);
        self.order_for_session(&session_id)
            .await
            .expect("webhook created the order")
    }

    /// Makes every conditional stock decrement on `products` fail, as when
    /// the ledger is unreachable. Writes that also stamp `updated_at` (the
    /// degraded path) and increments still go through.
    pub async fn fail_conditional_decrements(&self) {
        self.db()
            .execute_unprepared(
                "CREATE TRIGGER stock_ledger_offline BEFORE UPDATE OF stock ON products \
                 WHEN NEW.stock < OLD.stock AND NEW.updated_at IS OLD.updated_at \
                 BEGIN SELECT RAISE(ABORT, 'stock ledger offline'); END",
            )
            .await
            .expect("install stock fault trigger");
    }

    pub async fn order_items(&self, order_id: Uuid) -> Vec<order_item::Model> {
        order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(self.db())
            .await
            .unwrap()
    }

    pub async fn order_for_session(&self, session_id: &str) -> Option<order::Model> {
        order::Entity::find()
            .filter(order::Column::CheckoutSessionId.eq(session_id))
            .one(self.db())
            .await
            .expect("query order")
    }

    pub async fn reload_order(&self, order_id: Uuid) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(self.db())
            .await
            .expect("query order")
            .expect("order exists")
    }

    /// Rewrites an order's status and purchase time, standing in for the
    /// fulfilment steps and the passage of time.
    pub async fn age_order(
        &self,
        order_id: Uuid,
        status: order::OrderStatus,
        created_at: DateTime<Utc>,
    ) {
        order::Entity::update_many()
            .set(order::ActiveModel {
                status: Set(status),
                created_at: Set(created_at),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order_id))
            .exec(self.db())
            .await
            .expect("age order");
    }
}

mod common;

use axum::http::{Method, StatusCode};
use chrono::{Datelike, Utc};
use common::TestApp;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::json;
use storefront_api::{
    db::is_unique_violation_on,
    entities::{
        discount_code::{self, DiscountKind},
        invoice::{self, InvoiceKind},
        order::{self, OrderStatus, PaymentStatus},
        order_item,
    },
    services::invoices::next_number,
};

async fn order_count(app: &TestApp) -> u64 {
    order::Entity::find().count(app.db()).await.unwrap()
}

#[tokio::test]
async fn duplicate_webhook_creates_one_order_and_one_decrement() {
    let app = TestApp::new().await;
    let shirt = app
        .seed_sized_product("Linen shirt", 4_500, &[("M", 3)])
        .await;
    let session_id = app.paid_session(&[(&shirt, Some("M"), 2)]);

    let (first, body) = app.deliver_webhook(&session_id, None).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(body["received"], true);
    let (second, _) = app.deliver_webhook(&session_id, None).await;
    assert_eq!(second, StatusCode::OK);

    assert_eq!(order_count(&app).await, 1);
    assert_eq!(app.stock(shirt.id, Some("M")).await, 1);

    let order = app.order_for_session(&session_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.user_id, Some(app.customer_id));
    assert_eq!(order.total, 9_000);
    assert!(order.order_number.starts_with("ORD-"));
    assert!(!order.requires_review);

    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order.id))
        .all(app.db())
        .await
        .unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].size.as_deref(), Some("M"));
    assert_eq!(items[0].subtotal, 9_000);
}

#[tokio::test]
async fn verifier_and_webhook_agree_on_a_single_order() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 10).await;
    let session_id = app.paid_session(&[(&mug, None, 2)]);

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/checkout/verify",
            Some(json!({ "sessionId": session_id })),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["status"], "created");
    let order_number = body["orderNumber"].as_str().unwrap().to_string();

    // The late webhook finds the order already there.
    let (status, _) = app.deliver_webhook(&session_id, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/checkout/verify",
            Some(json!({ "sessionId": session_id })),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "exists");
    assert_eq!(body["orderNumber"], order_number.as_str());

    assert_eq!(order_count(&app).await, 1);
    assert_eq!(app.stock(mug.id, None).await, 8);
}

#[tokio::test]
async fn concurrent_confirmations_create_one_order() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 10).await;
    let session_id = app.paid_session(&[(&mug, None, 1)]);

    let verify = app.request(
        Method::POST,
        "/api/v1/checkout/verify",
        Some(json!({ "sessionId": session_id })),
        None,
    );
    let webhook = app.deliver_webhook(&session_id, None);
    let ((verify_status, _), (webhook_status, _)) = tokio::join!(verify, webhook);

    assert_eq!(verify_status, StatusCode::OK);
    assert_eq!(webhook_status, StatusCode::OK);
    assert_eq!(order_count(&app).await, 1);
    assert_eq!(app.stock(mug.id, None).await, 9);
}

#[tokio::test]
async fn bad_signature_is_rejected_without_side_effects() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 10).await;
    let session_id = app.paid_session(&[(&mug, None, 1)]);

    let (status, _) = app
        .deliver_webhook(&session_id, Some("t=1700000000,v1=deadbeef"))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(order_count(&app).await, 0);
    assert_eq!(app.stock(mug.id, None).await, 10);
}

#[tokio::test]
async fn malformed_session_ids_never_reach_the_gateway() {
    let app = TestApp::new().await;

    for session_id in ["", "cs_test_short", "pi_123456789012345", "cs_test_abc'; DROP TABLE orders;--"] {
        let (status, _) = app
            .request(
                Method::POST,
                "/api/v1/checkout/verify",
                Some(json!({ "sessionId": session_id })),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "session id {session_id:?}");
    }
}

#[tokio::test]
async fn unpaid_session_stays_pending() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 10).await;
    let session_id = app.paid_session(&[(&mug, None, 1)]);
    let mut session = storefront_api::payments::PaymentGateway::retrieve_checkout_session(
        app.gateway.as_ref(),
        &session_id,
    )
    .await
    .unwrap();
    session.payment_status = "unpaid".to_string();
    app.gateway.register_session(session);

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/checkout/verify",
            Some(json!({ "sessionId": session_id })),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(order_count(&app).await, 0);
}

#[tokio::test]
async fn oversold_payment_still_becomes_an_order_flagged_for_review() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 1).await;
    let session_id = app.paid_session(&[(&mug, None, 2)]);

    let order = {
        let (status, _) = app.deliver_webhook(&session_id, None).await;
        assert_eq!(status, StatusCode::OK);
        app.order_for_session(&session_id).await.unwrap()
    };

    assert!(order.requires_review);
    assert!(order
        .admin_notes
        .as_deref()
        .unwrap_or_default()
        .contains("Stock not decremented"));
    // Shortfalls are left for a person to reconcile.
    assert_eq!(app.stock(mug.id, None).await, 1);
}

#[tokio::test]
async fn paid_order_gets_an_invoice_and_counts_its_discount() {
    let app = TestApp::new().await;
    let scarf = app.seed_product("Wool scarf", 4_000, 5).await;
    let code = app
        .seed_discount("WELCOME10", DiscountKind::Percent, 10, None)
        .await;
    let session_id = app.paid_session(&[(&scarf, None, 1)]);
    let mut session = storefront_api::payments::PaymentGateway::retrieve_checkout_session(
        app.gateway.as_ref(),
        &session_id,
    )
    .await
    .unwrap();
    session.metadata.discount_code = Some("WELCOME10".to_string());
    session.metadata.discount_amount = 400;
    session.amount_discount = 400;
    session.amount_total = 3_600;
    app.gateway.register_session(session);

    let (status, _) = app.deliver_webhook(&session_id, None).await;
    assert_eq!(status, StatusCode::OK);
    let order = app.order_for_session(&session_id).await.unwrap();
    assert_eq!(order.total, 3_600);
    assert_eq!(order.discount_code.as_deref(), Some("WELCOME10"));

    let used = discount_code::Entity::find_by_id(code.id)
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(used.used_count, 1);

    let invoices = invoice::Entity::find()
        .filter(invoice::Column::OrderId.eq(order.id))
        .all(app.db())
        .await
        .unwrap();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].kind, InvoiceKind::Invoice);
    assert!(invoices[0].invoice_number.starts_with("FAC-"));
    assert!(invoices[0].emailed_at.is_some());

    let sent = app.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, common::CUSTOMER_EMAIL);
    assert_eq!(sent[0].attachments.len(), 1);
}

#[tokio::test]
async fn truncated_line_list_is_flagged_against_the_cart() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 5).await;
    let scarf = app.seed_product("Wool scarf", 4_000, 5).await;
    let session_id = app.paid_session(&[(&mug, None, 1), (&scarf, None, 2)]);
    let mut session = storefront_api::payments::PaymentGateway::retrieve_checkout_session(
        app.gateway.as_ref(),
        &session_id,
    )
    .await
    .unwrap();
    session.line_items.truncate(1);
    app.gateway.register_session(session);

    let (status, _) = app.deliver_webhook(&session_id, None).await;
    assert_eq!(status, StatusCode::OK);

    let order = app.order_for_session(&session_id).await.unwrap();
    assert!(order.requires_review);
    assert!(order
        .admin_notes
        .as_deref()
        .unwrap_or_default()
        .contains("do not match the cart"));
    assert_eq!(app.stock(mug.id, None).await, 4);
}

#[tokio::test]
async fn cancelling_an_oversold_order_restores_only_decremented_lines() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 1).await;
    let scarf = app.seed_product("Wool scarf", 4_000, 5).await;
    let order = app.place_order(&[(&mug, None, 3), (&scarf, None, 2)]).await;

    assert!(order.requires_review);
    assert_eq!(app.stock(mug.id, None).await, 1);
    assert_eq!(app.stock(scarf.id, None).await, 3);
    let items = app.order_items(order.id).await;
    let flag_for = |product_id| {
        items
            .iter()
            .find(|i| i.product_id == product_id)
            .map(|i| i.stock_decremented)
            .unwrap()
    };
    assert!(!flag_for(mug.id));
    assert!(flag_for(scarf.id));

    let (status, body) = app
        .request(
            Method::POST,
            "/api/v1/orders/cancel",
            Some(json!({ "orderId": order.id })),
            Some(&app.customer_token),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");

    // The mug never left stock, so nothing comes back for it.
    assert_eq!(app.stock(mug.id, None).await, 1);
    assert_eq!(app.stock(scarf.id, None).await, 5);
}

#[tokio::test]
async fn unreachable_ledger_leaves_the_order_for_review() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 5).await;
    app.fail_conditional_decrements().await;

    let order = app.place_order(&[(&mug, None, 2)]).await;

    assert!(order.requires_review);
    assert!(order
        .admin_notes
        .as_deref()
        .unwrap_or_default()
        .contains("Stock not decremented"));
    assert_eq!(app.stock(mug.id, None).await, 5);
    assert!(app.order_items(order.id).await.iter().all(|i| !i.stock_decremented));
    assert_eq!(order.payment_status, PaymentStatus::Paid);
}

#[tokio::test]
async fn degraded_mode_forces_the_decrement_and_flags_the_order() {
    let app = TestApp::with_config(|cfg| cfg.orders.stock_degraded_mode = true).await;
    let mug = app.seed_product("Stoneware mug", 1_800, 5).await;
    app.fail_conditional_decrements().await;
    let unsafe_before = storefront_api::metrics::STOCK_UNSAFE_DECREMENTS.get();

    let order = app.place_order(&[(&mug, None, 2)]).await;

    assert_eq!(app.stock(mug.id, None).await, 3);
    assert!(storefront_api::metrics::STOCK_UNSAFE_DECREMENTS.get() > unsafe_before);
    assert!(order.requires_review);
    assert!(order
        .admin_notes
        .as_deref()
        .unwrap_or_default()
        .contains("degraded mode"));
    assert!(app.order_items(order.id).await.iter().all(|i| i.stock_decremented));
}

#[tokio::test]
async fn colliding_order_numbers_are_told_apart_from_duplicate_payments() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 5).await;
    let order = app.place_order(&[(&mug, None, 1)]).await;

    let mut copy = order.clone();
    copy.id = uuid::Uuid::new_v4();
    copy.payment_id = Some("pi_other_payment".to_string());
    copy.checkout_session_id = Some("cs_test_otherSession01".to_string());
    let err = order::ActiveModel::from(copy).insert(app.db()).await.unwrap_err();

    assert!(is_unique_violation_on(&err, "order_number"));
    assert!(!is_unique_violation_on(&err, "checkout_session_id"));
}

#[tokio::test]
async fn invoice_numbers_keep_counting_past_six_digits() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 5).await;
    let order = app.place_order(&[(&mug, None, 1)]).await;
    let year = Utc::now().year();
    let first = invoice::Entity::find()
        .filter(invoice::Column::OrderId.eq(order.id))
        .one(app.db())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.invoice_number, format!("FAC-{year}-000001"));

    for number in [format!("FAC-{year}-999999"), format!("FAC-{year}-1000000")] {
        let mut row = first.clone();
        row.id = uuid::Uuid::new_v4();
        row.invoice_number = number;
        invoice::ActiveModel::from(row).insert(app.db()).await.unwrap();
    }

    let next = next_number(app.db(), InvoiceKind::Invoice, year).await.unwrap();
    assert_eq!(next, format!("FAC-{year}-1000001"));
    let credit = next_number(app.db(), InvoiceKind::CreditNote, year).await.unwrap();
    assert_eq!(credit, format!("ABON-{year}-000001"));
}

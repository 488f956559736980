mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::TestApp;
use storefront_api::services::stock_ledger::{
    self, DecrementOutcome, LineResult, StockLedger, StockLine,
};

fn line(product_id: uuid::Uuid, size: Option<&str>, quantity: i32) -> StockLine {
    StockLine {
        product_id,
        size: size.map(str::to_string),
        quantity,
    }
}

#[tokio::test]
async fn concurrent_decrements_never_oversell() {
    let app = TestApp::new().await;
    let shirt = app
        .seed_sized_product("Linen shirt", 4_500, &[("M", 5)])
        .await;
    let db = app.state.db.clone();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move {
                stock_ledger::try_decrement(&*db, shirt.id, Some("M"), 1).await
            })
        })
        .collect();

    let mut applied = 0;
    for task in tasks {
        if task.await.unwrap().unwrap() == DecrementOutcome::Applied {
            applied += 1;
        }
    }

    assert_eq!(applied, 5);
    assert_eq!(app.stock(shirt.id, Some("M")).await, 0);
}

#[tokio::test]
async fn insufficient_decrement_writes_nothing() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 2).await;

    let outcome = stock_ledger::try_decrement(app.db(), mug.id, None, 3)
        .await
        .unwrap();
    assert_eq!(outcome, DecrementOutcome::Insufficient { available: Some(2) });
    assert_eq!(app.stock(mug.id, None).await, 2);

    let missing = stock_ledger::try_decrement(app.db(), uuid::Uuid::new_v4(), None, 1)
        .await
        .unwrap();
    assert_eq!(missing, DecrementOutcome::Insufficient { available: None });
}

#[tokio::test]
async fn unknown_size_falls_back_to_the_product_counter() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 4).await;

    assert_eq!(app.stock(mug.id, Some("XL")).await, 4);
    let outcome = stock_ledger::try_decrement(app.db(), mug.id, Some("XL"), 3)
        .await
        .unwrap();
    assert_eq!(outcome, DecrementOutcome::Applied);
    assert_eq!(app.stock(mug.id, None).await, 1);
}

#[tokio::test]
async fn batch_decrement_is_all_or_nothing() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 5).await;
    let scarf = app.seed_product("Wool scarf", 4_000, 1).await;
    let ledger = StockLedger::new(Arc::clone(&app.state.db), false);

    let result = ledger
        .decrement_batch(&[line(mug.id, None, 2), line(scarf.id, None, 2)])
        .await
        .unwrap();
    assert_matches!(result, Err((short, Some(1))) if short.product_id == scarf.id);
    assert_eq!(app.stock(mug.id, None).await, 5);
    assert_eq!(app.stock(scarf.id, None).await, 1);

    ledger
        .decrement_batch(&[line(mug.id, None, 2), line(scarf.id, None, 1)])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(app.stock(mug.id, None).await, 3);
    assert_eq!(app.stock(scarf.id, None).await, 0);
}

#[tokio::test]
async fn order_lines_report_shortfalls_for_review() {
    let app = TestApp::new().await;
    let mug = app.seed_product("Stoneware mug", 1_800, 5).await;
    let scarf = app.seed_product("Wool scarf", 4_000, 1).await;
    let ledger = StockLedger::new(Arc::clone(&app.state.db), false);

    let results = ledger
        .decrement_order_lines(&[line(mug.id, None, 2), line(scarf.id, None, 3)])
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].1, LineResult::Applied);
    assert_eq!(results[1].1, LineResult::Shortfall { available: Some(1) });
    assert!(results[1].1.needs_review());
    assert_eq!(app.stock(mug.id, None).await, 3);
    assert_eq!(app.stock(scarf.id, None).await, 1);
}

#[tokio::test]
async fn increment_restores_the_matching_counter() {
    let app = TestApp::new().await;
    let shirt = app
        .seed_sized_product("Linen shirt", 4_500, &[("S", 0), ("M", 1)])
        .await;
    let ledger = StockLedger::new(Arc::clone(&app.state.db), false);

    assert!(ledger.increment(&line(shirt.id, Some("S"), 2)).await.unwrap());
    assert_eq!(app.stock(shirt.id, Some("S")).await, 2);
    assert_eq!(app.stock(shirt.id, Some("M")).await, 1);
    assert!(!ledger
        .increment(&line(uuid::Uuid::new_v4(), None, 1))
        .await
        .unwrap());
}

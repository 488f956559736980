use crate::{
    db::DbPool,
    entities::{product, product_size_stock},
    metrics,
};
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter,
    TransactionTrait,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, instrument, warn};
use uuid::Uuid;

/// A quantity of one product, optionally in one size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLine {
    pub product_id: Uuid,
    pub size: Option<String>,
    pub quantity: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrementOutcome {
    Applied,
    /// Nothing was written. `available` is the counter seen afterwards,
    /// `None` when the product does not exist.
    Insufficient { available: Option<i32> },
}

/// How one order line ended up in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineResult {
    Applied,
    /// Applied through the degraded read-modify-write path.
    Forced,
    Shortfall { available: Option<i32> },
    Unresolved { error: String },
}

impl LineResult {
    pub fn needs_review(&self) -> bool {
        !matches!(self, LineResult::Applied | LineResult::Forced)
    }
}

/// Which counter backs a product/size pair.
enum Counter {
    Size(Uuid),
    Global,
}

async fn counter_for<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    size: Option<&str>,
) -> Result<Counter, DbErr> {
    let Some(size) = size else {
        return Ok(Counter::Global);
    };
    let row = product_size_stock::Entity::find()
        .filter(product_size_stock::Column::ProductId.eq(product_id))
        .filter(product_size_stock::Column::Size.eq(size))
        .one(conn)
        .await?;
    Ok(row.map_or(Counter::Global, |r| Counter::Size(r.id)))
}

/// Effective availability: the size counter when one exists, the product's
/// global counter otherwise.
pub async fn available<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    size: Option<&str>,
) -> Result<Option<i32>, DbErr> {
    match counter_for(conn, product_id, size).await? {
        Counter::Size(id) => Ok(product_size_stock::Entity::find_by_id(id)
            .one(conn)
            .await?
            .map(|r| r.stock)),
        Counter::Global => Ok(product::Entity::find_by_id(product_id)
            .one(conn)
            .await?
            .map(|p| p.stock)),
    }
}

/// Conditionally decrements a counter with a single
/// `UPDATE .. SET stock = stock - q WHERE .. AND stock >= q`.
/// Exactly one affected row means the decrement happened.
pub async fn try_decrement<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    size: Option<&str>,
    quantity: i32,
) -> Result<DecrementOutcome, DbErr> {
    if quantity <= 0 {
        return Err(DbErr::Custom(format!("invalid decrement quantity {quantity}")));
    }

    let rows = match counter_for(conn, product_id, size).await? {
        Counter::Size(id) => {
            product_size_stock::Entity::update_many()
                .col_expr(
                    product_size_stock::Column::Stock,
                    Expr::col(product_size_stock::Column::Stock).sub(quantity),
                )
                .filter(product_size_stock::Column::Id.eq(id))
                .filter(product_size_stock::Column::Stock.gte(quantity))
                .exec(conn)
                .await?
                .rows_affected
        }
        Counter::Global => {
            product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).sub(quantity),
                )
                .filter(product::Column::Id.eq(product_id))
                .filter(product::Column::Stock.gte(quantity))
                .exec(conn)
                .await?
                .rows_affected
        }
    };

    if rows == 1 {
        Ok(DecrementOutcome::Applied)
    } else {
        Ok(DecrementOutcome::Insufficient {
            available: available(conn, product_id, size).await?,
        })
    }
}

/// Unconditionally adds `quantity` back. Returns false when no counter
/// matched (the product no longer exists).
pub async fn increment<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    size: Option<&str>,
    quantity: i32,
) -> Result<bool, DbErr> {
    let rows = match counter_for(conn, product_id, size).await? {
        Counter::Size(id) => {
            product_size_stock::Entity::update_many()
                .col_expr(
                    product_size_stock::Column::Stock,
                    Expr::col(product_size_stock::Column::Stock).add(quantity),
                )
                .filter(product_size_stock::Column::Id.eq(id))
                .exec(conn)
                .await?
                .rows_affected
        }
        Counter::Global => {
            product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).add(quantity),
                )
                .filter(product::Column::Id.eq(product_id))
                .exec(conn)
                .await?
                .rows_affected
        }
    };
    Ok(rows == 1)
}

/// Stock ledger over the product counters.
#[derive(Clone)]
pub struct StockLedger {
    db: Arc<DbPool>,
    degraded_mode: bool,
}

impl StockLedger {
    pub fn new(db: Arc<DbPool>, degraded_mode: bool) -> Self {
        Self { db, degraded_mode }
    }

    pub async fn available(&self, product_id: Uuid, size: Option<&str>) -> Result<Option<i32>, DbErr> {
        available(&*self.db, product_id, size).await
    }

    pub async fn increment(&self, line: &StockLine) -> Result<bool, DbErr> {
        increment(&*self.db, line.product_id, line.size.as_deref(), line.quantity).await
    }

    /// Validates and decrements every line inside one transaction. Either all
    /// lines are applied or none are.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn decrement_batch(
        &self,
        lines: &[StockLine],
    ) -> Result<Result<(), (StockLine, Option<i32>)>, DbErr> {
        let txn = self.db.begin().await?;
        for line in lines {
            let outcome =
                try_decrement(&txn, line.product_id, line.size.as_deref(), line.quantity).await?;
            if let DecrementOutcome::Insufficient { available } = outcome {
                txn.rollback().await?;
                return Ok(Err((line.clone(), available)));
            }
        }
        txn.commit().await?;
        Ok(Ok(()))
    }

    /// Read-modify-write decrement. Race-prone: only reachable in degraded
    /// mode and logged every time it is taken.
    #[instrument(skip(self))]
    pub async fn force_decrement(&self, line: &StockLine) -> Result<DecrementOutcome, DbErr> {
        error!(
            product_id = %line.product_id,
            size = line.size.as_deref().unwrap_or("-"),
            quantity = line.quantity,
            "stock degraded mode: applying unsafe read-modify-write decrement"
        );
        metrics::STOCK_UNSAFE_DECREMENTS.inc();
        if line.quantity <= 0 {
            return Err(DbErr::Custom(format!("invalid decrement quantity {}", line.quantity)));
        }

        let db = &*self.db;
        let current = available(db, line.product_id, line.size.as_deref()).await?;
        let Some(current) = current.filter(|c| *c >= line.quantity) else {
            return Ok(DecrementOutcome::Insufficient { available: current });
        };
        let remaining = current - line.quantity;

        match counter_for(db, line.product_id, line.size.as_deref()).await? {
            Counter::Size(id) => {
                product_size_stock::Entity::update_many()
                    .col_expr(product_size_stock::Column::Stock, Expr::value(remaining))
                    .filter(product_size_stock::Column::Id.eq(id))
                    .exec(db)
                    .await?;
            }
            Counter::Global => {
                product::Entity::update_many()
                    .col_expr(product::Column::Stock, Expr::value(remaining))
                    .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                    .filter(product::Column::Id.eq(line.product_id))
                    .exec(db)
                    .await?;
            }
        }
        Ok(DecrementOutcome::Applied)
    }

    /// Decrements stock for every line of a paid order, falling back in
    /// order: atomic per line, then one validate-and-decrement transaction
    /// for the lines that errored, then (degraded mode only) the unsafe
    /// path. Shortfalls are never retried; they go to manual review.
    #[instrument(skip(self, lines), fields(lines = lines.len()))]
    pub async fn decrement_order_lines(&self, lines: &[StockLine]) -> Vec<(StockLine, LineResult)> {
        let mut results = Vec::with_capacity(lines.len());
        let mut errored = Vec::new();

        for line in lines {
            match try_decrement(&*self.db, line.product_id, line.size.as_deref(), line.quantity).await {
                Ok(DecrementOutcome::Applied) => results.push((line.clone(), LineResult::Applied)),
                Ok(DecrementOutcome::Insufficient { available }) => {
                    results.push((line.clone(), LineResult::Shortfall { available }))
                }
                Err(e) => {
                    warn!(product_id = %line.product_id, error = %e, "atomic stock decrement failed");
                    errored.push(line.clone());
                }
            }
        }

        if errored.is_empty() {
            return results;
        }

        let mut pending = match self.decrement_batch(&errored).await {
            Ok(Ok(())) => {
                results.extend(errored.into_iter().map(|l| (l, LineResult::Applied)));
                return results;
            }
            Ok(Err((short, available))) => {
                results.push((short.clone(), LineResult::Shortfall { available }));
                errored.into_iter().filter(|l| *l != short).collect::<Vec<_>>()
            }
            Err(e) => {
                warn!(error = %e, "bulk stock decrement failed");
                errored
            }
        };

        for line in pending.drain(..) {
            if !self.degraded_mode {
                results.push((
                    line,
                    LineResult::Unresolved {
                        error: "stock ledger unavailable".to_string(),
                    },
                ));
                continue;
            }
            let result = match self.force_decrement(&line).await {
                Ok(DecrementOutcome::Applied) => LineResult::Forced,
                Ok(DecrementOutcome::Insufficient { available }) => LineResult::Shortfall { available },
                Err(e) => LineResult::Unresolved { error: e.to_string() },
            };
            results.push((line, result));
        }
        results
    }
}

use crate::{
    entities::discount_code::{self, DiscountKind},
    errors::{DiscountRejection, ServiceError},
};
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter,
};

/// Normalised form used for storage and lookups.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Checks `code` against a server-computed subtotal.
pub fn check(
    code: &discount_code::Model,
    subtotal: i64,
    now: DateTime<Utc>,
) -> Result<(), DiscountRejection> {
    if !code.active {
        return Err(DiscountRejection::Inactive);
    }
    if code.expires_at.is_some_and(|at| at <= now) {
        return Err(DiscountRejection::Expired);
    }
    if code.max_uses.is_some_and(|max| code.used_count >= max) {
        return Err(DiscountRejection::Exhausted);
    }
    if subtotal < code.min_subtotal {
        return Err(DiscountRejection::BelowMinimum {
            min_subtotal: code.min_subtotal,
        });
    }
    Ok(())
}

/// Discount amount for `subtotal`, never more than the subtotal itself.
pub fn amount_for(code: &discount_code::Model, subtotal: i64) -> i64 {
    let raw = match code.kind {
        DiscountKind::Percent => subtotal * code.value.clamp(0, 100) / 100,
        DiscountKind::Fixed => code.value.max(0),
    };
    raw.min(subtotal)
}

/// Looks up and validates a client-supplied code, returning the normalised
/// code and the discount it grants on `subtotal`.
pub async fn validate<C: ConnectionTrait>(
    conn: &C,
    raw_code: &str,
    subtotal: i64,
    now: DateTime<Utc>,
) -> Result<(String, i64), ServiceError> {
    let code = normalize_code(raw_code);
    let reject = |reason| ServiceError::InvalidDiscount {
        code: code.clone(),
        reason,
    };

    let Some(model) = discount_code::Entity::find()
        .filter(discount_code::Column::Code.eq(code.as_str()))
        .one(conn)
        .await?
    else {
        return Err(reject(DiscountRejection::Unknown));
    };
    check(&model, subtotal, now).map_err(reject)?;
    Ok((code.clone(), amount_for(&model, subtotal)))
}

/// Counts one use of `code`, bounded by `max_uses`.
pub async fn record_use<C: ConnectionTrait>(conn: &C, code: &str) -> Result<bool, DbErr> {
    let res = discount_code::Entity::update_many()
        .col_expr(
            discount_code::Column::UsedCount,
            Expr::col(discount_code::Column::UsedCount).add(1),
        )
        .filter(discount_code::Column::Code.eq(normalize_code(code)))
        .filter(
            discount_code::Column::MaxUses
                .is_null()
                .or(Expr::col(discount_code::Column::UsedCount)
                    .lt(Expr::col(discount_code::Column::MaxUses))),
        )
        .exec(conn)
        .await?;
    Ok(res.rows_affected == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Duration;
    use uuid::Uuid;

    fn code(kind: DiscountKind, value: i64) -> discount_code::Model {
        discount_code::Model {
            id: Uuid::new_v4(),
            code: "WELCOME".into(),
            kind,
            value,
            min_subtotal: 0,
            max_uses: None,
            used_count: 0,
            active: true,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn percent_and_fixed_amounts_are_capped_at_subtotal() {
        assert_eq!(amount_for(&code(DiscountKind::Percent, 10), 4_999), 499);
        assert_eq!(amount_for(&code(DiscountKind::Fixed, 1_500), 4_000), 1_500);
        assert_eq!(amount_for(&code(DiscountKind::Fixed, 9_000), 4_000), 4_000);
        assert_eq!(amount_for(&code(DiscountKind::Percent, 250), 4_000), 4_000);
    }

    #[test]
    fn rejections_are_specific() {
        let now = Utc::now();

        let mut inactive = code(DiscountKind::Fixed, 100);
        inactive.active = false;
        assert_matches!(check(&inactive, 1_000, now), Err(DiscountRejection::Inactive));

        let mut expired = code(DiscountKind::Fixed, 100);
        expired.expires_at = Some(now - Duration::minutes(1));
        assert_matches!(check(&expired, 1_000, now), Err(DiscountRejection::Expired));

        let mut used = code(DiscountKind::Fixed, 100);
        used.max_uses = Some(3);
        used.used_count = 3;
        assert_matches!(check(&used, 1_000, now), Err(DiscountRejection::Exhausted));

        let mut minimum = code(DiscountKind::Fixed, 100);
        minimum.min_subtotal = 5_000;
        assert_matches!(
            check(&minimum, 4_999, now),
            Err(DiscountRejection::BelowMinimum { min_subtotal: 5_000 })
        );
        assert_eq!(check(&minimum, 5_000, now), Ok(()));
    }

    #[test]
    fn codes_are_case_insensitive() {
        assert_eq!(normalize_code("  welcome10 "), "WELCOME10");
    }

    proptest::proptest! {
        #[test]
        fn discount_never_exceeds_subtotal(
            value in -1_000i64..100_000,
            subtotal in 0i64..10_000_000,
            percent in proptest::bool::ANY,
        ) {
            let kind = if percent { DiscountKind::Percent } else { DiscountKind::Fixed };
            let amount = amount_for(&code(kind, value), subtotal);
            proptest::prop_assert!(amount >= 0);
            proptest::prop_assert!(amount <= subtotal);
        }
    }
}

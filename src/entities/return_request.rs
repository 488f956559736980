use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;

/// Cancellation or return record attached to an order.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "returns")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub return_number: String,
    pub order_id: Uuid,
    #[sea_orm(nullable)]
    pub user_id: Option<Uuid>,
    pub kind: ReturnKind,
    pub status: ReturnStatus,
    pub reason: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,
    pub return_deadline: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub refund_id: Option<String>,
    #[sea_orm(nullable)]
    pub refund_amount: Option<i64>,
    #[sea_orm(column_type = "Text", nullable)]
    pub admin_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub received_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum ReturnKind {
    #[sea_orm(string_value = "cancellation")]
    Cancellation,
    #[sea_orm(string_value = "return")]
    Return,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
pub enum ReturnStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "approved")]
    Approved,
    #[sea_orm(string_value = "received")]
    Received,
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "rejected")]
    Rejected,
    #[sea_orm(string_value = "expired")]
    Expired,
}

impl ReturnStatus {
    /// Records in these states block a new return request for the order.
    pub const ACTIVE: [ReturnStatus; 3] = [
        ReturnStatus::Pending,
        ReturnStatus::Approved,
        ReturnStatus::Received,
    ];
}

/// Reasons a customer can pick when requesting a return.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReturnReason {
    Damaged,
    WrongSize,
    WrongItem,
    NotAsDescribed,
    ChangedMind,
    Other,
}

impl ReturnReason {
    /// Minimum description length required for `Other`.
    pub const MIN_OTHER_DESCRIPTION: usize = 10;

    pub fn requires_description(&self) -> bool {
        matches!(self, ReturnReason::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn reasons_round_trip_through_their_stored_form() {
        assert_eq!(ReturnReason::WrongSize.to_string(), "wrong_size");
        assert_eq!(ReturnReason::from_str("not_as_described").unwrap(), ReturnReason::NotAsDescribed);
        assert!(ReturnReason::from_str("bored").is_err());
    }
}

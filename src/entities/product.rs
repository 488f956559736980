use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Catalog product. `stock` is the global counter used for sizes that have
/// no dedicated row in `product_size_stocks`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    #[sea_orm(unique)]
    pub slug: String,
    /// Unit price in minor currency units.
    pub price: i64,
    #[sea_orm(nullable)]
    pub sale_price: Option<i64>,
    pub on_sale: bool,
    pub stock: i32,
    #[sea_orm(nullable)]
    pub image_url: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::product_size_stock::Entity")]
    SizeStocks,
}

impl Related<super::product_size_stock::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SizeStocks.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Price actually charged, taking an active sale into account.
    pub fn effective_price(&self) -> i64 {
        match self.sale_price {
            Some(sale) if self.on_sale && sale > 0 => sale,
            _ => self.price,
        }
    }
}

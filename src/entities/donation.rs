//! Donation record entity, shared by the chain mirror and the HTTP API.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "donations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Lower-case `0x`-prefixed transaction hash, unique when present
    #[sea_orm(unique, column_type = "String(StringLen::N(66))", nullable)]
    pub transaction_hash: Option<String>,
    #[sea_orm(column_type = "String(StringLen::N(42))", nullable)]
    pub donor_address: Option<String>,
    /// Application user that registered the donation
    #[sea_orm(column_type = "String(StringLen::N(64))", nullable)]
    pub donor_id: Option<String>,
    /// Sequence number emitted by the donation contract
    pub donation_id: Option<i64>,
    /// Amount in wei
    #[sea_orm(column_type = "Decimal(Some((39, 0)))")]
    pub amount: Decimal,
    #[sea_orm(column_type = "Text")]
    pub purpose: String,
    #[sea_orm(column_type = "String(StringLen::N(64))", nullable)]
    pub target_school_id: Option<String>,
    pub block_number: Option<i64>,
    /// Unix seconds of the containing block
    pub block_timestamp: Option<i64>,
    #[sea_orm(column_type = "String(StringLen::N(16))")]
    pub status: String,
    pub created_at: DateTimeWithTimeZone,
    pub confirmed_at: Option<DateTimeWithTimeZone>,
    pub allocated_at: Option<DateTimeWithTimeZone>,
    pub completed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, Row, postgres::PgRow};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Good,
    Error,
    PendingExpiration,
    Revoked,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Good => "good",
            ItemStatus::Error => "error",
            ItemStatus::PendingExpiration => "pending_expiration",
            ItemStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown item status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for ItemStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "good" => Ok(ItemStatus::Good),
            "error" => Ok(ItemStatus::Error),
            "pending_expiration" => Ok(ItemStatus::PendingExpiration),
            "revoked" => Ok(ItemStatus::Revoked),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One linked institution connection.
#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plaid_item_id: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub institution_id: Option<String>,
    pub institution_name: Option<String>,
    pub status: ItemStatus,
    pub error: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for Item {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        Ok(Item {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            plaid_item_id: row.try_get("plaid_item_id")?,
            access_token: row.try_get("access_token")?,
            institution_id: row.try_get("institution_id")?,
            institution_name: row.try_get("institution_name")?,
            status: status.parse().map_err(|err| sqlx::Error::ColumnDecode {
                index: String::from("status"),
                source: Box::new(err),
            })?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewItem {
    pub user_id: Uuid,
    pub plaid_item_id: String,
    pub access_token: String,
    pub institution_id: Option<String>,
    pub institution_name: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Account {
    pub id: Uuid,
    pub item_id: Uuid,
    pub user_id: Uuid,
    pub plaid_account_id: String,
    pub name: String,
    pub mask: Option<String>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub account_type: String,
    pub subtype: Option<String>,
    pub current_balance: Option<Decimal>,
    pub available_balance: Option<Decimal>,
    pub currency_code: Option<String>,
}

/// Account fields as reported by the aggregator, before they are tied to an item.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAccount {
    pub plaid_account_id: String,
    pub name: String,
    pub mask: Option<String>,
    pub account_type: String,
    pub subtype: Option<String>,
    pub balance: AccountBalance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountBalance {
    pub plaid_account_id: String,
    pub current: Option<Decimal>,
    pub available: Option<Decimal>,
    pub currency_code: Option<String>,
}

/// Stored ledger entry. `amount` keeps the aggregator's sign: positive is an outflow.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub account_id: Option<Uuid>,
    pub item_id: Uuid,
    pub user_id: Uuid,
    pub plaid_transaction_id: String,
    pub plaid_account_id: String,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub name: String,
    pub merchant_name: Option<String>,
    pub amount: Decimal,
    pub currency_code: Option<String>,
    pub date: NaiveDate,
    pub pending: bool,
    pub payment_channel: Option<String>,
    pub authorized_date: Option<NaiveDate>,
    pub location: Option<Value>,
    #[serde(skip_serializing)]
    pub raw_data: Value,
    pub is_removed: bool,
}

/// Typed view of one added/modified entry, plus the payload it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub plaid_transaction_id: String,
    pub plaid_account_id: String,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub name: String,
    pub merchant_name: Option<String>,
    pub amount: Decimal,
    pub currency_code: Option<String>,
    pub date: NaiveDate,
    pub pending: bool,
    pub payment_channel: Option<String>,
    pub authorized_date: Option<NaiveDate>,
    pub location: Option<Value>,
    pub raw_data: Value,
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncCursor {
    pub cursor: String,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub plaid_item_id: Option<String>,
    pub webhook_type: String,
    pub webhook_code: String,
    pub error: Option<Value>,
    pub new_transactions: Option<i64>,
    pub removed_transactions: Option<i64>,
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkToken {
    pub user_id: Uuid,
    pub link_token: String,
    pub expiration: DateTime<Utc>,
}

/// Everything one sync page asks the store to apply.
#[derive(Debug, Clone, Default)]
pub struct SyncPage {
    pub removed: Vec<String>,
    pub added: Vec<TransactionRecord>,
    pub modified: Vec<TransactionRecord>,
    pub balances: Vec<AccountBalance>,
}

/// Anomalies the store tolerated while applying a page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageOutcome {
    pub duplicate_added: Vec<String>,
    pub missing_modified: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub added: usize,
    pub modified: usize,
    pub removed: usize,
}

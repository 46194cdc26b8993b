use std::time::Duration;

use thiserror::Error;

use crate::plaid::PlaidError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Plaid error: {0}")]
    Plaid(#[from] PlaidError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("Item {0} is linked to a different user")]
    ItemOwnership(String),

    #[error("Account {0} already belongs to a different item")]
    AccountConflict(String),

    #[error("Sync already in progress for item {0}")]
    SyncLocked(String),

    #[error("Sync page timed out after {0:?}")]
    PageTimeout(Duration),

    #[error("Sync exceeded {0} pages")]
    TooManyPages(usize),

    #[error("Unreadable transaction in sync page for item {item_id}: {reason}")]
    MalformedTransaction { item_id: String, reason: String },

    #[error("Item {0} has been revoked and cannot be re-linked")]
    ItemRevoked(String),
}

impl Error {
    /// Whether a later attempt of the same operation can succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Plaid(_) | Error::Database(_) | Error::SyncLocked(_) | Error::PageTimeout(_) => {
                true
            }
            Error::Migration(_)
            | Error::ItemNotFound(_)
            | Error::ItemOwnership(_)
            | Error::AccountConflict(_)
            | Error::TooManyPages(_)
            | Error::MalformedTransaction { .. }
            | Error::ItemRevoked(_) => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

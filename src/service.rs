use std::{sync::Arc, time::Duration};

use crate::{db::Store, plaid::PlaidApi};

/// Settings for Link session creation.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub client_name: String,
    pub language: String,
    pub country_codes: Vec<String>,
    pub webhook_url: String,
}

/// Settings for the transaction sync engine.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Bound for a single `/transactions/sync` call.
    pub page_timeout: Duration,
    /// Longest a sync lease may be held before another worker can take it.
    pub lock_ttl: Duration,
    /// How long a sync waits for a lease held by someone else.
    pub lock_wait: Duration,
    pub lock_retry_interval: Duration,
    /// Pagination safety limit per sync attempt.
    pub max_pages: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_timeout: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(300),
            lock_wait: Duration::from_secs(10),
            lock_retry_interval: Duration::from_millis(250),
            max_pages: 10_000,
        }
    }
}

/// The link, webhook, sync and item-status pipeline. Built once at startup
/// and shared by the HTTP handlers and background jobs.
#[derive(Clone)]
pub struct PlaidService {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) plaid: Arc<dyn PlaidApi>,
    pub(crate) link: LinkSettings,
    pub(crate) sync: SyncSettings,
}

impl PlaidService {
    pub fn new(
        store: Arc<dyn Store>,
        plaid: Arc<dyn PlaidApi>,
        link: LinkSettings,
        sync: SyncSettings,
    ) -> Self {
        Self {
            store,
            plaid,
            link,
            sync,
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }
}

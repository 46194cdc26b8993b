//! Cursor-driven incremental transaction sync.
//!
//! Each page is applied atomically together with its `next_cursor`, so an
//! aborted sync resumes from the last page that was fully stored. Within a page
//! removals run before additions and additions before modifications.

use uuid::Uuid;

use crate::{
    domain::{Item, ItemStatus, SyncPage, SyncSummary},
    error::{Error, Result},
    plaid::{TransactionsSyncResponse, transaction_record},
    service::PlaidService,
};

/// Reads one sync response. A single unreadable entry fails the whole page so
/// the cursor never moves past a transaction that was not stored.
fn build_page(
    item: &Item,
    response: TransactionsSyncResponse,
) -> Result<(SyncPage, String, bool)> {
    let parse = |entries: Vec<serde_json::Value>| -> Result<Vec<_>> {
        entries
            .into_iter()
            .map(|raw| {
                transaction_record(raw).map_err(|err| Error::MalformedTransaction {
                    item_id: item.plaid_item_id.clone(),
                    reason: err.to_string(),
                })
            })
            .collect()
    };

    let page = SyncPage {
        added: parse(response.added)?,
        modified: parse(response.modified)?,
        removed: response
            .removed
            .into_iter()
            .map(|removed| removed.transaction_id)
            .collect(),
        balances: response.accounts.iter().map(|a| a.balance()).collect(),
    };
    Ok((page, response.next_cursor, response.has_more))
}

impl PlaidService {
    pub async fn sync_item(&self, item_id: Uuid) -> Result<SyncSummary> {
        let item = self
            .store
            .get_item(item_id)
            .await?
            .ok_or_else(|| Error::ItemNotFound(item_id.to_string()))?;
        self.sync_transactions(&item).await
    }

    pub async fn sync_item_by_plaid_id(&self, plaid_item_id: &str) -> Result<SyncSummary> {
        let item = self
            .store
            .get_item_by_plaid_id(plaid_item_id)
            .await?
            .ok_or_else(|| Error::ItemNotFound(plaid_item_id.to_string()))?;
        self.sync_transactions(&item).await
    }

    /// Pulls every pending page for the item while holding its sync lease.
    pub async fn sync_transactions(&self, item: &Item) -> Result<SyncSummary> {
        if item.status == ItemStatus::Revoked {
            tracing::warn!(
                "Skipping transaction sync for revoked item_id={}",
                &item.plaid_item_id
            );
            return Ok(SyncSummary::default());
        }

        let holder = Uuid::new_v4();
        let ttl = chrono::Duration::from_std(self.sync.lock_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        self.acquire_sync_lock(item, holder, ttl).await?;

        let result = self.sync_pages(item, holder, ttl).await;

        if let Err(err) = self.store.release_sync_lock(item.id, holder).await {
            tracing::error!(
                "Failed to release sync lock for item_id={}: {}",
                &item.plaid_item_id,
                err
            );
        }

        match &result {
            Ok(summary) => tracing::info!(
                "Finished transaction sync for item_id={}: added={} modified={} removed={}",
                &item.plaid_item_id,
                summary.added,
                summary.modified,
                summary.removed
            ),
            Err(err) => tracing::error!(
                "Transaction sync failed for item_id={}: {}",
                &item.plaid_item_id,
                err
            ),
        }

        result
    }

    async fn acquire_sync_lock(
        &self,
        item: &Item,
        holder: Uuid,
        ttl: chrono::Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.sync.lock_wait;

        loop {
            if self
                .store
                .try_acquire_sync_lock(item.id, holder, ttl)
                .await?
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "Sync lock for item_id={} still held after {:?}",
                    &item.plaid_item_id,
                    self.sync.lock_wait
                );
                return Err(Error::SyncLocked(item.plaid_item_id.clone()));
            }
            tracing::debug!(
                "Sync lock for item_id={} is held, retrying...",
                &item.plaid_item_id
            );
            tokio::time::sleep(self.sync.lock_retry_interval).await;
        }
    }

    /// Every page is written under the lease held by `holder`, renewing it for
    /// `ttl`, so a worker that lost its lease cannot move the cursor.
    async fn sync_pages(
        &self,
        item: &Item,
        holder: Uuid,
        ttl: chrono::Duration,
    ) -> Result<SyncSummary> {
        let stored = self.store.get_cursor(item.id).await?;
        match &stored {
            Some(stored) => tracing::info!(
                "Starting transaction sync for item_id={} cursor={} last_synced_at={}",
                &item.plaid_item_id,
                &stored.cursor,
                stored.last_synced_at
            ),
            None => tracing::info!(
                "Starting initial transaction sync for item_id={}",
                &item.plaid_item_id
            ),
        }

        let mut cursor = stored.map(|c| c.cursor);
        let mut summary = SyncSummary::default();
        let mut pages = 0usize;

        loop {
            if pages >= self.sync.max_pages {
                return Err(Error::TooManyPages(self.sync.max_pages));
            }

            let response = match tokio::time::timeout(
                self.sync.page_timeout,
                self.plaid
                    .sync_transactions(&item.access_token, cursor.as_deref()),
            )
            .await
            {
                Ok(response) => response?,
                Err(_) => return Err(Error::PageTimeout(self.sync.page_timeout)),
            };
            pages += 1;

            let (page, next_cursor, has_more) = build_page(item, response)?;

            tracing::info!(
                "Retrieved page={} for item_id={}: added={} modified={} removed={} has_more={}",
                pages,
                &item.plaid_item_id,
                page.added.len(),
                page.modified.len(),
                page.removed.len(),
                has_more
            );

            let outcome = self
                .store
                .apply_sync_page(item, &page, &next_cursor, holder, ttl)
                .await?;

            for id in &outcome.duplicate_added {
                tracing::warn!(
                    "Added transaction plaid_transaction_id={} already existed, updated instead",
                    id
                );
            }
            for id in &outcome.missing_modified {
                tracing::warn!(
                    "Modified transaction plaid_transaction_id={} not found, skipped",
                    id
                );
            }

            summary.added += page.added.len();
            summary.modified += page.modified.len() - outcome.missing_modified.len();
            summary.removed += page.removed.len();
            cursor = Some(next_cursor);

            if !has_more {
                return Ok(summary);
            }
        }
    }
}

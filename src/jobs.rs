use std::sync::Arc;

use futures::stream::{self, StreamExt};

use crate::{AppState, db::Store, domain::ItemStatus, service::PlaidService};

/// Items whose credentials still work. `error` items wait for update mode and
/// `revoked` ones never sync again.
const SYNCABLE: [ItemStatus; 2] = [ItemStatus::Good, ItemStatus::PendingExpiration];

#[derive(Debug, Default, PartialEq)]
pub struct SweepReport {
    pub synced: usize,
    pub failed: usize,
}

/// Runs one sync for every syncable item. A failing item is logged and does not
/// stop the rest of the sweep.
pub async fn sync_sweep(service: &PlaidService, concurrency: usize) -> SweepReport {
    let items = match service.store().list_items_with_status(&SYNCABLE).await {
        Ok(items) => items,
        Err(err) => {
            tracing::error!("An error occurred while querying items to sync: {:#?}", err);
            return SweepReport::default();
        }
    };

    tracing::info!("Found {} items to sync", items.len());

    let results: Vec<_> = stream::iter(items)
        .map(|item| async move {
            let result = service.sync_transactions(&item).await;
            (item.plaid_item_id, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut report = SweepReport::default();
    for (plaid_item_id, result) in results {
        match result {
            Ok(_) => report.synced += 1,
            Err(err) => {
                tracing::error!(
                    "Scheduled sync failed for item_id={} (retryable={}): {}",
                    plaid_item_id,
                    err.is_retryable(),
                    err
                );
                report.failed += 1;
            }
        }
    }
    report
}

pub async fn sync_poll_task(state: Arc<AppState>) {
    if state.sync_poll_interval == 0 {
        tracing::info!("Scheduled transaction sync is disabled");
        return;
    }

    // The first tick fires immediately.
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(state.sync_poll_interval));

    loop {
        interval.tick().await;
        tracing::info!("Running sync_poll_task...");

        let report = sync_sweep(&state.service, state.sync_concurrency).await;

        tracing::info!(
            "Finished running sync_poll_task: synced={} failed={}",
            report.synced,
            report.failed
        );
    }
}

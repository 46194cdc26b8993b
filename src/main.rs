mod args;
mod db;
mod domain;
mod error;
mod handlers;
mod items;
mod jobs;
mod link;
mod logging;
#[cfg(test)]
mod memory;
mod plaid;
mod service;
mod sync;
mod webhook;

use std::{sync::Arc, time::Duration};

use args::parse_args;
use db::{PgStore, create_pool, run_migrations};
use handlers::router;
use jobs::sync_poll_task;
use logging::setup_logging;
use plaid::PlaidClient;
use service::{LinkSettings, PlaidService, SyncSettings};

pub struct AppState {
    service: PlaidService,
    sync_poll_interval: u64,
    sync_concurrency: usize,
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    setup_logging(&args.base_log_dir);

    let webhook_url = args
        .webhook_url()
        .expect("Base URL must be an absolute URL e.g. 'https://example.com'");

    let pool = create_pool(&args.database_url)
        .await
        .expect("Failed to create PostgreSQL pool");

    run_migrations(&pool)
        .await
        .expect("Failed to apply database migrations");

    tracing::info!(
        "Using Plaid {:?} environment, webhooks at {}",
        args.plaid_env,
        &webhook_url
    );

    let plaid = PlaidClient::new(
        args.plaid_env.base_url(),
        &args.plaid_client_id,
        &args.plaid_secret,
    );

    let service = PlaidService::new(
        Arc::new(PgStore::new(pool)),
        Arc::new(plaid),
        LinkSettings {
            client_name: args.client_name,
            language: args.language,
            country_codes: args.country_codes,
            webhook_url,
        },
        SyncSettings {
            page_timeout: Duration::from_secs(args.sync_page_timeout),
            lock_ttl: Duration::from_secs(args.sync_lock_ttl),
            lock_wait: Duration::from_secs(args.sync_lock_wait),
            max_pages: args.sync_max_pages,
            ..SyncSettings::default()
        },
    );

    let app_state = Arc::new(AppState {
        service,
        sync_poll_interval: args.sync_poll_interval,
        sync_concurrency: args.sync_concurrency,
    });

    tracing::info!("Spawning background tasks...");
    tokio::spawn(sync_poll_task(app_state.clone()));

    let app = router(app_state);

    let bind_address = format! {"0.0.0.0:{}", args.port};
    tracing::info!("Server listening on {}...", bind_address);

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app).await.expect("Server error");
}

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    AppState,
    db::Store,
    domain::{Account, Item, LinkToken, SyncSummary, Transaction},
    error::Error,
    link::ExchangeResult,
    plaid::PlaidError,
    webhook::WebhookAck,
};

#[derive(Debug, Deserialize, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

#[derive(Debug, Deserialize)]
pub struct LinkTokenRequest {
    pub user_id: Uuid,
    pub client_user_id: Option<String>,
    pub products: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    pub public_token: String,
    pub user_id: Uuid,
    /// Set when Link ran in update mode for an existing item.
    pub item_id: Option<String>,
}

#[derive(Debug)]
pub enum AppError {
    Service(Error),
    BadRequest(String),
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError::Service(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Service(Error::ItemNotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("Item not found: {}", id))
            }
            AppError::Service(
                err @ (Error::ItemOwnership(_) | Error::AccountConflict(_) | Error::ItemRevoked(_)),
            ) => (StatusCode::CONFLICT, err.to_string()),
            AppError::Service(err @ (Error::SyncLocked(_) | Error::PageTimeout(_))) => {
                (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            AppError::Service(Error::Plaid(err)) => (
                StatusCode::BAD_GATEWAY,
                match err {
                    PlaidError::Api { error, .. } => error
                        .display_message
                        .unwrap_or(format!("Plaid request failed with {}", error.error_code)),
                    PlaidError::Request(_) => String::from("Plaid request failed"),
                },
            ),
            AppError::Service(Error::Database(_) | Error::Migration(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
            ),
            AppError::Service(err @ Error::MalformedTransaction { .. }) => {
                (StatusCode::BAD_GATEWAY, err.to_string())
            }
            AppError::Service(err @ Error::TooManyPages(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            AppError::BadRequest(msg) => {
                tracing::info!("Bad request: {}", &msg);
                (StatusCode::BAD_REQUEST, msg)
            }
        };

        (
            status,
            Json(serde_json::json!({ "message": error_message })),
        )
            .into_response()
    }
}

fn parse_id(value: &str, name: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(value)
        .map_err(|_err| AppError::BadRequest(format!("Invalid {} '{}'", name, value)))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/link-token", post(create_link_token))
        .route("/api/exchange-public-token", post(exchange_public_token))
        .route("/api/plaid-webhook", post(plaid_webhook))
        .route("/api/items/{item_id}", delete(remove_item))
        .route("/api/items/{item_id}/sync", post(sync_item))
        .route("/api/items/{item_id}/relinked", post(item_relinked))
        .route("/api/accounts/{user_id}", get(get_accounts))
        .route("/api/transactions/{user_id}", get(get_transactions))
        .with_state(state)
}

#[axum::debug_handler]
pub async fn create_link_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LinkTokenRequest>,
) -> Result<Json<DataResponse<LinkToken>>, AppError> {
    let client_user_id = request
        .client_user_id
        .unwrap_or_else(|| request.user_id.to_string());

    let token = state
        .service
        .create_link_token(request.user_id, &client_user_id, request.products)
        .await
        .inspect_err(|err| tracing::error!("Error creating link token: {}", err))?;

    Ok(Json(DataResponse { data: token }))
}

#[axum::debug_handler]
pub async fn exchange_public_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExchangeRequest>,
) -> Result<(StatusCode, Json<DataResponse<ExchangeResult>>), AppError> {
    if request.public_token.is_empty() {
        return Err(AppError::BadRequest(String::from(
            "Empty public token received",
        )));
    }

    let result = state
        .service
        .exchange_public_token(
            &request.public_token,
            request.user_id,
            request.item_id.as_deref(),
        )
        .await
        .inspect_err(|err| tracing::error!("Error exchanging public token: {}", err))?;

    Ok((StatusCode::CREATED, Json(DataResponse { data: result })))
}

/// Non-2xx responses make the aggregator redeliver, so only retryable failures
/// should surface as 5xx here.
#[axum::debug_handler]
pub async fn plaid_webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> Result<Json<DataResponse<WebhookAck>>, AppError> {
    let ack = state
        .service
        .handle_webhook(payload)
        .await
        .inspect_err(|err| {
            tracing::error!(
                "Error handling webhook (retryable={}): {}",
                err.is_retryable(),
                err
            )
        })?;

    Ok(Json(DataResponse { data: ack }))
}

#[axum::debug_handler]
pub async fn sync_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
) -> Result<Json<DataResponse<SyncSummary>>, AppError> {
    let item_id = parse_id(&item_id, "item_id")?;
    let summary = state.service.sync_item(item_id).await?;
    Ok(Json(DataResponse { data: summary }))
}

#[axum::debug_handler]
pub async fn item_relinked(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
) -> Result<Json<DataResponse<Item>>, AppError> {
    let item_id = parse_id(&item_id, "item_id")?;
    let item = state.service.confirm_relinked(item_id).await?;
    Ok(Json(DataResponse { data: item }))
}

#[axum::debug_handler]
pub async fn remove_item(
    State(state): State<Arc<AppState>>,
    Path(item_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let item_id = parse_id(&item_id, "item_id")?;
    state
        .service
        .remove_item(item_id)
        .await
        .inspect_err(|err| tracing::error!("Error removing item_id={}: {}", item_id, err))?;
    Ok(StatusCode::NO_CONTENT)
}

#[axum::debug_handler]
pub async fn get_accounts(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<DataResponse<Vec<Account>>>, AppError> {
    let user_id = parse_id(&user_id, "user_id")?;
    let accounts = state
        .service
        .store()
        .list_accounts(user_id)
        .await
        .inspect_err(|err| tracing::error!("Error querying accounts in get_accounts: {:#?}", err))?;

    Ok(Json(DataResponse { data: accounts }))
}

#[axum::debug_handler]
pub async fn get_transactions(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<DataResponse<Vec<Transaction>>>, AppError> {
    let user_id = parse_id(&user_id, "user_id")?;
    let transactions = state
        .service
        .store()
        .list_transactions(user_id)
        .await
        .inspect_err(|err| {
            tracing::error!(
                "Error querying transactions in get_transactions: {:#?}",
                err
            )
        })?;

    Ok(Json(DataResponse { data: transactions }))
}

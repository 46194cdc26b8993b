use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::NewWebhookEvent,
    error::{Error, Result},
    items::ItemEvent,
    service::PlaidService,
};

/// Fields of an inbound notification the pipeline acts on. Everything else
/// stays in the raw payload kept by the audit log.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub webhook_type: String,
    #[serde(default)]
    pub webhook_code: String,
    pub item_id: Option<String>,
    pub error: Option<Value>,
    pub new_transactions: Option<i64>,
    pub removed_transactions: Option<Vec<String>>,
}

impl WebhookPayload {
    pub fn from_raw(raw: &Value) -> Self {
        serde_json::from_value(raw.clone())
            .inspect_err(|err| tracing::warn!("Webhook payload has unexpected shape: {}", err))
            .unwrap_or_default()
    }

    fn audit_event(&self, raw: &Value) -> NewWebhookEvent {
        NewWebhookEvent {
            plaid_item_id: self.item_id.clone(),
            webhook_type: self.webhook_type.clone(),
            webhook_code: self.webhook_code.clone(),
            error: self.error.clone(),
            new_transactions: self.new_transactions,
            removed_transactions: self
                .removed_transactions
                .as_ref()
                .map(|ids| ids.len() as i64),
            raw: raw.clone(),
        }
    }

    fn plaid_item_id(&self) -> Result<&str> {
        self.item_id
            .as_deref()
            .ok_or_else(|| Error::ItemNotFound(String::from("<missing item_id>")))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub event_id: i64,
    pub handled: bool,
}

impl PlaidService {
    /// Records the notification in the audit log, then routes it by type and code.
    /// Unknown types and codes are acknowledged without side effects.
    pub async fn handle_webhook(&self, raw: Value) -> Result<WebhookAck> {
        let payload = WebhookPayload::from_raw(&raw);

        tracing::info!(
            "Received webhook type={} code={} item_id={}",
            &payload.webhook_type,
            &payload.webhook_code,
            payload.item_id.as_deref().unwrap_or("<none>")
        );

        let event_id = self
            .store
            .insert_webhook_event(&payload.audit_event(&raw))
            .await
            .inspect_err(|err| tracing::error!("Failed to record webhook: {}", err))?;

        let handled = match payload.webhook_type.as_str() {
            "TRANSACTIONS" => self.handle_transactions_webhook(&payload).await?,
            "ITEM" => self.handle_item_webhook(&payload).await?,
            other => {
                tracing::warn!(
                    "Unhandled webhook type={} code={}",
                    other,
                    &payload.webhook_code
                );
                false
            }
        };

        Ok(WebhookAck { event_id, handled })
    }

    async fn handle_transactions_webhook(&self, payload: &WebhookPayload) -> Result<bool> {
        match payload.webhook_code.as_str() {
            "INITIAL_UPDATE" | "HISTORICAL_UPDATE" | "DEFAULT_UPDATE" | "SYNC_UPDATES_AVAILABLE" => {
                self.sync_item_by_plaid_id(payload.plaid_item_id()?).await?;
                Ok(true)
            }
            "TRANSACTIONS_REMOVED" => {
                let ids = payload.removed_transactions.clone().unwrap_or_default();
                let changed = self.store.soft_delete_transactions(&ids).await?;
                tracing::info!(
                    "Flagged {} of {} removed transactions for item_id={}",
                    changed,
                    ids.len(),
                    payload.item_id.as_deref().unwrap_or("<none>")
                );
                Ok(true)
            }
            other => {
                tracing::warn!("Unhandled TRANSACTIONS webhook code={}", other);
                Ok(false)
            }
        }
    }

    async fn handle_item_webhook(&self, payload: &WebhookPayload) -> Result<bool> {
        let event = match payload.webhook_code.as_str() {
            "ERROR" => ItemEvent::Error(payload.error.clone()),
            "PENDING_EXPIRATION" => ItemEvent::PendingExpiration,
            "USER_PERMISSION_REVOKED" => ItemEvent::PermissionRevoked,
            other => {
                tracing::warn!("Unhandled ITEM webhook code={}", other);
                return Ok(false);
            }
        };

        self.transition_item_by_plaid_id(payload.plaid_item_id()?, event)
            .await?;
        Ok(true)
    }
}

//! Item status transitions.
//!
//! ```text
//! good ──ERROR──────────────▶ error ──relinked──▶ good
//! good ──PENDING_EXPIRATION─▶ pending_expiration ──relinked──▶ good
//! pending_expiration ──ERROR──▶ error
//! *    ──USER_PERMISSION_REVOKED──▶ revoked (terminal)
//! ```

use serde_json::Value;

use crate::{
    domain::{Item, ItemStatus},
    error::{Error, Result},
    service::PlaidService,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ItemEvent {
    Error(Option<Value>),
    PendingExpiration,
    PermissionRevoked,
    /// Update mode finished on the client.
    Relinked,
}

impl ItemEvent {
    fn name(&self) -> &'static str {
        match self {
            ItemEvent::Error(_) => "error",
            ItemEvent::PendingExpiration => "pending_expiration",
            ItemEvent::PermissionRevoked => "permission_revoked",
            ItemEvent::Relinked => "relinked",
        }
    }
}

/// Status an item moves to on `event`, or `None` when the event is not valid
/// from `current`.
pub fn next_status(current: ItemStatus, event: &ItemEvent) -> Option<ItemStatus> {
    match (current, event) {
        (ItemStatus::Revoked, _) => None,
        (_, ItemEvent::PermissionRevoked) => Some(ItemStatus::Revoked),
        (_, ItemEvent::Error(_)) => Some(ItemStatus::Error),
        (ItemStatus::Good | ItemStatus::PendingExpiration, ItemEvent::PendingExpiration) => {
            Some(ItemStatus::PendingExpiration)
        }
        (ItemStatus::Error, ItemEvent::PendingExpiration) => None,
        (_, ItemEvent::Relinked) => Some(ItemStatus::Good),
    }
}

impl PlaidService {
    /// Applies `event` to the item and returns it as stored afterwards. Invalid
    /// transitions are logged and leave the item untouched.
    ///
    /// The write is conditional on the status `item` was read with. When another
    /// writer got there first the item is re-read and the event is evaluated
    /// against its current status.
    pub async fn transition_item(&self, mut item: Item, event: ItemEvent) -> Result<Item> {
        loop {
            let Some(status) = next_status(item.status, &event) else {
                tracing::warn!(
                    "Ignoring item event={} for item_id={} in status={}",
                    event.name(),
                    &item.plaid_item_id,
                    item.status
                );
                return Ok(item);
            };

            let error = match &event {
                ItemEvent::Error(payload) => payload.clone(),
                ItemEvent::Relinked => None,
                ItemEvent::PendingExpiration | ItemEvent::PermissionRevoked => item.error.clone(),
            };

            if self
                .store
                .update_item_status(item.id, item.status, status, error.as_ref())
                .await?
            {
                tracing::info!(
                    "Item item_id={} moved from status={} to status={}",
                    &item.plaid_item_id,
                    item.status,
                    status
                );
                return Ok(Item {
                    status,
                    error,
                    ..item
                });
            }

            tracing::debug!(
                "Status of item_id={} changed since it was read, reloading",
                &item.plaid_item_id
            );
            item = self
                .store
                .get_item(item.id)
                .await?
                .ok_or_else(|| Error::ItemNotFound(item.plaid_item_id.clone()))?;
        }
    }

    pub async fn transition_item_by_plaid_id(
        &self,
        plaid_item_id: &str,
        event: ItemEvent,
    ) -> Result<Item> {
        let item = self
            .store
            .get_item_by_plaid_id(plaid_item_id)
            .await?
            .ok_or_else(|| Error::ItemNotFound(plaid_item_id.to_string()))?;
        self.transition_item(item, event).await
    }

    /// Client-side confirmation that update mode re-authenticated the item.
    pub async fn confirm_relinked(&self, item_id: uuid::Uuid) -> Result<Item> {
        let item = self
            .store
            .get_item(item_id)
            .await?
            .ok_or_else(|| Error::ItemNotFound(item_id.to_string()))?;
        self.transition_item(item, ItemEvent::Relinked).await
    }
}

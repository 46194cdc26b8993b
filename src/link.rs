use serde::Serialize;
use uuid::Uuid;

use crate::{
    domain::{Account, Item, ItemStatus, LinkToken, NewItem},
    error::{Error, Result},
    items::ItemEvent,
    plaid::{LinkTokenCreateRequest, LinkUser},
    service::PlaidService,
};

pub const DEFAULT_PRODUCTS: [&str; 2] = ["auth", "transactions"];

#[derive(Debug, Clone, Serialize)]
pub struct ExchangeResult {
    pub item_id: Uuid,
    pub plaid_item_id: String,
    pub institution_name: Option<String>,
    pub accounts: Vec<Account>,
}

impl PlaidService {
    /// Requests a Link session for the user and records it. Aggregator errors are
    /// returned as-is; a new session is cheap to request again.
    pub async fn create_link_token(
        &self,
        user_id: Uuid,
        client_user_id: &str,
        products: Option<Vec<String>>,
    ) -> Result<LinkToken> {
        let products = products
            .filter(|products| !products.is_empty())
            .unwrap_or_else(|| DEFAULT_PRODUCTS.iter().map(|p| p.to_string()).collect());

        let response = self
            .plaid
            .create_link_token(&LinkTokenCreateRequest {
                user: LinkUser {
                    client_user_id: client_user_id.to_string(),
                },
                client_name: self.link.client_name.clone(),
                products,
                language: self.link.language.clone(),
                country_codes: self.link.country_codes.clone(),
                webhook: self.link.webhook_url.clone(),
            })
            .await?;

        let token = LinkToken {
            user_id,
            link_token: response.link_token,
            expiration: response.expiration,
        };
        self.store.insert_link_token(&token).await?;

        tracing::info!(
            "Created link token for user_id={} expiring at {} request_id={}",
            user_id,
            token.expiration,
            &response.request_id
        );

        Ok(token)
    }

    /// Revoked items stay revoked; re-linking one would replace its access token
    /// and bring it back into syncing.
    async fn ensure_not_revoked(&self, plaid_item_id: &str) -> Result<()> {
        match self.store.get_item_by_plaid_id(plaid_item_id).await? {
            Some(item) if item.status == ItemStatus::Revoked => {
                tracing::warn!(
                    "Rejecting re-link of revoked item_id={} for user_id={}",
                    plaid_item_id,
                    item.user_id
                );
                Err(Error::ItemRevoked(plaid_item_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Swaps a Link public token for a durable access token and stores the item
    /// and its accounts in one transaction. With `plaid_item_id` set this is the
    /// update-mode flow for an item the user already owns.
    pub async fn exchange_public_token(
        &self,
        public_token: &str,
        user_id: Uuid,
        plaid_item_id: Option<&str>,
    ) -> Result<ExchangeResult> {
        if let Some(plaid_item_id) = plaid_item_id {
            self.ensure_not_revoked(plaid_item_id).await?;
        }

        let exchange = self.plaid.exchange_public_token(public_token).await?;
        if plaid_item_id.is_none() {
            self.ensure_not_revoked(&exchange.item_id).await?;
        }
        let plaid_item = self.plaid.get_item(&exchange.access_token).await?;

        let institution = match &plaid_item.institution_id {
            Some(institution_id) => Some(
                self.plaid
                    .get_institution(institution_id, &self.link.country_codes)
                    .await?,
            ),
            None => None,
        };

        let plaid_accounts = self.plaid.get_accounts(&exchange.access_token).await?;
        tracing::info!(
            "Found {} accounts for item_id={}",
            plaid_accounts.len(),
            &exchange.item_id
        );

        let new_item = NewItem {
            user_id,
            plaid_item_id: plaid_item_id
                .map(str::to_string)
                .unwrap_or(exchange.item_id),
            access_token: exchange.access_token,
            institution_id: plaid_item.institution_id,
            institution_name: institution.map(|i| i.name),
        };
        let accounts: Vec<_> = plaid_accounts.iter().map(|a| a.to_new_account()).collect();

        let (item, accounts) = self
            .store
            .save_item_with_accounts(&new_item, &accounts)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    "Failed to save item_id={} with its accounts: {}",
                    &new_item.plaid_item_id,
                    err
                )
            })?;

        let item: Item = if plaid_item_id.is_some() {
            self.transition_item(item, ItemEvent::Relinked).await?
        } else {
            item
        };

        tracing::info!(
            "Linked item_id={} for user_id={} with {} accounts",
            &item.plaid_item_id,
            user_id,
            accounts.len()
        );

        Ok(ExchangeResult {
            item_id: item.id,
            plaid_item_id: item.plaid_item_id,
            institution_name: item.institution_name,
            accounts,
        })
    }

    /// Revokes the access token at the aggregator, then deletes the item and
    /// everything synced for it.
    pub async fn remove_item(&self, item_id: Uuid) -> Result<()> {
        let item = self
            .store
            .get_item(item_id)
            .await?
            .ok_or_else(|| Error::ItemNotFound(item_id.to_string()))?;

        self.plaid.remove_item(&item.access_token).await?;
        self.store.delete_item(item.id).await?;

        tracing::info!(
            "Removed item_id={} for user_id={}",
            &item.plaid_item_id,
            item.user_id
        );
        Ok(())
    }
}

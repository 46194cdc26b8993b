//! In-memory [`Store`] used by the pipeline tests.
//!
//! Mirrors the Postgres semantics: unique external ids, all-or-nothing item and
//! page writes, soft deletes, lease expiry.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::{
    db::Store,
    domain::{
        Account, Item, ItemStatus, LinkToken, NewAccount, NewItem, NewWebhookEvent, PageOutcome,
        SyncCursor, SyncPage, Transaction, TransactionRecord,
    },
    error::{Error, Result},
};

#[derive(Default, Clone)]
pub struct State {
    pub link_tokens: Vec<LinkToken>,
    pub items: HashMap<Uuid, Item>,
    pub accounts: HashMap<Uuid, Account>,
    pub transactions: HashMap<String, Transaction>,
    pub cursors: HashMap<Uuid, SyncCursor>,
    pub webhooks: Vec<NewWebhookEvent>,
    pub locks: HashMap<Uuid, (Uuid, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct MemoryStore {
    pub state: Mutex<State>,
    fail_page_writes: AtomicBool,
}

fn injected_failure() -> Error {
    Error::Database(sqlx::Error::Protocol(String::from("injected write failure")))
}

impl State {
    fn account_id(&self, plaid_account_id: &str) -> Option<Uuid> {
        self.accounts
            .values()
            .find(|account| account.plaid_account_id == plaid_account_id)
            .map(|account| account.id)
    }

    fn write_record(&mut self, item: &Item, record: &TransactionRecord, existing: Option<&Transaction>) {
        let transaction = Transaction {
            id: existing.map(|t| t.id).unwrap_or_else(Uuid::new_v4),
            account_id: self.account_id(&record.plaid_account_id),
            item_id: existing.map(|t| t.item_id).unwrap_or(item.id),
            user_id: existing.map(|t| t.user_id).unwrap_or(item.user_id),
            plaid_transaction_id: record.plaid_transaction_id.clone(),
            plaid_account_id: record.plaid_account_id.clone(),
            category: record.category.clone(),
            subcategory: record.subcategory.clone(),
            name: record.name.clone(),
            merchant_name: record.merchant_name.clone(),
            amount: record.amount,
            currency_code: record.currency_code.clone(),
            date: record.date,
            pending: record.pending,
            payment_channel: record.payment_channel.clone(),
            authorized_date: record.authorized_date,
            location: record.location.clone(),
            raw_data: record.raw_data.clone(),
            is_removed: existing.map(|t| t.is_removed).unwrap_or(false),
        };
        self.transactions
            .insert(record.plaid_transaction_id.clone(), transaction);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `apply_sync_page` fail before writing anything.
    pub fn fail_page_writes(&self, fail: bool) {
        self.fail_page_writes.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> State {
        self.state.lock().unwrap().clone()
    }

    pub fn insert_item(&self, user_id: Uuid, plaid_item_id: &str, status: ItemStatus) -> Item {
        let now = Utc::now();
        let item = Item {
            id: Uuid::new_v4(),
            user_id,
            plaid_item_id: plaid_item_id.to_string(),
            access_token: format!("access-{}", plaid_item_id),
            institution_id: Some(String::from("ins_1")),
            institution_name: Some(String::from("First Platypus Bank")),
            status,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .unwrap()
            .items
            .insert(item.id, item.clone());
        item
    }

    pub fn insert_account(&self, item: &Item, plaid_account_id: &str) -> Account {
        let account = Account {
            id: Uuid::new_v4(),
            item_id: item.id,
            user_id: item.user_id,
            plaid_account_id: plaid_account_id.to_string(),
            name: String::from("Checking"),
            mask: Some(String::from("0000")),
            account_type: String::from("depository"),
            subtype: Some(String::from("checking")),
            current_balance: None,
            available_balance: None,
            currency_code: Some(String::from("USD")),
        };
        self.state
            .lock()
            .unwrap()
            .accounts
            .insert(account.id, account.clone());
        account
    }

    pub fn item(&self, id: Uuid) -> Item {
        self.state.lock().unwrap().items[&id].clone()
    }

    pub fn cursor(&self, item_id: Uuid) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .cursors
            .get(&item_id)
            .map(|c| c.cursor.clone())
    }

    pub fn transaction(&self, plaid_transaction_id: &str) -> Option<Transaction> {
        self.state
            .lock()
            .unwrap()
            .transactions
            .get(plaid_transaction_id)
            .cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_link_token(&self, token: &LinkToken) -> Result<()> {
        self.state.lock().unwrap().link_tokens.push(token.clone());
        Ok(())
    }

    async fn save_item_with_accounts(
        &self,
        item: &NewItem,
        accounts: &[NewAccount],
    ) -> Result<(Item, Vec<Account>)> {
        let mut guard = self.state.lock().unwrap();
        // Work on a copy so a failure leaves nothing behind.
        let mut state = guard.clone();
        let now = Utc::now();

        let existing = state
            .items
            .values()
            .find(|i| i.plaid_item_id == item.plaid_item_id)
            .cloned();
        let saved = match existing {
            Some(existing) if existing.user_id != item.user_id => {
                return Err(Error::ItemOwnership(item.plaid_item_id.clone()));
            }
            Some(existing) => Item {
                access_token: item.access_token.clone(),
                institution_id: item.institution_id.clone().or(existing.institution_id),
                institution_name: item.institution_name.clone().or(existing.institution_name),
                updated_at: now,
                ..existing
            },
            None => Item {
                id: Uuid::new_v4(),
                user_id: item.user_id,
                plaid_item_id: item.plaid_item_id.clone(),
                access_token: item.access_token.clone(),
                institution_id: item.institution_id.clone(),
                institution_name: item.institution_name.clone(),
                status: ItemStatus::Good,
                error: None,
                created_at: now,
                updated_at: now,
            },
        };
        state.items.insert(saved.id, saved.clone());

        let mut saved_accounts = Vec::with_capacity(accounts.len());
        for account in accounts {
            let existing = state
                .accounts
                .values()
                .find(|a| a.plaid_account_id == account.plaid_account_id)
                .cloned();
            let id = match existing {
                Some(existing) if existing.item_id != saved.id => {
                    return Err(Error::AccountConflict(account.plaid_account_id.clone()));
                }
                Some(existing) => existing.id,
                None => Uuid::new_v4(),
            };
            let row = Account {
                id,
                item_id: saved.id,
                user_id: saved.user_id,
                plaid_account_id: account.plaid_account_id.clone(),
                name: account.name.clone(),
                mask: account.mask.clone(),
                account_type: account.account_type.clone(),
                subtype: account.subtype.clone(),
                current_balance: account.balance.current,
                available_balance: account.balance.available,
                currency_code: account.balance.currency_code.clone(),
            };
            state.accounts.insert(row.id, row.clone());
            saved_accounts.push(row);
        }

        *guard = state;
        Ok((saved, saved_accounts))
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<Item>> {
        Ok(self.state.lock().unwrap().items.get(&id).cloned())
    }

    async fn get_item_by_plaid_id(&self, plaid_item_id: &str) -> Result<Option<Item>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .items
            .values()
            .find(|item| item.plaid_item_id == plaid_item_id)
            .cloned())
    }

    async fn list_items_with_status(&self, statuses: &[ItemStatus]) -> Result<Vec<Item>> {
        let mut items: Vec<Item> = self
            .state
            .lock()
            .unwrap()
            .items
            .values()
            .filter(|item| statuses.contains(&item.status))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }

    async fn update_item_status(
        &self,
        id: Uuid,
        expected: ItemStatus,
        status: ItemStatus,
        error: Option<&Value>,
    ) -> Result<bool> {
        match self.state.lock().unwrap().items.get_mut(&id) {
            Some(item) if item.status == expected => {
                item.status = status;
                item.error = error.cloned();
                item.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_item(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.items.remove(&id);
        state.accounts.retain(|_, a| a.item_id != id);
        state.transactions.retain(|_, t| t.item_id != id);
        state.cursors.remove(&id);
        state.locks.remove(&id);
        Ok(())
    }

    async fn list_accounts(&self, user_id: Uuid) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .state
            .lock()
            .unwrap()
            .accounts
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(accounts)
    }

    async fn list_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        let mut transactions: Vec<Transaction> = self
            .state
            .lock()
            .unwrap()
            .transactions
            .values()
            .filter(|t| t.user_id == user_id && !t.is_removed)
            .cloned()
            .collect();
        transactions.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(transactions)
    }

    async fn get_cursor(&self, item_id: Uuid) -> Result<Option<SyncCursor>> {
        Ok(self.state.lock().unwrap().cursors.get(&item_id).cloned())
    }

    async fn apply_sync_page(
        &self,
        item: &Item,
        page: &SyncPage,
        next_cursor: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<PageOutcome> {
        if self.fail_page_writes.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }

        let mut state = self.state.lock().unwrap();
        match state.locks.get_mut(&item.id) {
            Some((owner, expires_at)) if *owner == holder => *expires_at = Utc::now() + ttl,
            _ => return Err(Error::SyncLocked(item.plaid_item_id.clone())),
        }
        let mut outcome = PageOutcome::default();

        for id in &page.removed {
            if let Some(transaction) = state.transactions.get_mut(id) {
                transaction.is_removed = true;
            }
        }

        for record in &page.added {
            match state.transactions.get(&record.plaid_transaction_id).cloned() {
                Some(mut existing) => {
                    outcome
                        .duplicate_added
                        .push(record.plaid_transaction_id.clone());
                    existing.is_removed = false;
                    state.write_record(item, record, Some(&existing));
                }
                None => state.write_record(item, record, None),
            }
        }

        for record in &page.modified {
            match state.transactions.get(&record.plaid_transaction_id).cloned() {
                Some(existing) => state.write_record(item, record, Some(&existing)),
                None => outcome
                    .missing_modified
                    .push(record.plaid_transaction_id.clone()),
            }
        }

        for balance in &page.balances {
            if let Some(account) = state.accounts.values_mut().find(|a| {
                a.item_id == item.id && a.plaid_account_id == balance.plaid_account_id
            }) {
                account.current_balance = balance.current;
                account.available_balance = balance.available;
                if balance.currency_code.is_some() {
                    account.currency_code = balance.currency_code.clone();
                }
            }
        }

        state.cursors.insert(
            item.id,
            SyncCursor {
                cursor: next_cursor.to_string(),
                last_synced_at: Utc::now(),
            },
        );
        Ok(outcome)
    }

    async fn soft_delete_transactions(&self, plaid_transaction_ids: &[String]) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut changed = 0;
        for id in plaid_transaction_ids {
            if let Some(transaction) = state.transactions.get_mut(id) {
                if !transaction.is_removed {
                    transaction.is_removed = true;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    async fn insert_webhook_event(&self, event: &NewWebhookEvent) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        state.webhooks.push(event.clone());
        Ok(state.webhooks.len() as i64)
    }

    async fn try_acquire_sync_lock(
        &self,
        item_id: Uuid,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        match state.locks.get(&item_id) {
            Some((_, expires_at)) if *expires_at >= now => Ok(false),
            _ => {
                state.locks.insert(item_id, (holder, now + ttl));
                Ok(true)
            }
        }
    }

    async fn release_sync_lock(&self, item_id: Uuid, holder: Uuid) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.locks.get(&item_id).map(|(h, _)| *h) == Some(holder) {
            state.locks.remove(&item_id);
        }
        Ok(())
    }
}

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{
    domain::{
        Account, AccountBalance, Item, ItemStatus, LinkToken, NewAccount, NewItem,
        NewWebhookEvent, PageOutcome, SyncCursor, SyncPage, Transaction, TransactionRecord,
    },
    error::{Error, Result},
};

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPool::connect(database_url).await
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Migrations completed");
    Ok(())
}

/// Persistence used by the link, webhook and sync stages.
///
/// `save_item_with_accounts` and `apply_sync_page` are atomic: either every
/// write they describe lands or none does.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_link_token(&self, token: &LinkToken) -> Result<()>;

    /// Inserts the item, or re-links an existing one with the same external id
    /// when it belongs to the same user, together with all of its accounts.
    async fn save_item_with_accounts(
        &self,
        item: &NewItem,
        accounts: &[NewAccount],
    ) -> Result<(Item, Vec<Account>)>;

    async fn get_item(&self, id: Uuid) -> Result<Option<Item>>;

    async fn get_item_by_plaid_id(&self, plaid_item_id: &str) -> Result<Option<Item>>;

    async fn list_items_with_status(&self, statuses: &[ItemStatus]) -> Result<Vec<Item>>;

    /// Moves the item to `status` only while it is still in `expected`. Returns
    /// false when a concurrent writer changed the status first.
    async fn update_item_status(
        &self,
        id: Uuid,
        expected: ItemStatus,
        status: ItemStatus,
        error: Option<&Value>,
    ) -> Result<bool>;

    /// Removes the item with its accounts, transactions, cursor and lease.
    async fn delete_item(&self, id: Uuid) -> Result<()>;

    async fn list_accounts(&self, user_id: Uuid) -> Result<Vec<Account>>;

    /// Transactions of a user, excluding soft-deleted ones, newest first.
    async fn list_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>>;

    async fn get_cursor(&self, item_id: Uuid) -> Result<Option<SyncCursor>>;

    /// Applies removed, then added, then modified entries and the balances of one
    /// page, and moves the item's cursor to `next_cursor`.
    ///
    /// The write only commits while `holder` still owns the item's sync lease,
    /// which is extended by `ttl`. A lost lease fails with `Error::SyncLocked`
    /// and leaves nothing behind.
    async fn apply_sync_page(
        &self,
        item: &Item,
        page: &SyncPage,
        next_cursor: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<PageOutcome>;

    /// Flags the given transactions as removed. Returns how many rows changed.
    async fn soft_delete_transactions(&self, plaid_transaction_ids: &[String]) -> Result<u64>;

    async fn insert_webhook_event(&self, event: &NewWebhookEvent) -> Result<i64>;

    /// Takes the per-item sync lease unless another holder has an unexpired one.
    async fn try_acquire_sync_lock(&self, item_id: Uuid, holder: Uuid, ttl: Duration)
    -> Result<bool>;

    async fn release_sync_lock(&self, item_id: Uuid, holder: Uuid) -> Result<()>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ACCOUNT_COLUMNS: &str = "id, item_id, user_id, plaid_account_id, name, mask, type, subtype, \
     current_balance, available_balance, currency_code";

async fn insert_transaction(
    conn: &mut PgConnection,
    item: &Item,
    record: &TransactionRecord,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "
            INSERT INTO transactions (
                id,
                account_id,
                item_id,
                user_id,
                plaid_transaction_id,
                plaid_account_id,
                category,
                subcategory,
                name,
                merchant_name,
                amount,
                currency_code,
                date,
                pending,
                payment_channel,
                authorized_date,
                location,
                raw_data
            ) VALUES (
                $1, (SELECT id FROM accounts WHERE plaid_account_id = $5), $2, $3, $4, $5,
                $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17
            )
            ON CONFLICT (plaid_transaction_id) DO NOTHING
        ",
    )
    .bind(Uuid::new_v4())
    .bind(item.id)
    .bind(item.user_id)
    .bind(&record.plaid_transaction_id)
    .bind(&record.plaid_account_id)
    .bind(&record.category)
    .bind(&record.subcategory)
    .bind(&record.name)
    .bind(&record.merchant_name)
    .bind(record.amount)
    .bind(&record.currency_code)
    .bind(record.date)
    .bind(record.pending)
    .bind(&record.payment_channel)
    .bind(record.authorized_date)
    .bind(&record.location)
    .bind(&record.raw_data)
    .execute(&mut *conn)
    .await
    .inspect_err(|err| {
        tracing::error!(
            "Failed to insert transaction plaid_transaction_id={}: {}",
            &record.plaid_transaction_id,
            err
        )
    })?;

    Ok(result.rows_affected() == 1)
}

/// Overwrites the typed columns and payload. `revive` clears the removed flag.
async fn update_transaction(
    conn: &mut PgConnection,
    record: &TransactionRecord,
    revive: bool,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "
            UPDATE transactions SET
                account_id = (SELECT id FROM accounts WHERE plaid_account_id = $2),
                plaid_account_id = $2,
                category = $3,
                subcategory = $4,
                name = $5,
                merchant_name = $6,
                amount = $7,
                currency_code = $8,
                date = $9,
                pending = $10,
                payment_channel = $11,
                authorized_date = $12,
                location = $13,
                raw_data = $14,
                is_removed = CASE WHEN $15 THEN FALSE ELSE is_removed END,
                updated_at = NOW()
            WHERE plaid_transaction_id = $1
        ",
    )
    .bind(&record.plaid_transaction_id)
    .bind(&record.plaid_account_id)
    .bind(&record.category)
    .bind(&record.subcategory)
    .bind(&record.name)
    .bind(&record.merchant_name)
    .bind(record.amount)
    .bind(&record.currency_code)
    .bind(record.date)
    .bind(record.pending)
    .bind(&record.payment_channel)
    .bind(record.authorized_date)
    .bind(&record.location)
    .bind(&record.raw_data)
    .bind(revive)
    .execute(&mut *conn)
    .await
    .inspect_err(|err| {
        tracing::error!(
            "Failed to update transaction plaid_transaction_id={}: {}",
            &record.plaid_transaction_id,
            err
        )
    })?;

    Ok(result.rows_affected() > 0)
}

async fn update_balance(
    conn: &mut PgConnection,
    item_id: Uuid,
    balance: &AccountBalance,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "
            UPDATE accounts SET
                current_balance = $3,
                available_balance = $4,
                currency_code = COALESCE($5, currency_code),
                updated_at = NOW()
            WHERE plaid_account_id = $1 AND item_id = $2
        ",
    )
    .bind(&balance.plaid_account_id)
    .bind(item_id)
    .bind(balance.current)
    .bind(balance.available)
    .bind(&balance.currency_code)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn insert_link_token(&self, token: &LinkToken) -> Result<()> {
        sqlx::query(
            "
                INSERT INTO plaid_link_tokens (user_id, link_token, expiration)
                VALUES ($1, $2, $3)
            ",
        )
        .bind(token.user_id)
        .bind(&token.link_token)
        .bind(token.expiration)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_item_with_accounts(
        &self,
        item: &NewItem,
        accounts: &[NewAccount],
    ) -> Result<(Item, Vec<Account>)> {
        let mut tx = self.pool.begin().await?;

        let saved = sqlx::query_as::<_, Item>(
            "
                INSERT INTO items (
                    id,
                    user_id,
                    plaid_item_id,
                    access_token,
                    institution_id,
                    institution_name
                ) VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (plaid_item_id)
                DO UPDATE SET
                    access_token = EXCLUDED.access_token,
                    institution_id = COALESCE(EXCLUDED.institution_id, items.institution_id),
                    institution_name = COALESCE(EXCLUDED.institution_name, items.institution_name),
                    updated_at = NOW()
                WHERE items.user_id = EXCLUDED.user_id
                RETURNING *
            ",
        )
        .bind(Uuid::new_v4())
        .bind(item.user_id)
        .bind(&item.plaid_item_id)
        .bind(&item.access_token)
        .bind(&item.institution_id)
        .bind(&item.institution_name)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::ItemOwnership(item.plaid_item_id.clone()))?;

        let mut saved_accounts = Vec::with_capacity(accounts.len());
        for account in accounts {
            let row = sqlx::query_as::<_, Account>(&format!(
                "
                    INSERT INTO accounts (
                        id,
                        item_id,
                        user_id,
                        plaid_account_id,
                        name,
                        mask,
                        type,
                        subtype,
                        current_balance,
                        available_balance,
                        currency_code
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    ON CONFLICT (plaid_account_id)
                    DO UPDATE SET
                        name = EXCLUDED.name,
                        mask = EXCLUDED.mask,
                        type = EXCLUDED.type,
                        subtype = EXCLUDED.subtype,
                        current_balance = EXCLUDED.current_balance,
                        available_balance = EXCLUDED.available_balance,
                        currency_code = EXCLUDED.currency_code,
                        updated_at = NOW()
                    WHERE accounts.item_id = EXCLUDED.item_id
                    RETURNING {}
                ",
                ACCOUNT_COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(saved.id)
            .bind(saved.user_id)
            .bind(&account.plaid_account_id)
            .bind(&account.name)
            .bind(&account.mask)
            .bind(&account.account_type)
            .bind(&account.subtype)
            .bind(account.balance.current)
            .bind(account.balance.available)
            .bind(&account.balance.currency_code)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::AccountConflict(account.plaid_account_id.clone()))?;
            saved_accounts.push(row);
        }

        tx.commit().await?;
        Ok((saved, saved_accounts))
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<Item>> {
        Ok(
            sqlx::query_as::<_, Item>("SELECT * FROM items WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn get_item_by_plaid_id(&self, plaid_item_id: &str) -> Result<Option<Item>> {
        Ok(
            sqlx::query_as::<_, Item>("SELECT * FROM items WHERE plaid_item_id = $1")
                .bind(plaid_item_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn list_items_with_status(&self, statuses: &[ItemStatus]) -> Result<Vec<Item>> {
        let statuses: Vec<&str> = statuses.iter().map(ItemStatus::as_str).collect();
        Ok(sqlx::query_as::<_, Item>(
            "
                SELECT * FROM items
                WHERE status = ANY($1)
                ORDER BY created_at
            ",
        )
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn update_item_status(
        &self,
        id: Uuid,
        expected: ItemStatus,
        status: ItemStatus,
        error: Option<&Value>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "
                UPDATE items SET
                    status = $2,
                    error = $3,
                    updated_at = NOW()
                WHERE id = $1 AND status = $4
            ",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_item(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM items WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_accounts(&self, user_id: Uuid) -> Result<Vec<Account>> {
        Ok(sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE user_id = $1 ORDER BY name",
            ACCOUNT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn list_transactions(&self, user_id: Uuid) -> Result<Vec<Transaction>> {
        Ok(sqlx::query_as::<_, Transaction>(
            "
                SELECT * FROM transactions
                WHERE user_id = $1 AND NOT is_removed
                ORDER BY date DESC
            ",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?)
    }

    async fn get_cursor(&self, item_id: Uuid) -> Result<Option<SyncCursor>> {
        Ok(sqlx::query_as::<_, SyncCursor>(
            "SELECT cursor, last_synced_at FROM plaid_transaction_cursors WHERE item_id = $1",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn apply_sync_page(
        &self,
        item: &Item,
        page: &SyncPage,
        next_cursor: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<PageOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = PageOutcome::default();

        // Row lock on the lease keeps a takeover from interleaving with this page.
        let renewed = sqlx::query(
            "
                UPDATE plaid_sync_locks SET expires_at = $3
                WHERE item_id = $1 AND holder = $2
            ",
        )
        .bind(item.id)
        .bind(holder)
        .bind(Utc::now() + ttl)
        .execute(&mut *tx)
        .await?;
        if renewed.rows_affected() == 0 {
            tracing::warn!(
                "Sync lease for item_id={} was taken over, discarding page",
                &item.plaid_item_id
            );
            return Err(Error::SyncLocked(item.plaid_item_id.clone()));
        }

        if !page.removed.is_empty() {
            sqlx::query(
                "
                    UPDATE transactions SET is_removed = TRUE, updated_at = NOW()
                    WHERE plaid_transaction_id = ANY($1) AND NOT is_removed
                ",
            )
            .bind(&page.removed)
            .execute(&mut *tx)
            .await?;
        }

        for record in &page.added {
            if !insert_transaction(&mut tx, item, record).await? {
                outcome
                    .duplicate_added
                    .push(record.plaid_transaction_id.clone());
                update_transaction(&mut tx, record, true).await?;
            }
        }

        for record in &page.modified {
            if !update_transaction(&mut tx, record, false).await? {
                outcome
                    .missing_modified
                    .push(record.plaid_transaction_id.clone());
            }
        }

        for balance in &page.balances {
            update_balance(&mut tx, item.id, balance).await?;
        }

        sqlx::query(
            "
                INSERT INTO plaid_transaction_cursors (item_id, cursor, last_synced_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (item_id)
                DO UPDATE SET
                    cursor = EXCLUDED.cursor,
                    last_synced_at = EXCLUDED.last_synced_at
            ",
        )
        .bind(item.id)
        .bind(next_cursor)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn soft_delete_transactions(&self, plaid_transaction_ids: &[String]) -> Result<u64> {
        let result = sqlx::query(
            "
                UPDATE transactions SET is_removed = TRUE, updated_at = NOW()
                WHERE plaid_transaction_id = ANY($1) AND NOT is_removed
            ",
        )
        .bind(plaid_transaction_ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_webhook_event(&self, event: &NewWebhookEvent) -> Result<i64> {
        Ok(sqlx::query_scalar::<_, i64>(
            "
                INSERT INTO plaid_webhooks (
                    plaid_item_id,
                    webhook_type,
                    webhook_code,
                    error,
                    new_transactions,
                    removed_transactions,
                    raw
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING id
            ",
        )
        .bind(&event.plaid_item_id)
        .bind(&event.webhook_type)
        .bind(&event.webhook_code)
        .bind(&event.error)
        .bind(event.new_transactions)
        .bind(event.removed_transactions)
        .bind(&event.raw)
        .fetch_one(&self.pool)
        .await?)
    }

    async fn try_acquire_sync_lock(
        &self,
        item_id: Uuid,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let acquired = sqlx::query_scalar::<_, Uuid>(
            "
                INSERT INTO plaid_sync_locks (item_id, holder, expires_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (item_id)
                DO UPDATE SET
                    holder = EXCLUDED.holder,
                    expires_at = EXCLUDED.expires_at
                WHERE plaid_sync_locks.expires_at < $4
                RETURNING holder
            ",
        )
        .bind(item_id)
        .bind(holder)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(acquired.is_some())
    }

    async fn release_sync_lock(&self, item_id: Uuid, holder: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM plaid_sync_locks WHERE item_id = $1 AND holder = $2")
            .bind(item_id)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use clap::ValueEnum;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::domain::{AccountBalance, NewAccount, TransactionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlaidEnvironment {
    Sandbox,
    Development,
    Production,
}

impl PlaidEnvironment {
    pub fn base_url(&self) -> &'static str {
        match self {
            PlaidEnvironment::Sandbox => "https://sandbox.plaid.com",
            PlaidEnvironment::Development => "https://development.plaid.com",
            PlaidEnvironment::Production => "https://production.plaid.com",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PlaidApiError {
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_message: String,
    pub display_message: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PlaidError {
    #[error("request to Plaid failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Plaid returned status={status} error_code={} message={}", .error.error_code, .error.error_message)]
    Api { status: u16, error: PlaidApiError },
}

#[derive(Debug, Serialize)]
pub struct LinkUser {
    pub client_user_id: String,
}

#[derive(Debug, Serialize)]
pub struct LinkTokenCreateRequest {
    pub user: LinkUser,
    pub client_name: String,
    pub products: Vec<String>,
    pub language: String,
    pub country_codes: Vec<String>,
    pub webhook: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkTokenCreateResponse {
    pub link_token: String,
    pub expiration: DateTime<Utc>,
    pub request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicTokenExchangeResponse {
    pub access_token: String,
    pub item_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaidItem {
    pub institution_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemGetResponse {
    item: PlaidItem,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaidInstitution {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct InstitutionGetResponse {
    institution: PlaidInstitution,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaidBalances {
    pub current: Option<Decimal>,
    pub available: Option<Decimal>,
    pub iso_currency_code: Option<String>,
    pub unofficial_currency_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaidAccount {
    pub account_id: String,
    pub name: String,
    pub mask: Option<String>,
    #[serde(rename = "type")]
    pub account_type: String,
    pub subtype: Option<String>,
    #[serde(default)]
    pub balances: PlaidBalances,
}

impl PlaidAccount {
    pub fn balance(&self) -> AccountBalance {
        AccountBalance {
            plaid_account_id: self.account_id.clone(),
            current: self.balances.current,
            available: self.balances.available,
            currency_code: self
                .balances
                .iso_currency_code
                .clone()
                .or_else(|| self.balances.unofficial_currency_code.clone()),
        }
    }

    pub fn to_new_account(&self) -> NewAccount {
        NewAccount {
            plaid_account_id: self.account_id.clone(),
            name: self.name.clone(),
            mask: self.mask.clone(),
            account_type: self.account_type.clone(),
            subtype: self.subtype.clone(),
            balance: self.balance(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AccountsGetResponse {
    accounts: Vec<PlaidAccount>,
}

#[derive(Debug, Serialize)]
struct TransactionsSyncOptions {
    include_personal_finance_category: bool,
}

#[derive(Debug, Serialize)]
struct TransactionsSyncRequest<'a> {
    access_token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
    options: TransactionsSyncOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemovedTransaction {
    pub transaction_id: String,
}

/// One page of `/transactions/sync`. Added and modified entries stay untyped
/// until they are read through [`transaction_record`].
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionsSyncResponse {
    #[serde(default)]
    pub added: Vec<Value>,
    #[serde(default)]
    pub modified: Vec<Value>,
    #[serde(default)]
    pub removed: Vec<RemovedTransaction>,
    #[serde(default)]
    pub accounts: Vec<PlaidAccount>,
    pub next_cursor: String,
    pub has_more: bool,
}

#[derive(Debug, Deserialize)]
struct PersonalFinanceCategory {
    primary: Option<String>,
    detailed: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaidTransaction {
    transaction_id: String,
    account_id: String,
    amount: Decimal,
    date: NaiveDate,
    name: Option<String>,
    merchant_name: Option<String>,
    iso_currency_code: Option<String>,
    unofficial_currency_code: Option<String>,
    #[serde(default)]
    pending: bool,
    payment_channel: Option<String>,
    authorized_date: Option<NaiveDate>,
    location: Option<Value>,
    personal_finance_category: Option<PersonalFinanceCategory>,
    category: Option<Vec<String>>,
}

/// Reads the typed columns out of a transaction payload, falling back to defaults
/// for anything optional. Only the id, account, amount and date are required.
pub fn transaction_record(raw: Value) -> Result<TransactionRecord, serde_json::Error> {
    let parsed: PlaidTransaction = serde_json::from_value(raw.clone())?;

    let legacy = parsed.category.unwrap_or_default();
    let (category, subcategory) = match parsed.personal_finance_category {
        Some(PersonalFinanceCategory { primary, detailed }) if primary.is_some() => {
            (primary, detailed)
        }
        _ => (legacy.first().cloned(), legacy.get(1).cloned()),
    };

    Ok(TransactionRecord {
        plaid_transaction_id: parsed.transaction_id,
        plaid_account_id: parsed.account_id,
        category,
        subcategory,
        name: parsed
            .name
            .or_else(|| parsed.merchant_name.clone())
            .unwrap_or_default(),
        merchant_name: parsed.merchant_name,
        amount: parsed.amount,
        currency_code: parsed.iso_currency_code.or(parsed.unofficial_currency_code),
        date: parsed.date,
        pending: parsed.pending,
        payment_channel: parsed.payment_channel,
        authorized_date: parsed.authorized_date,
        location: parsed.location,
        raw_data: raw,
    })
}

#[async_trait]
pub trait PlaidApi: Send + Sync {
    async fn create_link_token(
        &self,
        request: &LinkTokenCreateRequest,
    ) -> Result<LinkTokenCreateResponse, PlaidError>;

    async fn exchange_public_token(
        &self,
        public_token: &str,
    ) -> Result<PublicTokenExchangeResponse, PlaidError>;

    async fn get_item(&self, access_token: &str) -> Result<PlaidItem, PlaidError>;

    async fn get_institution(
        &self,
        institution_id: &str,
        country_codes: &[String],
    ) -> Result<PlaidInstitution, PlaidError>;

    async fn get_accounts(&self, access_token: &str) -> Result<Vec<PlaidAccount>, PlaidError>;

    async fn sync_transactions(
        &self,
        access_token: &str,
        cursor: Option<&str>,
    ) -> Result<TransactionsSyncResponse, PlaidError>;

    async fn remove_item(&self, access_token: &str) -> Result<(), PlaidError>;
}

#[derive(Serialize)]
struct Authenticated<'a, B: Serialize> {
    client_id: &'a str,
    secret: &'a str,
    #[serde(flatten)]
    body: &'a B,
}

pub struct PlaidClient {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    secret: String,
}

impl PlaidClient {
    pub fn new(base_url: &str, client_id: &str, secret: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            secret: secret.to_string(),
        }
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, PlaidError> {
        let res = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&Authenticated {
                client_id: &self.client_id,
                secret: &self.secret,
                body,
            })
            .send()
            .await
            .inspect_err(|err| {
                tracing::error!("Error occurred in request to Plaid {}: {:#?}", path, err)
            })?;

        let status = res.status();
        if !status.is_success() {
            let error = res.json::<PlaidApiError>().await.unwrap_or_default();
            tracing::error!(
                "Plaid {} returned status={} error_type={} error_code={} request_id={:?}",
                path,
                status,
                &error.error_type,
                &error.error_code,
                &error.request_id
            );
            return Err(PlaidError::Api {
                status: status.as_u16(),
                error,
            });
        }

        res.json::<T>()
            .await
            .inspect_err(|err| {
                tracing::error!(
                    "Error occurred while deserialising Plaid {} response: {:#?}",
                    path,
                    err
                )
            })
            .map_err(PlaidError::from)
    }
}

#[derive(Serialize)]
struct AccessTokenRequest<'a> {
    access_token: &'a str,
}

#[async_trait]
impl PlaidApi for PlaidClient {
    async fn create_link_token(
        &self,
        request: &LinkTokenCreateRequest,
    ) -> Result<LinkTokenCreateResponse, PlaidError> {
        tracing::info!(
            "Creating link token for client_user_id={}",
            &request.user.client_user_id
        );
        self.post("/link/token/create", request).await
    }

    async fn exchange_public_token(
        &self,
        public_token: &str,
    ) -> Result<PublicTokenExchangeResponse, PlaidError> {
        #[derive(Serialize)]
        struct Request<'a> {
            public_token: &'a str,
        }

        tracing::info!("Exchanging public token...");
        self.post("/item/public_token/exchange", &Request { public_token })
            .await
    }

    async fn get_item(&self, access_token: &str) -> Result<PlaidItem, PlaidError> {
        self.post::<_, ItemGetResponse>("/item/get", &AccessTokenRequest { access_token })
            .await
            .map(|res| res.item)
    }

    async fn get_institution(
        &self,
        institution_id: &str,
        country_codes: &[String],
    ) -> Result<PlaidInstitution, PlaidError> {
        #[derive(Serialize)]
        struct Request<'a> {
            institution_id: &'a str,
            country_codes: &'a [String],
        }

        self.post::<_, InstitutionGetResponse>(
            "/institutions/get_by_id",
            &Request {
                institution_id,
                country_codes,
            },
        )
        .await
        .map(|res| res.institution)
    }

    async fn get_accounts(&self, access_token: &str) -> Result<Vec<PlaidAccount>, PlaidError> {
        tracing::info!("Listing accounts...");
        self.post::<_, AccountsGetResponse>("/accounts/get", &AccessTokenRequest { access_token })
            .await
            .map(|res| res.accounts)
    }

    async fn sync_transactions(
        &self,
        access_token: &str,
        cursor: Option<&str>,
    ) -> Result<TransactionsSyncResponse, PlaidError> {
        self.post(
            "/transactions/sync",
            &TransactionsSyncRequest {
                access_token,
                cursor,
                options: TransactionsSyncOptions {
                    include_personal_finance_category: true,
                },
            },
        )
        .await
    }

    async fn remove_item(&self, access_token: &str) -> Result<(), PlaidError> {
        self.post::<_, Value>("/item/remove", &AccessTokenRequest { access_token })
            .await
            .map(|_| ())
    }
}

/// Scripted aggregator for pipeline tests. Sync pages are keyed by the cursor
/// they are requested with.
#[cfg(test)]
pub mod mock {
    use std::{
        collections::{HashMap, HashSet},
        sync::Mutex,
        time::Duration,
    };

    use super::*;

    pub fn api_error(status: u16, error_code: &str) -> PlaidError {
        PlaidError::Api {
            status,
            error: PlaidApiError {
                error_type: String::from("API_ERROR"),
                error_code: error_code.to_string(),
                error_message: String::from("scripted failure"),
                display_message: None,
                request_id: None,
            },
        }
    }

    pub fn page(
        added: Vec<Value>,
        modified: Vec<Value>,
        removed: &[&str],
        next_cursor: &str,
        has_more: bool,
    ) -> TransactionsSyncResponse {
        TransactionsSyncResponse {
            added,
            modified,
            removed: removed
                .iter()
                .map(|id| RemovedTransaction {
                    transaction_id: id.to_string(),
                })
                .collect(),
            accounts: vec![],
            next_cursor: next_cursor.to_string(),
            has_more,
        }
    }

    pub fn account(account_id: &str, current: Decimal) -> PlaidAccount {
        PlaidAccount {
            account_id: account_id.to_string(),
            name: format!("Account {}", account_id),
            mask: Some(String::from("0000")),
            account_type: String::from("depository"),
            subtype: Some(String::from("checking")),
            balances: PlaidBalances {
                current: Some(current),
                available: Some(current),
                iso_currency_code: Some(String::from("USD")),
                unofficial_currency_code: None,
            },
        }
    }

    #[derive(Default)]
    pub struct MockPlaid {
        pub pages: Mutex<HashMap<Option<String>, TransactionsSyncResponse>>,
        pub failing_cursors: Mutex<HashSet<Option<String>>>,
        pub sync_delay: Mutex<Option<Duration>>,
        pub sync_calls: Mutex<Vec<Option<String>>>,
        pub accounts: Mutex<Vec<PlaidAccount>>,
        pub exchange: Mutex<Option<PublicTokenExchangeResponse>>,
        pub institution_id: Mutex<Option<String>>,
        pub link_requests: Mutex<Vec<Value>>,
        pub removed_items: Mutex<Vec<String>>,
    }

    impl MockPlaid {
        pub fn with_page(self, cursor: Option<&str>, page: TransactionsSyncResponse) -> Self {
            self.pages
                .lock()
                .unwrap()
                .insert(cursor.map(str::to_string), page);
            self
        }

        pub fn fail_on(&self, cursor: Option<&str>) {
            self.failing_cursors
                .lock()
                .unwrap()
                .insert(cursor.map(str::to_string));
        }

        pub fn recover(&self) {
            self.failing_cursors.lock().unwrap().clear();
        }

        pub fn sync_calls(&self) -> Vec<Option<String>> {
            self.sync_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PlaidApi for MockPlaid {
        async fn create_link_token(
            &self,
            request: &LinkTokenCreateRequest,
        ) -> Result<LinkTokenCreateResponse, PlaidError> {
            self.link_requests.lock().unwrap().push(serde_json::json!({
                "client_user_id": request.user.client_user_id,
                "products": request.products,
                "webhook": request.webhook,
            }));
            Ok(LinkTokenCreateResponse {
                link_token: format!("link-sandbox-{}", request.user.client_user_id),
                expiration: DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
                    .unwrap()
                    .to_utc(),
                request_id: String::from("req-1"),
            })
        }

        async fn exchange_public_token(
            &self,
            _public_token: &str,
        ) -> Result<PublicTokenExchangeResponse, PlaidError> {
            self.exchange
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| api_error(400, "INVALID_PUBLIC_TOKEN"))
        }

        async fn get_item(&self, _access_token: &str) -> Result<PlaidItem, PlaidError> {
            Ok(PlaidItem {
                institution_id: self.institution_id.lock().unwrap().clone(),
            })
        }

        async fn get_institution(
            &self,
            _institution_id: &str,
            _country_codes: &[String],
        ) -> Result<PlaidInstitution, PlaidError> {
            Ok(PlaidInstitution {
                name: String::from("First Platypus Bank"),
            })
        }

        async fn get_accounts(&self, _access_token: &str) -> Result<Vec<PlaidAccount>, PlaidError> {
            Ok(self.accounts.lock().unwrap().clone())
        }

        async fn sync_transactions(
            &self,
            _access_token: &str,
            cursor: Option<&str>,
        ) -> Result<TransactionsSyncResponse, PlaidError> {
            let key = cursor.map(str::to_string);
            self.sync_calls.lock().unwrap().push(key.clone());

            let delay = *self.sync_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self.failing_cursors.lock().unwrap().contains(&key) {
                return Err(api_error(500, "INTERNAL_SERVER_ERROR"));
            }
            self.pages
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .ok_or_else(|| api_error(400, "INVALID_CURSOR"))
        }

        async fn remove_item(&self, access_token: &str) -> Result<(), PlaidError> {
            self.removed_items
                .lock()
                .unwrap()
                .push(access_token.to_string());
            Ok(())
        }
    }
}

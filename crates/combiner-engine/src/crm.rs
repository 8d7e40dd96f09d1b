//! Customer repository backed by the Simla (RetailCRM) API v5.

use async_trait::async_trait;
use combiner_core::{
    CrmConfig, CustomerId, CustomerPatch, CustomerRecord, CustomerRef, CustomersBySite, Order,
    OrdersBySite, SubscriptionUpdate,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::cache::{CUSTOMERS_FILE, ORDERS_FILE, SnapshotCache};
use crate::error::{EngineError, Result};
use crate::http::{RateLimitedClient, error_message};
use crate::repository::{CustomerRepository, customers_by_site, orders_by_site};

const USER_AGENT: &str = concat!("crm-combiner/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    #[serde(default)]
    total_page_count: u32,
}

#[derive(Debug, Deserialize)]
struct Acknowledgement {
    #[serde(default)]
    success: bool,
}

pub struct CrmRepository {
    client: RateLimitedClient,
    base_url: String,
    page_limit: u32,
    cache: Option<SnapshotCache>,
    refresh: bool,
}

impl CrmRepository {
    /// Client for the CRM in `config`; both the URL and the API key are required.
    pub fn new(config: &CrmConfig) -> Result<Self> {
        let url = config.url.as_deref().map(str::trim).filter(|u| !u.is_empty());
        let key = config.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty());
        let (Some(url), Some(key)) = (url, key) else {
            return Err(EngineError::MissingCredentials);
        };

        let client = RateLimitedClient::new(
            RateLimitedClient::interval_for(config.requests_per_second),
            config.max_retries,
            USER_AGENT,
        )?
        .with_header("X-API-KEY", key)?;

        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            page_limit: config.page_limit.max(1),
            cache: None,
            refresh: false,
        })
    }

    /// Serve snapshots from `cache`; `refresh` refetches and overwrites them.
    pub fn with_cache(mut self, cache: SnapshotCache, refresh: bool) -> Self {
        self.cache = Some(cache);
        self.refresh = refresh;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v5/{}", self.base_url, path)
    }

    /// Every item of a paged list endpoint.
    async fn fetch_all<T: DeserializeOwned>(&self, path: &str, field: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1u32;
        loop {
            let query = [("page", page.to_string()), ("limit", self.page_limit.to_string())];
            let body: Value = self.client.get_json(&self.url(path), &query).await?;
            ensure_success(&body)?;

            let batch = body.get(field).cloned().unwrap_or(Value::Array(Vec::new()));
            let batch: Vec<T> =
                serde_json::from_value(batch).map_err(|e| EngineError::Parse(format!("{path}: {e}")))?;
            items.extend(batch);

            let pagination: Pagination = body
                .get("pagination")
                .cloned()
                .map(serde_json::from_value::<Pagination>)
                .transpose()
                .map_err(|e| EngineError::Parse(format!("{path} pagination: {e}")))?
                .unwrap_or(Pagination { total_page_count: 0 });

            debug!(path, page, total = pagination.total_page_count, "fetched page");
            page += 1;
            if page > pagination.total_page_count {
                break;
            }
        }
        Ok(items)
    }

    /// Cached snapshot unless a refresh was requested, else `fetch` and store.
    async fn snapshot<T, F>(&self, name: &str, fetch: F) -> Result<T>
    where
        T: serde::Serialize + DeserializeOwned,
        F: std::future::Future<Output = Result<T>>,
    {
        if let Some(cache) = &self.cache
            && !self.refresh
            && let Some(cached) = cache.load(name).await?
        {
            info!(file = name, "using cached snapshot");
            return Ok(cached);
        }
        let value = fetch.await?;
        if let Some(cache) = &self.cache {
            cache.store(name, &value).await?;
            info!(file = name, "snapshot refreshed");
        }
        Ok(value)
    }
}

fn ensure_success(body: &Value) -> Result<()> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        return Err(EngineError::Api {
            status: 200,
            message: error_message(&body.to_string()),
        });
    }
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| EngineError::Parse(e.to_string()))
}

#[async_trait]
impl CustomerRepository for CrmRepository {
    async fn list_customers_by_site(&self) -> Result<CustomersBySite> {
        self.snapshot(CUSTOMERS_FILE, async {
            let customers: Vec<CustomerRecord> = self.fetch_all("customers", "customers").await?;
            info!(count = customers.len(), "fetched customers");
            Ok::<_, EngineError>(customers_by_site(customers))
        })
        .await
    }

    async fn list_orders_by_site(&self) -> Result<OrdersBySite> {
        self.snapshot(ORDERS_FILE, async {
            let orders: Vec<Order> = self.fetch_all("orders", "orders").await?;
            info!(count = orders.len(), "fetched orders");
            Ok::<_, EngineError>(orders_by_site(orders))
        })
        .await
    }

    async fn combine(&self, winner: CustomerId, losers: &[CustomerId]) -> Result<bool> {
        let losers: Vec<Value> = losers.iter().map(|id| json!({ "id": id })).collect();
        let form = [
            ("resultCustomer", to_json(&json!({ "id": winner }))?),
            ("customers", to_json(&losers)?),
        ];
        let ack: Acknowledgement = self.client.post_form(&self.url("customers/combine"), &form).await?;
        Ok(ack.success)
    }

    async fn edit_customer(&self, patch: &CustomerPatch) -> Result<()> {
        let form = [
            ("by", "id".to_string()),
            ("site", patch.site.clone()),
            ("customer", to_json(patch)?),
        ];
        let body: Value = self
            .client
            .post_form(&self.url(&format!("customers/{}/edit", patch.id)), &form)
            .await?;
        ensure_success(&body)
    }

    async fn set_subscriptions(&self, customer: &CustomerRef, subscriptions: &[SubscriptionUpdate]) -> Result<()> {
        let form = [
            ("by", "id".to_string()),
            ("site", customer.site.clone()),
            ("subscriptions", to_json(&subscriptions)?),
        ];
        let body: Value = self
            .client
            .post_form(&self.url(&format!("customers/{}/subscriptions", customer.id)), &form)
            .await?;
        ensure_success(&body)
    }
}

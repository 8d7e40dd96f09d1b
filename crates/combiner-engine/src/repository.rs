use std::sync::Mutex;

use async_trait::async_trait;
use combiner_core::{
    CustomerId, CustomerPatch, CustomerRecord, CustomerRef, CustomersBySite, Order, OrdersBySite,
    SubscriptionUpdate, NO_SITE,
};

use crate::error::{EngineError, Result};

/// Where customers come from and where merge decisions are written back.
///
/// Implementations are called strictly one request at a time.
#[async_trait]
pub trait CustomerRepository: Send + Sync {
    async fn list_customers_by_site(&self) -> Result<CustomersBySite>;

    /// Orders grouped by site and customer id, newest first.
    async fn list_orders_by_site(&self) -> Result<OrdersBySite>;

    /// Fold `losers` into `winner`. `Ok(false)` when the CRM refused.
    async fn combine(&self, winner: CustomerId, losers: &[CustomerId]) -> Result<bool>;

    async fn edit_customer(&self, patch: &CustomerPatch) -> Result<()>;

    async fn set_subscriptions(&self, customer: &CustomerRef, subscriptions: &[SubscriptionUpdate]) -> Result<()>;
}

/// Group a flat customer list by site; customers without one go under `_`.
pub fn customers_by_site(customers: impl IntoIterator<Item = CustomerRecord>) -> CustomersBySite {
    let mut by_site = CustomersBySite::new();
    for mut customer in customers {
        if customer.site.is_empty() {
            customer.site = NO_SITE.to_string();
        }
        by_site
            .entry(customer.site.clone())
            .or_default()
            .insert(customer.id, customer);
    }
    by_site
}

/// Group orders by site and customer, newest first. Orders without a
/// customer are dropped.
pub fn orders_by_site(orders: impl IntoIterator<Item = Order>) -> OrdersBySite {
    let mut by_site = OrdersBySite::new();
    for order in orders {
        let Some(customer) = order.customer_id() else {
            continue;
        };
        let site = order.site.clone().unwrap_or_else(|| NO_SITE.to_string());
        by_site
            .entry(site)
            .or_default()
            .entry(customer)
            .or_default()
            .push(order);
    }
    for customers in by_site.values_mut() {
        for orders in customers.values_mut() {
            orders.sort_by(|a, b| {
                let date = |o: &Order| o.created_at.as_ref().map(|ts| ts.date.clone());
                date(b).cmp(&date(a)).then(b.id.cmp(&a.id))
            });
        }
    }
    by_site
}

/// A write the in-memory repository received.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Combine { winner: CustomerId, losers: Vec<CustomerId> },
    Edit(CustomerPatch),
    Subscriptions { customer: CustomerRef, subscriptions: Vec<SubscriptionUpdate> },
}

/// Repository over fixed snapshots that records every write.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    customers: CustomersBySite,
    orders: OrdersBySite,
    refuse_combine: Vec<CustomerId>,
    fail_combine: Vec<CustomerId>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl InMemoryRepository {
    pub fn new(customers: CustomersBySite, orders: OrdersBySite) -> Self {
        Self {
            customers,
            orders,
            ..Default::default()
        }
    }

    pub fn with_customers(customers: impl IntoIterator<Item = CustomerRecord>) -> Self {
        Self::new(customers_by_site(customers), OrdersBySite::new())
    }

    /// Combining into `winner` reports `success: false`.
    pub fn refuse_combine_into(mut self, winner: CustomerId) -> Self {
        self.refuse_combine.push(winner);
        self
    }

    /// Combining into `winner` fails with an API error.
    pub fn fail_combine_into(mut self, winner: CustomerId) -> Self {
        self.fail_combine.push(winner);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    fn record(&self, call: RecordedCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }
}

#[async_trait]
impl CustomerRepository for InMemoryRepository {
    async fn list_customers_by_site(&self) -> Result<CustomersBySite> {
        Ok(self.customers.clone())
    }

    async fn list_orders_by_site(&self) -> Result<OrdersBySite> {
        Ok(self.orders.clone())
    }

    async fn combine(&self, winner: CustomerId, losers: &[CustomerId]) -> Result<bool> {
        self.record(RecordedCall::Combine {
            winner,
            losers: losers.to_vec(),
        });
        if self.fail_combine.contains(&winner) {
            return Err(EngineError::Api {
                status: 400,
                message: format!("customer {winner} cannot be combined"),
            });
        }
        Ok(!self.refuse_combine.contains(&winner))
    }

    async fn edit_customer(&self, patch: &CustomerPatch) -> Result<()> {
        self.record(RecordedCall::Edit(patch.clone()));
        Ok(())
    }

    async fn set_subscriptions(&self, customer: &CustomerRef, subscriptions: &[SubscriptionUpdate]) -> Result<()> {
        self.record(RecordedCall::Subscriptions {
            customer: customer.clone(),
            subscriptions: subscriptions.to_vec(),
        });
        Ok(())
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::customer::CustomerId;
use super::timestamp::CreatedAt;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<OrderCustomer>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<CreatedAt>,

    /// Status, type, payment data and everything else the CRM sends.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCustomer {
    pub id: CustomerId,
}

impl Order {
    pub fn new(id: i64, customer_id: CustomerId) -> Self {
        Self {
            id,
            customer: Some(OrderCustomer { id: customer_id }),
            ..Default::default()
        }
    }

    pub fn customer_id(&self) -> Option<CustomerId> {
        self.customer.as_ref().map(|c| c.id)
    }

    /// Value of an order attribute used by order-history criteria.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::from(self.id)),
            "site" => self.site.clone().map(Value::String),
            "createdAt" => self.created_at.as_ref().map(|ts| Value::String(ts.date.clone())),
            other => self.extra.get(other).cloned(),
        }
    }
}

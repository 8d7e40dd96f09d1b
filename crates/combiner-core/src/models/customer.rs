use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::timestamp::CreatedAt;
use super::value::map_or_empty_list;

pub type CustomerId = i64;

/// Site code used for customers the CRM returns without one.
pub const NO_SITE: &str = "_";

/// A customer card as fetched from the CRM.
///
/// Fields the engine reasons about are typed; everything else the CRM sends
/// is kept in `extra` so dotted field paths can still reach it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRecord {
    pub id: CustomerId,

    #[serde(default)]
    pub site: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default)]
    pub phones: Vec<Phone>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patronymic: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birthday: Option<String>,

    #[serde(default, deserialize_with = "map_or_empty_list")]
    pub address: BTreeMap<String, Value>,

    #[serde(default)]
    pub orders_count: i64,

    #[serde(default)]
    pub total_summ: f64,

    #[serde(default, deserialize_with = "map_or_empty_list")]
    pub custom_fields: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<CreatedAt>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<CustomerSource>,

    #[serde(default)]
    pub mg_customers: Vec<MgCustomer>,

    #[serde(default)]
    pub customer_subscriptions: Vec<CustomerSubscription>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phone {
    #[serde(default)]
    pub number: String,
}

impl Phone {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
}

/// A link between the customer and a messenger channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MgCustomer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mg_channel: Option<MgChannel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MgChannel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub channel_type: Option<String>,

    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerSubscription {
    pub subscription: SubscriptionChannel,

    #[serde(default)]
    pub subscribed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionChannel {
    pub channel: String,
}

impl CustomerRecord {
    pub fn new(id: CustomerId, site: impl Into<String>) -> Self {
        Self {
            id,
            site: site.into(),
            ..Default::default()
        }
    }

    /// Lowercased `first last patronymic` with whitespace collapsed.
    pub fn full_name(&self) -> String {
        [&self.first_name, &self.last_name, &self.patronymic]
            .iter()
            .filter_map(|part| part.as_deref())
            .flat_map(str::split_whitespace)
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn email_str(&self) -> &str {
        self.email.as_deref().unwrap_or_default()
    }

    pub fn has_active_channel(&self) -> bool {
        self.mg_customers
            .iter()
            .any(|link| link.mg_channel.as_ref().is_some_and(|channel| channel.active))
    }

    pub fn source_code(&self) -> Option<&str> {
        self.source
            .as_ref()
            .and_then(|source| source.source.as_deref())
            .filter(|code| !code.is_empty())
    }
}

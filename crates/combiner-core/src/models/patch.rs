use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::customer::{CustomerId, Phone};

/// Changes to send to the CRM for one surviving customer.
///
/// Only fields that changed are present. Named fields live in `fields` so that
/// every merge policy writes through the same map and later policies can
/// overwrite earlier ones for the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerPatch {
    pub id: CustomerId,
    pub site: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_fields: BTreeMap<String, Value>,

    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl CustomerPatch {
    pub fn new(id: CustomerId, site: impl Into<String>) -> Self {
        Self {
            id,
            site: site.into(),
            custom_fields: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn set_manager(&mut self, manager_id: i64) {
        self.fields.insert("managerId".to_string(), Value::from(manager_id));
    }

    pub fn set_phones(&mut self, phones: &[Phone]) {
        let list = phones
            .iter()
            .map(|phone| serde_json::json!({ "number": phone.number }))
            .collect();
        self.fields.insert("phones".to_string(), Value::Array(list));
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn set_custom_field(&mut self, name: impl Into<String>, value: Value) {
        self.custom_fields.insert(name.into(), value);
    }

    pub fn manager_id(&self) -> Option<i64> {
        self.fields.get("managerId").and_then(Value::as_i64)
    }

    pub fn phones(&self) -> Option<Vec<String>> {
        self.fields.get("phones").and_then(Value::as_array).map(|list| {
            list.iter()
                .filter_map(|p| p.get("number").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.custom_fields.is_empty()
    }
}

/// Identifies the customer a subscription write targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRef {
    pub id: CustomerId,
    pub site: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionUpdate {
    pub channel: String,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_serializes_flat() {
        let mut patch = CustomerPatch::new(10, "shop");
        patch.set_manager(3);
        patch.set_phones(&[Phone::new("+79001234567")]);
        patch.set_custom_field("emails", Value::String("a@b.cd".into()));

        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["id"], 10);
        assert_eq!(json["managerId"], 3);
        assert_eq!(json["phones"][0]["number"], "+79001234567");
        assert_eq!(json["customFields"]["emails"], "a@b.cd");
        assert_eq!(patch.manager_id(), Some(3));
        assert_eq!(patch.phones(), Some(vec!["+79001234567".to_string()]));
    }

    #[test]
    fn test_empty_patch() {
        let patch = CustomerPatch::new(1, "shop");
        assert!(patch.is_empty());
        let json = serde_json::to_value(&patch).unwrap();
        assert!(json.get("customFields").is_none());
    }
}

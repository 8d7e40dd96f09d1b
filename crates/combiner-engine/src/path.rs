//! Field lookups by name or dotted path over a customer record.
//!
//! Lookups never fail: a missing field, a missing key or a path that runs into
//! a scalar all resolve to `None`.

use combiner_core::{CustomerRecord, is_blank_opt};
use serde_json::Value;

/// A `prefix.code` reference such as `customFields.loyalty` or `address.city`.
///
/// Only the first dot splits; the code is looked up verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub prefix: String,
    pub code: String,
}

impl FieldPath {
    pub fn parse(raw: &str) -> Option<Self> {
        let (prefix, code) = raw.split_once('.')?;
        if prefix.is_empty() {
            return None;
        }
        Some(Self {
            prefix: prefix.to_string(),
            code: code.to_string(),
        })
    }

    pub fn resolve(&self, record: &CustomerRecord) -> Option<Value> {
        let container = field(record, &self.prefix)?;
        child(&container, &self.code)
    }

    pub fn is_blank_on(&self, record: &CustomerRecord) -> bool {
        is_blank_opt(self.resolve(record).as_ref())
    }
}

/// Top-level field of a record by its CRM name.
pub fn field(record: &CustomerRecord, name: &str) -> Option<Value> {
    let value = match name {
        "id" => Value::from(record.id),
        "site" => Value::String(record.site.clone()),
        "email" => Value::String(record.email.clone()?),
        "phones" => serde_json::to_value(&record.phones).ok()?,
        "firstName" => Value::String(record.first_name.clone()?),
        "lastName" => Value::String(record.last_name.clone()?),
        "patronymic" => Value::String(record.patronymic.clone()?),
        "birthday" => Value::String(record.birthday.clone()?),
        "address" => serde_json::to_value(&record.address).ok()?,
        "ordersCount" => Value::from(record.orders_count),
        "totalSumm" => Value::from(record.total_summ),
        "customFields" => serde_json::to_value(&record.custom_fields).ok()?,
        "managerId" => Value::from(record.manager_id?),
        "externalId" => Value::String(record.external_id.clone()?),
        "createdAt" => serde_json::to_value(record.created_at.as_ref()?).ok()?,
        "source" => serde_json::to_value(record.source.as_ref()?).ok()?,
        "mgCustomers" => serde_json::to_value(&record.mg_customers).ok()?,
        "customerSubscriptions" => serde_json::to_value(&record.customer_subscriptions).ok()?,
        other => record.extra.get(other)?.clone(),
    };
    Some(value)
}

/// Walk every dot-separated segment, starting at a top-level field.
pub fn traverse(record: &CustomerRecord, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let mut current = field(record, segments.next()?)?;
    for segment in segments {
        current = child(&current, segment)?;
    }
    Some(current)
}

fn child(container: &Value, key: &str) -> Option<Value> {
    match container {
        Value::Object(map) => map.get(key).cloned(),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|idx| items.get(idx).cloned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use combiner_core::{CustomerSource, Phone};
    use serde_json::json;

    fn record() -> CustomerRecord {
        let mut customer = CustomerRecord::new(1, "shop");
        customer.email = Some("anna@example.com".to_string());
        customer.phones = vec![Phone::new("+7 900 000-11-22")];
        customer.address.insert("city".to_string(), json!("Moscow"));
        customer.custom_fields.insert("inn".to_string(), json!("77-01"));
        customer.source = Some(CustomerSource {
            source: Some("instagram".to_string()),
            ..Default::default()
        });
        customer.extra.insert("vip".to_string(), json!({"level": 2}));
        customer
    }

    #[test]
    fn parse_splits_on_first_dot() {
        let path = FieldPath::parse("customFields.a.b").unwrap();
        assert_eq!(path.prefix, "customFields");
        assert_eq!(path.code, "a.b");
        assert!(FieldPath::parse("email").is_none());
        assert!(FieldPath::parse(".x").is_none());
    }

    #[test]
    fn resolve_nested_values() {
        let customer = record();
        assert_eq!(FieldPath::parse("address.city").unwrap().resolve(&customer), Some(json!("Moscow")));
        assert_eq!(FieldPath::parse("customFields.inn").unwrap().resolve(&customer), Some(json!("77-01")));
        assert_eq!(FieldPath::parse("source.source").unwrap().resolve(&customer), Some(json!("instagram")));
        assert_eq!(FieldPath::parse("vip.level").unwrap().resolve(&customer), Some(json!(2)));
    }

    #[test]
    fn unresolved_paths_are_none() {
        let customer = record();
        assert_eq!(FieldPath::parse("address.zip").unwrap().resolve(&customer), None);
        assert_eq!(FieldPath::parse("nope.zip").unwrap().resolve(&customer), None);
        assert_eq!(FieldPath::parse("email.zip").unwrap().resolve(&customer), None);
        assert_eq!(FieldPath::parse("managerId.x").unwrap().resolve(&customer), None);
        assert!(FieldPath::parse("address.zip").unwrap().is_blank_on(&customer));
    }

    #[test]
    fn traverse_follows_lists() {
        let customer = record();
        assert_eq!(traverse(&customer, "phones.0.number"), Some(json!("+7 900 000-11-22")));
        assert_eq!(traverse(&customer, "phones.3.number"), None);
        assert_eq!(traverse(&customer, "email"), Some(json!("anna@example.com")));
    }
}

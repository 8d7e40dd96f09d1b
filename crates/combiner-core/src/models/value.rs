use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Loose emptiness as the CRM treats it: null, `""`, `"0"`, zero, `false`,
/// and empty lists or mappings carry no information.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f == 0.0),
        Value::String(s) => s.is_empty() || s == "0",
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

/// `true` when the lookup found nothing or found a blank value.
pub fn is_blank_opt(value: Option<&Value>) -> bool {
    value.is_none_or(is_blank)
}

/// Render a scalar for keys and report cells. Containers are JSON-encoded.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => if *b { "1".to_string() } else { String::new() },
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// The CRM encodes an empty mapping as `[]`; accept that alongside objects
/// and null.
pub(crate) fn map_or_empty_list<'de, D>(deserializer: D) -> Result<BTreeMap<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MapOrList {
        Map(BTreeMap<String, Value>),
        List(Vec<Value>),
    }

    Ok(match Option::<MapOrList>::deserialize(deserializer)? {
        Some(MapOrList::Map(map)) => map,
        Some(MapOrList::List(items)) => items
            .into_iter()
            .enumerate()
            .map(|(idx, value)| (idx.to_string(), value))
            .collect(),
        None => BTreeMap::new(),
    })
}

//! Query-string handling for list requests.

use std::collections::BTreeSet;

use kura_db::ViewOptions;
use kura_extension::Query;
use kura_filter::{parse_bool, Filter};
use kura_schema::{Policy, Schema};
use kura_types::ResourceError;
use serde_json::Value;
use tracing::debug;

/// Parameters accepted besides schema properties.
pub const RESERVED: [&str; 8] = [
    "sort_key",
    "sort_order",
    "limit",
    "offset",
    "search_field",
    "any_of",
    "_details",
    "_fields",
];

fn first<'a>(query: &'a Query, key: &str) -> Option<&'a str> {
    query.get(key).and_then(|v| v.first()).map(String::as_str)
}

fn flag(query: &Query, key: &str, default: bool) -> bool {
    first(query, key).and_then(parse_bool).unwrap_or(default)
}

/// Rejects parameters that are neither properties nor reserved.
pub fn verify_query_params(schema: &Schema, query: &Query) -> Result<(), ResourceError> {
    let unknown: BTreeSet<&str> = query
        .keys()
        .map(String::as_str)
        .filter(|k| !schema.has_property(k) && !RESERVED.contains(k))
        .collect();
    if unknown.is_empty() {
        return Ok(());
    }
    let names: Vec<&str> = unknown.into_iter().collect();
    Err(ResourceError::wrong_query(format!(
        "Unrecognized query parameters: {}",
        names.join(", ")
    )))
}

/// Filter built from property parameters. Properties the policy hides are
/// ignored; `search_field=<p>` turns `<p>` into a substring match and
/// `any_of=true` joins the conditions with OR.
pub fn query_filter(schema: &Schema, query: &Query, policy: &Policy) -> Result<Filter, ResourceError> {
    let search: Vec<&String> = query.get("search_field").map(|v| v.iter().collect()).unwrap_or_default();
    for column in &search {
        if first(query, column).is_none() {
            return Err(ResourceError::wrong_query(format!(
                "search value for `{column}` not available in URL"
            )));
        }
    }

    let mut keys: Vec<&String> = query.keys().collect();
    keys.sort();
    let mut conditions = Vec::new();
    for key in keys {
        if !schema.has_property(key) {
            continue;
        }
        if !policy.properties_filter().is_visible(key) {
            debug!(schema = %schema.id, property = %key, "ignoring filter on hidden property");
            continue;
        }
        let values = &query[key];
        let condition = if search.contains(&key) {
            Filter::substring(key.as_str(), values.first().cloned().unwrap_or_default())
        } else {
            match values.as_slice() {
                [] => continue,
                [one] => Filter::eq(key.as_str(), Value::String(one.clone())),
                many => Filter::eq(
                    key.as_str(),
                    Value::Array(many.iter().cloned().map(Value::String).collect()),
                ),
            }
        };
        conditions.push(condition);
    }

    Ok(match conditions.len() {
        0 => Filter::all(),
        1 => conditions.remove(0),
        _ if flag(query, "any_of", false) => Filter::Or(conditions),
        _ => Filter::And(conditions),
    })
}

/// `_details` (default true) and repeated `_fields`.
pub fn view_options(query: &Query) -> ViewOptions {
    ViewOptions {
        fields: query.get("_fields").filter(|f| !f.is_empty()).cloned(),
        details: flag(query, "_details", true),
        ..ViewOptions::default()
    }
}

#[cfg(test)]
mod tests {
    use kura_filter::matches;
    use serde_json::json;

    use super::*;

    fn schema() -> Schema {
        Schema::from_value(&json!({
            "id": "network", "plural": "networks",
            "schema": {"properties": {"name": {"type": "string"}, "state": {"type": "string"},
                                      "secret": {"type": "string"}}}
        }))
        .unwrap()
    }

    fn query(pairs: &[(&str, &[&str])]) -> Query {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn unknown_parameters_are_listed() {
        let q = query(&[("name", &["a"]), ("zeta", &["1"]), ("alpha", &["2"]), ("limit", &["5"])]);
        let err = verify_query_params(&schema(), &q).unwrap_err();
        assert_eq!(err.message(), "Unrecognized query parameters: alpha, zeta");
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn any_of_switches_to_or() {
        let policy = Policy::allow_all();
        let q = query(&[("name", &["a"]), ("state", &["UP"]), ("any_of", &["true"])]);
        let filter = query_filter(&schema(), &q, &policy).unwrap();
        assert!(matches(&filter, json!({"name": "a", "state": "DOWN"}).as_object().unwrap()));

        let q = query(&[("name", &["a"]), ("state", &["UP"])]);
        let filter = query_filter(&schema(), &q, &policy).unwrap();
        assert!(!matches(&filter, json!({"name": "a", "state": "DOWN"}).as_object().unwrap()));
    }

    #[test]
    fn search_field_needs_a_value() {
        let policy = Policy::allow_all();
        let q = query(&[("search_field", &["name"]), ("name", &["et"])]);
        let filter = query_filter(&schema(), &q, &policy).unwrap();
        assert!(matches(&filter, json!({"name": "network"}).as_object().unwrap()));

        let q = query(&[("search_field", &["state"])]);
        let err = query_filter(&schema(), &q, &policy).unwrap_err();
        assert!(err.message().contains("search value for `state`"));
    }

    #[test]
    fn hidden_properties_are_not_filtered() {
        let policy = Policy::from_value(&json!({
            "id": "p", "principal": "Member", "action": "*",
            "resource": {"path": ".*", "blacklistProperties": ["secret"]}
        }))
        .unwrap();
        let q = query(&[("secret", &["x"])]);
        assert!(query_filter(&schema(), &q, &policy).unwrap().is_all());
    }
}

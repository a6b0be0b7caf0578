//! Tests for `resolver` module

use super::*;
use crate::record::{Record, Timestamp};
use chrono::{TimeZone, Utc};

const USER_BY_ID: &str =
    "(select User filter .firebase_uid = <str>json_get(<json>$guests, '%%n%%', 'userId'))";
const USER_BY_PHONE: &str =
    "(select User filter .phone = <str>json_get(<json>$guests, '%%n%%', 'phone'))";

fn guest(user_id: Option<&str>, phone: Option<&str>) -> Value {
    let mut map = Record::new();
    if let Some(id) = user_id {
        map.insert("userId".into(), Value::from(id));
    }
    if let Some(p) = phone {
        map.insert("phone".into(), Value::from(p));
    }
    Value::Map(map)
}

fn guest_key_fn() -> KeyFunction {
    KeyFunction::new("guest_kind", |v| {
        let map = v.as_map();
        if map.and_then(|m| m.get("userId")).is_some() {
            Ok(Some("user".into()))
        } else if map.and_then(|m| m.get("phone")).is_some() {
            Ok(Some("phone".into()))
        } else {
            Ok(None)
        }
    })
}

fn guest_resolver() -> Resolver {
    let mut resolutions = IndexMap::new();
    resolutions.insert("user".to_string(), USER_BY_ID.to_string());
    resolutions.insert("phone".to_string(), USER_BY_PHONE.to_string());
    Resolver::array("guests", guest_key_fn(), resolutions).unwrap()
}

fn host_resolver() -> Resolver {
    let mut resolutions = IndexMap::new();
    resolutions.insert(
        "link".to_string(),
        ":= (select User filter .firebase_uid = <str>$host)".to_string(),
    );
    Resolver::scalar(
        "host",
        KeyFunction::new("link", |_| Ok(Some("link".into()))),
        resolutions,
    )
    .unwrap()
}

// -------------------------------------------------------------------------
// Scalar resolver
// -------------------------------------------------------------------------

#[test]
fn test_scalar_resolution() {
    let resolution = host_resolver().resolve(&Value::from("u-42")).unwrap().unwrap();
    assert_eq!(resolution.source, Value::from("u-42"));
    assert_eq!(
        resolution.query,
        ":= (select User filter .firebase_uid = <str>$host)"
    );
    assert_eq!(resolution.vars["host"], serde_json::json!("u-42"));
}

#[test]
fn test_scalar_null_is_not_resolved() {
    let resolver = host_resolver();
    assert_eq!(resolver.resolve(&Value::Null).unwrap(), None);
    assert_eq!(resolver.resolve(&Value::Float(f64::NAN)).unwrap(), None);
}

#[test]
fn test_scalar_unknown_key_is_fatal() {
    // Arrange
    let mut resolutions = IndexMap::new();
    resolutions.insert("going".to_string(), "(select 1)".to_string());
    let resolver = Resolver::scalar(
        "status",
        KeyFunction::new("identity", |v| Ok(Some(v.to_string()))),
        resolutions,
    )
    .unwrap();

    // Act
    let result = resolver.resolve(&Value::from("maybe"));

    // Assert
    match result {
        Err(Error::UnresolvedKey { field, key, value }) => {
            assert_eq!(field, "status");
            assert_eq!(key, "maybe");
            assert_eq!(value, "maybe");
        }
        other => panic!("expected UnresolvedKey, got {other:?}"),
    }
}

#[test]
fn test_empty_resolution_set_rejected() {
    let result = Resolver::scalar(
        "host",
        KeyFunction::new("k", |_| Ok(None)),
        IndexMap::new(),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

// -------------------------------------------------------------------------
// Array resolver
// -------------------------------------------------------------------------

#[test]
fn test_array_null_key_keeps_positions() {
    // Arrange
    let a = guest(Some("u-1"), None);
    let b = guest(None, None);
    let c = guest(None, Some("+15550100"));
    let value = Value::Array(vec![a.clone(), b, c.clone()]);

    // Act
    let resolution = guest_resolver().resolve(&value).unwrap().unwrap();

    // Assert
    assert_eq!(resolution.source, Value::Array(vec![a, Value::Null, c]));
    assert_eq!(resolution.query.matches("json_get").count(), 2);
    assert!(resolution.query.contains("'0', 'userId'"));
    assert!(resolution.query.contains("'2', 'phone'"));
    assert!(!resolution.query.contains("'1'"));
    assert!(!resolution.query.contains(INDEX_PLACEHOLDER));
    assert!(resolution.query.starts_with(":= assert_distinct({("));
    assert!(resolution.query.ends_with("),})"));
}

#[test]
fn test_array_bound_variable_is_positional_json() {
    let value = Value::Array(vec![guest(None, None), guest(Some("u-9"), None)]);

    let resolution = guest_resolver().resolve(&value).unwrap().unwrap();

    let encoded = resolution.vars["guests"].as_str().unwrap();
    let decoded: serde_json::Value = serde_json::from_str(encoded).unwrap();
    assert_eq!(decoded, serde_json::json!([null, {"userId": "u-9"}]));
}

#[test]
fn test_array_timestamps_normalized_in_bound_variable() {
    let mut entry = Record::new();
    entry.insert("userId".into(), Value::from("u-1"));
    entry.insert(
        "invitedAt".into(),
        Value::Timestamp(Timestamp::Precise(
            Utc.with_ymd_and_hms(2024, 6, 1, 18, 30, 0).unwrap(),
        )),
    );

    let resolution = guest_resolver()
        .resolve(&Value::Array(vec![Value::Map(entry)]))
        .unwrap()
        .unwrap();

    let encoded = resolution.vars["guests"].as_str().unwrap();
    assert!(encoded.contains("\"2024-06-01T18:30:00.000000+00:00\""));
}

#[test]
fn test_array_size_window() {
    let resolver = guest_resolver();

    assert_eq!(resolver.resolve(&Value::Array(vec![])).unwrap(), None);

    let too_many = Value::Array(vec![guest(Some("u"), None); MAX_ARRAY_LEN + 1]);
    assert_eq!(resolver.resolve(&too_many).unwrap(), None);

    let at_limit = Value::Array(vec![guest(Some("u"), None); MAX_ARRAY_LEN]);
    let resolution = resolver.resolve(&at_limit).unwrap().unwrap();
    assert!(resolution.query.contains("'1023', 'userId'"));
}

#[test]
fn test_array_all_null_keys_omitted() {
    let value = Value::Array(vec![guest(None, None), guest(None, None)]);
    assert_eq!(guest_resolver().resolve(&value).unwrap(), None);
}

#[test]
fn test_array_non_sequence_omitted() {
    let resolver = guest_resolver();
    assert_eq!(resolver.resolve(&Value::from("u-1")).unwrap(), None);
    assert_eq!(resolver.resolve(&Value::Null).unwrap(), None);
}

#[test]
fn test_array_non_map_element_omits_field() {
    let value = Value::Array(vec![guest(Some("u-1"), None), Value::from("loose")]);
    assert_eq!(guest_resolver().resolve(&value).unwrap(), None);
}

#[test]
fn test_array_unknown_key_is_fatal() {
    let mut resolutions = IndexMap::new();
    resolutions.insert("user".to_string(), USER_BY_ID.to_string());
    let resolver = Resolver::array("guests", guest_key_fn(), resolutions).unwrap();

    let value = Value::Array(vec![guest(None, Some("+1"))]);

    assert!(matches!(
        resolver.resolve(&value),
        Err(Error::UnresolvedKey { .. })
    ));
}

#[test]
fn test_substitute_index_replaces_every_placeholder() {
    assert_eq!(substitute_index("a %%n%% b %%n%%", 7), "a 7 b 7");
    assert_eq!(substitute_index("no placeholder", 3), "no placeholder");
}

#[test]
fn test_from_spec_uses_registry() {
    let spec: ResolverSpec = serde_yaml::from_str(
        "key:\n  constant: link\nresolutions:\n  link: \":= (select Event filter .firebase_id = <str>$event)\"\n",
    )
    .unwrap();
    let registry = TransformRegistry::with_builtins();

    let resolver = Resolver::from_spec("event", &spec, false, &registry).unwrap();

    assert!(!resolver.is_array());
    assert_eq!(resolver.field(), "event");
    let resolution = resolver.resolve(&Value::from("ev-1")).unwrap().unwrap();
    assert_eq!(resolution.vars["event"], serde_json::json!("ev-1"));
}

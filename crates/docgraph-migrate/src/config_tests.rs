//! Tests for `config` module

use super::*;

const CONFIG: &str = r#"
source:
  type: json_file
  dir: ./exports
target:
  type: edgedb_http
  url: http://localhost:10701
  database: app
options:
  page_size: 50
collections:
  users:
    fetch_order:
      field: createdAt
      direction: DESCENDING
    mapping:
      firebase_uid: id
      phone_number:
        col: phoneNumber
        transform: normalize_phone
      created_at:
        col: createdAt
        transform: normalize_timestamp
      metadata:
        row: attach_metadata
    type_casts:
      created_at: datetime
    skip_if_empty: [phone_number]
    query_suffix: unless conflict on .firebase_uid
    execution:
      strategy: row_transactional
      entity: User
  payments:
    fetch_order:
      field: paidAt
    collection_group: true
    mapping:
      event_id: eventId
      amount: amount
    group_by: [event_id]
    prerequisites:
      - query: select count(Event filter .firebase_id = <str>$event)
        vars:
          event: event_id
    execution:
      strategy: grouped_bulk
      query: "with data := <json>$data update Event set { paid := true }"
"#;

fn config() -> MigrationConfig {
    MigrationConfig::from_yaml(CONFIG).unwrap()
}

// -------------------------------------------------------------------------
// Parsing
// -------------------------------------------------------------------------

#[test]
fn test_parse_full_config() {
    // Act
    let config = config();

    // Assert
    assert!(matches!(config.source, SourceConfig::JsonFile(_)));
    assert!(matches!(config.target, TargetConfig::EdgeHttp(ref c) if c.database == "app"));
    assert_eq!(config.options.page_size, 50);
    assert_eq!(config.options.dump_dir, PathBuf::from("."));
    let names: Vec<&str> = config.collections.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["users", "payments"]);

    let users = config.collection("users").unwrap();
    assert_eq!(users.fetch_order.direction, Direction::Descending);
    assert!(!users.collection_group);
    assert_eq!(users.mapping.len(), 4);
    assert_eq!(users.type_casts["created_at"], "datetime");

    let payments = config.collection("payments").unwrap();
    assert_eq!(payments.fetch_order.direction, Direction::Ascending);
    assert!(payments.collection_group);
    assert_eq!(payments.prerequisites.len(), 1);
    assert_eq!(payments.execution.name(), "grouped_bulk");

    assert!(config.validate().is_ok());
}

#[test]
fn test_memory_target_and_defaults() {
    let yaml = r#"
source:
  type: json_file
  dir: .
target:
  type: memory
collections:
  users:
    fetch_order: { field: createdAt, direction: ascending }
    mapping:
      firebase_uid: id
    execution: { strategy: row_transactional, entity: User }
"#;

    let config = MigrationConfig::from_yaml(yaml).unwrap();

    assert!(matches!(config.target, TargetConfig::Memory));
    assert_eq!(config.options.page_size, 100);
    assert!(config.validate().is_ok());
}

#[test]
fn test_unknown_strategy_rejected() {
    let yaml = CONFIG.replace("strategy: row_transactional", "strategy: upsert");
    assert!(matches!(
        MigrationConfig::from_yaml(&yaml),
        Err(Error::Yaml(_))
    ));
}

#[test]
fn test_unknown_collection() {
    let err = config().collection("invoices").unwrap_err();
    assert!(matches!(err, Error::Config(ref msg) if msg.contains("invoices")));
}

#[test]
fn test_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("migration.yaml");
    std::fs::write(&path, CONFIG).unwrap();

    let config = MigrationConfig::from_file(&path).unwrap();

    assert_eq!(config.collections.len(), 2);
}

// -------------------------------------------------------------------------
// Validation
// -------------------------------------------------------------------------

fn invalid(from: &str, to: &str) -> String {
    let config = MigrationConfig::from_yaml(&CONFIG.replace(from, to)).unwrap();
    match config.validate() {
        Err(Error::Config(msg)) => msg,
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn test_zero_page_size() {
    assert!(invalid("page_size: 50", "page_size: 0").contains("page_size"));
}

#[test]
fn test_unmapped_references() {
    let msg = invalid("skip_if_empty: [phone_number]", "skip_if_empty: [email]");
    assert!(msg.starts_with("collection `users`"));
    assert!(msg.contains("email"));

    let msg = invalid("group_by: [event_id]", "group_by: [event]");
    assert!(msg.contains("group_by"));

    let msg = invalid("event: event_id", "event: eventId");
    assert!(msg.contains("eventId"));

    let msg = invalid("created_at: datetime", "updated_at: datetime");
    assert!(msg.contains("type_casts"));
}

#[test]
fn test_metadata_cannot_be_cast() {
    let msg = invalid("created_at: datetime", "metadata: json");
    assert!(msg.contains("reserved"));
}

#[test]
fn test_group_by_requires_grouped_strategy() {
    // Arrange
    let yaml = CONFIG.replace(
        "    skip_if_empty: [phone_number]",
        "    skip_if_empty: [phone_number]\n    group_by: [firebase_uid]",
    );
    let config = MigrationConfig::from_yaml(&yaml).unwrap();

    // Act
    let result = config.validate();

    // Assert
    assert!(matches!(result, Err(Error::Config(ref msg)) if msg.contains("grouped_bulk")));
}

#[test]
fn test_empty_bulk_query() {
    let msg = invalid(
        r#"query: "with data := <json>$data update Event set { paid := true }""#,
        r#"query: "  ""#,
    );
    assert!(msg.contains("grouped_bulk needs a query"));
}

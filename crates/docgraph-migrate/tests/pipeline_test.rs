//! End-to-end pipeline tests over JSON exports and the memory store.

#![allow(clippy::pedantic)]

use std::path::Path;

use docgraph_migrate::retry::RetryPolicy;
use docgraph_migrate::source::json_file::{JsonFileConfig, JsonFileSource};
use docgraph_migrate::target::http::{EdgeHttpConfig, EdgeHttpStore};
use docgraph_migrate::target::memory::MemoryStore;
use docgraph_migrate::{Error, MigrationConfig, Pipeline, RunOptions, TransformRegistry};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RULES: &str = r#"
target:
  type: memory
source:
  type: json_file
  dir: .
options:
  page_size: 2
collections:
  users:
    fetch_order: { field: rank }
    mapping:
      firebase_uid: id
      name: name
      phone_number: phone
      metadata: { row: attach_metadata }
    skip_if_empty: [phone_number]
    query_suffix: unless conflict on .firebase_uid
    execution: { strategy: row_transactional, entity: User }
  payments:
    fetch_order: { field: paidAt }
    collection_group: true
    mapping:
      firebase_id: id
      event_id: { col: _path, transform: { segment: 1 } }
      amount: amount
    group_by: [event_id]
    prerequisites:
      - query: select count(Event filter .firebase_id = <str>$event)
        vars:
          event: event_id
    execution:
      strategy: grouped_bulk
      query: "with data := <json>$data for row in json_array_unpack(data) union (update Event set { paid := true })"
  links:
    fetch_order: { field: rank }
    mapping:
      firebase_id: id
      kind: kind
    execution:
      strategy: resolution_keyed_bulk
      key: { field: kind }
      statements:
        user: "with data := <json>$data insert UserLink { id := <str>data['firebase_id'] }"
        org: "with data := <json>$data insert OrgLink { id := <str>data['firebase_id'] }"
"#;

fn write_exports(dir: &Path) {
    let users = json!([
        {"id": "u1", "name": "Ada", "phone": "+15550001", "rank": 1, "create_time": "2023-01-01T00:00:00Z"},
        {"id": "u2", "name": "Bob", "phone": null, "rank": 2},
        {"id": "u3", "name": "Cy", "phone": "+15550003", "rank": 3, "isDeleted": true},
        {"id": "u4", "name": "Dee", "phone": "+15550004", "rank": 4}
    ]);
    let payments = json!([
        {"id": "p1", "_path": ["events", "e1", "payments", "p1"], "amount": 10, "paidAt": 1},
        {"id": "p2", "_path": ["events", "e1", "payments", "p2"], "amount": 5, "paidAt": 2},
        {"id": "p3", "_path": ["events", "e2", "payments", "p3"], "amount": 7, "paidAt": 3}
    ]);
    let links = json!([
        {"id": "l1", "kind": "user", "rank": 1},
        {"id": "l2", "kind": "org", "rank": 2},
        {"id": "l3", "kind": "team", "rank": 3},
        {"id": "l4", "rank": 4}
    ]);
    for (name, docs) in [("users", users), ("payments", payments), ("links", links)] {
        std::fs::write(dir.join(format!("{name}.json")), docs.to_string()).unwrap();
    }
}

struct Fixture {
    dir: TempDir,
    store: MemoryStore,
    pipeline: Pipeline,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    write_exports(dir.path());
    let mut config = MigrationConfig::from_yaml(RULES).unwrap();
    config.options.dump_dir = dir.path().join("dumps");

    let store = MemoryStore::new();
    let source = JsonFileSource::new(JsonFileConfig {
        dir: dir.path().to_path_buf(),
    });
    let pipeline = Pipeline::new(
        config,
        TransformRegistry::with_builtins(),
        Box::new(source),
        Box::new(store.clone()),
    );
    Fixture {
        dir,
        store,
        pipeline,
    }
}

// -------------------------------------------------------------------------
// Row transactional
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_row_transactional_commits_valid_rows() {
    // Arrange
    let mut fx = fixture();

    // Act
    let stats = fx
        .pipeline
        .run("users", &RunOptions::default())
        .await
        .unwrap();

    // Assert
    assert_eq!((stats.fetched, stats.transformed), (4, 4));
    assert_eq!((stats.valid, stats.invalid), (2, 2));
    assert_eq!((stats.executed, stats.failed), (2, 0));

    let statements = fx.store.statements();
    assert_eq!(statements.len(), 2);
    assert!(statements.iter().all(|s| s.transactional));
    assert!(statements[0].query.starts_with("insert User {"));
    assert!(statements[0].query.contains(r#"firebase_uid := "u1""#));
    assert!(statements[0].query.ends_with("unless conflict on .firebase_uid"));
    assert!(!statements[0].query.contains("metadata"));
    assert!(statements[1].query.contains(r#"firebase_uid := "u4""#));

    let tx = fx.store.transactions();
    assert_eq!((tx.begun, tx.committed, tx.rolled_back), (1, 1, 0));
    assert_eq!(fx.store.closed(), 1);
}

#[tokio::test]
async fn test_row_transactional_failure_rolls_back_everything() {
    // Arrange
    let mut fx = fixture();
    fx.store.fail_call(2);

    // Act
    let result = fx.pipeline.run("users", &RunOptions::default()).await;

    // Assert
    assert!(matches!(result, Err(Error::Transaction(_))));
    assert!(fx.store.statements().is_empty());
    assert_eq!(fx.store.transactions().rolled_back, 1);
    assert_eq!(fx.store.closed(), 1);
}

#[tokio::test]
async fn test_no_valid_rows_opens_no_transaction() {
    // Arrange
    let mut fx = fixture();
    let options = RunOptions {
        limit: Some(1),
        start_after: Some("u2".to_string()),
        ..RunOptions::default()
    };

    // Act
    let stats = fx.pipeline.run("users", &options).await.unwrap();

    // Assert
    assert_eq!((stats.fetched, stats.transformed), (1, 1));
    assert_eq!((stats.valid, stats.invalid), (0, 1));
    assert_eq!(stats.executed, 0);
    assert_eq!(fx.store.transactions().begun, 0);
    assert_eq!(fx.store.attempts(), 0);
}

#[tokio::test]
async fn test_row_transactional_over_http_commits_one_request() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    write_exports(dir.path());
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/edgedb/edgeql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [{}]})))
        .expect(1)
        .mount(&server)
        .await;
    let store = EdgeHttpStore::new(EdgeHttpConfig {
        url: server.uri(),
        database: "edgedb".to_string(),
        user: None,
        password: None,
        retry: RetryPolicy::none(),
    })
    .unwrap();
    let mut pipeline = Pipeline::new(
        MigrationConfig::from_yaml(RULES).unwrap(),
        TransformRegistry::with_builtins(),
        Box::new(JsonFileSource::new(JsonFileConfig {
            dir: dir.path().to_path_buf(),
        })),
        Box::new(store),
    );

    // Act
    let stats = pipeline.run("users", &RunOptions::default()).await.unwrap();

    // Assert
    assert_eq!((stats.executed, stats.failed), (2, 0));
    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let query = body["query"].as_str().unwrap();
    assert!(query.contains(r#"firebase_uid := "u1""#));
    assert!(query.contains(r#"firebase_uid := "u4""#));
}

#[tokio::test]
async fn test_no_transaction_keeps_going_after_failure() {
    // Arrange
    let mut fx = fixture();
    fx.store.fail_call(1);
    let options = RunOptions {
        no_transaction: true,
        ..RunOptions::default()
    };

    // Act
    let stats = fx.pipeline.run("users", &options).await.unwrap();

    // Assert
    assert_eq!((stats.executed, stats.failed), (1, 1));
    let statements = fx.store.statements();
    assert_eq!(statements.len(), 1);
    assert!(!statements[0].transactional);
    assert_eq!(fx.store.transactions().begun, 0);
}

#[tokio::test]
async fn test_dry_run_executes_nothing() {
    // Arrange
    let mut fx = fixture();
    let options = RunOptions {
        dry_run: true,
        ..RunOptions::default()
    };

    // Act
    let stats = fx.pipeline.run("users", &options).await.unwrap();

    // Assert
    assert_eq!(stats.valid, 2);
    assert_eq!(stats.executed, 0);
    assert_eq!(fx.store.attempts(), 0);
    assert_eq!(fx.store.transactions().begun, 0);
}

#[tokio::test]
async fn test_single_field_requires_dry_run() {
    // Arrange
    let mut fx = fixture();
    let mut options = RunOptions {
        field: Some("phone_number".to_string()),
        ..RunOptions::default()
    };

    // Act
    let refused = fx.pipeline.run("users", &options).await;
    options.dry_run = true;
    let stats = fx.pipeline.run("users", &options).await.unwrap();

    // Assert
    assert!(matches!(refused, Err(Error::Config(_))));
    assert_eq!(stats.transformed, 4);
    assert_eq!(fx.store.attempts(), 0);
}

#[tokio::test]
async fn test_dump_invalid_writes_rejected_rows() {
    // Arrange
    let mut fx = fixture();
    let options = RunOptions {
        dry_run: true,
        dump_invalid: true,
        ..RunOptions::default()
    };

    // Act
    fx.pipeline.run("users", &options).await.unwrap();

    // Assert
    let path = fx.dir.path().join("dumps").join("users_invalid.csv");
    let mut reader = csv::Reader::from_path(&path).unwrap();
    let header: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
    assert_eq!(header[0], "firebase_uid");
    let ids: Vec<String> = reader
        .records()
        .map(|r| r.unwrap()[0].to_string())
        .collect();
    assert_eq!(ids, vec!["u2", "u3"]);
}

// -------------------------------------------------------------------------
// Paging
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_start_after_with_limit() {
    // Arrange
    let mut fx = fixture();
    let options = RunOptions {
        limit: Some(5),
        start_after: Some("u2".to_string()),
        ..RunOptions::default()
    };

    // Act
    let stats = fx.pipeline.run("users", &options).await.unwrap();

    // Assert
    assert_eq!(stats.fetched, 2);
    assert_eq!((stats.valid, stats.invalid), (1, 1));
    let statements = fx.store.statements();
    assert_eq!(statements.len(), 1);
    assert!(statements[0].query.contains(r#"firebase_uid := "u4""#));
}

#[tokio::test]
async fn test_limit_fetches_single_page() {
    // Arrange
    let mut fx = fixture();
    let options = RunOptions {
        dry_run: true,
        limit: Some(1),
        ..RunOptions::default()
    };

    // Act
    let stats = fx.pipeline.run("users", &options).await.unwrap();

    // Assert
    assert_eq!(stats.fetched, 1);
}

#[tokio::test]
async fn test_unknown_start_after_key_fails() {
    // Arrange
    let mut fx = fixture();
    let options = RunOptions {
        start_after: Some("missing".to_string()),
        ..RunOptions::default()
    };

    // Act
    let result = fx.pipeline.run("users", &options).await;

    // Assert
    assert!(matches!(result, Err(Error::Extraction(_))));
    assert_eq!(fx.store.attempts(), 0);
}

// -------------------------------------------------------------------------
// Grouped bulk with prerequisites
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_grouped_bulk_after_guard() {
    // Arrange
    let mut fx = fixture();
    fx.store.on("select count(Event", |vars| {
        let known = vars.get("event") == Some(&json!("e1"));
        Ok(vec![json!(u8::from(known))])
    });

    // Act
    let stats = fx
        .pipeline
        .run("payments", &RunOptions::default())
        .await
        .unwrap();

    // Assert
    assert_eq!(stats.fetched, 3);
    assert_eq!((stats.valid, stats.invalid), (2, 1));
    assert_eq!((stats.executed, stats.failed, stats.skipped), (1, 0, 0));

    let bulk: Vec<_> = fx
        .store
        .statements()
        .into_iter()
        .filter(|s| s.query.contains("update Event"))
        .collect();
    assert_eq!(bulk.len(), 1);
    let payload: serde_json::Value =
        serde_json::from_str(bulk[0].vars["data"].as_str().unwrap()).unwrap();
    let rows = payload.as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["firebase_id"], "p1");
    assert_eq!(rows[0]["event_id"], "e1");
    assert_eq!(rows[1]["amount"], 5);
}

// -------------------------------------------------------------------------
// Resolution keyed bulk
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_keyed_bulk_routes_by_key() {
    // Arrange
    let mut fx = fixture();

    // Act
    let stats = fx
        .pipeline
        .run("links", &RunOptions::default())
        .await
        .unwrap();

    // Assert
    assert_eq!(stats.fetched, 4);
    assert_eq!((stats.executed, stats.failed, stats.skipped), (2, 0, 2));
    let statements = fx.store.statements();
    assert_eq!(statements.len(), 2);
    assert!(statements[0].query.contains("insert UserLink"));
    assert!(statements[1].query.contains("insert OrgLink"));
}

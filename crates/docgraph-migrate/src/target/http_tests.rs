//! Tests for the EdgeQL HTTP target.

use super::*;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(url: &str) -> EdgeHttpConfig {
    EdgeHttpConfig {
        url: url.to_string(),
        database: "edgedb".to_string(),
        user: None,
        password: None,
        retry: RetryPolicy::none(),
    }
}

fn retrying(url: &str) -> EdgeHttpConfig {
    EdgeHttpConfig {
        retry: RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            multiplier: 2.0,
        },
        ..config(url)
    }
}

fn vars(pairs: &[(&str, serde_json::Value)]) -> Vars {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

async fn posted_bodies(server: &MockServer) -> Vec<serde_json::Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

#[test]
fn test_config_defaults() {
    let config: EdgeHttpConfig = serde_yaml::from_str("url: http://localhost:10701").unwrap();
    assert_eq!(config.database, "edgedb");
    assert!(config.user.is_none());
    assert_eq!(config.retry, RetryPolicy::default());
}

#[test]
fn test_rejects_non_http_url() {
    assert!(matches!(
        EdgeHttpStore::new(config("edgedb://localhost:5656")),
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn test_execute_posts_query_and_variables() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/edgedb/edgeql"))
        .and(body_json(serde_json::json!({
            "query": "select count(User filter .firebase_uid = <str>$uid)",
            "variables": {"uid": "u-1"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": [1]})))
        .expect(1)
        .mount(&server)
        .await;
    let store = EdgeHttpStore::new(config(&server.uri())).unwrap();
    let mut vars = Vars::new();
    vars.insert("uid".into(), serde_json::json!("u-1"));

    // Act
    let rows = store
        .execute("select count(User filter .firebase_uid = <str>$uid)", &vars)
        .await
        .unwrap();

    // Assert
    assert_eq!(rows, vec![serde_json::json!(1)]);
}

#[tokio::test]
async fn test_query_error_is_execution_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {"message": "missing value for required property", "type": "MissingRequiredError", "code": 84017154}
        })))
        .mount(&server)
        .await;
    let store = EdgeHttpStore::new(config(&server.uri())).unwrap();

    let err = store.execute("insert User {}", &Vars::new()).await.unwrap_err();

    match err {
        Error::Execution(msg) => assert!(msg.starts_with("MissingRequiredError")),
        other => panic!("expected execution error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_error_is_connection_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;
    let store = EdgeHttpStore::new(config(&server.uri())).unwrap();

    let err = store.execute("select 1", &Vars::new()).await.unwrap_err();

    assert!(matches!(err, Error::TargetConnection(_)));
}

// -------------------------------------------------------------------------
// Retries
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_write_not_resent_after_gateway_timeout() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(504).set_body_string("gateway timeout"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .mount(&server)
        .await;
    let store = EdgeHttpStore::new(retrying(&server.uri())).unwrap();

    // Act
    let result = store
        .execute(r#"insert User { firebase_uid := "u-1" }"#, &Vars::new())
        .await;

    // Assert
    assert!(matches!(result, Err(Error::TargetConnection(_))));
    assert_eq!(posted_bodies(&server).await.len(), 1);
}

#[tokio::test]
async fn test_read_query_retried_after_server_error() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": [1]})))
        .mount(&server)
        .await;
    let store = EdgeHttpStore::new(retrying(&server.uri())).unwrap();

    // Act
    let rows = store.query("select count(Event)", &Vars::new()).await.unwrap();

    // Assert
    assert_eq!(rows, vec![serde_json::json!(1)]);
    assert_eq!(posted_bodies(&server).await.len(), 2);
}

// -------------------------------------------------------------------------
// Transactions
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_transaction_commits_in_one_request() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/db/edgedb/edgeql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": [{}]})))
        .expect(1)
        .mount(&server)
        .await;
    let store = EdgeHttpStore::new(config(&server.uri())).unwrap();

    // Act
    let mut tx = store.begin_transaction().await.unwrap();
    tx.execute(
        "insert User { firebase_uid := <str>$uid }",
        &vars(&[("uid", serde_json::json!("u-1"))]),
    )
    .await
    .unwrap();
    tx.execute(
        "insert User { firebase_uid := <str>$uid };",
        &vars(&[("uid", serde_json::json!("u-2"))]),
    )
    .await
    .unwrap();
    assert!(posted_bodies(&server).await.is_empty());
    tx.commit().await.unwrap();

    // Assert
    let bodies = posted_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    let query = bodies[0]["query"].as_str().unwrap();
    assert!(query.contains("s0 := (insert User { firebase_uid := <str>$s0_uid })"));
    assert!(query.contains("s1 := (insert User { firebase_uid := <str>$s1_uid })"));
    assert!(query.ends_with("select { s0 := count(s0), s1 := count(s1) }"));
    assert_eq!(
        bodies[0]["variables"],
        serde_json::json!({"s0_uid": "u-1", "s1_uid": "u-2"})
    );
}

#[tokio::test]
async fn test_failed_commit_is_transaction_error() {
    // Arrange
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {"message": "violates exclusivity constraint", "type": "ConstraintViolationError"}
        })))
        .mount(&server)
        .await;
    let store = EdgeHttpStore::new(config(&server.uri())).unwrap();
    let mut tx = store.begin_transaction().await.unwrap();
    tx.execute("insert User {}", &Vars::new()).await.unwrap();

    // Act
    let result = tx.commit().await;

    // Assert
    assert!(
        matches!(result, Err(Error::Transaction(msg)) if msg.contains("ConstraintViolationError"))
    );
}

#[tokio::test]
async fn test_rollback_and_empty_commit_send_nothing() {
    let server = MockServer::start().await;
    let store = EdgeHttpStore::new(config(&server.uri())).unwrap();

    let mut tx = store.begin_transaction().await.unwrap();
    tx.execute("insert User {}", &Vars::new()).await.unwrap();
    tx.rollback().await.unwrap();
    store.begin_transaction().await.unwrap().commit().await.unwrap();

    assert!(posted_bodies(&server).await.is_empty());
}

#[test]
fn test_prefix_params_skips_literals_and_unbound_names() {
    let bound = vars(&[("data", serde_json::json!("[]"))]);

    let out = prefix_params(
        r#"with data := <json>$data insert Note { text := "costs $data", tag := '$data', n := <int64>$other }"#,
        &bound,
        "s3_",
    );

    assert_eq!(
        out,
        r#"with data := <json>$s3_data insert Note { text := "costs $data", tag := '$data', n := <int64>$other }"#
    );
}

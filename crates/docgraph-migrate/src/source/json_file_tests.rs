//! Tests for the JSON export source.

use super::*;
use crate::config::FetchOrder;
use crate::source::fetch_all;
use tempfile::TempDir;

fn export(files: &[(&str, serde_json::Value)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, docs) in files {
        std::fs::write(dir.path().join(format!("{name}.json")), docs.to_string()).unwrap();
    }
    dir
}

async fn connected(dir: &TempDir) -> JsonFileSource {
    let mut source = JsonFileSource::new(JsonFileConfig {
        dir: dir.path().to_path_buf(),
    });
    source.connect().await.unwrap();
    source
}

fn ordered(collection: &str, field: &str, direction: Direction) -> FetchRequest {
    FetchRequest {
        order: Some(FetchOrder {
            field: field.to_string(),
            direction,
        }),
        ..FetchRequest::new(collection)
    }
}

fn ids(records: &[Record]) -> Vec<String> {
    records.iter().map(|r| r[ID_FIELD].to_string()).collect()
}

fn users() -> serde_json::Value {
    serde_json::json!([
        {"id": "u3", "name": "Cy", "joined": 3},
        {"id": "u1", "name": "Ana", "joined": 1, "create_time": "2024-01-01T00:00:00Z"},
        {"id": "u2", "name": "Bo", "joined": 2},
        {"id": "u4", "name": "Di"}
    ])
}

#[tokio::test]
async fn test_fetch_enriches_documents() {
    // Arrange
    let dir = export(&[("users", users())]);
    let source = connected(&dir).await;

    // Act
    let page = source.fetch(&FetchRequest::new("users")).await.unwrap();

    // Assert
    let first = &page.records[0];
    assert_eq!(first[ID_FIELD], Value::from("u1"));
    assert_eq!(first[PATH_FIELD], Value::from(vec!["users", "u1"]));
    assert!(matches!(first[CREATE_TIME_FIELD], Value::Timestamp(_)));
    assert_eq!(first[UPDATE_TIME_FIELD], Value::Null);
    let keys: Vec<&str> = first.keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        vec!["name", "joined", "id", "create_time", "update_time", "_path"]
    );
}

#[tokio::test]
async fn test_order_excludes_documents_missing_field() {
    let dir = export(&[("users", users())]);
    let source = connected(&dir).await;

    let asc = source
        .fetch(&ordered("users", "joined", Direction::Ascending))
        .await
        .unwrap();
    let desc = source
        .fetch(&ordered("users", "joined", Direction::Descending))
        .await
        .unwrap();

    assert_eq!(ids(&asc.records), vec!["u1", "u2", "u3"]);
    assert_eq!(ids(&desc.records), vec!["u3", "u2", "u1"]);
    assert_eq!(
        source.count(&FetchRequest::new("users")).await.unwrap(),
        4
    );
}

#[tokio::test]
async fn test_limit_and_cursor() {
    // Arrange
    let dir = export(&[("users", users())]);
    let source = connected(&dir).await;
    let request = ordered("users", "joined", Direction::Ascending);

    // Act
    let first = source
        .fetch(&request.clone().with_limit(Some(2)))
        .await
        .unwrap();
    let rest = source
        .fetch(&request.with_start_after(first.cursor.clone()))
        .await
        .unwrap();

    // Assert
    assert_eq!(ids(&first.records), vec!["u1", "u2"]);
    assert_eq!(
        first.cursor,
        Some(Cursor {
            path: vec!["users".into(), "u2".into()],
            order_value: Some(Value::Int(2)),
        })
    );
    assert_eq!(ids(&rest.records), vec!["u3"]);
}

#[tokio::test]
async fn test_collection_group_scans_every_file() {
    // Arrange
    let dir = export(&[
        (
            "payments",
            serde_json::json!([
                {"id": "p1", "_path": ["events", "e1", "payments", "p1"], "amount": 10},
                {"id": "p9", "_path": ["payments", "p9"], "amount": 90}
            ]),
        ),
        (
            "events",
            serde_json::json!([
                {"id": "e2"},
                {"id": "p2", "_path": ["events", "e2", "payments", "p2"], "amount": 20}
            ]),
        ),
    ]);
    let source = connected(&dir).await;
    let request = FetchRequest {
        collection_group: true,
        ..ordered("payments", "amount", Direction::Ascending)
    };

    // Act
    let page = source.fetch(&request).await.unwrap();

    // Assert
    assert_eq!(ids(&page.records), vec!["p1", "p2", "p9"]);
    assert_eq!(page.records[1][PATH_FIELD].as_array().unwrap()[1], Value::from("e2"));
}

#[tokio::test]
async fn test_resolve_start_after() {
    let dir = export(&[("users", users())]);
    let source = connected(&dir).await;
    let request = ordered("users", "joined", Direction::Ascending);

    let cursor = source.resolve_start_after(&request, "u1").await.unwrap();
    let page = source
        .fetch(&request.clone().with_start_after(Some(cursor)))
        .await
        .unwrap();

    assert_eq!(ids(&page.records), vec!["u2", "u3"]);
    assert!(matches!(
        source.resolve_start_after(&request, "nobody").await,
        Err(Error::Extraction(_))
    ));
}

#[tokio::test]
async fn test_start_after_requires_order() {
    let dir = export(&[("users", users())]);
    let source = connected(&dir).await;
    let request = FetchRequest::new("users").with_start_after(Some(Cursor {
        path: vec!["users".into(), "u1".into()],
        order_value: None,
    }));

    assert!(matches!(source.fetch(&request).await, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_fetch_all_pages_until_short_page() {
    let dir = export(&[("users", users())]);
    let source = connected(&dir).await;

    let records = fetch_all(&source, &ordered("users", "joined", Direction::Ascending), 1)
        .await
        .unwrap();

    assert_eq!(ids(&records), vec!["u1", "u2", "u3"]);
}

#[tokio::test]
async fn test_exported_timestamp_maps() {
    let dir = export(&[(
        "events",
        serde_json::json!([
            {"id": "e1", "startsAt": {"_seconds": 1_704_067_200, "_nanoseconds": 0}, "label": "2024-01-01T00:00:00Z"}
        ]),
    )]);
    let source = connected(&dir).await;

    let page = source.fetch(&FetchRequest::new("events")).await.unwrap();

    assert_eq!(
        page.records[0]["startsAt"],
        Value::Timestamp(Timestamp::Proto {
            seconds: 1_704_067_200,
            nanos: 0
        })
    );
    assert_eq!(page.records[0]["label"], Value::from("2024-01-01T00:00:00Z"));
}

#[tokio::test]
async fn test_missing_id_and_unknown_collection() {
    let dir = export(&[("users", serde_json::json!([{"name": "no id"}]))]);
    let mut source = JsonFileSource::new(JsonFileConfig {
        dir: dir.path().to_path_buf(),
    });
    assert!(matches!(source.connect().await, Err(Error::Extraction(_))));

    let dir = export(&[("users", users())]);
    let source = connected(&dir).await;
    assert!(matches!(
        source.fetch(&FetchRequest::new("orders")).await,
        Err(Error::Extraction(_))
    ));
}

#[tokio::test]
async fn test_not_connected() {
    let source = JsonFileSource::new(JsonFileConfig {
        dir: PathBuf::from("."),
    });
    assert!(matches!(
        source.fetch(&FetchRequest::new("users")).await,
        Err(Error::SourceConnection(_))
    ));
}

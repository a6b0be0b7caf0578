//! Tests for `error` module

use super::*;

#[test]
fn test_error_codes_are_unique() {
    // Arrange
    let errors: Vec<Error> = vec![
        Error::Config("test".into()),
        Error::unresolved_key("host", Some("maybe"), "abc"),
        Error::Format("test".into()),
        Error::Type("test".into()),
        Error::SourceConnection("test".into()),
        Error::Extraction("test".into()),
        Error::Authentication("test".into()),
        Error::RateLimit(60),
        Error::TargetConnection("test".into()),
        Error::Execution("test".into()),
        Error::Transaction("test".into()),
        Error::Unsupported("test".into()),
        Error::Io(std::io::Error::other("test")),
    ];

    // Act
    let codes: Vec<&str> = errors.iter().map(Error::code).collect();

    // Assert
    let mut unique_codes = codes.clone();
    unique_codes.sort_unstable();
    unique_codes.dedup();
    assert_eq!(codes.len(), unique_codes.len());
    assert!(codes.iter().all(|c| c.starts_with("MIG-")));
}

#[test]
fn test_error_display_contains_code() {
    let err = Error::Format("bad phone".into());
    assert_eq!(err.to_string(), "[MIG-003] Format error: bad phone");
}

#[test]
fn test_unresolved_key_null_key() {
    let err = Error::unresolved_key("company", None, "\"Acme\"");
    let msg = err.to_string();
    assert!(msg.contains("`null`"));
    assert!(msg.contains("`company`"));
}

#[test]
fn test_only_execution_errors_are_soft() {
    assert!(!Error::Execution("x".into()).is_fatal());
    assert!(Error::Config("x".into()).is_fatal());
    assert!(Error::Transaction("x".into()).is_fatal());
    assert!(Error::Format("x".into()).is_fatal());
}

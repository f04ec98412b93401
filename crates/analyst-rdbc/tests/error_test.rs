//! Unit tests for analyst-rdbc error module

use analyst_rdbc::error::{Error, ErrorCategory};

#[test]
fn test_categories() {
    assert_eq!(Error::connection("x").category(), ErrorCategory::Connection);
    assert_eq!(Error::query("x").category(), ErrorCategory::Query);
    assert_eq!(Error::transaction("x").category(), ErrorCategory::Transaction);
    assert_eq!(
        Error::type_conversion("x").category(),
        ErrorCategory::TypeConversion
    );
    assert_eq!(Error::config("x").category(), ErrorCategory::Configuration);
    assert_eq!(Error::unsupported("x").category(), ErrorCategory::Other);
}

#[test]
fn test_query_error_keeps_sql() {
    let err = Error::query_with_sql("no such table: t", "SELECT * FROM t");
    assert_eq!(err.sql(), Some("SELECT * FROM t"));
    assert_eq!(err.to_string(), "query error: no such table: t");
}

#[test]
fn test_source_is_exposed() {
    use std::error::Error as _;

    let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
    let err = Error::connection_with_source("failed to connect", io);
    assert!(err.source().is_some());
}

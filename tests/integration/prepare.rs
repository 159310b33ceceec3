//! End-to-end checks of lazy backend preparation through a running proxy.

use mysql::prelude::*;

use crate::{get_proxy_config, should_run_integration_tests};

#[test]
fn test_simple_query_roundtrip() {
    if !should_run_integration_tests() {
        return;
    }

    let config = get_proxy_config();
    let mut conn = mysql::Conn::new(config.opts()).expect("connect through proxy");

    let value: Option<i64> = conn.query_first("SELECT 1").expect("query");
    assert_eq!(value, Some(1));
}

#[test]
fn test_session_variables_replayed_across_commands() {
    if !should_run_integration_tests() {
        return;
    }

    let config = get_proxy_config();
    let mut conn = mysql::Conn::new(config.opts()).expect("connect through proxy");

    // the proxy mirrors the assignment; with sharing enabled every later
    // command may land on a different backend, which must still see it
    conn.query_drop("SET SESSION sql_mode = 'STRICT_ALL_TABLES'")
        .expect("set session variable");

    for _ in 0..3 {
        let mode: Option<String> = conn
            .query_first("SELECT @@SESSION.sql_mode")
            .expect("read session variable");
        assert_eq!(mode, Some("STRICT_ALL_TABLES".to_string()));
    }
}

#[test]
fn test_schema_follows_client() {
    if !should_run_integration_tests() {
        return;
    }

    let config = get_proxy_config();
    let mut conn = mysql::Conn::new(config.opts()).expect("connect through proxy");

    conn.query_drop(format!("USE {}", config.database))
        .expect("change schema");

    let db: Option<String> = conn.query_first("SELECT DATABASE()").expect("query schema");
    assert_eq!(db, Some(config.database.clone()));
}

#[test]
fn test_transaction_pins_backend() {
    if !should_run_integration_tests() {
        return;
    }

    let config = get_proxy_config();
    let mut conn = mysql::Conn::new(config.opts()).expect("connect through proxy");

    conn.query_drop("START TRANSACTION").expect("begin");

    // both statements must observe the same backend connection
    let first: Option<i64> = conn.query_first("SELECT CONNECTION_ID()").expect("query");
    let second: Option<i64> = conn.query_first("SELECT CONNECTION_ID()").expect("query");
    assert_eq!(first, second);

    conn.query_drop("COMMIT").expect("commit");
}

//! Result-stream handlers for queries issued during backend preparation.
//!
//! Each handler consumes the resultset events of exactly one query and
//! condenses them into a [`HandlerOutcome`] the connector applies: a
//! failure to record, captured variables to commit, or a request to
//! disable connection sharing.

use tracing::{debug, warn};

use crate::protocol::resultset::ResultEvent;
use crate::protocol::ErrPacket;
use crate::session::variables::Value;

/// What a finished handler asks the connector to do
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    /// Failure to record on the connector
    pub failure: Option<ErrPacket>,
    /// Variables to commit into the session-variable store, in row order
    pub captured: Vec<(String, Value)>,
    /// Session state drifted untrackably; disable sharing
    pub state_changed: bool,
}

/// The three handler shapes used during preparation
#[derive(Debug)]
pub enum QueryHandler {
    /// Only interested in failure: statements whose success needs no
    /// inspection (`SET`, transaction characteristics)
    FailedQuery {
        stmt: String,
        failure: Option<ErrPacket>,
    },
    /// Expect a single row with a single field equal to `"1"`; any other
    /// shape is an error, a differing value yields `sentinel`
    IsTrue {
        sentinel: ErrPacket,
        row_count: u64,
        failure: Option<ErrPacket>,
    },
    /// Capture `(name, value)` rows into a buffer, committed only when the
    /// whole resultset arrived cleanly
    CaptureSysVars {
        buffered: Vec<(String, Value)>,
        something_failed: bool,
    },
}

impl QueryHandler {
    pub fn failed_query(stmt: impl Into<String>) -> Self {
        QueryHandler::FailedQuery {
            stmt: stmt.into(),
            failure: None,
        }
    }

    pub fn is_true(sentinel: ErrPacket) -> Self {
        QueryHandler::IsTrue {
            sentinel,
            row_count: 0,
            failure: None,
        }
    }

    pub fn capture_sys_vars() -> Self {
        QueryHandler::CaptureSysVars {
            buffered: Vec::new(),
            something_failed: false,
        }
    }

    /// Feed one resultset event. Events arrive in stream order; the
    /// terminal event is `RowEnd`, `Ok` or `Err`.
    pub fn on_event(&mut self, event: ResultEvent) {
        match self {
            QueryHandler::FailedQuery { stmt, failure } => {
                if let ResultEvent::Err(err) = event {
                    warn!(stmt = %stmt, error = %err, "Executing statement failed");
                    *failure = Some(err);
                }
            }
            QueryHandler::IsTrue {
                sentinel,
                row_count,
                failure,
            } => match event {
                ResultEvent::ColumnCount(count) => {
                    if count != 1 {
                        *failure = Some(ErrPacket::new(0, "HY000", "Too many columns"));
                    }
                }
                ResultEvent::Column => {}
                ResultEvent::Row(row) => {
                    *row_count += 1;

                    let Some(field) = row.fields.first() else {
                        *failure = Some(ErrPacket::new(0, "HY000", "No fields"));
                        return;
                    };

                    let Some(value) = field else {
                        *failure = Some(ErrPacket::new(0, "HY000", "Expected integer, got NULL"));
                        return;
                    };

                    if value != "1" {
                        *failure = Some(sentinel.clone());
                    }
                }
                ResultEvent::RowEnd => {
                    if *row_count != 1 {
                        *failure = Some(ErrPacket::new(0, "HY000", "Too many rows"));
                    }
                }
                ResultEvent::Ok(_) => {
                    *failure = Some(ErrPacket::new(0, "HY000", "Expected a resultset"));
                }
                ResultEvent::Err(err) => {
                    warn!(error = %err, "Condition query failed");
                    *failure = Some(err);
                }
            },
            QueryHandler::CaptureSysVars {
                buffered,
                something_failed,
            } => match event {
                ResultEvent::ColumnCount(count) => {
                    if count != 2 {
                        *something_failed = true;
                    }
                }
                ResultEvent::Column => {}
                ResultEvent::Row(row) => {
                    if *something_failed {
                        return;
                    }

                    let key = match row.fields.first() {
                        Some(Some(key)) => key.clone(),
                        _ => {
                            *something_failed = true;
                            return;
                        }
                    };

                    let value = match row.fields.get(1) {
                        Some(value) => Value::from(value.clone()),
                        None => {
                            *something_failed = true;
                            return;
                        }
                    };

                    buffered.push((key, value));
                }
                ResultEvent::RowEnd => {}
                ResultEvent::Ok(_) => {
                    // a resultset was expected; disable sharing
                    *something_failed = true;
                }
                ResultEvent::Err(err) => {
                    debug!(error = %err, "Fetching system variables failed");
                    *something_failed = true;
                }
            },
        }
    }

    /// Condense the consumed stream into its outcome
    pub fn finish(self) -> HandlerOutcome {
        match self {
            QueryHandler::FailedQuery { failure, .. } => HandlerOutcome {
                failure,
                ..HandlerOutcome::default()
            },
            QueryHandler::IsTrue { failure, .. } => HandlerOutcome {
                failure,
                ..HandlerOutcome::default()
            },
            QueryHandler::CaptureSysVars {
                buffered,
                something_failed,
            } => {
                if something_failed {
                    // do not commit partial state
                    HandlerOutcome {
                        state_changed: true,
                        ..HandlerOutcome::default()
                    }
                } else {
                    HandlerOutcome {
                        captured: buffered,
                        ..HandlerOutcome::default()
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::resultset::TextRow;
    use crate::protocol::OkPacket;

    fn sentinel() -> ErrPacket {
        ErrPacket::new(0, "HY000", "wait_for_my_writes timed out")
    }

    /// Run an IsTrue handler over a single-row, single-column resultset
    fn is_true_over(cell: Option<&str>) -> Option<ErrPacket> {
        let mut handler = QueryHandler::is_true(sentinel());
        handler.on_event(ResultEvent::ColumnCount(1));
        handler.on_event(ResultEvent::Column);
        handler.on_event(ResultEvent::Row(TextRow::new(vec![cell
            .map(|s| s.to_string())])));
        handler.on_event(ResultEvent::RowEnd);
        handler.finish().failure
    }

    #[test]
    fn test_is_true_single_cell_fixtures() {
        assert_eq!(is_true_over(Some("1")), None);
        assert_eq!(is_true_over(Some("0")), Some(sentinel()));
        assert_eq!(is_true_over(Some("2")), Some(sentinel()));
        assert_eq!(is_true_over(Some("")), Some(sentinel()));
        assert_eq!(
            is_true_over(None),
            Some(ErrPacket::new(0, "HY000", "Expected integer, got NULL"))
        );
    }

    #[test]
    fn test_is_true_wrong_column_count() {
        let mut handler = QueryHandler::is_true(sentinel());
        handler.on_event(ResultEvent::ColumnCount(2));
        let failure = handler.finish().failure.unwrap();
        assert_eq!(failure.error_message, "Too many columns");
    }

    #[test]
    fn test_is_true_no_rows() {
        let mut handler = QueryHandler::is_true(sentinel());
        handler.on_event(ResultEvent::ColumnCount(1));
        handler.on_event(ResultEvent::Column);
        handler.on_event(ResultEvent::RowEnd);
        let failure = handler.finish().failure.unwrap();
        assert_eq!(failure.error_message, "Too many rows");
    }

    #[test]
    fn test_is_true_two_rows() {
        let mut handler = QueryHandler::is_true(sentinel());
        handler.on_event(ResultEvent::ColumnCount(1));
        handler.on_event(ResultEvent::Column);
        let row = || ResultEvent::Row(TextRow::new(vec![Some("1".to_string())]));
        handler.on_event(row());
        handler.on_event(row());
        handler.on_event(ResultEvent::RowEnd);
        let failure = handler.finish().failure.unwrap();
        assert_eq!(failure.error_message, "Too many rows");
    }

    #[test]
    fn test_is_true_empty_row() {
        let mut handler = QueryHandler::is_true(sentinel());
        handler.on_event(ResultEvent::ColumnCount(1));
        handler.on_event(ResultEvent::Column);
        handler.on_event(ResultEvent::Row(TextRow::default()));
        handler.on_event(ResultEvent::RowEnd);
        let failure = handler.finish().failure.unwrap();
        assert_eq!(failure.error_message, "No fields");
    }

    #[test]
    fn test_failed_query_records_server_error() {
        let mut handler = QueryHandler::failed_query("SET @@SESSION.sql_mode = ''");
        handler.on_event(ResultEvent::Err(ErrPacket::new(
            1064,
            "42000",
            "syntax error",
        )));
        let outcome = handler.finish();
        assert_eq!(outcome.failure.unwrap().error_code, 1064);
    }

    #[test]
    fn test_failed_query_ignores_success() {
        let mut handler = QueryHandler::failed_query("SET @@SESSION.autocommit = 1");
        handler.on_event(ResultEvent::Ok(OkPacket::new()));
        assert!(handler.finish().failure.is_none());
    }

    #[test]
    fn test_capture_commits_in_row_order() {
        let mut handler = QueryHandler::capture_sys_vars();
        handler.on_event(ResultEvent::ColumnCount(2));
        handler.on_event(ResultEvent::Column);
        handler.on_event(ResultEvent::Column);
        handler.on_event(ResultEvent::Row(TextRow::new(vec![
            Some("collation_connection".to_string()),
            Some("utf8mb4_general_ci".to_string()),
        ])));
        handler.on_event(ResultEvent::Row(TextRow::new(vec![
            Some("sql_mode".to_string()),
            None,
        ])));
        handler.on_event(ResultEvent::RowEnd);

        let outcome = handler.finish();
        assert!(!outcome.state_changed);
        assert_eq!(outcome.captured.len(), 2);
        assert_eq!(outcome.captured[0].0, "collation_connection");
        assert_eq!(
            outcome.captured[0].1.as_str(),
            Some("utf8mb4_general_ci")
        );
        // a NULL value is captured as NULL, not dropped
        assert!(outcome.captured[1].1.is_null());
    }

    #[test]
    fn test_capture_wrong_column_count_discards_rows() {
        let mut handler = QueryHandler::capture_sys_vars();
        handler.on_event(ResultEvent::ColumnCount(3));
        handler.on_event(ResultEvent::Row(TextRow::new(vec![
            Some("a".to_string()),
            Some("b".to_string()),
            Some("c".to_string()),
        ])));
        handler.on_event(ResultEvent::RowEnd);

        let outcome = handler.finish();
        assert!(outcome.state_changed);
        assert!(outcome.captured.is_empty());
    }

    #[test]
    fn test_capture_null_key_discards_all() {
        let mut handler = QueryHandler::capture_sys_vars();
        handler.on_event(ResultEvent::ColumnCount(2));
        handler.on_event(ResultEvent::Row(TextRow::new(vec![
            Some("good".to_string()),
            Some("row".to_string()),
        ])));
        handler.on_event(ResultEvent::Row(TextRow::new(vec![
            None,
            Some("value".to_string()),
        ])));
        handler.on_event(ResultEvent::RowEnd);

        let outcome = handler.finish();
        assert!(outcome.state_changed);
        assert!(outcome.captured.is_empty());
    }

    #[test]
    fn test_capture_unexpected_ok_disables_sharing() {
        let mut handler = QueryHandler::capture_sys_vars();
        handler.on_event(ResultEvent::Ok(OkPacket::new()));
        let outcome = handler.finish();
        assert!(outcome.state_changed);
        assert!(outcome.failure.is_none());
    }
}

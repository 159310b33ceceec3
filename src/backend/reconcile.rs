//! Session-variable reconciliation: build the `SET @@SESSION.*` batch that
//! replays the client's known session state onto a backend.

use crate::session::variables::{
    SessionVariables, Value, STATEMENT_ID, TRACK_GTIDS, TRACK_STATE_CHANGE, TRACK_SYSTEM_VARIABLES,
    TRACK_TRANSACTION_INFO,
};

/// System variables captured from the backend when they are not yet known
/// client-side, in fetch order.
pub const FETCHED_SYS_VARS: [&str; 3] = ["collation_connection", "character_set_client", "sql_mode"];

fn push_assignment(stmt: &mut String, key: &str, value: &Value) {
    if stmt.is_empty() {
        stmt.push_str("SET ");
    } else {
        stmt.push_str(",\n    ");
    }

    stmt.push_str("@@SESSION.");
    stmt.push_str(key);
    stmt.push_str(" = ");
    stmt.push_str(&value.to_sql());
}

/// Emit the stored value, or `default` when the store has no usable value
fn push_stored_or(stmt: &mut String, vars: &SessionVariables, key: &str, default: &Value) {
    match vars.get_non_null(key) {
        Some(value) => push_assignment(stmt, key, value),
        None => push_assignment(stmt, key, default),
    }
}

/// Emit `default` only when the store has no usable value
fn push_if_not_set(stmt: &mut String, vars: &SessionVariables, key: &str, default: &Value) {
    if vars.get_non_null(key).is_none() {
        push_assignment(stmt, key, default);
    }
}

/// Build the one-statement `SET` batch for a backend.
///
/// When session trackers are needed, `session_track_system_variables` is
/// emitted first (forced to `'*'` unless the client chose a value) so the
/// server tracks every assignment that follows. `statement_id` is
/// proxy-internal and never replayed. Returns None when there is nothing
/// to set.
pub fn build_set_statement(vars: &SessionVariables, need_session_trackers: bool) -> Option<String> {
    let mut stmt = String::new();

    if need_session_trackers {
        push_stored_or(&mut stmt, vars, TRACK_SYSTEM_VARIABLES, &Value::from("*"));
    } else if let Some(value) = vars.get_non_null(TRACK_SYSTEM_VARIABLES) {
        // the client configured tracking explicitly; mirror its intent
        push_assignment(&mut stmt, TRACK_SYSTEM_VARIABLES, value);
    }

    for (key, value) in vars.iter() {
        // emitted first, above
        if key == TRACK_SYSTEM_VARIABLES {
            continue;
        }

        // read-only
        if key == STATEMENT_ID {
            continue;
        }

        push_assignment(&mut stmt, key, value);
    }

    if need_session_trackers {
        push_if_not_set(&mut stmt, vars, TRACK_GTIDS, &Value::from("OWN_GTID"));
        push_if_not_set(
            &mut stmt,
            vars,
            TRACK_TRANSACTION_INFO,
            &Value::from("CHARACTERISTICS"),
        );
        push_if_not_set(&mut stmt, vars, TRACK_STATE_CHANGE, &Value::from("ON"));
    }

    if stmt.is_empty() {
        None
    } else {
        Some(stmt)
    }
}

/// Build the query that captures still-unknown system variables, one
/// `SELECT '<name>', @@SESSION.`<name>`` per missing variable, UNIONed.
/// Returns None when every fetch target is already known.
pub fn build_fetch_sys_vars_statement(vars: &SessionVariables) -> Option<String> {
    let mut stmt = String::new();

    for name in FETCHED_SYS_VARS {
        if vars.contains(name) {
            continue;
        }

        if !stmt.is_empty() {
            stmt.push_str(" UNION ");
        }

        // single quotes on the label keep this ANSI_QUOTES safe
        stmt.push_str(&format!("SELECT '{name}', @@SESSION.`{name}`"));
    }

    if stmt.is_empty() {
        None
    } else {
        Some(stmt)
    }
}

/// Split a transaction-characteristics script at its first `;`.
///
/// Returns the head statement and leaves the remainder (one leading space
/// trimmed) in `script`; the script is drained when no separator is left.
pub fn split_trx_statement(script: &mut String) -> String {
    match script.find(';') {
        None => std::mem::take(script),
        Some(pos) => {
            let head = script[..pos].to_string();
            let mut rest = script[pos + 1..].to_string();
            if rest.starts_with(' ') {
                rest.remove(0);
            }
            *script = rest;
            head
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_store_no_trackers() {
        let vars = SessionVariables::new();
        assert_eq!(build_set_statement(&vars, false), None);
    }

    #[test]
    fn test_empty_store_with_trackers() {
        let vars = SessionVariables::new();
        let stmt = build_set_statement(&vars, true).unwrap();
        assert_eq!(
            stmt,
            "SET @@SESSION.session_track_system_variables = '*',\n    \
             @@SESSION.session_track_gtids = 'OWN_GTID',\n    \
             @@SESSION.session_track_transaction_info = 'CHARACTERISTICS',\n    \
             @@SESSION.session_track_state_change = 'ON'"
        );
    }

    #[test]
    fn test_trackers_first_and_statement_id_skipped() {
        let mut vars = SessionVariables::new();
        vars.set("sql_mode", Value::from("STRICT_ALL_TABLES"));
        vars.set("time_zone", Value::from("+00:00"));
        vars.set(STATEMENT_ID, Value::from("7"));

        let stmt = build_set_statement(&vars, true).unwrap();

        assert!(stmt.starts_with("SET @@SESSION.session_track_system_variables = '*',"));
        assert!(stmt.contains("@@SESSION.sql_mode = 'STRICT_ALL_TABLES'"));
        assert!(stmt.contains("@@SESSION.time_zone = '+00:00'"));
        assert!(!stmt.contains("statement_id"));
        assert!(stmt.contains("@@SESSION.session_track_gtids = 'OWN_GTID'"));
        assert!(stmt.contains("@@SESSION.session_track_transaction_info = 'CHARACTERISTICS'"));
        assert!(stmt.ends_with("@@SESSION.session_track_state_change = 'ON'"));
    }

    #[test]
    fn test_preset_tracker_not_defaulted() {
        let mut vars = SessionVariables::new();
        vars.set(TRACK_GTIDS, Value::from("ALL_GTIDS"));

        let stmt = build_set_statement(&vars, true).unwrap();

        // emitted once, from the store, not the default
        assert!(stmt.contains("@@SESSION.session_track_gtids = 'ALL_GTIDS'"));
        assert!(!stmt.contains("OWN_GTID"));
    }

    #[test]
    fn test_client_chosen_tracking_mirrored_without_trackers() {
        let mut vars = SessionVariables::new();
        vars.set(TRACK_SYSTEM_VARIABLES, Value::from("sql_mode"));
        vars.set("autocommit", Value::from("1"));

        let stmt = build_set_statement(&vars, false).unwrap();

        assert!(stmt.starts_with("SET @@SESSION.session_track_system_variables = 'sql_mode'"));
        assert!(stmt.contains("@@SESSION.autocommit = 1"));
        // no defaults appended without trackers
        assert!(!stmt.contains("OWN_GTID"));
    }

    #[test]
    fn test_fetch_statement_only_missing() {
        let mut vars = SessionVariables::new();
        vars.set("character_set_client", Value::from("utf8mb4"));

        let stmt = build_fetch_sys_vars_statement(&vars).unwrap();
        assert_eq!(
            stmt,
            "SELECT 'collation_connection', @@SESSION.`collation_connection` \
             UNION SELECT 'sql_mode', @@SESSION.`sql_mode`"
        );
    }

    #[test]
    fn test_fetch_statement_all_known() {
        let mut vars = SessionVariables::new();
        for name in FETCHED_SYS_VARS {
            vars.set(name, Value::from("x"));
        }
        assert_eq!(build_fetch_sys_vars_statement(&vars), None);
    }

    #[test]
    fn test_split_trx_statement() {
        let mut script =
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE; START TRANSACTION READ ONLY".to_string();

        let head = split_trx_statement(&mut script);
        assert_eq!(head, "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE");
        assert_eq!(script, "START TRANSACTION READ ONLY");

        let tail = split_trx_statement(&mut script);
        assert_eq!(tail, "START TRANSACTION READ ONLY");
        assert!(script.is_empty());
    }

    #[test]
    fn test_split_trims_single_leading_space() {
        let mut script = "A;  B".to_string();
        split_trx_statement(&mut script);
        // only one space is trimmed
        assert_eq!(script, " B");
    }
}

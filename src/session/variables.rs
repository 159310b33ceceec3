//! Client-side mirror of session variables.
//!
//! The store feeds backend preparation: every variable known here is
//! replayed onto a backend before the client's command is forwarded.

use std::collections::BTreeMap;

/// Read-only variable, maintained by the proxy itself. Never replayed in a
/// `SET` statement.
pub const STATEMENT_ID: &str = "statement_id";

/// Variables the session trackers need. `session_track_system_variables`
/// is forced when trackers are required; the others default only when the
/// client never set them.
pub const TRACK_SYSTEM_VARIABLES: &str = "session_track_system_variables";
pub const TRACK_GTIDS: &str = "session_track_gtids";
pub const TRACK_TRANSACTION_INFO: &str = "session_track_transaction_info";
pub const TRACK_STATE_CHANGE: &str = "session_track_state_change";

/// A session-variable value: SQL NULL or text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value(Option<String>);

impl Value {
    pub fn null() -> Self {
        Value(None)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Render as a SQL literal: `NULL`, a bare integer, or a
    /// single-quoted string with `'` doubled.
    pub fn to_sql(&self) -> String {
        match &self.0 {
            None => "NULL".to_string(),
            Some(text) if text.parse::<i64>().is_ok() => text.clone(),
            Some(text) => format!("'{}'", text.replace('\'', "''")),
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value(Some(text.to_string()))
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value(Some(text))
    }
}

impl From<Option<String>> for Value {
    fn from(text: Option<String>) -> Self {
        Value(text)
    }
}

/// Session-variable store: name -> value.
///
/// Backed by a BTreeMap so iteration order is deterministic (trace output
/// and the emitted `SET` statement are stable across runs).
#[derive(Debug, Clone, Default)]
pub struct SessionVariables {
    vars: BTreeMap<String, Value>,
}

impl SessionVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// A value that is present and not NULL
    pub fn get_non_null(&self, name: &str) -> Option<&Value> {
        self.vars.get(name).filter(|v| !v.is_null())
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }
}

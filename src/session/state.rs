//! Client-session state and statement tracking.
//!
//! The proxy watches the statements it forwards. `SET` assignments feed
//! the session-variable mirror that backend preparation replays;
//! transaction statements gate pooling and are remembered as the
//! characteristics a fresh backend has to restore.

use super::variables::Value;

/// Client session state
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Client username
    pub username: String,
    /// Current default schema
    pub schema: String,
    /// Whether the client is inside a transaction
    pub in_transaction: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// What a forwarded statement means for proxy-side tracking
#[derive(Debug, Clone, PartialEq)]
pub enum TrackedStatement {
    /// Session-variable assignments, in statement order
    SessionVars(Vec<(String, Value)>),
    /// Transaction characteristics to restore on fresh backends
    TrxCharacteristics(String),
    /// A transaction begins
    TransactionStart,
    /// A transaction ends
    TransactionEnd,
    /// Nothing to track
    Other,
}

/// Classify a statement for session tracking
pub fn track_statement(sql: &str) -> TrackedStatement {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();

    if upper.starts_with("SET TRANSACTION") {
        return TrackedStatement::TrxCharacteristics(trimmed.to_string());
    }

    if upper.starts_with("BEGIN") || upper.starts_with("START TRANSACTION") {
        return TrackedStatement::TransactionStart;
    }

    if upper.starts_with("COMMIT") || upper.starts_with("ROLLBACK") {
        return TrackedStatement::TransactionEnd;
    }

    if let Some(body) = strip_keyword(trimmed, "SET") {
        // SET NAMES / CHARACTER SET fan out into several variables
        // server-side; nothing we can mirror assignment-by-assignment
        let body_upper = body.to_uppercase();
        if body_upper.starts_with("NAMES") || body_upper.starts_with("CHARACTER SET") {
            return TrackedStatement::Other;
        }

        let mut vars = Vec::new();
        for part in split_assignments(body) {
            if let Some((name, value)) = parse_assignment(&part) {
                vars.push((name, value));
            }
        }

        if !vars.is_empty() {
            return TrackedStatement::SessionVars(vars);
        }
    }

    TrackedStatement::Other
}

/// Strip a leading keyword followed by whitespace, case-insensitively
fn strip_keyword<'a>(input: &'a str, keyword: &str) -> Option<&'a str> {
    if input.len() <= keyword.len() {
        return None;
    }
    let (head, tail) = input.split_at(keyword.len());
    if head.eq_ignore_ascii_case(keyword) && tail.starts_with(char::is_whitespace) {
        Some(tail.trim_start())
    } else {
        None
    }
}

/// Split `a = 1, b = 'x,y'` on commas outside quotes
fn split_assignments(body: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in body.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                ',' => {
                    parts.push(std::mem::take(&mut current));
                }
                _ => current.push(ch),
            },
        }
    }

    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

/// Parse one `name = value` assignment into a session-variable entry.
/// Global and user-variable assignments are not session state.
fn parse_assignment(part: &str) -> Option<(String, Value)> {
    let (name, value) = part.split_once('=')?;

    let mut name = name.trim();
    // strip the := of user-style assignment syntax
    name = name.strip_suffix(':').unwrap_or(name).trim();

    let lowered = name.to_lowercase();
    let name = if let Some(rest) = lowered.strip_prefix("@@session.") {
        rest.to_string()
    } else if let Some(rest) = strip_keyword(&lowered, "session") {
        rest.to_string()
    } else if let Some(rest) = lowered.strip_prefix("@@local.") {
        rest.to_string()
    } else if let Some(rest) = strip_keyword(&lowered, "local") {
        rest.to_string()
    } else if lowered.starts_with("@@global.") || strip_keyword(&lowered, "global").is_some() {
        return None;
    } else if lowered.starts_with('@') {
        // user variable
        return None;
    } else if let Some(rest) = lowered.strip_prefix("@@") {
        rest.to_string()
    } else {
        lowered
    };

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    Some((name, parse_value(value.trim())))
}

fn parse_value(value: &str) -> Value {
    if value.eq_ignore_ascii_case("null") || value.eq_ignore_ascii_case("default") {
        return Value::null();
    }

    for quote in ['\'', '"'] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            let inner = &value[1..value.len() - 1];
            return Value::from(inner.replace(&format!("{quote}{quote}"), &quote.to_string()));
        }
    }

    Value::from(value)
}

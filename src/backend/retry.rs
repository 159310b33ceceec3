//! Transient-error classification and retry knobs for backend connects.

use std::time::Duration;

use crate::protocol::ErrPacket;

/// Pause between connect attempts while the retry budget lasts
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

// Server-side conditions that clear up on their own
const ER_CON_COUNT_ERROR: u16 = 1040;
const ER_SERVER_SHUTDOWN: u16 = 1053;
const ER_NORMAL_SHUTDOWN: u16 = 1077;
const ER_SHUTDOWN_COMPLETE: u16 = 1079;
// Client-side conditions raised before or during the handshake
const CR_CONNECTION_ERROR: u16 = 2002;
const CR_CONN_HOST_ERROR: u16 = 2003;
const CR_SERVER_GONE_ERROR: u16 = 2006;
const CR_SERVER_LOST: u16 = 2013;

/// Whether a connect/handshake error is worth retrying within the
/// retry deadline.
///
/// Code 0 carries network-level failures that never reached the server.
pub fn connect_error_is_transient(err: &ErrPacket) -> bool {
    matches!(
        err.error_code,
        0 | ER_CON_COUNT_ERROR
            | ER_SERVER_SHUTDOWN
            | ER_NORMAL_SHUTDOWN
            | ER_SHUTDOWN_COMPLETE
            | CR_CONNECTION_ERROR
            | CR_CONN_HOST_ERROR
            | CR_SERVER_GONE_ERROR
            | CR_SERVER_LOST
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_codes() {
        assert!(connect_error_is_transient(&ErrPacket::new(
            1040,
            "08004",
            "Too many connections"
        )));
        assert!(connect_error_is_transient(&ErrPacket::new(
            2003,
            "HY000",
            "Can't connect to MySQL server"
        )));
        assert!(connect_error_is_transient(&ErrPacket::new(
            0,
            "HY000",
            "connection refused"
        )));
    }

    #[test]
    fn test_hard_errors_not_transient() {
        assert!(!connect_error_is_transient(&ErrPacket::access_denied()));
        assert!(!connect_error_is_transient(&ErrPacket::new(
            1049,
            "42000",
            "Unknown database"
        )));
    }
}

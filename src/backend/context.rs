//! Shared state the backend-preparation core reads and mutates.

use std::time::Duration;

use crate::protocol::handshake::Greeting;
use crate::protocol::packet::{capabilities, SEQ_NO_PRIOR_PACKET};
use crate::protocol::Packet;
use crate::router::ServerMode;
use crate::session::variables::SessionVariables;

/// What the proxy knows about the client channel itself, used when
/// per-user connection requirements are enforced
#[derive(Debug, Clone, Default)]
pub struct ClientChannelInfo {
    pub tls: bool,
    pub x509_issuer: Option<String>,
    pub x509_subject: Option<String>,
}

/// Client-side protocol view
#[derive(Debug, Clone, Default)]
pub struct ClientView {
    pub username: String,
    /// Known when the client authenticated against a configured account;
    /// a known password permits silent backend re-authentication.
    pub password: Option<String>,
    pub schema: String,
    /// Connection attributes the client sent during its handshake
    pub sent_attributes: Vec<(String, String)>,
    pub capabilities: u32,
    pub seq_id: u8,
    pub channel: ClientChannelInfo,
}

impl ClientView {
    pub fn multi_statements(&self) -> bool {
        self.capabilities & capabilities::CLIENT_MULTI_STATEMENTS != 0
    }
}

/// Server-side protocol view
#[derive(Debug, Clone)]
pub struct ServerView {
    /// Whether a backend socket is currently attached
    pub open: bool,
    /// The greeting received from the backend. Present means the channel
    /// has completed a handshake before (fresh sockets have none until the
    /// greeting exchange runs).
    pub greeting: Option<Greeting>,
    /// User the backend session is authenticated as
    pub username: String,
    pub schema: String,
    /// Connection attributes sent to this backend
    pub sent_attributes: Vec<(String, String)>,
    pub capabilities: u32,
    pub status_flags: u16,
    pub seq_id: u8,
}

impl Default for ServerView {
    fn default() -> Self {
        Self {
            open: false,
            greeting: None,
            username: String::new(),
            schema: String::new(),
            sent_attributes: Vec::new(),
            capabilities: 0,
            status_flags: 0,
            seq_id: SEQ_NO_PRIOR_PACKET,
        }
    }
}

impl ServerView {
    pub fn multi_statements(&self) -> bool {
        self.capabilities & capabilities::CLIENT_MULTI_STATEMENTS != 0
    }
}

/// Configuration snapshot preparation runs against
#[derive(Debug, Clone)]
pub struct PrepareSettings {
    pub connect_retry_timeout: Duration,
    pub connection_sharing: bool,
    pub router_require_enforce: bool,
}

impl Default for PrepareSettings {
    fn default() -> Self {
        Self {
            connect_retry_timeout: Duration::from_secs(7),
            connection_sharing: false,
            router_require_enforce: false,
        }
    }
}

/// Per-connection context shared between the session and the
/// backend-preparation core.
///
/// The core mutates it exclusively while active; the session reads it
/// between commands. It is never torn down by the core itself.
#[derive(Debug, Default)]
pub struct ConnectionContext {
    pub client: ClientView,
    pub server: ServerView,
    /// Session variables known client-side, replayed onto backends
    pub vars: SessionVariables,
    /// Statement sequence that rebuilds the current transaction state,
    /// as reported by the session tracker. Opaque to the core.
    pub trx_characteristics: Option<String>,
    pub authenticated: bool,
    pub expected_server_mode: ServerMode,
    /// The greeting the client saw was synthesized by the proxy rather
    /// than forwarded from a backend
    pub greeting_from_router: bool,
    /// Set when session state drifted in a way the proxy could not track;
    /// disables connection sharing for this session
    pub some_state_changed: bool,
    pub wait_for_my_writes: bool,
    /// Seconds; 0 means check visibility without waiting
    pub wait_for_my_writes_timeout_secs: u64,
    /// GTID set this client's reads must observe, empty when unknown
    pub gtid_at_least_executed: String,
    pub settings: PrepareSettings,
    /// Frame staged for the client, flushed on `SendToClient`
    pub pending_client_frame: Option<Packet>,
}

impl ConnectionContext {
    /// Sharing is on and nothing untrackable happened so far
    pub fn connection_sharing_possible(&self) -> bool {
        self.settings.connection_sharing && !self.some_state_changed
    }

    /// Session trackers must be active for sharing to work; only needed
    /// when the client's greeting came from the proxy
    pub fn need_session_trackers(&self) -> bool {
        self.settings.connection_sharing && self.greeting_from_router
    }

    /// Drop the server-side view after the socket moved elsewhere
    /// (pooled or closed)
    pub fn detach_server(&mut self) {
        self.server = ServerView::default();
        self.authenticated = false;
    }
}

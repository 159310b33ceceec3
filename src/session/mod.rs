//! Client-facing session: handshake, command loop, forwarding.
//!
//! A session authenticates the client against the configured accounts,
//! then relays commands. Backends are attached lazily: before a command
//! is forwarded, [`crate::backend::prepare`] brings a fresh or pooled
//! backend up to the client's session state. Between commands the backend
//! may be handed back to the shared pool when sharing is possible.

mod state;
pub mod variables;

pub use state::{track_statement, SessionState, TrackedStatement};
pub use variables::{SessionVariables, Value};

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, info_span, warn};

use crate::backend::context::{ClientView, ConnectionContext, PrepareSettings};
use crate::backend::{prepare, Splicer, WireDrivers};
use crate::config::{Config, UserConfig};
use crate::metrics::metrics;
use crate::pool::{BackendChannel, BackendPool, PooledBackend};
use crate::protocol::{
    capabilities, compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet,
    ClientCommand, Command, ErrPacket, Greeting, HandshakeResponse, Packet, PacketCodec,
};
use crate::router::Topology;

/// Handle a single client session
pub struct Session {
    /// Unique session ID
    pub id: u32,
    /// Session state
    pub state: SessionState,
    users: Arc<Vec<UserConfig>>,
    topology: Arc<Topology>,
    pool: Arc<BackendPool>,
    settings: PrepareSettings,
    wait_for_my_writes: bool,
    wait_for_my_writes_timeout_secs: u64,
}

impl Session {
    pub fn new(
        id: u32,
        config: &Config,
        users: Arc<Vec<UserConfig>>,
        topology: Arc<Topology>,
        pool: Arc<BackendPool>,
    ) -> Self {
        Self {
            id,
            state: SessionState::new(),
            users,
            topology,
            pool,
            settings: PrepareSettings {
                connect_retry_timeout: Duration::from_millis(
                    config.prepare.connect_retry_timeout_ms,
                ),
                connection_sharing: config.prepare.connection_sharing,
                router_require_enforce: config.prepare.router_require_enforce,
            },
            wait_for_my_writes: config.prepare.wait_for_my_writes,
            wait_for_my_writes_timeout_secs: config.prepare.wait_for_my_writes_timeout_secs,
        }
    }

    /// Run the session: authenticate the client, then relay commands
    pub async fn run<S>(mut self, client_stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = Framed::new(client_stream, PacketCodec);

        // Step 1: greet the client with a synthesized handshake
        let greeting = Greeting::for_client(self.id);
        let scramble = greeting.auth_plugin_data();
        client.send(greeting.encode()).await?;

        // Step 2: authenticate against the configured accounts
        let response_packet = client
            .next()
            .await
            .ok_or(SessionError::ClientDisconnected)??;

        let response = HandshakeResponse::parse(&response_packet.payload)
            .ok_or_else(|| SessionError::Protocol("Invalid handshake response".into()))?;

        debug!(
            session_id = self.id,
            username = %response.username,
            database = ?response.database,
            "Received handshake response"
        );

        let err_seq = response_packet.sequence_id.wrapping_add(1);
        let Some(user) = self
            .users
            .iter()
            .find(|user| user.name == response.username)
            .cloned()
        else {
            let err = ErrPacket::access_denied();
            client.send(err.encode(err_seq, response.capability_flags)).await?;
            return Ok(());
        };

        let expected = compute_auth_response(&user.password, &scramble);
        if expected != response.auth_response {
            warn!(session_id = self.id, username = %user.name, "Client authentication failed");

            let err = ErrPacket::access_denied();
            client.send(err.encode(err_seq, response.capability_flags)).await?;
            return Ok(());
        }

        self.state.username = response.username.clone();
        self.state.schema = response.database.clone().unwrap_or_default();

        // Step 3: the shared connection context both sides work against
        let mut ctx = ConnectionContext {
            client: ClientView {
                username: response.username.clone(),
                password: Some(user.password.clone()),
                schema: self.state.schema.clone(),
                sent_attributes: response.attributes.clone(),
                capabilities: response.capability_flags,
                seq_id: response_packet.sequence_id,
                channel: Default::default(),
            },
            settings: self.settings.clone(),
            wait_for_my_writes: self.wait_for_my_writes,
            wait_for_my_writes_timeout_secs: self.wait_for_my_writes_timeout_secs,
            greeting_from_router: true,
            ..Default::default()
        };

        let mut backend: Option<BackendChannel> = None;

        // Step 4: establish the first backend through the lazy connector;
        // its SendAuthOk answers the client's handshake
        let span = info_span!("client_handshake", session_id = self.id);
        let result = {
            let mut drivers = WireDrivers::new(
                Splicer {
                    client: &mut client,
                    backend: &mut backend,
                },
                &self.pool,
                &self.topology,
                &self.users,
                self.id,
            );
            prepare(&mut drivers, &mut ctx, true, Some(span)).await
        };

        match result {
            Err(err) => {
                metrics().record_prepare("error");
                warn!(session_id = self.id, error = %err, "Backend preparation failed");

                client.send(err.encode(err_seq, ctx.client.capabilities)).await?;
                return Ok(());
            }
            Ok(()) if !ctx.authenticated => {
                // preparation was cancelled; nothing usable to offer
                let err = ErrPacket::new(2013, "HY000", "Backend unavailable");
                client.send(err.encode(err_seq, ctx.client.capabilities)).await?;
                return Ok(());
            }
            Ok(()) => metrics().record_prepare("ok"),
        }

        info!(
            session_id = self.id,
            username = %self.state.username,
            "Client authenticated"
        );

        // Step 5: main command loop
        let result = self.command_loop(&mut client, &mut ctx, &mut backend).await;

        // hand a still-attached backend to the pool on the way out
        if ctx.server.open && ctx.connection_sharing_possible() && !self.state.in_transaction {
            self.pool_backend(&mut ctx, &mut backend).await;
        }

        result
    }

    /// Main command processing loop
    async fn command_loop<C>(
        &mut self,
        client: &mut Framed<C, PacketCodec>,
        ctx: &mut ConnectionContext,
        backend: &mut Option<BackendChannel>,
    ) -> Result<(), SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let packet = match client.next().await {
                Some(Ok(packet)) => packet,
                Some(Err(err)) => {
                    warn!(session_id = self.id, error = %err, "Client read error");
                    return Err(err.into());
                }
                None => {
                    info!(session_id = self.id, "Client disconnected");
                    return Ok(());
                }
            };

            ctx.client.seq_id = packet.sequence_id;

            let cmd = ClientCommand::parse(&packet.payload);
            debug!(session_id = self.id, command = ?cmd, "Received command");
            metrics().record_command(command_label(&cmd));

            if matches!(cmd, ClientCommand::Quit) {
                info!(session_id = self.id, "Client sent QUIT");
                return Ok(());
            }

            // attach a backend suited for this command
            if !ctx.server.open {
                ctx.expected_server_mode = self
                    .topology
                    .mode_for(cmd.is_read_only(), self.state.in_transaction);

                let result = {
                    let mut drivers = WireDrivers::new(
                        Splicer {
                            client: &mut *client,
                            backend: &mut *backend,
                        },
                        &self.pool,
                        &self.topology,
                        &self.users,
                        self.id,
                    );
                    prepare(&mut drivers, ctx, false, None).await
                };

                match result {
                    Ok(()) if ctx.authenticated => metrics().record_prepare("ok"),
                    Ok(()) => {
                        metrics().record_prepare("error");
                        let err = ErrPacket::new(2013, "HY000", "Backend unavailable");
                        client.send(err.encode(1, ctx.client.capabilities)).await?;
                        continue;
                    }
                    Err(err) => {
                        metrics().record_prepare("error");
                        warn!(session_id = self.id, error = %err, "Backend preparation failed");

                        client.send(err.encode(1, ctx.client.capabilities)).await?;
                        continue;
                    }
                }
            }

            // forward the command and relay its response
            let first_was_ok = match self.forward_command(client, ctx, backend, packet).await {
                Ok(ok) => ok,
                Err(err) => {
                    // the backend is gone; tell the client and give up
                    let notice = ErrPacket::new(2013, "HY000", "Lost connection to MySQL server");
                    let _ = client.send(notice.encode(1, ctx.client.capabilities)).await;
                    return Err(err);
                }
            };

            // state updates only after the backend accepted the command
            if first_was_ok {
                match &cmd {
                    ClientCommand::InitDb(db) => {
                        self.state.schema = db.clone();
                        ctx.client.schema = db.clone();
                        ctx.server.schema = db.clone();
                        debug!(session_id = self.id, schema = %self.state.schema, "Schema changed");
                    }
                    ClientCommand::Query(sql) => self.track_query(ctx, sql),
                    ClientCommand::ResetConnection => {
                        ctx.vars = SessionVariables::new();
                        ctx.trx_characteristics = None;
                        self.state.in_transaction = false;
                    }
                    _ => {}
                }
            }

            // between commands the backend can serve other sessions
            if !self.state.in_transaction && ctx.connection_sharing_possible() {
                self.pool_backend(ctx, backend).await;
            }
        }
    }

    /// Mirror the session-state effects of a successful statement
    fn track_query(&mut self, ctx: &mut ConnectionContext, sql: &str) {
        match track_statement(sql) {
            TrackedStatement::SessionVars(vars) => {
                for (name, value) in vars {
                    ctx.vars.set(name, value);
                }
            }
            TrackedStatement::TrxCharacteristics(stmt) => {
                ctx.trx_characteristics = Some(stmt);
            }
            TrackedStatement::TransactionStart => {
                self.state.in_transaction = true;
            }
            TrackedStatement::TransactionEnd => {
                self.state.in_transaction = false;
                ctx.trx_characteristics = None;
            }
            TrackedStatement::Other => {}
        }
    }

    /// Send one command to the backend and relay the response packets.
    /// Returns whether the first response packet was an OK.
    async fn forward_command<C>(
        &self,
        client: &mut Framed<C, PacketCodec>,
        ctx: &mut ConnectionContext,
        backend: &mut Option<BackendChannel>,
        packet: Packet,
    ) -> Result<bool, SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let result = async {
            let channel = backend.as_mut().ok_or(SessionError::BackendDisconnected)?;

            channel
                .send(packet)
                .await
                .map_err(|_| SessionError::BackendDisconnected)?;

            let backend_caps = ctx.server.capabilities;

            let first = channel
                .recv()
                .await
                .map_err(|_| SessionError::BackendDisconnected)?;
            let first_was_ok = is_ok_packet(&first.payload);

            if first_was_ok || is_err_packet(&first.payload) {
                client.send(first).await?;
                return Ok(first_was_ok);
            }

            // resultset: column definitions up to the first terminator
            client.send(first).await?;

            loop {
                let packet = channel
                    .recv()
                    .await
                    .map_err(|_| SessionError::BackendDisconnected)?;

                let is_end = is_ok_packet(&packet.payload)
                    || is_err_packet(&packet.payload)
                    || is_eof_packet(&packet.payload, backend_caps);

                client.send(packet).await?;

                if is_end {
                    break;
                }
            }

            // classic EOF framing: rows follow, up to a second terminator
            if backend_caps & capabilities::CLIENT_DEPRECATE_EOF == 0 {
                loop {
                    let packet = channel
                        .recv()
                        .await
                        .map_err(|_| SessionError::BackendDisconnected)?;

                    let is_end = is_ok_packet(&packet.payload)
                        || is_err_packet(&packet.payload)
                        || is_eof_packet(&packet.payload, backend_caps);

                    client.send(packet).await?;

                    if is_end {
                        break;
                    }
                }
            }

            Ok(first_was_ok)
        }
        .await;

        if matches!(result, Err(SessionError::BackendDisconnected)) {
            *backend = None;
            ctx.server.open = false;
        }

        result
    }

    /// Offer the attached backend to the pool; quit it when there is no room
    async fn pool_backend(
        &self,
        ctx: &mut ConnectionContext,
        backend: &mut Option<BackendChannel>,
    ) {
        let Some(channel) = backend.take() else {
            return;
        };

        let view = ctx.server.clone();
        match self.pool.put(PooledBackend::new(channel, view)).await {
            None => {
                debug!(session_id = self.id, "Backend returned to pool");
                metrics().record_backend_pooled("pooled");
            }
            Some(mut rejected) => {
                metrics().record_backend_pooled("full");
                let _ = rejected
                    .channel
                    .send(Packet::command(Command::Quit, &[]))
                    .await;
            }
        }

        ctx.detach_server();
    }
}

fn command_label(cmd: &ClientCommand) -> &'static str {
    match cmd {
        ClientCommand::Query(_) => "query",
        ClientCommand::InitDb(_) => "init_db",
        ClientCommand::Quit => "quit",
        ClientCommand::Ping => "ping",
        ClientCommand::ResetConnection => "reset_connection",
        ClientCommand::Unknown(..) => "other",
    }
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Backend disconnected")]
    BackendDisconnected,
}

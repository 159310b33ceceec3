//! Sub-exchange drivers for backend preparation.
//!
//! [`BackendDrivers`] is the contract the connector's invocations run
//! against; [`WireDrivers`] is the real implementation speaking the MySQL
//! protocol over the splicer's channels. Tests substitute scripted
//! implementations.

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::connector::ServerOption;
use super::context::{ConnectionContext, ServerView};
use super::handlers::{HandlerOutcome, QueryHandler};
use super::require::RequiredAttributes;
use crate::config::UserConfig;
use crate::pool::{BackendChannel, BackendPool, PooledBackend};
use crate::protocol::handshake::Greeting;
use crate::protocol::packet::capabilities;
use crate::protocol::resultset::{parse_column_count, parse_text_row, ResultEvent};
use crate::protocol::{
    compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet, Command, ErrPacket,
    HandshakeResponse, OkPacket, Packet, PacketCodec,
};
use crate::router::Topology;

/// The sub-exchanges the connector can request.
///
/// Every method mutates the shared context the way the exchange would be
/// observed: view updates, the `authenticated` flag, and the open flag on
/// socket loss. Server errors come back as the wire error triple.
pub trait BackendDrivers {
    /// Open a fresh backend socket or take a pooled one
    async fn connect(&mut self, ctx: &mut ConnectionContext) -> Result<(), ErrPacket>;
    /// Full greeting handshake on a fresh socket
    async fn server_greeting(
        &mut self,
        ctx: &mut ConnectionContext,
        in_handshake: bool,
    ) -> Result<(), ErrPacket>;
    /// Re-authenticate an existing socket as the client's user
    async fn change_user(
        &mut self,
        ctx: &mut ConnectionContext,
        in_handshake: bool,
    ) -> Result<(), ErrPacket>;
    /// Reset the session on a reused socket
    async fn reset_connection(&mut self, ctx: &mut ConnectionContext) -> Result<(), ErrPacket>;
    /// Toggle a protocol option
    async fn set_option(
        &mut self,
        ctx: &mut ConnectionContext,
        option: ServerOption,
    ) -> Result<(), ErrPacket>;
    /// Select the default schema
    async fn init_schema(
        &mut self,
        ctx: &mut ConnectionContext,
        schema: &str,
    ) -> Result<(), ErrPacket>;
    /// Execute one statement, streaming its result into `handler`
    async fn query(
        &mut self,
        ctx: &mut ConnectionContext,
        stmt: &str,
        handler: QueryHandler,
    ) -> HandlerOutcome;
    /// Close the backend gracefully
    async fn quit(&mut self, ctx: &mut ConnectionContext);
    /// Fetch the authenticated user's connection requirements
    async fn fetch_required_attrs(
        &mut self,
        ctx: &mut ConnectionContext,
    ) -> Option<RequiredAttributes>;
    /// Hand the backend to the pool; false when the pool refused it
    async fn pool_server_connection(&mut self, ctx: &mut ConnectionContext) -> bool;
    /// Flush a staged frame to the client
    async fn send_to_client(&mut self, frame: Packet) -> Result<(), ErrPacket>;

    /// Cancellable wait between connect retries; false when cancelled
    async fn wait(&mut self, delay: Duration) -> bool;
}

/// The I/O object holding both sides of a proxied connection
pub struct Splicer<'a, C> {
    pub client: &'a mut Framed<C, PacketCodec>,
    pub backend: &'a mut Option<BackendChannel>,
}

/// Real drivers: MySQL wire exchanges over the splicer's channels
pub struct WireDrivers<'a, C> {
    splicer: Splicer<'a, C>,
    pool: &'a BackendPool,
    topology: &'a Topology,
    users: &'a [UserConfig],
    session_id: u32,
}

/// Internal wire failure, split so callers can keep or drop the socket
enum WireError {
    Io(std::io::Error),
    Server(ErrPacket),
    Protocol(String),
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        WireError::Io(err)
    }
}

impl WireError {
    fn into_err_packet(self) -> ErrPacket {
        match self {
            // network-level failures never reached the server
            WireError::Io(err) => ErrPacket::new(
                2013,
                "HY000",
                &format!("Lost connection to MySQL server ({err})"),
            ),
            WireError::Server(err) => err,
            WireError::Protocol(msg) => ErrPacket::new(2027, "HY000", &msg),
        }
    }

    fn closes_socket(&self) -> bool {
        matches!(self, WireError::Io(_) | WireError::Protocol(_))
    }
}

impl<'a, C> WireDrivers<'a, C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        splicer: Splicer<'a, C>,
        pool: &'a BackendPool,
        topology: &'a Topology,
        users: &'a [UserConfig],
        session_id: u32,
    ) -> Self {
        Self {
            splicer,
            pool,
            topology,
            users,
            session_id,
        }
    }

    fn drop_backend(&mut self, ctx: &mut ConnectionContext) {
        *self.splicer.backend = None;
        ctx.server.open = false;
    }

    /// Apply a wire failure: drop the socket when it is unusable, and
    /// surface the error triple
    fn fail(&mut self, ctx: &mut ConnectionContext, err: WireError, auth_exchange: bool) -> ErrPacket {
        // a failed auth exchange leaves the channel in an undefined state
        if err.closes_socket() || auth_exchange {
            self.drop_backend(ctx);
        }
        err.into_err_packet()
    }

    /// Read the reply to an authentication exchange, answering
    /// mysql_native_password auth-switch requests along the way
    async fn read_auth_reply(
        channel: &mut BackendChannel,
        password: &str,
        caps: u32,
    ) -> Result<OkPacket, WireError> {
        let mut reply = channel.recv().await?;

        loop {
            if is_ok_packet(&reply.payload) {
                return OkPacket::parse(&reply.payload, caps)
                    .ok_or_else(|| WireError::Protocol("malformed OK packet".into()));
            }

            if is_err_packet(&reply.payload) {
                let err = ErrPacket::parse(&reply.payload, caps)
                    .unwrap_or_else(|| ErrPacket::new(2027, "HY000", "Malformed packet"));
                return Err(WireError::Server(err));
            }

            // auth-switch request: plugin name + fresh scramble
            if reply.payload.first() == Some(&0xFE) && reply.payload.len() > 1 {
                let body = &reply.payload[1..];
                let null_pos = body
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| WireError::Protocol("malformed auth-switch".into()))?;
                let plugin = String::from_utf8_lossy(&body[..null_pos]).to_string();
                if plugin != "mysql_native_password" {
                    return Err(WireError::Protocol(format!(
                        "unsupported auth plugin {plugin}"
                    )));
                }

                let mut scramble = &body[null_pos + 1..];
                if scramble.last() == Some(&0) {
                    scramble = &scramble[..scramble.len() - 1];
                }

                let auth = compute_auth_response(password, scramble);
                channel
                    .send(Packet::new(reply.sequence_id.wrapping_add(1), auth))
                    .await?;

                reply = channel.recv().await?;
                continue;
            }

            return Err(WireError::Protocol("unexpected auth reply".into()));
        }
    }

    async fn do_server_greeting(&mut self, ctx: &mut ConnectionContext) -> Result<(), WireError> {
        let channel = self
            .splicer
            .backend
            .as_mut()
            .ok_or_else(|| WireError::Protocol("no backend attached".into()))?;

        let greeting_packet = channel.recv().await?;
        let greeting = Greeting::parse(&greeting_packet.payload)
            .ok_or_else(|| WireError::Protocol("invalid backend greeting".into()))?;

        debug!(
            server_version = %greeting.server_version,
            addr = channel.addr(),
            "Received backend greeting"
        );

        let password = ctx.client.password.clone().unwrap_or_default();
        let auth_response = compute_auth_response(&password, &greeting.auth_plugin_data());

        let mut caps = capabilities::BASE_CAPABILITIES & greeting.capability_flags;
        if ctx.client.multi_statements() {
            caps |= capabilities::CLIENT_MULTI_STATEMENTS;
        }

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: 0x21,
            username: ctx.client.username.clone(),
            auth_response,
            database: None,
            auth_plugin_name: greeting.auth_plugin_name.clone(),
            attributes: ctx.client.sent_attributes.clone(),
        };

        channel
            .send(response.encode(greeting_packet.sequence_id.wrapping_add(1)))
            .await?;

        let ok = Self::read_auth_reply(channel, &password, caps).await?;

        ctx.server.greeting = Some(greeting);
        ctx.server.username = ctx.client.username.clone();
        ctx.server.sent_attributes = ctx.client.sent_attributes.clone();
        ctx.server.schema = String::new();
        ctx.server.capabilities = caps;
        ctx.server.status_flags = ok.status_flags;
        ctx.authenticated = true;

        Ok(())
    }

    async fn do_change_user(&mut self, ctx: &mut ConnectionContext) -> Result<(), WireError> {
        let greeting = ctx
            .server
            .greeting
            .clone()
            .ok_or_else(|| WireError::Protocol("change-user without greeting".into()))?;

        let channel = self
            .splicer
            .backend
            .as_mut()
            .ok_or_else(|| WireError::Protocol("no backend attached".into()))?;

        let password = ctx.client.password.clone().unwrap_or_default();
        let auth = compute_auth_response(&password, &greeting.auth_plugin_data());
        let caps = ctx.server.capabilities;

        let mut arg = BytesMut::new();
        arg.extend_from_slice(ctx.client.username.as_bytes());
        arg.put_u8(0);
        arg.put_u8(auth.len() as u8);
        arg.extend_from_slice(&auth);
        arg.extend_from_slice(ctx.client.schema.as_bytes());
        arg.put_u8(0);
        arg.put_u16_le(0x21); // charset
        if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
            arg.extend_from_slice(greeting.auth_plugin_name.as_bytes());
            arg.put_u8(0);
        }
        if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
            let mut attrs = BytesMut::new();
            for (key, value) in &ctx.client.sent_attributes {
                crate::protocol::packet::put_lenenc_str(&mut attrs, key.as_bytes());
                crate::protocol::packet::put_lenenc_str(&mut attrs, value.as_bytes());
            }
            crate::protocol::packet::put_lenenc_int(&mut arg, attrs.len() as u64);
            arg.extend_from_slice(&attrs);
        }

        channel
            .send(Packet::command(Command::ChangeUser, &arg))
            .await?;

        let ok = Self::read_auth_reply(channel, &password, caps).await?;

        ctx.server.username = ctx.client.username.clone();
        ctx.server.sent_attributes = ctx.client.sent_attributes.clone();
        ctx.server.schema = ctx.client.schema.clone();
        ctx.server.status_flags = ok.status_flags;
        ctx.authenticated = true;

        Ok(())
    }

    async fn do_simple_command(
        &mut self,
        ctx: &mut ConnectionContext,
        packet: Packet,
    ) -> Result<(), WireError> {
        let channel = self
            .splicer
            .backend
            .as_mut()
            .ok_or_else(|| WireError::Protocol("no backend attached".into()))?;

        channel.send(packet).await?;

        let reply = channel.recv().await?;
        ctx.server.seq_id = reply.sequence_id;

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload, ctx.server.capabilities)
                .unwrap_or_else(|| ErrPacket::new(2027, "HY000", "Malformed packet"));
            return Err(WireError::Server(err));
        }

        if is_ok_packet(&reply.payload) {
            if let Some(ok) = OkPacket::parse(&reply.payload, ctx.server.capabilities) {
                ctx.server.status_flags = ok.status_flags;
            }
            return Ok(());
        }

        // COM_SET_OPTION acknowledges with EOF on the classic protocol
        if is_eof_packet(&reply.payload, ctx.server.capabilities) {
            return Ok(());
        }

        Err(WireError::Protocol("unexpected command reply".into()))
    }

    async fn stream_result(
        channel: &mut BackendChannel,
        ctx: &mut ConnectionContext,
        handler: &mut QueryHandler,
    ) -> Result<(), WireError> {
        let caps = ctx.server.capabilities;

        let first = channel.recv().await?;
        ctx.server.seq_id = first.sequence_id;

        if is_ok_packet(&first.payload) {
            let ok = OkPacket::parse(&first.payload, caps)
                .ok_or_else(|| WireError::Protocol("malformed OK packet".into()))?;
            ctx.server.status_flags = ok.status_flags;
            handler.on_event(ResultEvent::Ok(ok));
            return Ok(());
        }

        if is_err_packet(&first.payload) {
            let err = ErrPacket::parse(&first.payload, caps)
                .unwrap_or_else(|| ErrPacket::new(2027, "HY000", "Malformed packet"));
            handler.on_event(ResultEvent::Err(err));
            return Ok(());
        }

        let count = parse_column_count(&first.payload)
            .ok_or_else(|| WireError::Protocol("invalid column count".into()))?;
        handler.on_event(ResultEvent::ColumnCount(count));

        // column definitions up to the EOF that closes them
        loop {
            let packet = channel.recv().await?;
            ctx.server.seq_id = packet.sequence_id;

            if is_eof_packet(&packet.payload, caps) {
                break;
            }
            if is_err_packet(&packet.payload) {
                let err = ErrPacket::parse(&packet.payload, caps)
                    .unwrap_or_else(|| ErrPacket::new(2027, "HY000", "Malformed packet"));
                handler.on_event(ResultEvent::Err(err));
                return Ok(());
            }

            handler.on_event(ResultEvent::Column);
        }

        // rows up to the terminal EOF or ERR
        loop {
            let packet = channel.recv().await?;
            ctx.server.seq_id = packet.sequence_id;

            if is_eof_packet(&packet.payload, caps) {
                handler.on_event(ResultEvent::RowEnd);
                return Ok(());
            }
            if is_err_packet(&packet.payload) {
                let err = ErrPacket::parse(&packet.payload, caps)
                    .unwrap_or_else(|| ErrPacket::new(2027, "HY000", "Malformed packet"));
                handler.on_event(ResultEvent::Err(err));
                return Ok(());
            }

            let row = parse_text_row(&packet.payload)
                .ok_or_else(|| WireError::Protocol("malformed row packet".into()))?;
            handler.on_event(ResultEvent::Row(row));
        }
    }
}

impl<'a, C> BackendDrivers for WireDrivers<'a, C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    async fn connect(&mut self, ctx: &mut ConnectionContext) -> Result<(), ErrPacket> {
        let target = self.topology.select(ctx.expected_server_mode, self.session_id);
        let addr = target.addr();

        if let Some(pooled) = self.pool.get(&addr).await {
            debug!(addr = %addr, "Attached pooled backend");

            *self.splicer.backend = Some(pooled.channel);
            ctx.server = pooled.view;
            ctx.server.open = true;
            return Ok(());
        }

        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                debug!(addr = %addr, "Connected to backend");

                *self.splicer.backend = Some(BackendChannel::new(stream, addr));
                ctx.server = ServerView::default();
                ctx.server.open = true;
                Ok(())
            }
            Err(err) => {
                warn!(addr = %addr, error = %err, "Backend connect failed");

                Err(ErrPacket::new(
                    2003,
                    "HY000",
                    &format!("Can't connect to MySQL server on '{addr}' ({err})"),
                ))
            }
        }
    }

    async fn server_greeting(
        &mut self,
        ctx: &mut ConnectionContext,
        _in_handshake: bool,
    ) -> Result<(), ErrPacket> {
        match self.do_server_greeting(ctx).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(ctx, err, true)),
        }
    }

    async fn change_user(
        &mut self,
        ctx: &mut ConnectionContext,
        _in_handshake: bool,
    ) -> Result<(), ErrPacket> {
        match self.do_change_user(ctx).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(ctx, err, true)),
        }
    }

    async fn reset_connection(&mut self, ctx: &mut ConnectionContext) -> Result<(), ErrPacket> {
        match self
            .do_simple_command(ctx, Packet::command(Command::ResetConnection, &[]))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(ctx, err, true)),
        }
    }

    async fn set_option(
        &mut self,
        ctx: &mut ConnectionContext,
        option: ServerOption,
    ) -> Result<(), ErrPacket> {
        let value: u16 = match option {
            ServerOption::MultiStatementsOn => 0,
            ServerOption::MultiStatementsOff => 1,
        };

        match self
            .do_simple_command(
                ctx,
                Packet::command(Command::SetOption, &value.to_le_bytes()),
            )
            .await
        {
            Ok(()) => {
                match option {
                    ServerOption::MultiStatementsOn => {
                        ctx.server.capabilities |= capabilities::CLIENT_MULTI_STATEMENTS;
                    }
                    ServerOption::MultiStatementsOff => {
                        ctx.server.capabilities &= !capabilities::CLIENT_MULTI_STATEMENTS;
                    }
                }
                Ok(())
            }
            Err(err) => Err(self.fail(ctx, err, false)),
        }
    }

    async fn init_schema(
        &mut self,
        ctx: &mut ConnectionContext,
        schema: &str,
    ) -> Result<(), ErrPacket> {
        match self
            .do_simple_command(ctx, Packet::command(Command::InitDb, schema.as_bytes()))
            .await
        {
            Ok(()) => {
                ctx.server.schema = schema.to_string();
                Ok(())
            }
            Err(err) => Err(self.fail(ctx, err, false)),
        }
    }

    async fn query(
        &mut self,
        ctx: &mut ConnectionContext,
        stmt: &str,
        mut handler: QueryHandler,
    ) -> HandlerOutcome {
        let result = match self.splicer.backend.as_mut() {
            None => Err(WireError::Protocol("no backend attached".into())),
            Some(channel) => {
                match channel
                    .send(Packet::command(Command::Query, stmt.as_bytes()))
                    .await
                {
                    Ok(()) => Self::stream_result(channel, ctx, &mut handler).await,
                    Err(err) => Err(err.into()),
                }
            }
        };

        if let Err(err) = result {
            let err = self.fail(ctx, err, false);
            handler.on_event(ResultEvent::Err(err));
        }

        handler.finish()
    }

    async fn quit(&mut self, ctx: &mut ConnectionContext) {
        if let Some(channel) = self.splicer.backend.as_mut() {
            let _ = channel.send(Packet::command(Command::Quit, &[])).await;
        }

        *self.splicer.backend = None;
        ctx.detach_server();
    }

    async fn fetch_required_attrs(
        &mut self,
        ctx: &mut ConnectionContext,
    ) -> Option<RequiredAttributes> {
        self.users
            .iter()
            .find(|user| user.name == ctx.client.username)
            .map(|user| RequiredAttributes::from(&user.require))
    }

    async fn pool_server_connection(&mut self, ctx: &mut ConnectionContext) -> bool {
        let Some(channel) = self.splicer.backend.take() else {
            return false;
        };

        let view = ctx.server.clone();
        match self.pool.put(PooledBackend::new(channel, view)).await {
            None => {
                ctx.detach_server();
                true
            }
            Some(rejected) => {
                // leave the socket attached so quit() can close it
                *self.splicer.backend = Some(rejected.channel);
                false
            }
        }
    }

    async fn send_to_client(&mut self, frame: Packet) -> Result<(), ErrPacket> {
        self.splicer.client.send(frame).await.map_err(|err| {
            ErrPacket::new(0, "HY000", &format!("client connection lost ({err})"))
        })
    }

    async fn wait(&mut self, delay: Duration) -> bool {
        // the runtime cancels by aborting the session task; the sleep
        // itself runs to completion
        tokio::time::sleep(delay).await;
        true
    }
}

//! The lazy-connect state machine.
//!
//! Before a client command is forwarded, the connector walks a backend
//! channel through connect, authentication, session-variable replay,
//! option/schema alignment, replication-visibility checks and transaction
//! restoration until the backend is observationally equivalent to the
//! client's session.
//!
//! The machine is cooperative and pull-based: [`LazyConnector::process`]
//! inspects the shared [`ConnectionContext`] and returns a [`Step`]. The
//! driver loop executes any requested sub-exchange, reports the result via
//! [`LazyConnector::complete`], and re-enters `process()`. Nothing here
//! performs I/O.

use std::time::Duration;

// tokio's Instant so timer-driven tests can run on paused time
use tokio::time::Instant;
use tracing::{debug_span, field, Span};

use super::context::ConnectionContext;
use super::handlers::{HandlerOutcome, QueryHandler};
use super::reconcile;
use super::require::{self, RequiredAttributes};
use super::retry::{connect_error_is_transient, CONNECT_RETRY_INTERVAL};
use super::trace;
use crate::protocol::{ErrPacket, OkPacket, SEQ_NO_PRIOR_PACKET};
use crate::router::ServerMode;
use crate::session::variables::STATEMENT_ID;

/// Preparation stages. `*Done` stages exist to observe the completion of
/// the sub-exchange their predecessor requested; predecessors skip them
/// when no work is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Connect,
    Connected,
    Authenticated,
    SetVars,
    SetVarsDone,
    SetServerOption,
    SetServerOptionDone,
    FetchSysVars,
    FetchSysVarsDone,
    SetSchema,
    SetSchemaDone,
    WaitGtidExecuted,
    WaitGtidExecutedDone,
    SetTrxCharacteristics,
    SetTrxCharacteristicsDone,
    FetchUserAttrs,
    FetchUserAttrsDone,
    SendAuthOk,
    PoolOrClose,
    FallbackToWrite,
    Done,
}

/// COM_SET_OPTION argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOption {
    MultiStatementsOn,
    MultiStatementsOff,
}

/// A sub-exchange the driver loop must run before re-entering the machine
#[derive(Debug)]
pub enum Invocation {
    /// Open a fresh backend socket or take one from the pool
    Connect,
    /// Full greeting handshake on a fresh socket
    ServerGreeting { in_handshake: bool },
    /// Re-authenticate an already-connected socket
    ChangeUser { in_handshake: bool },
    /// Reset the session on a reused socket with matching identity
    ResetConnection,
    /// Align the multi-statements protocol option
    SetOption(ServerOption),
    /// Select the default schema
    InitSchema(String),
    /// Run one statement, streaming its result into `handler`
    Query { stmt: String, handler: QueryHandler },
    /// Return the backend to the pool, or quit it if the pool is full
    PoolOrClose,
    /// Fetch the authenticated user's connection requirements
    FetchRequiredAttrs,
}

/// Result of one sub-exchange, fed back through [`LazyConnector::complete`]
#[derive(Debug)]
pub enum Completion {
    Connect(Result<(), ErrPacket>),
    ServerGreeting(Result<(), ErrPacket>),
    ChangeUser(Result<(), ErrPacket>),
    ResetConnection(Result<(), ErrPacket>),
    SetOption(Result<(), ErrPacket>),
    InitSchema(Result<(), ErrPacket>),
    Query(HandlerOutcome),
    /// Whether the backend was accepted by the pool (false: it was quit)
    Pooled(bool),
    RequiredAttrs(Option<RequiredAttributes>),
}

/// What the driver loop should do next
#[derive(Debug)]
pub enum Step {
    /// Re-enter `process()` immediately
    Again,
    /// Run the sub-exchange, call `complete()`, then re-enter
    Invoke(Invocation),
    /// Wait (cancellable), then re-enter
    Suspend(Duration),
    /// Flush the staged client frame, then re-enter
    SendToClient,
    /// Preparation finished; do not re-enter
    Done,
}

/// Open a stage span parented to the connector's outer span
macro_rules! child_span {
    ($self:ident, $name:literal) => {
        Some(debug_span!(
            parent: $self.connect_span.as_ref().and_then(Span::id),
            $name,
            otel.status_code = field::Empty
        ))
    };
}

/// The lazy-connect state machine. One instance prepares one backend for
/// one client command (or for the initial handshake).
pub struct LazyConnector {
    stage: Stage,
    in_handshake: bool,
    started: Instant,

    /// Failure recorded during reconciliation, surfaced once at Done
    failed: Option<ErrPacket>,
    /// The error reported upward, set at most once
    reported: Option<ErrPacket>,

    retry_connect: bool,
    already_fallback: bool,

    /// Transaction-characteristics script still to replay
    trx_stmt: String,
    /// Result of the required-attributes fetch
    required_attrs: Option<RequiredAttributes>,

    parent_span: Option<Span>,
    connect_span: Option<Span>,
    authenticate_span: Option<Span>,
    set_vars_span: Option<Span>,
    fetch_sys_vars_span: Option<Span>,
    set_schema_span: Option<Span>,
    wait_gtid_span: Option<Span>,
    trx_span: Option<Span>,
}

impl LazyConnector {
    pub fn new(in_handshake: bool, parent_span: Option<Span>) -> Self {
        Self {
            stage: Stage::Connect,
            in_handshake,
            started: Instant::now(),
            failed: None,
            reported: None,
            retry_connect: false,
            already_fallback: false,
            trx_stmt: String::new(),
            required_attrs: None,
            parent_span,
            connect_span: None,
            authenticate_span: None,
            set_vars_span: None,
            fetch_sys_vars_span: None,
            set_schema_span: None,
            wait_gtid_span: None,
            trx_span: None,
        }
    }

    /// Advance the machine by one stage
    pub fn process(&mut self, ctx: &mut ConnectionContext) -> Step {
        match self.stage {
            Stage::Connect => self.connect(ctx),
            Stage::Connected => self.connected(ctx),
            Stage::Authenticated => self.authenticated(ctx),
            Stage::SetVars => self.set_vars(ctx),
            Stage::SetVarsDone => self.set_vars_done(),
            Stage::SetServerOption => self.set_server_option(ctx),
            Stage::SetServerOptionDone => self.set_server_option_done(),
            Stage::FetchSysVars => self.fetch_sys_vars(ctx),
            Stage::FetchSysVarsDone => self.fetch_sys_vars_done(),
            Stage::SetSchema => self.set_schema(ctx),
            Stage::SetSchemaDone => self.set_schema_done(),
            Stage::WaitGtidExecuted => self.wait_gtid_executed(ctx),
            Stage::WaitGtidExecutedDone => self.wait_gtid_executed_done(),
            Stage::SetTrxCharacteristics => self.set_trx_characteristics(),
            Stage::SetTrxCharacteristicsDone => self.set_trx_characteristics_done(),
            Stage::FetchUserAttrs => self.fetch_user_attrs(ctx),
            Stage::FetchUserAttrsDone => self.fetch_user_attrs_done(ctx),
            Stage::SendAuthOk => self.send_auth_ok(ctx),
            Stage::PoolOrClose => self.pool_or_close(),
            Stage::FallbackToWrite => self.fallback_to_write(ctx),
            Stage::Done => self.done(ctx),
        }
    }

    /// Feed back the result of a requested sub-exchange
    pub fn complete(&mut self, completion: Completion, ctx: &mut ConnectionContext) {
        match completion {
            Completion::Connect(Ok(())) => {}
            Completion::Connect(Err(err)) => self.report(err),

            Completion::ServerGreeting(Ok(())) => {}
            Completion::ServerGreeting(Err(err)) => {
                // Retry quietly only while the error is transient, the
                // deadline has not passed, and re-running the handshake
                // cannot confuse the client (password known, or the
                // greeting never arrived).
                if connect_error_is_transient(&err)
                    && (ctx.client.password.is_some() || ctx.server.greeting.is_none())
                    && self.started.elapsed() < ctx.settings.connect_retry_timeout
                {
                    self.retry_connect = true;
                } else {
                    self.report(err);
                }
            }

            Completion::ChangeUser(Ok(())) => {}
            Completion::ChangeUser(Err(err)) => self.report(err),

            Completion::ResetConnection(Ok(())) => {}
            Completion::ResetConnection(Err(err)) => {
                ctx.authenticated = false;
                self.report(err);
            }

            Completion::SetOption(Ok(())) | Completion::InitSchema(Ok(())) => {}
            Completion::SetOption(Err(err)) | Completion::InitSchema(Err(err)) => {
                self.failed = Some(err);
            }

            Completion::Query(outcome) => {
                if let Some(err) = outcome.failure {
                    self.failed = Some(err);
                }
                for (key, value) in outcome.captured {
                    ctx.vars.set(key, value);
                }
                if outcome.state_changed {
                    ctx.some_state_changed = true;
                }
            }

            Completion::Pooled(still_open) => {
                if still_open {
                    trace::stage("connect::pooled");
                } else {
                    trace::stage("connect::pool_full");
                }
            }

            Completion::RequiredAttrs(attrs) => self.required_attrs = attrs,
        }
    }

    /// Resume after a cancelled suspend: finish without further work
    pub fn cancel(&mut self) {
        self.stage = Stage::Done;
    }

    /// The error to surface upward, if preparation failed
    pub fn take_error(&mut self) -> Option<ErrPacket> {
        self.reported.take()
    }

    fn report(&mut self, err: ErrPacket) {
        if self.reported.is_none() {
            self.reported = Some(err);
        }
    }

    fn connect(&mut self, ctx: &mut ConnectionContext) -> Step {
        trace::stage("connect::connect");

        self.connect_span = Some(debug_span!(
            parent: self.parent_span.as_ref().and_then(Span::id),
            "mysql/prepare_server_connection",
            otel.status_code = field::Empty
        ));

        if !ctx.server.open {
            self.stage = Stage::Connected;
            // a fresh socket or one from the pool
            Step::Invoke(Invocation::Connect)
        } else {
            // a backend is already attached, nothing to prepare
            self.stage = Stage::Done;
            Step::Again
        }
    }

    /// Decide the handshake flavor for the attached socket
    fn connected(&mut self, ctx: &mut ConnectionContext) -> Step {
        if !ctx.server.open {
            trace::stage("connect::not_connected");

            // the connect failed; its error is already reported
            self.stage = Stage::Done;
            return Step::Again;
        }

        self.authenticate_span = child_span!(self, "mysql/authenticate");

        // Grab the transaction characteristics before any SET retargets
        // the backend's session tracker.
        if let Some(trx) = &ctx.trx_characteristics {
            self.trx_stmt = trx.clone();
        }

        if ctx.server.greeting.is_some() {
            let same_user = ctx.client.username == ctx.server.username;
            let same_attrs = ctx.client.sent_attributes == ctx.server.sent_attributes;

            if !self.in_handshake && same_user && same_attrs {
                // Identity matches: a session reset suffices. A schema
                // mismatch is fine, set_schema() reconciles it later.
                trace::span_attr(
                    &self.authenticate_span,
                    "mysql.remote.needs_full_handshake",
                    false,
                );

                ctx.authenticated = true;
                self.stage = Stage::Authenticated;
                Step::Invoke(Invocation::ResetConnection)
            } else {
                trace::span_attr(
                    &self.authenticate_span,
                    "mysql.remote.needs_full_handshake",
                    true,
                );
                trace::span_attr(
                    &self.authenticate_span,
                    "mysql.remote.username_differs",
                    !same_user,
                );
                trace::span_attr(
                    &self.authenticate_span,
                    "mysql.remote.connection_attributes_differ",
                    !same_attrs,
                );

                self.stage = Stage::Authenticated;
                Step::Invoke(Invocation::ChangeUser {
                    in_handshake: self.in_handshake,
                })
            }
        } else {
            trace::span_attr(
                &self.authenticate_span,
                "mysql.remote.needs_full_handshake",
                true,
            );

            self.stage = Stage::Authenticated;
            Step::Invoke(Invocation::ServerGreeting {
                in_handshake: self.in_handshake,
            })
        }
    }

    fn authenticated(&mut self, ctx: &mut ConnectionContext) -> Step {
        if !ctx.authenticated || !ctx.server.open {
            trace::stage("connect::authenticate::error");
            trace::span_end_err(&mut self.authenticate_span);

            if self.retry_connect {
                self.retry_connect = false;

                self.stage = Stage::Connect;
                return Step::Suspend(CONNECT_RETRY_INTERVAL);
            }

            self.stage = Stage::Done;
            return Step::Again;
        }

        trace::stage("connect::authenticate::ok");
        trace::span_end(&mut self.authenticate_span);

        self.stage = Stage::SetVars;
        Step::Again
    }

    fn set_vars(&mut self, ctx: &mut ConnectionContext) -> Step {
        let need_trackers = ctx.need_session_trackers();

        match reconcile::build_set_statement(&ctx.vars, need_trackers) {
            Some(stmt) => {
                self.stage = Stage::SetVarsDone;

                trace::stage("connect::set_var");
                self.set_vars_span = child_span!(self, "mysql/set_var");

                for (key, value) in ctx.vars.iter() {
                    if key == STATEMENT_ID {
                        continue;
                    }

                    let attr = format!("mysql.session.@@SESSION.{key}");
                    match value.as_str() {
                        Some(text) => trace::span_attr(&self.set_vars_span, &attr, text),
                        None => trace::span_attr(&self.set_vars_span, &attr, "NULL"),
                    }
                }

                Step::Invoke(Invocation::Query {
                    handler: QueryHandler::failed_query(stmt.clone()),
                    stmt,
                })
            }
            None => {
                self.stage = Stage::SetServerOption;
                Step::Again
            }
        }
    }

    fn set_vars_done(&mut self) -> Step {
        trace::span_end(&mut self.set_vars_span);
        trace::stage("connect::set_var::done");

        self.stage = Stage::SetServerOption;
        Step::Again
    }

    fn set_server_option(&mut self, ctx: &mut ConnectionContext) -> Step {
        let client_multi = ctx.client.multi_statements();

        if client_multi == ctx.server.multi_statements() {
            self.stage = Stage::FetchSysVars;
            return Step::Again;
        }

        trace::stage("connect::set_server_option");

        self.stage = Stage::SetServerOptionDone;
        Step::Invoke(Invocation::SetOption(if client_multi {
            ServerOption::MultiStatementsOn
        } else {
            ServerOption::MultiStatementsOff
        }))
    }

    fn set_server_option_done(&mut self) -> Step {
        if self.failed.is_some() {
            trace::stage("connect::set_server_option::failed");
            self.stage = Stage::Done;
        } else {
            trace::stage("connect::set_server_option::done");
            self.stage = Stage::FetchSysVars;
        }

        Step::Again
    }

    fn fetch_sys_vars(&mut self, ctx: &mut ConnectionContext) -> Step {
        let stmt = if ctx.connection_sharing_possible() {
            // capture the sys-vars that aren't known yet
            reconcile::build_fetch_sys_vars_statement(&ctx.vars)
        } else {
            None
        };

        match stmt {
            Some(stmt) => {
                trace::stage("connect::fetch_sys_vars");
                self.fetch_sys_vars_span = child_span!(self, "mysql/fetch_sys_vars");

                self.stage = Stage::FetchSysVarsDone;
                Step::Invoke(Invocation::Query {
                    handler: QueryHandler::capture_sys_vars(),
                    stmt,
                })
            }
            None => {
                self.stage = Stage::SetSchema;
                Step::Again
            }
        }
    }

    fn fetch_sys_vars_done(&mut self) -> Step {
        trace::span_end(&mut self.fetch_sys_vars_span);
        trace::stage("connect::fetch_sys_vars::done");

        self.stage = Stage::SetSchema;
        Step::Again
    }

    fn set_schema(&mut self, ctx: &mut ConnectionContext) -> Step {
        let client_schema = &ctx.client.schema;

        if !client_schema.is_empty() && *client_schema != ctx.server.schema {
            trace::stage("connect::set_schema");
            self.set_schema_span = child_span!(self, "mysql/set_schema");

            self.stage = Stage::SetSchemaDone;
            Step::Invoke(Invocation::InitSchema(client_schema.clone()))
        } else {
            self.stage = Stage::WaitGtidExecuted; // skip set_schema_done
            Step::Again
        }
    }

    fn set_schema_done(&mut self) -> Step {
        trace::span_end(&mut self.set_schema_span);

        if self.failed.is_some() {
            trace::stage("connect::set_schema::failed");

            self.stage = Stage::Done;
            return Step::Again;
        }

        trace::stage("connect::set_schema::done");

        self.stage = Stage::WaitGtidExecuted;
        Step::Again
    }

    /// Before reading from a replica, make sure the client's own writes
    /// are visible there
    fn wait_gtid_executed(&mut self, ctx: &mut ConnectionContext) -> Step {
        // skip wait_gtid_executed_done if we didn't wait
        self.stage = Stage::SetTrxCharacteristics;

        if ctx.wait_for_my_writes && ctx.expected_server_mode == ServerMode::ReadOnly {
            let gtid = ctx.gtid_at_least_executed.clone();
            if !gtid.is_empty() {
                trace::stage("connect::wait_gtid");
                self.wait_gtid_span = child_span!(self, "mysql/wait_gtid_executed");

                self.stage = Stage::WaitGtidExecutedDone;

                let quoted = gtid.replace('\'', "''");
                let timeout = ctx.wait_for_my_writes_timeout_secs;
                let stmt = if timeout == 0 {
                    format!("SELECT GTID_SUBSET('{quoted}', @@GLOBAL.gtid_executed)")
                } else {
                    format!("SELECT NOT WAIT_FOR_EXECUTED_GTID_SET('{quoted}', {timeout})")
                };

                return Step::Invoke(Invocation::Query {
                    handler: QueryHandler::is_true(ErrPacket::new(
                        0,
                        "HY000",
                        "wait_for_my_writes timed out",
                    )),
                    stmt,
                });
            }
        }

        Step::Again
    }

    fn wait_gtid_executed_done(&mut self) -> Step {
        if self.failed.is_some() {
            trace::stage("connect::wait_gtid::failed");
            trace::span_end_err(&mut self.wait_gtid_span);

            self.stage = Stage::PoolOrClose;
        } else {
            trace::stage("connect::wait_gtid::done");
            trace::span_end(&mut self.wait_gtid_span);

            self.stage = Stage::SetTrxCharacteristics;
        }

        Step::Again
    }

    fn pool_or_close(&mut self) -> Step {
        self.stage = Stage::FallbackToWrite;
        Step::Invoke(Invocation::PoolOrClose)
    }

    fn fallback_to_write(&mut self, ctx: &mut ConnectionContext) -> Step {
        if self.already_fallback || ctx.expected_server_mode == ServerMode::ReadWrite {
            // Fall back to the primary once, and only when the client
            // asked for a read-only target. The recorded failure
            // surfaces at Done.
            self.stage = Stage::Done;
            return Step::Again;
        }

        trace::stage("connect::fallback_to_write");

        ctx.expected_server_mode = ServerMode::ReadWrite;
        self.already_fallback = true;

        self.failed = None;

        // the retried attempt opens a fresh outer span
        trace::span_end(&mut self.connect_span);

        self.stage = Stage::Connect;
        Step::Again
    }

    /// Replay the transaction characteristics, one statement per pass
    fn set_trx_characteristics(&mut self) -> Step {
        if self.trx_stmt.is_empty() {
            self.stage = Stage::FetchUserAttrs; // skip set_trx_characteristics_done
            return Step::Again;
        }

        trace::stage("connect::trx_characteristics");
        self.trx_span = child_span!(self, "mysql/set_trx_characteristics");

        self.stage = Stage::SetTrxCharacteristicsDone;

        let stmt = reconcile::split_trx_statement(&mut self.trx_stmt);
        Step::Invoke(Invocation::Query {
            handler: QueryHandler::failed_query(stmt.clone()),
            stmt,
        })
    }

    fn set_trx_characteristics_done(&mut self) -> Step {
        trace::stage("connect::trx_characteristics::done");

        if self.failed.is_some() {
            trace::span_end_err(&mut self.trx_span);
        } else {
            trace::span_end(&mut self.trx_span);
        }

        // if there is more, execute the next part
        self.stage = if self.trx_stmt.is_empty() {
            Stage::FetchUserAttrs
        } else {
            Stage::SetTrxCharacteristics
        };

        Step::Again
    }

    fn fetch_user_attrs(&mut self, ctx: &mut ConnectionContext) -> Step {
        if !ctx.settings.router_require_enforce {
            self.stage = Stage::SendAuthOk;
            return Step::Again;
        }

        trace::stage("connect::fetch_user_attrs");

        self.stage = Stage::FetchUserAttrsDone;
        Step::Invoke(Invocation::FetchRequiredAttrs)
    }

    fn fetch_user_attrs_done(&mut self, ctx: &mut ConnectionContext) -> Step {
        trace::stage("connect::fetch_user_attrs::done");

        let Some(required) = self.required_attrs.take() else {
            self.failed = Some(ErrPacket::access_denied());

            self.stage = Stage::Done;
            return Step::Again;
        };

        if !require::enforce(&ctx.client.channel, &required) {
            self.failed = Some(ErrPacket::access_denied());

            self.stage = Stage::Done;
            return Step::Again;
        }

        self.stage = Stage::SendAuthOk;
        Step::Again
    }

    fn send_auth_ok(&mut self, ctx: &mut ConnectionContext) -> Step {
        if !self.in_handshake {
            self.stage = Stage::Done;
            return Step::Again;
        }

        trace::stage("connect::ok");

        // tell the client that everything is ok
        let ok = OkPacket::with_status_flags(ctx.server.status_flags);
        ctx.pending_client_frame = Some(ok.encode(
            ctx.client.seq_id.wrapping_add(1),
            ctx.client.capabilities,
        ));

        self.stage = Stage::Done;
        Step::SendToClient
    }

    fn done(&mut self, ctx: &mut ConnectionContext) -> Step {
        if let Some(err) = self.failed.take() {
            trace::stage("connect::failed");

            self.report(err);
            ctx.authenticated = false;
        }

        // reset the server-side seq-id; the next command starts clean
        ctx.server.seq_id = SEQ_NO_PRIOR_PACKET;

        trace::span_end(&mut self.connect_span);

        Step::Done
    }
}

//! Lazy backend preparation.
//!
//! The session calls [`prepare`] before forwarding a command that needs a
//! backend. The connector state machine decides what has to happen —
//! connect, authenticate, replay session state, align options and schema,
//! wait for replication visibility, restore transaction characteristics —
//! and the drivers execute each exchange.

pub mod connector;
pub mod context;
pub mod drivers;
pub mod handlers;
pub mod reconcile;
pub mod require;
pub mod retry;
pub mod trace;

pub use connector::{Completion, Invocation, LazyConnector, ServerOption, Step};
pub use context::ConnectionContext;
pub use drivers::{BackendDrivers, Splicer, WireDrivers};

use tracing::Span;

use crate::protocol::ErrPacket;

/// Run the lazy connector to completion.
///
/// On success the backend attached to the context is observationally
/// equivalent to the client's session. On failure the error is returned
/// exactly once and the context is left unauthenticated.
pub async fn prepare<D: BackendDrivers>(
    drivers: &mut D,
    ctx: &mut ConnectionContext,
    in_handshake: bool,
    parent_span: Option<Span>,
) -> Result<(), ErrPacket> {
    let mut connector = LazyConnector::new(in_handshake, parent_span);

    loop {
        match connector.process(ctx) {
            Step::Again => {}
            Step::Invoke(invocation) => {
                let completion = run_invocation(drivers, ctx, invocation).await;
                connector.complete(completion, ctx);
            }
            Step::Suspend(delay) => {
                if !drivers.wait(delay).await {
                    connector.cancel();
                }
            }
            Step::SendToClient => {
                if let Some(frame) = ctx.pending_client_frame.take() {
                    drivers.send_to_client(frame).await?;
                }
            }
            Step::Done => break,
        }
    }

    match connector.take_error() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Execute one requested sub-exchange
async fn run_invocation<D: BackendDrivers>(
    drivers: &mut D,
    ctx: &mut ConnectionContext,
    invocation: Invocation,
) -> Completion {
    match invocation {
        Invocation::Connect => Completion::Connect(drivers.connect(ctx).await),
        Invocation::ServerGreeting { in_handshake } => {
            Completion::ServerGreeting(drivers.server_greeting(ctx, in_handshake).await)
        }
        Invocation::ChangeUser { in_handshake } => {
            Completion::ChangeUser(drivers.change_user(ctx, in_handshake).await)
        }
        Invocation::ResetConnection => {
            Completion::ResetConnection(drivers.reset_connection(ctx).await)
        }
        Invocation::SetOption(option) => Completion::SetOption(drivers.set_option(ctx, option).await),
        Invocation::InitSchema(schema) => {
            Completion::InitSchema(drivers.init_schema(ctx, &schema).await)
        }
        Invocation::Query { stmt, handler } => {
            Completion::Query(drivers.query(ctx, &stmt, handler).await)
        }
        Invocation::PoolOrClose => {
            let pooled = drivers.pool_server_connection(ctx).await;
            if !pooled {
                // the pool had no room; close gracefully
                drivers.quit(ctx).await;
            }
            Completion::Pooled(pooled)
        }
        Invocation::FetchRequiredAttrs => {
            Completion::RequiredAttrs(drivers.fetch_required_attrs(ctx).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::context::{ConnectionContext, ServerView};
    use super::handlers::{HandlerOutcome, QueryHandler};
    use super::require::RequiredAttributes;
    use super::*;
    use crate::protocol::handshake::Greeting;
    use crate::protocol::packet::capabilities;
    use crate::protocol::resultset::{ResultEvent, TextRow};
    use crate::protocol::{Packet, SEQ_NO_PRIOR_PACKET};
    use crate::router::ServerMode;
    use crate::session::variables::Value;

    fn dummy_greeting() -> Greeting {
        Greeting {
            protocol_version: 10,
            server_version: "8.0.35".to_string(),
            connection_id: 99,
            auth_plugin_data_part1: [0; 8],
            capability_flags: capabilities::BASE_CAPABILITIES,
            character_set: 0x21,
            status_flags: 0x0002,
            auth_plugin_data_part2: vec![0; 12],
            auth_plugin_name: "mysql_native_password".to_string(),
        }
    }

    enum ConnectOutcome {
        Fresh,
        Pooled(ServerView),
        Fail(ErrPacket),
    }

    /// Scripted drivers: every exchange is recorded, outcomes come from
    /// per-kind scripts and default to success.
    #[derive(Default)]
    struct MockDrivers {
        calls: Vec<String>,
        connect_script: VecDeque<ConnectOutcome>,
        greeting_script: VecDeque<Result<(), ErrPacket>>,
        greeting_always_fails: Option<ErrPacket>,
        query_script: VecDeque<Vec<ResultEvent>>,
        required_attrs: Option<RequiredAttributes>,
        pool_accepts: bool,
        cancel_waits: bool,
        sent_frames: Vec<Packet>,
        wait_count: u32,
    }

    impl MockDrivers {
        fn queries(&self) -> Vec<&str> {
            self.calls
                .iter()
                .filter_map(|call| call.strip_prefix("query:"))
                .collect()
        }

        fn count(&self, name: &str) -> usize {
            self.calls.iter().filter(|call| *call == name).count()
        }
    }

    impl BackendDrivers for MockDrivers {
        async fn connect(&mut self, ctx: &mut ConnectionContext) -> Result<(), ErrPacket> {
            self.calls.push("connect".to_string());

            match self
                .connect_script
                .pop_front()
                .unwrap_or(ConnectOutcome::Fresh)
            {
                ConnectOutcome::Fresh => {
                    ctx.server = ServerView::default();
                    ctx.server.open = true;
                    Ok(())
                }
                ConnectOutcome::Pooled(view) => {
                    ctx.server = view;
                    ctx.server.open = true;
                    Ok(())
                }
                ConnectOutcome::Fail(err) => Err(err),
            }
        }

        async fn server_greeting(
            &mut self,
            ctx: &mut ConnectionContext,
            _in_handshake: bool,
        ) -> Result<(), ErrPacket> {
            self.calls.push("server_greeting".to_string());

            let result = match &self.greeting_always_fails {
                Some(err) => Err(err.clone()),
                None => self.greeting_script.pop_front().unwrap_or(Ok(())),
            };

            match result {
                Ok(()) => {
                    ctx.server.greeting = Some(dummy_greeting());
                    ctx.server.username = ctx.client.username.clone();
                    ctx.server.sent_attributes = ctx.client.sent_attributes.clone();
                    ctx.server.capabilities = ctx.client.capabilities;
                    ctx.server.status_flags = 0x0002;
                    ctx.authenticated = true;
                    Ok(())
                }
                Err(err) => {
                    // a failed handshake drops the socket
                    ctx.server.open = false;
                    Err(err)
                }
            }
        }

        async fn change_user(
            &mut self,
            ctx: &mut ConnectionContext,
            _in_handshake: bool,
        ) -> Result<(), ErrPacket> {
            self.calls.push("change_user".to_string());

            ctx.server.username = ctx.client.username.clone();
            ctx.server.sent_attributes = ctx.client.sent_attributes.clone();
            ctx.server.schema = ctx.client.schema.clone();
            ctx.authenticated = true;
            Ok(())
        }

        async fn reset_connection(&mut self, _ctx: &mut ConnectionContext) -> Result<(), ErrPacket> {
            self.calls.push("reset_connection".to_string());
            Ok(())
        }

        async fn set_option(
            &mut self,
            ctx: &mut ConnectionContext,
            option: ServerOption,
        ) -> Result<(), ErrPacket> {
            self.calls.push(format!("set_option:{option:?}"));

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

        async fn init_schema(
            &mut self,
            ctx: &mut ConnectionContext,
            schema: &str,
        ) -> Result<(), ErrPacket> {
            self.calls.push(format!("init_schema:{schema}"));

            ctx.server.schema = schema.to_string();
            Ok(())
        }

        async fn query(
            &mut self,
            _ctx: &mut ConnectionContext,
            stmt: &str,
            mut handler: QueryHandler,
        ) -> HandlerOutcome {
            self.calls.push(format!("query:{stmt}"));

            let events = self
                .query_script
                .pop_front()
                .unwrap_or_else(|| vec![ResultEvent::Ok(crate::protocol::OkPacket::new())]);

            for event in events {
                handler.on_event(event);
            }
            handler.finish()
        }

        async fn quit(&mut self, ctx: &mut ConnectionContext) {
            self.calls.push("quit".to_string());
            ctx.detach_server();
        }

        async fn fetch_required_attrs(
            &mut self,
            _ctx: &mut ConnectionContext,
        ) -> Option<RequiredAttributes> {
            self.calls.push("fetch_required_attrs".to_string());
            self.required_attrs.clone()
        }

        async fn pool_server_connection(&mut self, ctx: &mut ConnectionContext) -> bool {
            self.calls.push("pool".to_string());

            if self.pool_accepts {
                ctx.detach_server();
                true
            } else {
                false
            }
        }

        async fn send_to_client(&mut self, frame: Packet) -> Result<(), ErrPacket> {
            self.sent_frames.push(frame);
            Ok(())
        }

        async fn wait(&mut self, delay: Duration) -> bool {
            self.wait_count += 1;

            if self.cancel_waits {
                return false;
            }

            tokio::time::sleep(delay).await;
            true
        }
    }

    fn test_ctx() -> ConnectionContext {
        let mut ctx = ConnectionContext::default();
        ctx.client.username = "app".to_string();
        ctx.client.password = Some("secret".to_string());
        ctx.client.capabilities = capabilities::BASE_CAPABILITIES;
        ctx
    }

    fn matched_pooled_view(schema: &str) -> ServerView {
        ServerView {
            greeting: Some(dummy_greeting()),
            username: "app".to_string(),
            schema: schema.to_string(),
            capabilities: capabilities::BASE_CAPABILITIES,
            ..ServerView::default()
        }
    }

    fn single_cell(value: &str) -> Vec<ResultEvent> {
        vec![
            ResultEvent::ColumnCount(1),
            ResultEvent::Column,
            ResultEvent::Row(TextRow::new(vec![Some(value.to_string())])),
            ResultEvent::RowEnd,
        ]
    }

    #[tokio::test]
    async fn test_fresh_connection_prepares_schema() {
        let mut drivers = MockDrivers::default();
        let mut ctx = test_ctx();
        ctx.client.schema = "app".to_string();

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        assert!(result.is_ok());
        assert_eq!(
            drivers.calls,
            vec!["connect", "server_greeting", "init_schema:app"]
        );
        assert!(ctx.authenticated);
        assert!(ctx.server.open);
        assert_eq!(ctx.server.seq_id, SEQ_NO_PRIOR_PACKET);
        assert!(drivers.sent_frames.is_empty());
    }

    #[tokio::test]
    async fn test_open_backend_needs_no_preparation() {
        let mut drivers = MockDrivers::default();
        let mut ctx = test_ctx();
        ctx.server.open = true;
        ctx.authenticated = true;

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        assert!(result.is_ok());
        assert!(drivers.calls.is_empty());
    }

    #[tokio::test]
    async fn test_pool_reuse_resets_instead_of_changing_user() {
        let mut drivers = MockDrivers::default();
        drivers
            .connect_script
            .push_back(ConnectOutcome::Pooled(matched_pooled_view("x")));

        let mut ctx = test_ctx();
        ctx.client.schema = "y".to_string();

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        assert!(result.is_ok());
        // schema mismatch alone never forces a full re-handshake
        assert_eq!(
            drivers.calls,
            vec!["connect", "reset_connection", "init_schema:y"]
        );
        assert_eq!(drivers.count("change_user"), 0);
    }

    #[tokio::test]
    async fn test_username_mismatch_forces_change_user() {
        let mut drivers = MockDrivers::default();
        let mut view = matched_pooled_view("");
        view.username = "other".to_string();
        drivers.connect_script.push_back(ConnectOutcome::Pooled(view));

        let mut ctx = test_ctx();

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        assert!(result.is_ok());
        assert_eq!(drivers.count("change_user"), 1);
        assert_eq!(drivers.count("reset_connection"), 0);
    }

    #[tokio::test]
    async fn test_handshake_never_takes_reuse_fast_path() {
        let mut drivers = MockDrivers::default();
        drivers
            .connect_script
            .push_back(ConnectOutcome::Pooled(matched_pooled_view("")));

        let mut ctx = test_ctx();

        // identity matches, but during the client handshake a full
        // re-authentication is required
        let result = prepare(&mut drivers, &mut ctx, true, None).await;

        assert!(result.is_ok());
        assert_eq!(drivers.count("change_user"), 1);
        assert_eq!(drivers.count("reset_connection"), 0);
        // the client got its auth-ok
        assert_eq!(drivers.sent_frames.len(), 1);
        assert_eq!(drivers.sent_frames[0].payload[0], 0x00);
    }

    #[tokio::test]
    async fn test_session_vars_replayed_and_sys_vars_captured() {
        let mut drivers = MockDrivers::default();
        // the SET batch succeeds
        drivers
            .query_script
            .push_back(vec![ResultEvent::Ok(crate::protocol::OkPacket::new())]);
        // the sys-var fetch returns both missing variables
        drivers.query_script.push_back(vec![
            ResultEvent::ColumnCount(2),
            ResultEvent::Column,
            ResultEvent::Column,
            ResultEvent::Row(TextRow::new(vec![
                Some("collation_connection".to_string()),
                Some("utf8mb4_general_ci".to_string()),
            ])),
            ResultEvent::Row(TextRow::new(vec![
                Some("character_set_client".to_string()),
                Some("utf8mb4".to_string()),
            ])),
            ResultEvent::RowEnd,
        ]);

        let mut ctx = test_ctx();
        ctx.settings.connection_sharing = true;
        ctx.greeting_from_router = true;
        ctx.vars.set("sql_mode", Value::from("STRICT_ALL_TABLES"));
        ctx.vars.set("time_zone", Value::from("+00:00"));
        ctx.vars.set("statement_id", Value::from("7"));

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        assert!(result.is_ok());

        let queries = drivers.queries();
        assert!(queries[0].starts_with("SET @@SESSION.session_track_system_variables = '*',"));
        assert!(queries[0].contains("@@SESSION.sql_mode = 'STRICT_ALL_TABLES'"));
        assert!(!queries[0].contains("statement_id"));

        assert_eq!(
            queries[1],
            "SELECT 'collation_connection', @@SESSION.`collation_connection` \
             UNION SELECT 'character_set_client', @@SESSION.`character_set_client`"
        );

        assert_eq!(
            ctx.vars.get("collation_connection").unwrap().as_str(),
            Some("utf8mb4_general_ci")
        );
        assert_eq!(
            ctx.vars.get("character_set_client").unwrap().as_str(),
            Some("utf8mb4")
        );
    }

    #[tokio::test]
    async fn test_sys_var_capture_anomaly_disables_sharing() {
        let mut drivers = MockDrivers::default();
        // tracker SET succeeds
        drivers
            .query_script
            .push_back(vec![ResultEvent::Ok(crate::protocol::OkPacket::new())]);
        // the capture response has three columns
        drivers.query_script.push_back(vec![
            ResultEvent::ColumnCount(3),
            ResultEvent::Row(TextRow::new(vec![
                Some("a".to_string()),
                Some("b".to_string()),
                Some("c".to_string()),
            ])),
            ResultEvent::RowEnd,
        ]);

        let mut ctx = test_ctx();
        ctx.settings.connection_sharing = true;
        ctx.greeting_from_router = true;
        ctx.client.schema = "app".to_string();

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        assert!(result.is_ok());
        assert!(ctx.some_state_changed);
        // nothing was committed
        assert!(ctx.vars.get("collation_connection").is_none());
        // the flow still reached schema reconciliation
        assert_eq!(drivers.count("init_schema:app"), 1);
    }

    #[tokio::test]
    async fn test_gtid_wait_failure_falls_back_to_primary_once() {
        let mut drivers = MockDrivers::default();
        drivers.pool_accepts = false;
        // the replica reports the wait timed out
        drivers.query_script.push_back(single_cell("0"));

        let mut ctx = test_ctx();
        ctx.expected_server_mode = ServerMode::ReadOnly;
        ctx.wait_for_my_writes = true;
        ctx.wait_for_my_writes_timeout_secs = 5;
        ctx.gtid_at_least_executed = "abc:1-10".to_string();

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        assert!(result.is_ok());
        assert_eq!(ctx.expected_server_mode, ServerMode::ReadWrite);

        // first attempt waited, was refused by the pool, and quit
        let queries = drivers.queries();
        assert_eq!(
            queries[0],
            "SELECT NOT WAIT_FOR_EXECUTED_GTID_SET('abc:1-10', 5)"
        );
        assert_eq!(drivers.count("pool"), 1);
        assert_eq!(drivers.count("quit"), 1);

        // second attempt targets the primary; no second wait, no second fallback
        assert_eq!(drivers.count("connect"), 2);
        assert_eq!(queries.len(), 1);
        assert!(ctx.authenticated);
    }

    #[tokio::test]
    async fn test_gtid_wait_pools_backend_when_accepted() {
        let mut drivers = MockDrivers::default();
        drivers.pool_accepts = true;
        drivers.query_script.push_back(single_cell("0"));

        let mut ctx = test_ctx();
        ctx.expected_server_mode = ServerMode::ReadOnly;
        ctx.wait_for_my_writes = true;
        ctx.wait_for_my_writes_timeout_secs = 5;
        ctx.gtid_at_least_executed = "abc:1-10".to_string();

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        assert!(result.is_ok());
        assert_eq!(drivers.count("pool"), 1);
        assert_eq!(drivers.count("quit"), 0);
    }

    #[tokio::test]
    async fn test_gtid_check_without_timeout_uses_subset() {
        let mut drivers = MockDrivers::default();
        drivers.query_script.push_back(single_cell("1"));

        let mut ctx = test_ctx();
        ctx.expected_server_mode = ServerMode::ReadOnly;
        ctx.wait_for_my_writes = true;
        ctx.wait_for_my_writes_timeout_secs = 0;
        ctx.gtid_at_least_executed = "abc:1-10".to_string();

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        assert!(result.is_ok());
        assert_eq!(
            drivers.queries()[0],
            "SELECT GTID_SUBSET('abc:1-10', @@GLOBAL.gtid_executed)"
        );
        // the wait succeeded; the backend stayed on the replica
        assert_eq!(ctx.expected_server_mode, ServerMode::ReadOnly);
        assert_eq!(drivers.count("pool"), 0);
    }

    #[tokio::test]
    async fn test_trx_characteristics_replayed_in_order() {
        let mut drivers = MockDrivers::default();

        let mut ctx = test_ctx();
        ctx.trx_characteristics = Some(
            "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE; START TRANSACTION READ ONLY"
                .to_string(),
        );

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        assert!(result.is_ok());
        assert_eq!(
            drivers.queries(),
            vec![
                "SET TRANSACTION ISOLATION LEVEL SERIALIZABLE",
                "START TRANSACTION READ ONLY",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_greeting_error_retries_until_deadline() {
        let mut drivers = MockDrivers::default();
        drivers.greeting_always_fails = Some(ErrPacket::new(
            2003,
            "HY000",
            "Can't connect to MySQL server",
        ));

        let mut ctx = test_ctx();
        ctx.settings.connect_retry_timeout = Duration::from_millis(250);

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        let err = result.unwrap_err();
        assert_eq!(err.error_code, 2003);

        // attempts at t=0/100/200 retried, the one at t=300 was past the
        // deadline and surfaced
        assert_eq!(drivers.count("server_greeting"), 4);
        assert_eq!(drivers.wait_count, 3);
        assert!(!ctx.authenticated);
    }

    #[tokio::test]
    async fn test_hard_greeting_error_surfaces_immediately() {
        let mut drivers = MockDrivers::default();
        drivers
            .greeting_script
            .push_back(Err(ErrPacket::access_denied()));

        let mut ctx = test_ctx();

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        let err = result.unwrap_err();
        assert_eq!(err.error_code, 1045);
        assert_eq!(drivers.wait_count, 0);
        assert_eq!(drivers.count("server_greeting"), 1);
    }

    #[tokio::test]
    async fn test_fallback_clears_failure_then_second_failure_surfaces() {
        let mut drivers = MockDrivers::default();
        drivers.pool_accepts = true;
        drivers.query_script.push_back(single_cell("0"));
        drivers.connect_script.push_back(ConnectOutcome::Fresh);
        drivers.connect_script.push_back(ConnectOutcome::Fail(ErrPacket::new(
            2005,
            "HY000",
            "Unknown MySQL server host",
        )));

        let mut ctx = test_ctx();
        ctx.expected_server_mode = ServerMode::ReadOnly;
        ctx.wait_for_my_writes = true;
        ctx.wait_for_my_writes_timeout_secs = 5;
        ctx.gtid_at_least_executed = "abc:1-10".to_string();

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        // the gtid-wait failure was cleared by the fallback; the connect
        // failure of the second attempt is what surfaces
        let err = result.unwrap_err();
        assert_eq!(err.error_code, 2005);
        assert_eq!(ctx.expected_server_mode, ServerMode::ReadWrite);
        assert_eq!(drivers.count("connect"), 2);
    }

    #[tokio::test]
    async fn test_cancelled_retry_wait_stops_preparation() {
        let mut drivers = MockDrivers::default();
        drivers.cancel_waits = true;
        drivers.greeting_always_fails =
            Some(ErrPacket::new(2003, "HY000", "Can't connect to MySQL server"));

        let mut ctx = test_ctx();

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        // cancellation ends preparation without a reported error
        assert!(result.is_ok());
        assert!(!ctx.authenticated);
        assert_eq!(drivers.wait_count, 1);
    }

    #[tokio::test]
    async fn test_set_vars_failure_reported_at_done() {
        let mut drivers = MockDrivers::default();
        drivers.query_script.push_back(vec![ResultEvent::Err(ErrPacket::new(
            1064,
            "42000",
            "You have an error in your SQL syntax",
        ))]);

        let mut ctx = test_ctx();
        ctx.vars.set("autocommit", Value::from("1"));

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        let err = result.unwrap_err();
        assert_eq!(err.error_code, 1064);
        assert!(!ctx.authenticated);
        assert_eq!(ctx.server.seq_id, SEQ_NO_PRIOR_PACKET);
    }

    #[tokio::test]
    async fn test_require_enforcement_unknown_user_denied() {
        let mut drivers = MockDrivers::default();
        drivers.required_attrs = None;

        let mut ctx = test_ctx();
        ctx.settings.router_require_enforce = true;

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        let err = result.unwrap_err();
        assert_eq!(err.error_code, 1045);
        assert_eq!(err.sql_state, "28000");
        assert!(!ctx.authenticated);
    }

    #[tokio::test]
    async fn test_require_enforcement_ssl_demanded_on_plain_channel() {
        let mut drivers = MockDrivers::default();
        drivers.required_attrs = Some(RequiredAttributes {
            ssl: true,
            ..Default::default()
        });

        let mut ctx = test_ctx();
        ctx.settings.router_require_enforce = true;

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        assert_eq!(result.unwrap_err().error_code, 1045);
    }

    #[tokio::test]
    async fn test_require_enforcement_passes_without_requirements() {
        let mut drivers = MockDrivers::default();
        drivers.required_attrs = Some(RequiredAttributes::default());

        let mut ctx = test_ctx();
        ctx.settings.router_require_enforce = true;

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        assert!(result.is_ok());
        assert!(ctx.authenticated);
    }

    #[tokio::test]
    async fn test_multi_statements_mismatch_aligned() {
        let mut drivers = MockDrivers::default();
        let mut view = matched_pooled_view("");
        view.capabilities &= !capabilities::CLIENT_MULTI_STATEMENTS;
        drivers.connect_script.push_back(ConnectOutcome::Pooled(view));

        let mut ctx = test_ctx();
        ctx.client.capabilities |= capabilities::CLIENT_MULTI_STATEMENTS;

        let result = prepare(&mut drivers, &mut ctx, false, None).await;

        assert!(result.is_ok());
        assert_eq!(drivers.count("set_option:MultiStatementsOn"), 1);
        assert!(ctx.server.multi_statements());
    }
}

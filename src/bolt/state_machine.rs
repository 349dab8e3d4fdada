use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::logging::{LogLevel, Logger};

use super::error::{BoltError, ConnectionFatality};
use super::handler::ResponseHandler;
use super::messages::{RequestKind, ValueMap};
use super::runner::{Authenticator, StatementRunner, TerminationToken};
use super::session::{ConnectionDescriptor, Session, SessionSignals, SessionState};
use super::status::Status;

pub const SERVER_AGENT: &str = concat!("bolt-runtime/", env!("CARGO_PKG_VERSION"));

const LOG_CONTEXT: &str = "bolt::session";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionSettings {
    /// Explicit transactions idle for longer than this are rolled back.
    pub transaction_timeout: Option<Duration>,
}

#[derive(Debug, Default)]
struct MachineSignals {
    interrupt_counter: AtomicUsize,
    terminated: AtomicBool,
    termination: TerminationToken,
}

impl MachineSignals {
    fn pending_interrupts(&self) -> usize {
        self.interrupt_counter.load(Ordering::SeqCst)
    }

    /// Returns the number of interrupts still outstanding afterwards.
    fn acknowledge_interrupt(&self) -> usize {
        let previous = self
            .interrupt_counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

impl SessionSignals for MachineSignals {
    fn interrupt(&self) {
        self.interrupt_counter.fetch_add(1, Ordering::SeqCst);
        self.termination.mark();
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.termination.mark();
    }
}

enum Admission {
    Proceed,
    Answered,
}

/// Bolt v1 session: the request state machine on top of a statement runner.
pub struct BoltStateMachine<R> {
    key: String,
    descriptor: ConnectionDescriptor,
    state: SessionState,
    runner: R,
    authenticator: Arc<dyn Authenticator>,
    signals: Arc<MachineSignals>,
    settings: SessionSettings,
    pending_error: Option<BoltError>,
    owner: Option<String>,
    client_name: Option<String>,
    last_activity: Instant,
    logger: Arc<Logger>,
}

impl<R: StatementRunner> BoltStateMachine<R> {
    pub fn new(
        descriptor: ConnectionDescriptor,
        runner: R,
        authenticator: Arc<dyn Authenticator>,
        settings: SessionSettings,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            descriptor,
            state: SessionState::Connected,
            runner,
            authenticator,
            signals: Arc::new(MachineSignals::default()),
            settings,
            pending_error: None,
            owner: None,
            client_name: None,
            last_activity: Instant::now(),
            logger,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn process<F>(
        &mut self,
        kind: RequestKind,
        handler: &mut dyn ResponseHandler,
        transition: F,
    ) -> Result<(), ConnectionFatality>
    where
        F: FnOnce(&mut Self, &mut dyn ResponseHandler) -> Result<SessionState, ConnectionFatality>,
    {
        let outcome = match self.before(handler) {
            Ok(Admission::Proceed) => transition(self, &mut *handler).map(|next| self.state = next),
            Ok(Admission::Answered) => Ok(()),
            Err(fatality) => Err(fatality),
        };

        self.logger.log(
            LogLevel::Verbose,
            Some(LOG_CONTEXT),
            &format!("{kind} handled"),
            Some(json!({
                "connection": self.descriptor.to_string(),
                "session": self.key,
                "state": self.state.name(),
                "fatal": outcome.is_err(),
            })),
        );

        handler.on_finish();
        self.last_activity = Instant::now();
        outcome
    }

    fn before(&mut self, handler: &mut dyn ResponseHandler) -> Result<Admission, ConnectionFatality> {
        if self.signals.is_terminated() {
            handler.mark_ignored();
            self.release_runner();
            self.state = SessionState::Closed;
            return Err(ConnectionFatality::interrupted(format!(
                "session '{}' was terminated",
                self.key
            )));
        }

        if self.state == SessionState::Closed {
            handler.mark_ignored();
            return Err(ConnectionFatality::interrupted(format!(
                "session '{}' is closed",
                self.key
            )));
        }

        if self.signals.pending_interrupts() > 0 && self.state != SessionState::Interrupted {
            if self.state == SessionState::Connected {
                // Interrupts are only ever raised by RESET.
                return Err(self.breach(RequestKind::Reset, handler));
            }
            self.state = SessionState::Interrupted;
        }

        if self.state != SessionState::Interrupted {
            if let Some(error) = self.pending_error.take() {
                self.fail(handler, error);
                return Ok(Admission::Answered);
            }
        }

        Ok(Admission::Proceed)
    }

    fn fail(&self, handler: &mut dyn ResponseHandler, error: BoltError) {
        if !error.is_publishable() {
            self.logger.log(
                LogLevel::Error,
                Some(LOG_CONTEXT),
                &format!("client request failed: {}", error.message()),
                Some(json!({
                    "connection": self.descriptor.to_string(),
                    "session": self.key,
                    "status": error.status().wire_code(),
                    "reference": error.reference().to_string(),
                })),
            );
        }
        handler.mark_failed(error);
    }

    fn breach(&self, kind: RequestKind, handler: &mut dyn ResponseHandler) -> ConnectionFatality {
        let message = format!(
            "{kind} cannot be handled by a session in the {} state.",
            self.state
        );
        self.fail(
            handler,
            BoltError::fatal(Status::RequestInvalid, message.clone()),
        );
        ConnectionFatality::breach(message)
    }

    fn ready_state(&self) -> SessionState {
        if self.runner.has_transaction() {
            SessionState::InTransaction
        } else {
            SessionState::Idle
        }
    }

    fn authenticate(
        &mut self,
        client_name: &str,
        auth_token: &ValueMap,
        handler: &mut dyn ResponseHandler,
    ) -> Result<SessionState, ConnectionFatality> {
        match self.authenticator.authenticate(auth_token) {
            Ok(result) => {
                if result.credentials_expired {
                    handler.on_metadata("credentials_expired", Value::Bool(true));
                }
                handler.on_metadata("server", Value::String(SERVER_AGENT.to_owned()));

                self.owner = result.principal.or_else(|| {
                    auth_token
                        .get("principal")
                        .and_then(Value::as_str)
                        .map(str::to_owned)
                });
                self.client_name = Some(client_name.to_owned());
                self.logger.log(
                    LogLevel::Debug,
                    Some(LOG_CONTEXT),
                    "session authenticated",
                    Some(json!({
                        "connection": self.descriptor.to_string(),
                        "session": self.key,
                        "owner": self.owner,
                        "client": self.client_name,
                    })),
                );
                Ok(SessionState::Idle)
            }
            Err(error) if error.status().code().starts_with("Security.") => {
                let message = error.message().to_owned();
                self.fail(handler, BoltError::fatal(error.status(), message.clone()));
                Err(ConnectionFatality::auth(message))
            }
            Err(error) => {
                let message = error.message().to_owned();
                self.fail(handler, BoltError::fatal(Status::UnknownError, message.clone()));
                Err(ConnectionFatality::crashed(message))
            }
        }
    }

    fn statement_failed(
        &mut self,
        error: BoltError,
        handler: &mut dyn ResponseHandler,
    ) -> Result<SessionState, ConnectionFatality> {
        if error.status() == Status::AuthorizationExpired {
            let message = error.message().to_owned();
            self.fail(handler, BoltError::fatal(error.status(), message.clone()));
            return Err(ConnectionFatality::auth(message));
        }

        self.fail(handler, error);
        Ok(SessionState::Failed)
    }

    fn execute(
        &mut self,
        statement: &str,
        parameters: &ValueMap,
        handler: &mut dyn ResponseHandler,
    ) -> Result<SessionState, ConnectionFatality> {
        let started_at = Instant::now();
        match self
            .runner
            .run(statement, parameters, &self.signals.termination)
        {
            Ok(metadata) => {
                let fields = metadata
                    .field_names
                    .into_iter()
                    .map(Value::String)
                    .collect();
                handler.on_metadata("fields", Value::Array(fields));
                handler.on_metadata(
                    "result_available_after",
                    json!(started_at.elapsed().as_millis() as u64),
                );
                Ok(SessionState::Streaming)
            }
            Err(error) => self.statement_failed(error, handler),
        }
    }

    fn consume(
        &mut self,
        pull: bool,
        handler: &mut dyn ResponseHandler,
    ) -> Result<SessionState, ConnectionFatality> {
        let started_at = Instant::now();
        let consumed = self
            .runner
            .consume_result(&mut |records| handler.on_records(records, pull));

        match consumed {
            Ok(()) => {
                handler.on_metadata(
                    "result_consumed_after",
                    json!(started_at.elapsed().as_millis() as u64),
                );
                Ok(self.ready_state())
            }
            Err(error) => self.statement_failed(error, handler),
        }
    }

    fn reset_machine(
        &mut self,
        handler: &mut dyn ResponseHandler,
    ) -> Result<SessionState, ConnectionFatality> {
        match self.runner.reset() {
            Ok(()) => {
                self.signals.termination.clear();
                self.pending_error = None;
                Ok(SessionState::Idle)
            }
            Err(error) => {
                let message = error.message().to_owned();
                self.fail(handler, BoltError::fatal(error.status(), message.clone()));
                Err(ConnectionFatality::crashed(message))
            }
        }
    }

    fn release_runner(&mut self) {
        if let Err(error) = self.runner.close() {
            self.logger.warn(
                Some(LOG_CONTEXT),
                &format!(
                    "failed to release session '{}' of {}: {error}",
                    self.key, self.descriptor
                ),
            );
        }
    }
}

impl<R: StatementRunner> Session for BoltStateMachine<R> {
    fn key(&self) -> &str {
        &self.key
    }

    fn signals(&self) -> Arc<dyn SessionSignals> {
        self.signals.clone()
    }

    fn init(
        &mut self,
        client_name: &str,
        auth_token: &ValueMap,
        handler: &mut dyn ResponseHandler,
    ) -> Result<(), ConnectionFatality> {
        self.process(RequestKind::Init, handler, |machine, handler| {
            match machine.state {
                SessionState::Connected => machine.authenticate(client_name, auth_token, handler),
                _ => Err(machine.breach(RequestKind::Init, handler)),
            }
        })
    }

    fn run(
        &mut self,
        statement: &str,
        parameters: &ValueMap,
        handler: &mut dyn ResponseHandler,
    ) -> Result<(), ConnectionFatality> {
        self.process(RequestKind::Run, handler, |machine, handler| {
            match machine.state {
                SessionState::Idle | SessionState::InTransaction => {
                    machine.execute(statement, parameters, handler)
                }
                SessionState::Failed | SessionState::Interrupted => {
                    handler.mark_ignored();
                    Ok(machine.state)
                }
                _ => Err(machine.breach(RequestKind::Run, handler)),
            }
        })
    }

    fn pull_all(&mut self, handler: &mut dyn ResponseHandler) -> Result<(), ConnectionFatality> {
        self.process(RequestKind::PullAll, handler, |machine, handler| {
            match machine.state {
                SessionState::Streaming => machine.consume(true, handler),
                SessionState::Failed | SessionState::Interrupted => {
                    handler.mark_ignored();
                    Ok(machine.state)
                }
                _ => Err(machine.breach(RequestKind::PullAll, handler)),
            }
        })
    }

    fn discard_all(&mut self, handler: &mut dyn ResponseHandler) -> Result<(), ConnectionFatality> {
        self.process(RequestKind::DiscardAll, handler, |machine, handler| {
            match machine.state {
                SessionState::Streaming => machine.consume(false, handler),
                SessionState::Failed | SessionState::Interrupted => {
                    handler.mark_ignored();
                    Ok(machine.state)
                }
                _ => Err(machine.breach(RequestKind::DiscardAll, handler)),
            }
        })
    }

    fn reset(&mut self, handler: &mut dyn ResponseHandler) -> Result<(), ConnectionFatality> {
        self.process(RequestKind::Reset, handler, |machine, handler| {
            match machine.state {
                SessionState::Connected | SessionState::Closed => {
                    Err(machine.breach(RequestKind::Reset, handler))
                }
                SessionState::Interrupted => {
                    if machine.signals.acknowledge_interrupt() > 0 {
                        handler.mark_ignored();
                        Ok(SessionState::Interrupted)
                    } else {
                        machine.reset_machine(handler)
                    }
                }
                _ => machine.reset_machine(handler),
            }
        })
    }

    fn ack_failure(&mut self, handler: &mut dyn ResponseHandler) -> Result<(), ConnectionFatality> {
        self.process(RequestKind::AckFailure, handler, |machine, handler| {
            match machine.state {
                SessionState::Failed => Ok(machine.ready_state()),
                SessionState::Interrupted => {
                    handler.mark_ignored();
                    Ok(SessionState::Interrupted)
                }
                SessionState::Connected | SessionState::Closed => {
                    Err(machine.breach(RequestKind::AckFailure, handler))
                }
                other => Ok(other),
            }
        })
    }

    fn validate_transaction(&mut self) -> Result<(), ConnectionFatality> {
        if self.signals.is_terminated() {
            return Err(ConnectionFatality::interrupted(format!(
                "session '{}' was terminated",
                self.key
            )));
        }

        let Some(timeout) = self.settings.transaction_timeout else {
            return Ok(());
        };
        let open = matches!(
            self.state,
            SessionState::InTransaction | SessionState::Streaming
        ) && self.runner.has_transaction();
        if !open || self.last_activity.elapsed() < timeout {
            return Ok(());
        }

        self.signals.termination.mark();
        self.runner.reset().map_err(|error| {
            ConnectionFatality::crashed(format!(
                "failed to roll back timed out transaction: {error}"
            ))
        })?;
        self.signals.termination.clear();

        self.logger.log(
            LogLevel::Warn,
            Some(LOG_CONTEXT),
            "idle transaction timed out and was rolled back",
            Some(json!({
                "session": self.key,
                "timeout_ms": timeout.as_millis() as u64,
            })),
        );
        self.pending_error = Some(BoltError::new(
            Status::TransactionTimedOut,
            format!(
                "The transaction has not received any requests within {} ms and was rolled back.",
                timeout.as_millis()
            ),
        ));
        self.state = SessionState::Failed;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConnectionFatality> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.runner.close().map_err(|error| {
            ConnectionFatality::crashed(format!(
                "failed to release session '{}': {error}",
                self.key
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use serde_json::{json, Value};

    use super::{BoltStateMachine, SessionSettings};
    use crate::bolt::error::{BoltError, ConnectionFatality};
    use crate::bolt::handler::{RecordStream, ResponseHandler};
    use crate::bolt::memory::{InMemoryRunner, StaticAuthenticator};
    use crate::bolt::messages::ValueMap;
    use crate::bolt::session::{ConnectionDescriptor, Session, SessionState};
    use crate::bolt::status::Status;
    use crate::logging::test_support::{memory_channels, MemorySink};

    #[derive(Default)]
    struct Outcome {
        metadata: ValueMap,
        records: Vec<Vec<Value>>,
        failure: Option<BoltError>,
        ignored: bool,
        finished: usize,
    }

    impl ResponseHandler for Outcome {
        fn on_metadata(&mut self, key: &str, value: Value) {
            self.metadata.insert(key.to_owned(), value);
        }

        fn on_records(&mut self, records: &mut dyn RecordStream, pull: bool) -> Result<(), BoltError> {
            let collected = &mut self.records;
            records.visit(&mut |row| {
                if pull {
                    collected.push(row);
                }
                Ok(())
            })
        }

        fn mark_failed(&mut self, error: BoltError) {
            self.failure = Some(error);
        }

        fn mark_ignored(&mut self) {
            self.ignored = true;
        }

        fn on_finish(&mut self) {
            self.finished += 1;
        }
    }

    fn descriptor() -> ConnectionDescriptor {
        let address: SocketAddr = "127.0.0.1:7687".parse().expect("address should parse");
        ConnectionDescriptor {
            connection_id: 1,
            connector: "bolt".to_owned(),
            client_address: address,
            server_address: address,
        }
    }

    fn machine_with(
        settings: SessionSettings,
        authenticator: StaticAuthenticator,
    ) -> (BoltStateMachine<InMemoryRunner>, Arc<MemorySink>) {
        let (channels, sink) = memory_channels();
        let machine = BoltStateMachine::new(
            descriptor(),
            InMemoryRunner::new(),
            Arc::new(authenticator),
            settings,
            channels.internal,
        );
        (machine, sink)
    }

    fn ready_machine() -> (BoltStateMachine<InMemoryRunner>, Arc<MemorySink>) {
        let (mut machine, sink) = machine_with(SessionSettings::default(), StaticAuthenticator::open());
        let mut outcome = Outcome::default();
        machine
            .init("tests/1.0", &ValueMap::new(), &mut outcome)
            .expect("init should succeed");
        (machine, sink)
    }

    fn send_run(machine: &mut BoltStateMachine<InMemoryRunner>, statement: &str) -> Outcome {
        let mut outcome = Outcome::default();
        machine
            .run(statement, &ValueMap::new(), &mut outcome)
            .expect("run should not be fatal");
        outcome
    }

    fn send_pull(machine: &mut BoltStateMachine<InMemoryRunner>) -> Outcome {
        let mut outcome = Outcome::default();
        machine
            .pull_all(&mut outcome)
            .expect("pull should not be fatal");
        outcome
    }

    fn basic_token(principal: &str, credentials: &str) -> ValueMap {
        let Value::Object(map) = json!({
            "scheme": "basic",
            "principal": principal,
            "credentials": credentials,
        }) else {
            unreachable!("literal is an object");
        };
        map
    }

    #[test]
    fn init_moves_to_ready_and_reports_server_agent() {
        let (mut machine, sink) = machine_with(SessionSettings::default(), StaticAuthenticator::open());
        let mut outcome = Outcome::default();

        machine
            .init("tests/1.0", &ValueMap::new(), &mut outcome)
            .expect("init should succeed");

        assert_eq!(machine.state(), SessionState::Idle);
        let lines = sink.lines_containing("session authenticated");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"client\":\"tests/1.0\""));
        assert!(lines[0].contains("\"connection\":\"bolt-1[127.0.0.1:7687"));
        assert!(outcome.metadata.contains_key("server"));
        assert!(outcome.failure.is_none());
        assert_eq!(outcome.finished, 1);
    }

    #[test]
    fn wrong_credentials_are_fatal_after_reporting_failure() {
        let authenticator =
            StaticAuthenticator::with_users([("neo4j".to_owned(), "secret".to_owned())]);
        let (mut machine, _) = machine_with(SessionSettings::default(), authenticator);
        let mut outcome = Outcome::default();

        let fatality = machine
            .init("tests/1.0", &basic_token("neo4j", "wrong"), &mut outcome)
            .expect_err("bad credentials should be fatal");

        assert!(matches!(fatality, ConnectionFatality::AuthFatal { .. }));
        let failure = outcome.failure.expect("failure should be reported");
        assert_eq!(failure.status(), Status::Unauthorized);
        assert_eq!(outcome.finished, 1);
    }

    #[test]
    fn correct_credentials_record_the_owner() {
        let authenticator =
            StaticAuthenticator::with_users([("neo4j".to_owned(), "secret".to_owned())]);
        let (mut machine, sink) = machine_with(SessionSettings::default(), authenticator);
        let mut outcome = Outcome::default();

        machine
            .init("tests/1.0", &basic_token("neo4j", "secret"), &mut outcome)
            .expect("init should succeed");

        let lines = sink.lines_containing("session authenticated");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("\"owner\":\"neo4j\""));
    }

    #[test]
    fn run_before_init_is_a_protocol_breach() {
        let (mut machine, _) = machine_with(SessionSettings::default(), StaticAuthenticator::open());
        let mut outcome = Outcome::default();

        let fatality = machine
            .run("RETURN 1", &ValueMap::new(), &mut outcome)
            .expect_err("run before init should be fatal");

        assert_eq!(
            fatality,
            ConnectionFatality::breach("RUN cannot be handled by a session in the CONNECTED state.")
        );
        let failure = outcome.failure.expect("failure should be reported");
        assert_eq!(failure.status(), Status::RequestInvalid);
        assert_eq!(outcome.finished, 1);
    }

    #[test]
    fn run_then_pull_streams_records_and_returns_to_ready() {
        let (mut machine, _) = ready_machine();

        let run = send_run(&mut machine, "RETURN 1 AS x, 'a' AS y");
        assert_eq!(machine.state(), SessionState::Streaming);
        assert_eq!(run.metadata.get("fields"), Some(&json!(["x", "y"])));
        assert!(run.metadata.contains_key("result_available_after"));

        let pull = send_pull(&mut machine);
        assert_eq!(pull.records, vec![vec![json!(1), json!("a")]]);
        assert_eq!(machine.state(), SessionState::Idle);
    }

    #[test]
    fn discard_drops_records() {
        let (mut machine, _) = ready_machine();
        send_run(&mut machine, "RETURN 1");
        let mut outcome = Outcome::default();

        machine
            .discard_all(&mut outcome)
            .expect("discard should not be fatal");

        assert!(outcome.records.is_empty());
        assert_eq!(machine.state(), SessionState::Idle);
    }

    #[test]
    fn pull_without_result_is_a_protocol_breach() {
        let (mut machine, _) = ready_machine();
        let mut outcome = Outcome::default();

        let fatality = machine
            .pull_all(&mut outcome)
            .expect_err("pull in ready state should be fatal");

        assert_eq!(
            fatality,
            ConnectionFatality::breach("PULL_ALL cannot be handled by a session in the READY state.")
        );
    }

    #[test]
    fn failed_session_ignores_requests_until_acknowledged() {
        let (mut machine, _) = ready_machine();

        let failed = send_run(&mut machine, "FOO");
        assert_eq!(
            failed.failure.as_ref().map(BoltError::status),
            Some(Status::InvalidSyntax)
        );
        assert_eq!(machine.state(), SessionState::Failed);

        let ignored = send_run(&mut machine, "RETURN 1");
        assert!(ignored.ignored);
        assert_eq!(machine.state(), SessionState::Failed);

        let mut ack = Outcome::default();
        machine
            .ack_failure(&mut ack)
            .expect("ack should not be fatal");
        assert!(!ack.ignored && ack.failure.is_none());
        assert_eq!(machine.state(), SessionState::Idle);
    }

    #[test]
    fn ack_failure_outside_failed_state_is_a_noop_success() {
        let (mut machine, _) = ready_machine();
        let mut ack = Outcome::default();

        machine
            .ack_failure(&mut ack)
            .expect("ack should not be fatal");

        assert!(ack.failure.is_none());
        assert!(!ack.ignored);
        assert_eq!(machine.state(), SessionState::Idle);
    }

    #[test]
    fn ack_failure_keeps_explicit_transaction_open() {
        let (mut machine, _) = ready_machine();
        send_run(&mut machine, "BEGIN");
        send_pull(&mut machine);
        assert_eq!(machine.state(), SessionState::InTransaction);

        send_run(&mut machine, "NOT A STATEMENT");
        assert_eq!(machine.state(), SessionState::Failed);

        let mut ack = Outcome::default();
        machine
            .ack_failure(&mut ack)
            .expect("ack should not be fatal");
        assert_eq!(machine.state(), SessionState::InTransaction);

        send_run(&mut machine, "COMMIT");
        send_pull(&mut machine);
        assert_eq!(machine.state(), SessionState::Idle);
    }

    #[test]
    fn internal_errors_are_logged_with_their_reference() {
        let (mut machine, sink) = ready_machine();

        let outcome = send_run(&mut machine, "CALL db.fail('disk on fire')");

        let failure = outcome.failure.expect("failure should be reported");
        assert_eq!(failure.status(), Status::UnknownError);
        let logged = sink.lines_containing(&failure.reference().to_string());
        assert_eq!(logged.len(), 1);
        assert!(logged[0].contains("disk on fire"));
    }

    #[test]
    fn interrupts_ignore_requests_until_matching_resets_arrive() {
        let (mut machine, _) = ready_machine();
        let signals = machine.signals();
        signals.interrupt();
        signals.interrupt();

        let ignored = send_run(&mut machine, "RETURN 1");
        assert!(ignored.ignored);
        assert_eq!(machine.state(), SessionState::Interrupted);

        let mut first_reset = Outcome::default();
        machine
            .reset(&mut first_reset)
            .expect("reset should not be fatal");
        assert!(first_reset.ignored);
        assert_eq!(machine.state(), SessionState::Interrupted);

        let mut second_reset = Outcome::default();
        machine
            .reset(&mut second_reset)
            .expect("reset should not be fatal");
        assert!(!second_reset.ignored);
        assert!(second_reset.failure.is_none());
        assert_eq!(machine.state(), SessionState::Idle);

        let run = send_run(&mut machine, "RETURN 2");
        assert!(run.failure.is_none() && !run.ignored);
    }

    #[test]
    fn interrupt_cancels_a_sleeping_statement() {
        let (mut machine, _) = ready_machine();
        let signals = machine.signals();
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            signals.interrupt();
        });

        let outcome = send_run(&mut machine, "CALL db.sleep(5000)");
        interrupter.join().expect("interrupter thread should finish");

        assert_eq!(
            outcome.failure.as_ref().map(BoltError::status),
            Some(Status::TransactionTerminated)
        );
        let mut reset = Outcome::default();
        machine
            .reset(&mut reset)
            .expect("reset should not be fatal");
        assert_eq!(machine.state(), SessionState::Idle);
    }

    #[test]
    fn terminated_session_fails_next_request_fatally() {
        let (mut machine, _) = ready_machine();
        machine.signals().terminate();
        let mut outcome = Outcome::default();

        let fatality = machine
            .run("RETURN 1", &ValueMap::new(), &mut outcome)
            .expect_err("terminated session should be fatal");

        assert!(matches!(fatality, ConnectionFatality::Interrupted { .. }));
        assert!(outcome.ignored);
        assert_eq!(outcome.finished, 1);
        assert_eq!(machine.state(), SessionState::Closed);
    }

    #[test]
    fn idle_transaction_timeout_fails_the_next_request() {
        let settings = SessionSettings {
            transaction_timeout: Some(Duration::from_millis(5)),
        };
        let (mut machine, _) = machine_with(settings, StaticAuthenticator::open());
        let mut init = Outcome::default();
        machine
            .init("tests/1.0", &ValueMap::new(), &mut init)
            .expect("init should succeed");
        send_run(&mut machine, "BEGIN");
        send_pull(&mut machine);

        thread::sleep(Duration::from_millis(20));
        machine
            .validate_transaction()
            .expect("timeout should not be fatal");
        assert_eq!(machine.state(), SessionState::Failed);

        let next = send_run(&mut machine, "RETURN 1");
        assert_eq!(
            next.failure.as_ref().map(BoltError::status),
            Some(Status::TransactionTimedOut)
        );
        assert!(!next.ignored);

        let mut ack = Outcome::default();
        machine
            .ack_failure(&mut ack)
            .expect("ack should not be fatal");
        assert_eq!(machine.state(), SessionState::Idle);
    }

    #[test]
    fn close_is_idempotent() {
        let (mut machine, _) = ready_machine();

        machine.close().expect("first close should succeed");
        machine.close().expect("second close should succeed");

        assert_eq!(machine.state(), SessionState::Closed);
    }
}

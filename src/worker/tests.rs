use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use super::{SessionWorker, WorkerExit, WorkerHandle, WorkerSettings};
use crate::bolt::callback::test_support::{next_response, ChannelWriter};
use crate::bolt::error::BoltError;
use crate::bolt::handler::ResponseHandler;
use crate::bolt::memory::{InMemoryRunner, StaticAuthenticator};
use crate::bolt::state_machine::{BoltStateMachine, SessionSettings};
use crate::bolt::{
    ConnectionDescriptor, ConnectionFatality, RequestMessage, ResponseMessage, ResponseWriter,
    Session, SessionSignals, Status, ValueMap,
};
use crate::logging::test_support::{memory_channels, MemorySink};
use crate::logging::LogChannels;

#[derive(Default)]
struct Scripted {
    active: AtomicUsize,
    max_active: AtomicUsize,
    closes: AtomicUsize,
    validations: AtomicUsize,
    interrupts: AtomicUsize,
    terminated: AtomicBool,
    gate_open: AtomicBool,
    executed: Mutex<Vec<String>>,
    running_at_terminate: Mutex<Option<bool>>,
    handle: OnceLock<WorkerHandle>,
    started: Mutex<Option<Sender<String>>>,
}

impl Scripted {
    fn executed(&self) -> Vec<String> {
        self.executed.lock().expect("scripted mutex poisoned").clone()
    }

    fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn announce(&self, statement: &str) {
        if let Some(sender) = self.started.lock().expect("scripted mutex poisoned").as_ref() {
            let _ = sender.send(statement.to_owned());
        }
    }
}

impl SessionSignals for Scripted {
    fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
    }

    fn terminate(&self) {
        let running = self.handle.get().map(WorkerHandle::is_running);
        *self.running_at_terminate.lock().expect("scripted mutex poisoned") = running;
        self.terminated.store(true, Ordering::SeqCst);
    }
}

/// Session double whose behaviour is picked by the RUN statement.
struct ScriptedSession {
    scripted: Arc<Scripted>,
}

impl ScriptedSession {
    fn respond(
        &mut self,
        label: &str,
        handler: &mut dyn ResponseHandler,
    ) -> Result<(), ConnectionFatality> {
        let active = self.scripted.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.scripted.max_active.fetch_max(active, Ordering::SeqCst);
        self.scripted.announce(label);

        let outcome = self.behave(label, handler);

        self.scripted
            .executed
            .lock()
            .expect("scripted mutex poisoned")
            .push(label.to_owned());
        self.scripted.active.fetch_sub(1, Ordering::SeqCst);
        handler.on_finish();
        outcome
    }

    fn behave(
        &mut self,
        label: &str,
        handler: &mut dyn ResponseHandler,
    ) -> Result<(), ConnectionFatality> {
        match label {
            "panic" => panic!("scripted session exploded"),
            "breach" => {
                handler.mark_failed(BoltError::fatal(Status::RequestInvalid, "scripted breach"));
                Err(ConnectionFatality::breach("scripted breach"))
            }
            "auth" => {
                handler.mark_failed(BoltError::fatal(Status::Unauthorized, "scripted auth"));
                Err(ConnectionFatality::auth("scripted auth"))
            }
            "block" => {
                while !self.scripted.terminated.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                handler.mark_ignored();
                Err(ConnectionFatality::interrupted("scripted terminated"))
            }
            "gate" => {
                while !self.scripted.gate_open.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }
            other => {
                if let Some(millis) = other.strip_prefix("sleep:") {
                    let millis = millis.parse().expect("sleep label should carry millis");
                    thread::sleep(Duration::from_millis(millis));
                }
                handler.on_metadata("label", Value::String(other.to_owned()));
                Ok(())
            }
        }
    }
}

impl Session for ScriptedSession {
    fn key(&self) -> &str {
        "scripted-session"
    }

    fn signals(&self) -> Arc<dyn SessionSignals> {
        self.scripted.clone()
    }

    fn init(
        &mut self,
        _client_name: &str,
        _auth_token: &ValueMap,
        handler: &mut dyn ResponseHandler,
    ) -> Result<(), ConnectionFatality> {
        self.respond("INIT", handler)
    }

    fn run(
        &mut self,
        statement: &str,
        _parameters: &ValueMap,
        handler: &mut dyn ResponseHandler,
    ) -> Result<(), ConnectionFatality> {
        self.respond(statement, handler)
    }

    fn pull_all(&mut self, handler: &mut dyn ResponseHandler) -> Result<(), ConnectionFatality> {
        self.respond("PULL_ALL", handler)
    }

    fn discard_all(&mut self, handler: &mut dyn ResponseHandler) -> Result<(), ConnectionFatality> {
        self.respond("DISCARD_ALL", handler)
    }

    fn reset(&mut self, handler: &mut dyn ResponseHandler) -> Result<(), ConnectionFatality> {
        self.respond("RESET", handler)
    }

    fn ack_failure(&mut self, handler: &mut dyn ResponseHandler) -> Result<(), ConnectionFatality> {
        self.respond("ACK_FAILURE", handler)
    }

    fn validate_transaction(&mut self) -> Result<(), ConnectionFatality> {
        self.scripted.validations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConnectionFatality> {
        self.scripted.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    scripted: Arc<Scripted>,
    handle: WorkerHandle,
    responses: Receiver<ResponseMessage>,
    sink: Arc<MemorySink>,
    thread: JoinHandle<WorkerExit>,
}

impl Harness {
    fn start(settings: WorkerSettings) -> Self {
        let scripted = Arc::new(Scripted::default());
        let (logs, sink) = memory_channels();
        let (writer, responses) = ChannelWriter::new();
        let (worker, handle) = SessionWorker::new(
            "scripted-worker",
            ScriptedSession {
                scripted: Arc::clone(&scripted),
            },
            Arc::new(writer),
            &settings,
            logs,
        );
        if scripted.handle.set(handle.clone()).is_err() {
            panic!("scripted handle should be set once");
        }
        let thread = thread::spawn(move || worker.run());
        Self {
            scripted,
            handle,
            responses,
            sink,
            thread,
        }
    }

    fn with_started_channel(self) -> (Self, Receiver<String>) {
        let (sender, receiver) = mpsc::channel();
        *self.scripted.started.lock().expect("scripted mutex poisoned") = Some(sender);
        (self, receiver)
    }

    fn run(&self, statement: &str) {
        self.handle
            .enqueue(RequestMessage::run(statement))
            .expect("job should be queued");
    }

    fn join(self) -> (WorkerExit, Arc<Scripted>, Arc<MemorySink>) {
        let exit = self.thread.join().expect("worker thread should not panic");
        (exit, self.scripted, self.sink)
    }
}

fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        queue_capacity: 100,
        idle_poll: Duration::from_millis(20),
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn jobs_execute_in_enqueue_order() {
    let harness = Harness::start(fast_settings());
    let labels: Vec<String> = (0..20).map(|index| format!("job-{index}")).collect();
    for label in &labels {
        harness.run(label);
    }

    for label in &labels {
        match next_response(&harness.responses) {
            ResponseMessage::Success(metadata) => {
                assert_eq!(metadata.get("label"), Some(&json!(label)));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    harness.handle.halt();
    let (exit, scripted, _) = harness.join();
    assert_eq!(exit, WorkerExit::Halted);
    assert_eq!(scripted.executed(), labels);
}

#[test]
fn session_is_never_driven_concurrently() {
    let harness = Harness::start(fast_settings());
    let producers: Vec<_> = (0..4)
        .map(|_| {
            let handle = harness.handle.clone();
            thread::spawn(move || {
                for _ in 0..10 {
                    handle
                        .enqueue(RequestMessage::run("sleep:1"))
                        .expect("job should be queued");
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer should finish");
    }

    for _ in 0..40 {
        next_response(&harness.responses);
    }
    harness.handle.halt();
    let (_, scripted, _) = harness.join();
    assert_eq!(scripted.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(scripted.executed().len(), 40);
}

#[test]
fn halt_closes_session_exactly_once() {
    let harness = Harness::start(fast_settings());
    harness.run("first");
    next_response(&harness.responses);

    harness.handle.halt();
    harness.handle.halt();
    let handle = harness.handle.clone();
    let (exit, scripted, _) = harness.join();
    handle.halt();

    assert_eq!(exit, WorkerExit::Halted);
    assert_eq!(scripted.closes(), 1);
    assert!(!handle.is_running());
    assert!(handle.enqueue(RequestMessage::PullAll).is_err());
}

#[test]
fn protocol_breach_stops_worker_and_logs_internally() {
    let harness = Harness::start(fast_settings());
    harness.run("breach");
    harness.run("never-run");

    assert!(matches!(
        next_response(&harness.responses),
        ResponseMessage::Failure {
            status: Status::RequestInvalid,
            ..
        }
    ));
    let (exit, scripted, sink) = harness.join();

    assert!(matches!(
        exit,
        WorkerExit::Fatal(ConnectionFatality::ProtocolBreach { .. })
    ));
    assert_eq!(scripted.closes(), 1);
    assert_eq!(scripted.executed(), vec!["breach".to_owned()]);
    let lines = sink.lines_containing("protocol breach");
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("[ERROR] <internal>"));
    assert!(lines[0].contains("\"reason\":\"protocol_breach\""));
}

#[test]
fn authentication_fatality_goes_to_security_log_only() {
    let harness = Harness::start(fast_settings());
    harness.run("auth");

    let (exit, scripted, sink) = harness.join();

    assert!(matches!(exit, WorkerExit::Fatal(ConnectionFatality::AuthFatal { .. })));
    assert_eq!(scripted.closes(), 1);
    let lines = sink.lines_containing("scripted auth");
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("[WARN] <security>"));
    assert!(lines[0].contains("\"reason\":\"auth_fatal\""));
}

#[test]
fn panicking_session_is_reported_as_crash_and_closed() {
    let harness = Harness::start(fast_settings());
    harness.run("panic");

    let (exit, scripted, sink) = harness.join();

    match exit {
        WorkerExit::Fatal(ConnectionFatality::Crashed { message }) => {
            assert_eq!(message, "scripted session exploded");
        }
        other => panic!("unexpected exit: {other:?}"),
    }
    assert_eq!(scripted.closes(), 1);
    let lines = sink.lines_containing("crashed");
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("[ERROR] <user>"));
}

#[test]
fn enqueue_blocks_while_queue_is_full() {
    let (harness, started) = Harness::start(WorkerSettings {
        queue_capacity: 1,
        idle_poll: Duration::from_millis(20),
    })
    .with_started_channel();

    harness.run("gate");
    assert_eq!(
        started
            .recv_timeout(Duration::from_secs(5))
            .expect("gate job should start"),
        "gate"
    );
    harness.run("queued");

    let producer_handle = harness.handle.clone();
    let (done_tx, done_rx) = mpsc::channel();
    let producer = thread::spawn(move || {
        producer_handle
            .enqueue(RequestMessage::run("overflow"))
            .expect("overflow job should eventually be queued");
        done_tx.send(()).expect("test channel should be open");
    });

    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
    harness.scripted.gate_open.store(true, Ordering::SeqCst);
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("producer should unblock once the worker drains the queue");
    producer.join().expect("producer should finish");

    for _ in 0..3 {
        next_response(&harness.responses);
    }
    harness.handle.halt();
    let (_, scripted, _) = harness.join();
    assert_eq!(
        scripted.executed(),
        vec!["gate".to_owned(), "queued".to_owned(), "overflow".to_owned()]
    );
}

#[test]
fn idle_worker_validates_transaction_without_jobs() {
    let harness = Harness::start(fast_settings());

    assert!(wait_until(|| harness.scripted.validations.load(Ordering::SeqCst) >= 2));
    assert!(harness.scripted.executed().is_empty());

    harness.handle.halt();
    let (_, scripted, _) = harness.join();
    assert_eq!(scripted.closes(), 1);
}

#[test]
fn halt_during_running_job_terminates_before_stopping() {
    let (harness, started) = Harness::start(fast_settings()).with_started_channel();
    harness.run("block");
    harness.run("never-run");
    started
        .recv_timeout(Duration::from_secs(5))
        .expect("blocking job should start");

    let halter_handle = harness.handle.clone();
    thread::spawn(move || halter_handle.halt())
        .join()
        .expect("halt thread should finish");

    assert!(matches!(next_response(&harness.responses), ResponseMessage::Ignored));
    let (exit, scripted, _) = harness.join();

    assert_eq!(
        *scripted
            .running_at_terminate
            .lock()
            .expect("scripted mutex poisoned"),
        Some(true)
    );
    assert!(matches!(
        exit,
        WorkerExit::Fatal(ConnectionFatality::Interrupted { .. })
    ));
    assert_eq!(scripted.closes(), 1);
    assert_eq!(scripted.executed(), vec!["block".to_owned()]);
}

#[test]
fn interrupt_reaches_session_signals() {
    let harness = Harness::start(fast_settings());
    harness.handle.interrupt();
    harness.handle.interrupt();

    assert_eq!(harness.scripted.interrupts.load(Ordering::SeqCst), 2);
    harness.handle.halt();
    harness.join();
}

#[test]
fn rejected_worker_answers_failure_and_closes() {
    let scripted = Arc::new(Scripted::default());
    let (logs, _sink) = memory_channels();
    let (writer, responses) = ChannelWriter::new();
    let (worker, handle) = SessionWorker::new(
        "rejected-worker",
        ScriptedSession {
            scripted: Arc::clone(&scripted),
        },
        Arc::new(writer),
        &fast_settings(),
        logs,
    );

    worker.reject(Status::NoThreadsAvailable, "no threads");

    assert_eq!(
        next_response(&responses),
        ResponseMessage::failure(Status::NoThreadsAvailable, "no threads")
    );
    assert_eq!(scripted.closes(), 1);
    assert!(!handle.is_running());
    assert!(handle.enqueue(RequestMessage::PullAll).is_err());
}

fn machine_worker(
    settings: SessionSettings,
) -> (
    WorkerHandle,
    Receiver<ResponseMessage>,
    JoinHandle<WorkerExit>,
) {
    let (logs, _sink) = memory_channels();
    machine_worker_with_logs(settings, logs)
}

fn machine_worker_with_logs(
    settings: SessionSettings,
    logs: LogChannels,
) -> (
    WorkerHandle,
    Receiver<ResponseMessage>,
    JoinHandle<WorkerExit>,
) {
    let address: SocketAddr = "127.0.0.1:7687".parse().expect("address should parse");
    let descriptor = ConnectionDescriptor {
        connection_id: 1,
        connector: "bolt".to_owned(),
        client_address: "127.0.0.1:50123".parse().expect("address should parse"),
        server_address: address,
    };
    let session = BoltStateMachine::new(
        descriptor,
        InMemoryRunner::new(),
        Arc::new(StaticAuthenticator::open()),
        settings,
        Arc::clone(&logs.internal),
    );
    let (writer, responses) = ChannelWriter::new();
    let writer: Arc<dyn ResponseWriter> = Arc::new(writer);
    let (worker, handle) = SessionWorker::new("machine-worker", session, writer, &fast_settings(), logs);
    let thread = thread::spawn(move || worker.run());
    (handle, responses, thread)
}

fn expect_success(responses: &Receiver<ResponseMessage>) -> ValueMap {
    match next_response(responses) {
        ResponseMessage::Success(metadata) => metadata,
        other => panic!("expected SUCCESS, got {other:?}"),
    }
}

#[test]
fn init_run_pull_produces_success_record_success() {
    let (handle, responses, thread) = machine_worker(SessionSettings::default());

    handle
        .enqueue(RequestMessage::init("driver/1.0", ValueMap::new()))
        .expect("init should be queued");
    handle
        .enqueue(RequestMessage::run("RETURN 1"))
        .expect("run should be queued");
    handle
        .enqueue(RequestMessage::PullAll)
        .expect("pull should be queued");

    expect_success(&responses);
    let run_metadata = expect_success(&responses);
    assert_eq!(run_metadata.get("fields"), Some(&json!(["1"])));
    assert_eq!(
        next_response(&responses),
        ResponseMessage::Record(vec![json!(1)])
    );
    let pull_metadata = expect_success(&responses);
    assert!(pull_metadata.contains_key("result_consumed_after"));

    handle.halt();
    assert_eq!(
        thread.join().expect("worker thread should finish"),
        WorkerExit::Halted
    );
}

#[test]
fn failure_ignores_requests_until_acknowledged() {
    let (handle, responses, thread) = machine_worker(SessionSettings::default());

    handle
        .enqueue(RequestMessage::init("driver/1.0", ValueMap::new()))
        .expect("init should be queued");
    expect_success(&responses);

    handle
        .enqueue(RequestMessage::run("INVALID CYPHER"))
        .expect("run should be queued");
    assert!(matches!(
        next_response(&responses),
        ResponseMessage::Failure {
            status: Status::InvalidSyntax,
            ..
        }
    ));

    handle
        .enqueue(RequestMessage::run("RETURN 1"))
        .expect("run should be queued");
    assert_eq!(next_response(&responses), ResponseMessage::Ignored);

    handle
        .enqueue(RequestMessage::AckFailure)
        .expect("ack should be queued");
    expect_success(&responses);

    handle
        .enqueue(RequestMessage::run("RETURN 1"))
        .expect("run should be queued");
    let metadata = expect_success(&responses);
    assert_eq!(metadata.get("fields"), Some(&json!(["1"])));

    handle.halt();
    thread.join().expect("worker thread should finish");
}

#[test]
fn reset_interrupts_running_statement() {
    let (handle, responses, thread) = machine_worker(SessionSettings::default());

    handle
        .enqueue(RequestMessage::init("driver/1.0", ValueMap::new()))
        .expect("init should be queued");
    expect_success(&responses);

    let started = Instant::now();
    handle
        .enqueue(RequestMessage::run("CALL db.sleep(10000)"))
        .expect("run should be queued");
    thread::sleep(Duration::from_millis(50));
    handle.interrupt();
    handle
        .enqueue(RequestMessage::Reset)
        .expect("reset should be queued");

    assert!(matches!(
        next_response(&responses),
        ResponseMessage::Failure {
            status: Status::TransactionTerminated,
            ..
        }
    ));
    expect_success(&responses);
    assert!(started.elapsed() < Duration::from_secs(5));

    handle
        .enqueue(RequestMessage::run("RETURN 'after'"))
        .expect("run should be queued");
    expect_success(&responses);

    handle.halt();
    thread.join().expect("worker thread should finish");
}

#[test]
fn idle_transaction_times_out_and_fails_next_request() {
    let (logs, sink) = memory_channels();
    let (handle, responses, thread) = machine_worker_with_logs(
        SessionSettings {
            transaction_timeout: Some(Duration::from_millis(50)),
        },
        logs,
    );

    for request in [
        RequestMessage::init("driver/1.0", ValueMap::new()),
        RequestMessage::run("BEGIN"),
        RequestMessage::DiscardAll,
    ] {
        handle.enqueue(request).expect("request should be queued");
        expect_success(&responses);
    }

    assert!(wait_until(|| !sink
        .lines_containing("idle transaction timed out")
        .is_empty()));

    handle
        .enqueue(RequestMessage::run("RETURN 1"))
        .expect("run should be queued");
    assert!(matches!(
        next_response(&responses),
        ResponseMessage::Failure {
            status: Status::TransactionTimedOut,
            ..
        }
    ));

    handle
        .enqueue(RequestMessage::AckFailure)
        .expect("ack should be queued");
    expect_success(&responses);

    handle
        .enqueue(RequestMessage::run("COMMIT"))
        .expect("commit should be queued");
    assert!(matches!(
        next_response(&responses),
        ResponseMessage::Failure {
            status: Status::TransactionNotFound,
            ..
        }
    ));

    handle.halt();
    thread.join().expect("worker thread should finish");
}

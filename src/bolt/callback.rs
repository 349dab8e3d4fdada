use std::fmt;
use std::io;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::logging::{LogLevel, Logger};

use super::error::BoltError;
use super::handler::{RecordStream, ResponseHandler};
use super::messages::{RequestKind, ResponseMessage, ValueMap};
use super::status::Status;

const LOG_CONTEXT: &str = "bolt::callback";

pub type CompletionHook = Box<dyn FnOnce() + Send>;

/// Outbound side of a connection. Implementations serialize concurrent
/// writers themselves.
pub trait ResponseWriter: Send + Sync {
    fn write(&self, message: &ResponseMessage) -> Result<(), WriteError>;
}

#[derive(Debug)]
pub enum WriteError {
    Io(io::Error),
    Encode(String),
    Closed,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(source) => write!(f, "failed to write response: {source}"),
            Self::Encode(reason) => write!(f, "failed to encode response: {reason}"),
            Self::Closed => write!(f, "connection is closed"),
        }
    }
}

impl std::error::Error for WriteError {}

/// Turns one session operation into exactly one terminal response.
///
/// A bridge is reused for every request of its kind; the router resets it
/// with [`ResponseBridge::prepare`] before each use and `on_finish` clears it.
pub struct ResponseBridge {
    kind: RequestKind,
    worker: Arc<str>,
    writer: Arc<dyn ResponseWriter>,
    logger: Arc<Logger>,
    metadata: ValueMap,
    error: Option<BoltError>,
    ignored: bool,
    on_completed: Option<CompletionHook>,
}

impl ResponseBridge {
    /// `worker` names the session worker in the bridge's log lines.
    pub fn new(
        kind: RequestKind,
        worker: Arc<str>,
        writer: Arc<dyn ResponseWriter>,
        logger: Arc<Logger>,
    ) -> Self {
        Self {
            kind,
            worker,
            writer,
            logger,
            metadata: ValueMap::new(),
            error: None,
            ignored: false,
            on_completed: None,
        }
    }

    pub fn prepare(&mut self, on_completed: Option<CompletionHook>) -> &mut Self {
        self.clear_state();
        self.on_completed = on_completed;
        self
    }

    fn clear_state(&mut self) {
        self.metadata = ValueMap::new();
        self.error = None;
        self.ignored = false;
        self.on_completed = None;
    }

    fn terminal_response(&mut self) -> ResponseMessage {
        if self.ignored {
            return ResponseMessage::Ignored;
        }
        match self.error.take() {
            Some(error) => ResponseMessage::failure(error.status(), error.client_message()),
            None => ResponseMessage::Success(std::mem::take(&mut self.metadata)),
        }
    }
}

impl ResponseHandler for ResponseBridge {
    fn on_metadata(&mut self, key: &str, value: Value) {
        self.metadata.insert(key.to_owned(), value);
    }

    fn on_records(&mut self, records: &mut dyn RecordStream, pull: bool) -> Result<(), BoltError> {
        if !pull {
            return records.visit(&mut |_| Ok(()));
        }

        let writer = &self.writer;
        records.visit(&mut |values| {
            writer.write(&ResponseMessage::Record(values)).map_err(|error| {
                BoltError::new(
                    Status::UnknownError,
                    format!("failed to publish record: {error}"),
                )
            })
        })
    }

    fn mark_failed(&mut self, error: BoltError) {
        // The first failure wins; later ones are consequences of it.
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn mark_ignored(&mut self) {
        self.ignored = true;
    }

    fn on_finish(&mut self) {
        if !self.ignored {
            if let Some(error) = self.error.as_ref().filter(|error| error.is_fatal()) {
                self.logger.log(
                    LogLevel::Warn,
                    Some(LOG_CONTEXT),
                    &format!("{} failed, connection will be closed: {error}", self.kind),
                    Some(json!({
                        "worker": &*self.worker,
                        "status": error.status().wire_code(),
                        "reference": error.reference().to_string(),
                    })),
                );
            }
        }

        let response = self.terminal_response();
        if let Err(error) = self.writer.write(&response) {
            self.logger.log(
                LogLevel::Warn,
                Some(LOG_CONTEXT),
                &format!("failed to send {} response: {error}", self.kind),
                Some(json!({
                    "worker": &*self.worker,
                    "response": response_name(&response),
                })),
            );
        }

        if let Some(hook) = self.on_completed.take() {
            hook();
        }
        self.clear_state();
    }
}

fn response_name(response: &ResponseMessage) -> &'static str {
    match response {
        ResponseMessage::Success(_) => "SUCCESS",
        ResponseMessage::Record(_) => "RECORD",
        ResponseMessage::Ignored => "IGNORED",
        ResponseMessage::Failure { .. } => "FAILURE",
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::test_support::ChannelWriter;
    use super::{ResponseBridge, ResponseWriter};
    use crate::bolt::error::BoltError;
    use crate::bolt::handler::{BufferedResult, ResponseHandler};
    use crate::bolt::messages::{RequestKind, ResponseMessage};
    use crate::bolt::status::Status;
    use crate::logging::test_support::{memory_channels, MemorySink};

    fn bridge(kind: RequestKind) -> (ResponseBridge, Arc<ChannelWriter>, std::sync::mpsc::Receiver<ResponseMessage>) {
        let (bridge, writer, receiver, _) = bridge_with_logs(kind);
        (bridge, writer, receiver)
    }

    fn bridge_with_logs(
        kind: RequestKind,
    ) -> (
        ResponseBridge,
        Arc<ChannelWriter>,
        std::sync::mpsc::Receiver<ResponseMessage>,
        Arc<MemorySink>,
    ) {
        let (writer, receiver) = ChannelWriter::new();
        let writer = Arc::new(writer);
        let (channels, sink) = memory_channels();
        let shared: Arc<dyn ResponseWriter> = writer.clone();
        let bridge = ResponseBridge::new(kind, Arc::from("bolt-worker[test]"), shared, channels.internal);
        (bridge, writer, receiver, sink)
    }

    #[test]
    fn success_carries_accumulated_metadata() {
        let (mut bridge, _, receiver) = bridge(RequestKind::Run);

        bridge.prepare(None).on_metadata("fields", json!(["n"]));
        bridge.on_finish();

        let Ok(ResponseMessage::Success(metadata)) = receiver.try_recv() else {
            panic!("expected SUCCESS");
        };
        assert_eq!(metadata.get("fields"), Some(&json!(["n"])));
    }

    #[test]
    fn ignored_takes_precedence_over_failure() {
        let (mut bridge, _, receiver) = bridge(RequestKind::Run);

        let handler = bridge.prepare(None);
        handler.mark_failed(BoltError::new(Status::InvalidSyntax, "bad"));
        handler.mark_ignored();
        handler.on_finish();

        assert_eq!(receiver.try_recv().ok(), Some(ResponseMessage::Ignored));
    }

    #[test]
    fn internal_failures_are_redacted() {
        let (mut bridge, _, receiver) = bridge(RequestKind::Run);
        let error = BoltError::new(Status::UnknownError, "secret stack trace");
        let reference = error.reference().to_string();

        let handler = bridge.prepare(None);
        handler.mark_failed(error);
        handler.on_finish();

        let Ok(ResponseMessage::Failure { status, message }) = receiver.try_recv() else {
            panic!("expected FAILURE");
        };
        assert_eq!(status, Status::UnknownError);
        assert!(!message.contains("secret"));
        assert!(message.contains(&reference));
    }

    #[test]
    fn state_is_cleared_between_uses_and_hook_runs_once() {
        let (mut bridge, _, receiver) = bridge(RequestKind::Run);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let handler = bridge.prepare(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        handler.mark_failed(BoltError::new(Status::InvalidSyntax, "bad"));
        handler.on_finish();

        bridge.prepare(None).on_finish();

        assert!(matches!(receiver.try_recv(), Ok(ResponseMessage::Failure { .. })));
        assert_eq!(receiver.try_recv().ok(), Some(ResponseMessage::Success(Default::default())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pull_writes_records_before_terminal_response() {
        let (mut bridge, _, receiver) = bridge(RequestKind::PullAll);
        let mut result = BufferedResult::new(
            vec!["n".to_owned()],
            vec![vec![json!(1)], vec![json!(2)]],
        );

        let handler = bridge.prepare(None);
        handler
            .on_records(&mut result, true)
            .expect("records should publish");
        handler.on_finish();

        let received: Vec<ResponseMessage> = receiver.try_iter().collect();
        assert_eq!(
            received,
            vec![
                ResponseMessage::Record(vec![json!(1)]),
                ResponseMessage::Record(vec![json!(2)]),
                ResponseMessage::Success(Default::default()),
            ]
        );
    }

    #[test]
    fn write_failures_are_swallowed_but_hook_still_runs() {
        let (mut bridge, writer, receiver) = bridge(RequestKind::Reset);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        writer.break_connection();

        bridge
            .prepare(Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })))
            .on_finish();

        assert!(receiver.try_recv().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fatal_failure_is_logged_before_it_is_sent() {
        let (mut bridge, _, receiver, sink) = bridge_with_logs(RequestKind::Run);
        let error = BoltError::fatal(Status::RequestInvalid, "RUN is not allowed here");
        let reference = error.reference().to_string();

        let handler = bridge.prepare(None);
        handler.mark_failed(error);
        handler.on_finish();

        assert!(matches!(
            receiver.try_recv(),
            Ok(ResponseMessage::Failure {
                status: Status::RequestInvalid,
                ..
            })
        ));
        let lines = sink.lines_containing("connection will be closed");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[WARN]"));
        assert!(lines[0].contains(&reference));
        assert!(lines[0].contains("Neo.ClientError.Request.Invalid"));
        assert!(lines[0].contains("\"worker\":\"bolt-worker[test]\""));
    }

    #[test]
    fn recoverable_failure_is_not_logged() {
        let (mut bridge, _, receiver, sink) = bridge_with_logs(RequestKind::Run);

        let handler = bridge.prepare(None);
        handler.mark_failed(BoltError::new(Status::InvalidSyntax, "bad"));
        handler.on_finish();

        assert!(matches!(receiver.try_recv(), Ok(ResponseMessage::Failure { .. })));
        assert!(sink.lines_containing("connection will be closed").is_empty());
    }
}

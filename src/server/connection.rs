use std::fmt;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;

use crate::bolt::{
    ConnectionDescriptor, RequestMessage, ResponseMessage, ResponseWriter, WriteError,
};
use crate::logging::{LogChannels, LogLevel};
use crate::wire::codec::{read_frame, write_frame, CodecError};
use crate::wire::handshake::{perform_server_handshake, HandshakeError};
use crate::wire::messages::{decode_request, encode_response, MessageError};
use crate::worker::{FactoryError, Job, SessionConnector, WorkerFactory};

const LOG_CONTEXT: &str = "bolt::connection";

/// Writes framed responses to a client stream.
pub struct FrameResponseWriter {
    stream: Mutex<TcpStream>,
    closed: AtomicBool,
}

impl FrameResponseWriter {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }

    /// Shuts the stream down; later writes fail with [`WriteError::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let stream = self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = stream.shutdown(Shutdown::Both);
    }
}

impl ResponseWriter for FrameResponseWriter {
    fn write(&self, message: &ResponseMessage) -> Result<(), WriteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WriteError::Closed);
        }
        let mut stream = self
            .stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        write_frame(&mut *stream, &encode_response(message)).map_err(|error| match error {
            CodecError::Io(source) => WriteError::Io(source),
            other => WriteError::Encode(other.to_string()),
        })
    }
}

#[derive(Debug)]
pub enum ConnectionError {
    StreamClone(std::io::Error),
    Handshake(HandshakeError),
    Worker(FactoryError),
    Frame(CodecError),
    Message(MessageError),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamClone(source) => write!(f, "failed to clone client stream: {source}"),
            Self::Handshake(source) => write!(f, "{source}"),
            Self::Worker(source) => write!(f, "{source}"),
            Self::Frame(source) => write!(f, "{source}"),
            Self::Message(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Drives one client connection on the calling thread: handshake, worker
/// start-up, then the read loop feeding decoded requests to the worker.
///
/// Returns once the client disconnects or the stream fails; the worker is
/// halted at that point. `on_close` runs exactly once, on the worker thread
/// after the session has been closed, or right here when no worker could be
/// started.
pub fn serve_connection<C: SessionConnector>(
    descriptor: ConnectionDescriptor,
    mut stream: TcpStream,
    factory: &WorkerFactory<C>,
    logs: &LogChannels,
    on_close: impl FnOnce() + Send + 'static,
) -> Result<(), ConnectionError> {
    let version = match perform_server_handshake(&mut stream) {
        Ok(version) => version,
        Err(error) => {
            let _ = stream.shutdown(Shutdown::Both);
            on_close();
            return Err(ConnectionError::Handshake(error));
        }
    };
    logs.internal.log(
        LogLevel::Debug,
        Some(LOG_CONTEXT),
        "handshake completed",
        Some(json!({ "connection": descriptor.to_string(), "version": version })),
    );

    let writer = match stream.try_clone() {
        Ok(clone) => Arc::new(FrameResponseWriter::new(clone)),
        Err(error) => {
            let _ = stream.shutdown(Shutdown::Both);
            on_close();
            return Err(ConnectionError::StreamClone(error));
        }
    };

    let closing_writer = Arc::clone(&writer);
    let handle = factory
        .new_worker(descriptor.clone(), writer, move || {
            closing_writer.close();
            on_close();
        })
        .map_err(ConnectionError::Worker)?;

    // Requests read but not yet answered by the worker.
    let in_flight = Arc::new(AtomicUsize::new(0));
    let outcome = loop {
        let envelope = match read_frame(&mut stream) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break Ok(()),
            Err(error) => break Err(ConnectionError::Frame(error)),
        };
        let request = match decode_request(&envelope) {
            Ok(request) => request,
            Err(error) => break Err(ConnectionError::Message(error)),
        };

        if request == RequestMessage::Reset {
            handle.interrupt();
        }
        in_flight.fetch_add(1, Ordering::SeqCst);
        let answered = Arc::clone(&in_flight);
        let job = Job::new(request).with_completion(move || {
            answered.fetch_sub(1, Ordering::SeqCst);
        });
        if handle.enqueue(job).is_err() {
            in_flight.fetch_sub(1, Ordering::SeqCst);
            // The worker stopped on its own and closed the connection.
            break Ok(());
        }
    };

    logs.internal.log(
        LogLevel::Debug,
        Some(LOG_CONTEXT),
        "connection reader finished",
        Some(json!({
            "connection": descriptor.to_string(),
            "unanswered_requests": in_flight.load(Ordering::SeqCst),
        })),
    );

    if let Err(error) = &outcome {
        logs.internal.warn(
            Some(LOG_CONTEXT),
            &format!("closing connection {descriptor}: {error}"),
        );
    }
    handle.halt();
    outcome
}

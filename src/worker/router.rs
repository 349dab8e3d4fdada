use std::sync::Arc;

use crate::bolt::{
    ConnectionFatality, RequestKind, RequestMessage, ResponseBridge, ResponseWriter, Session,
};
use crate::logging::Logger;

use super::job::Job;

/// Owns one reusable response bridge per request kind and feeds jobs to
/// the matching session operation.
pub struct MessageRouter {
    init: ResponseBridge,
    run: ResponseBridge,
    pull_all: ResponseBridge,
    discard_all: ResponseBridge,
    reset: ResponseBridge,
    ack_failure: ResponseBridge,
}

impl MessageRouter {
    pub fn new(worker: &str, writer: Arc<dyn ResponseWriter>, logger: Arc<Logger>) -> Self {
        let worker: Arc<str> = Arc::from(worker);
        let bridge = |kind| {
            ResponseBridge::new(kind, Arc::clone(&worker), Arc::clone(&writer), Arc::clone(&logger))
        };
        Self {
            init: bridge(RequestKind::Init),
            run: bridge(RequestKind::Run),
            pull_all: bridge(RequestKind::PullAll),
            discard_all: bridge(RequestKind::DiscardAll),
            reset: bridge(RequestKind::Reset),
            ack_failure: bridge(RequestKind::AckFailure),
        }
    }

    pub fn dispatch<S: Session + ?Sized>(
        &mut self,
        session: &mut S,
        job: Job,
    ) -> Result<(), ConnectionFatality> {
        let Job {
            request,
            on_completed,
            ..
        } = job;

        match request {
            RequestMessage::Init {
                client_name,
                auth_token,
            } => session.init(&client_name, &auth_token, self.init.prepare(on_completed)),
            RequestMessage::Run {
                statement,
                parameters,
            } => session.run(&statement, &parameters, self.run.prepare(on_completed)),
            RequestMessage::PullAll => session.pull_all(self.pull_all.prepare(on_completed)),
            RequestMessage::DiscardAll => {
                session.discard_all(self.discard_all.prepare(on_completed))
            }
            RequestMessage::Reset => session.reset(self.reset.prepare(on_completed)),
            RequestMessage::AckFailure => {
                session.ack_failure(self.ack_failure.prepare(on_completed))
            }
        }
    }
}

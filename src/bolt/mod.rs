pub mod callback;
pub mod error;
pub mod handler;
pub mod memory;
pub mod messages;
pub mod runner;
pub mod session;
pub mod state_machine;
pub mod status;

pub use callback::{CompletionHook, ResponseBridge, ResponseWriter, WriteError};
pub use error::ConnectionFatality;
pub use messages::{RequestKind, RequestMessage, ResponseMessage, ValueMap};
pub use session::{ConnectionDescriptor, Session, SessionSignals};
pub use status::Status;

//! # Messaging
//!
//! Message model, listener contract, request/answer correlation and the
//! [`Messaging`] façade applications talk to.

pub mod correlator;
pub mod errors;
pub mod listener;
pub mod message;
pub mod pause;
pub mod registry;
pub mod service;
pub mod status_info;

pub use correlator::{AnswerCallback, AnswerRoute, Correlator};
pub use errors::{MessagingError, MessagingResult};
pub use listener::{
    listener_fn, Disposition, ListenerRegistry, ListenerResult, MessageListener, Rejection,
    RejectionAction, RejectionHandler,
};
pub use message::{Msg, MsgBuilder, MsgId, MsgLock};
pub use registry::MessagingRegistry;
pub use service::{Messaging, MessagingBuilder};

#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # docbus
//!
//! Distributed message queueing on top of a shared document store.
//!
//! ## Overview
//!
//! Every node runs a [`Messaging`] engine against the same store. Messages are
//! plain documents in one collection per queue; all coordination between nodes
//! goes through that collection and a companion lock collection, never through
//! direct node-to-node connections.
//!
//! - **Exclusive** messages are processed by at most one node, arbitrated by a
//!   primary-key insert into the lock collection.
//! - **Broadcast** messages are processed once by every interested node; each
//!   node records itself in the message's `processedBy` set.
//! - **Answers** (`inAnswerTo` set) are routed back to the requester's waiting
//!   call or async callback.
//!
//! New work is discovered through the store's change feed when it has one and
//! through a periodic, authoritative poll in any case.
//!
//! ## Module Organization
//!
//! - [`messaging`] - message model, listeners, correlation, the [`Messaging`] façade
//! - [`engine`] - change feed monitor, poller, processing queue, dispatcher, locks
//! - [`store`] - `MessageStore` trait with in-memory and PostgreSQL backends
//! - [`config`] - layered configuration
//! - [`logging`] - structured logging setup
//! - [`resilience`] - retry with backoff for idempotent store operations
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use docbus::config::MessagingConfig;
//! use docbus::{listener_fn, Disposition, InMemoryStore, Messaging, Msg};
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(InMemoryStore::new());
//! let config = MessagingConfig { poll_interval_ms: 50, ..MessagingConfig::default() };
//!
//! let server = Messaging::builder(store.clone()).config(config.clone()).node_id("server").build()?;
//! server.add_listener_for_topic(
//!     "greet",
//!     listener_fn("greeter", |msg| async move {
//!         let name = msg.value.clone().unwrap_or_default();
//!         Ok(Disposition::answer(Msg::builder("greet").msg(format!("hello {name}")).build()))
//!     }),
//! );
//! server.start().await?;
//!
//! let client = Messaging::builder(store).config(config).node_id("client").build()?;
//! client.start().await?;
//!
//! let request = Msg::builder("greet").value("world").build();
//! let answer = client
//!     .send_and_await_first_answer(request, Duration::from_secs(5), true)
//!     .await?;
//! assert_eq!(answer.and_then(|a| a.msg).as_deref(), Some("hello world"));
//!
//! client.terminate().await?;
//! server.terminate().await?;
//! # Ok::<(), docbus::MessagingError>(())
//! # }).unwrap();
//! ```

pub mod config;
pub mod constants;
pub mod engine;
pub mod logging;
pub mod messaging;
pub mod resilience;
pub mod store;

pub use config::{ConfigManager, DocbusConfig, MessagingConfig};
pub use engine::EngineStatsSnapshot;
pub use messaging::{
    listener_fn, Disposition, MessageListener, Messaging, MessagingBuilder, MessagingError,
    MessagingRegistry, MessagingResult, Msg, MsgBuilder, MsgId, MsgLock, Rejection,
};
pub use store::{InMemoryStore, MessageStore};

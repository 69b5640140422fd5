//! # Roomcast - message fan-out for chat rooms
//!
//! Roomcast takes one message sent to a room and replicates its effects into
//! every member's private state: a mailbox per (user, room), a link row per
//! (mailbox, message), an unread counter per (room, user), and a best-effort
//! real-time push. Everything is stored in an embedded [sled](https://docs.rs/sled)
//! database without multi-record transactions; each cross-entity update is an
//! idempotent lookup-or-create or an atomic counter increment.
//!
//! Only persisting the message can fail a send. Once it is stored, the
//! remaining steps run for every member and failures are reported through
//! the injected [`fanout::FanoutSink`] instead of the caller.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use roomcast::fanout::{Orchestrator, SessionHub};
//! use roomcast::storage::ChatStoreBuilder;
//! use roomcast::types::MessageDraft;
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = ChatStoreBuilder::new("./data").open()?;
//!     let room = store.rooms().create_one_to_one("alice", "bob")?;
//!     let hub = Arc::new(SessionHub::new(64));
//!     let orchestrator = Orchestrator::builder(&store, hub).build();
//!     let message = orchestrator.send_message(&MessageDraft::new("hi bob"), &room, "alice")?;
//!     assert_eq!(orchestrator.unread_count(&room.id, "bob")?, 1);
//!     println!("sent {}", message.id);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`storage`] - sled collections and the traits the orchestrator talks to
//! - [`fanout`] - send state machine, broadcaster, push hub, observability sink
//! - [`tasks`] - background queue for side effects kept off the send path
//! - [`config`] - TOML configuration
//! - [`validation`] - id and body checks applied before anything is written
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────┐
//! │   Orchestrator   │ ──▶ │  Broadcaster │ ──▶ SessionHub (per-user mpsc)
//! └──────────────────┘     └──────────────┘
//!          │
//! ┌──────────────────┐
//! │  Storage (sled)  │ messages · mailboxes · links · read tracking · rooms
//! └──────────────────┘
//! ```

pub mod config;
pub mod errors;
pub mod fanout;
pub mod logutil;
pub mod metrics;
pub mod storage;
pub mod tasks;
pub mod types;
pub mod validation;

//! # Tranquara Relay
//!
//! Task dispatch and event synchronization between the Tranquara journaling
//! API and its AI worker, over a message broker.
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────── ai_tasks ─────────────┐
//! HTTP ─► Publisher                                  ▼
//!   │                                            AI worker
//!   └─► Bridge ◄── ResponseRouter ◄── ai_response ──┤
//!                                                    │
//! DataStore ◄── ConsumerDispatcher ◄── sync_data ────┘
//! ```
//!
//! ## Data store
//!
//! Journals and write-back records go through the [`store::DataStore`] trait.
//! The primary database is an external collaborator: whoever embeds the relay
//! supplies an implementation. The bundled binary wires [`store::MemoryStore`],
//! which keeps records only for the life of the process.
//!
//! ## Modules
//!
//! - [`connection`]: broker connection lifecycle and reconnects
//! - [`envelope`]: `{event, timestamp, payload}` wire codec
//! - [`events`]: event names and payload shapes
//! - [`publisher`]: fire-and-forget publishing
//! - [`consumer`]: supervised queue consumers and retry policy
//! - [`handlers`]: event handler registry and write-back handlers
//! - [`bridge`]: streamed request/response over the broker
//! - [`api`]: HTTP endpoints

pub mod api;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dead_letter;
pub mod envelope;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod publisher;
pub mod shutdown;
pub mod store;

// Re-export commonly used types at crate root
pub use bridge::{Bridge, ResponseRouter};
pub use config::RelayConfig;
pub use connection::ConnectionManager;
pub use consumer::ConsumerDispatcher;
pub use handlers::{Handler, HandlerTable};
pub use publisher::Publisher;

//! # cocode-collab — shared C++ editor with a compile/run pipeline
//!
//! One global document, edited by any number of authenticated users over
//! WebSocket. Edits replace the whole text (last writer wins). Any user
//! can compile and run the code; the result goes to everyone.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   JSON envelopes   ┌───────────────┐
//! │ SessionClient │ ◄────────────────► │ CollabServer  │
//! │ (per user)    │     WebSocket      │ gateway/conn  │
//! └───────────────┘                    └──────┬────────┘
//!                                             │
//!                      ┌──────────────────────┼──────────────────┐
//!                      ▼                      ▼                  ▼
//!               ┌─────────────┐        ┌─────────────┐    ┌────────────┐
//!               │ SharedState │ ◄──────│ Hub loop    │    │ Compiler   │
//!               │ (doc + aux) │  init  │ (fan-out)   │    │ (g++, run) │
//!               └─────────────┘        └─────────────┘    └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON envelope and typed payloads
//! - [`auth`] — identity and the credential seam
//! - [`config`] — TOML configuration
//! - [`state`] — shared document and auxiliary fields
//! - [`hub`] — connection registry and ordered fan-out
//! - [`compiler`] — bounded compile and execute
//! - [`server`] — WebSocket acceptor and session gateway
//! - [`client`] — WebSocket session client

pub mod auth;
pub mod client;
pub mod compiler;
pub mod config;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod state;

// Re-exports for convenience
pub use auth::{AuthError, Authenticator, Identity, StaticTokens};
pub use client::{ClientError, ConnectionState, SessionClient};
pub use compiler::{CompileResult, Compiler, FailureKind, PipelineError};
pub use config::{CollabConfig, ConfigError};
pub use hub::{ConnectionHandle, Hub, HubStats, OutboundQueue};
pub use protocol::{Envelope, MessageType, Payload, ProtocolError};
pub use server::{CollabServer, ServerError, ServerStats};
pub use state::{CompileRecord, DocumentState, SharedAuxState, SharedState};

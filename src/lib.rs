//! Transaction-server connection layer for a pool of page servers.
//!
//! A transaction server (TS) keeps one long-lived channel to every page
//! server (PS) named in its configuration.  This crate owns the lifecycle of
//! those channels:
//!
//! - **Connection state machine** — each endpoint is driven through
//!   `IDLE → CONNECTING → CONNECTED → DISCONNECTING → IDLE`, with socket
//!   teardown offloaded to a background thread so no request path ever
//!   blocks on it.
//! - **Main-connection routing** — outbound requests go to a designated
//!   *main* connection; on failure the layer rotates to the first reachable
//!   endpoint in registration order.
//! - **Background reconnection** — a periodic daemon retries every idle
//!   endpoint and refreshes the main connection when one comes back.
//! - **Quorum consensus LSA** (active variant) — the highest log sequence
//!   address that a majority of connected page servers report as durably
//!   saved, with a condvar-based waiter for log-flush callers.
//! - **Catchup handshake** (active variant) — a freshly connected page
//!   server is held in `CONNECTING` until it confirms it has caught up to
//!   the requested LSA.
//!
//! ## Architecture
//!
//! ```text
//!  ┌─────────────────────────────────────────────────────┐
//!  │  ActiveTranServer                                   │
//!  │  consensus LSA · catchup · prior-list fan-out       │
//!  └───────────────────────┬─────────────────────────────┘
//!                          │
//!  ┌───────────────────────▼─────────────────────────────┐
//!  │  TranServer                                         │
//!  │  boot · main-connection routing · PsConnector       │
//!  └──────┬─────────────────────┬────────────────────────┘
//!         │                     │
//!  ┌──────▼───────────┐   ┌─────▼──────────────────┐
//!  │ ConnectionHandler│ … │ AsyncDisconnectWorker  │
//!  │ (one per PS)     │   │ (background teardown)  │
//!  └──────┬───────────┘   └────────────────────────┘
//!         │
//!  ┌──────▼───────────────────────────────────────────────┐
//!  │  Conn (request/response multiplexer over Channel)    │
//!  └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]     | `TranServerConfig` defaults and dev overrides |
//! | [`error`]      | Crate-wide error enum + channel-level error codes |
//! | [`lsa`]        | Log sequence addresses |
//! | [`node`]       | Page-server endpoints and hosts-string parsing |
//! | [`channel`]    | Blocking TCP channel with a poll timeout |
//! | [`message`]    | Wire request codes and payload encodings |
//! | [`conn`]       | Duplex request/response multiplexer |
//! | [`disconnect`] | Background destruction of drained handlers |
//! | [`prior`]      | Log prior-list fan-out to registered sinks |
//! | [`quorum`]     | Consensus-LSA arithmetic and the flush waiter |
//! | [`handler`]    | Per-endpoint connection state machine |
//! | [`server`]     | Transaction server core and reconnect daemon |
//! | [`active`]     | Active transaction server variant |

pub mod active;
pub mod channel;
pub mod config;
pub mod conn;
pub mod disconnect;
pub mod error;
pub mod handler;
pub mod lsa;
pub mod message;
pub mod node;
pub mod prior;
pub mod quorum;
pub mod server;

pub use crate::{
    active::ActiveTranServer,
    config::TranServerConfig,
    error::{CommError, Result, TranServerError},
    handler::{ConnState, ConnectionHandler},
    lsa::{Lsa, NULL_LSA},
    node::PsNode,
    server::{ConnType, TranServer},
};

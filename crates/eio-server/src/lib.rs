//! # eio-server
//!
//! Transport-negotiating realtime engine served over axum.
//!
//! - **Sessions**: one task per client owning its buffer, heartbeat and
//!   active transport ([`Socket`], [`SocketEvent`])
//! - **Transports**: long-polling (XHR and JSONP) and WebSocket, with
//!   probe-and-swap upgrades between them
//! - **Registry**: request validation, handshakes, live session lookup
//! - **HTTP**: the axum router and WebSocket plumbing
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod errors;
pub mod http;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
mod timer;
pub mod transport;

pub use errors::{Result, ServerError};
pub use registry::{RequestInfo, Route, SessionRegistry};
pub use server::EioServer;
pub use session::{Connection, FrameInlet, ReadyState, Socket, SocketEvent};
pub use transport::{CloseReason, FramedSink, SinkError, TransportId};

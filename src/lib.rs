//! httptcpinfo - kernel TCP_INFO for the connection carrying each HTTP request
//!
//! The server captures the socket handle of every accepted connection and
//! makes it available to the handlers of the requests served on it. A handler
//! can then read the kernel's `tcp_info` (RTT, congestion window,
//! retransmits, byte counters) for exactly that connection.
//!
//! # Library Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use httptcpinfo::context::{ConnContext, RequestContext, lookup, on_connection_established};
//! use httptcpinfo::tcp_info::query;
//!
//! let (stream, peer) = listener.accept().await?;
//! let conn = Arc::new(on_connection_established(ConnContext::new(Some(peer)), &stream));
//!
//! // later, for each request on that connection
//! let req_ctx = RequestContext::new(conn.clone(), 1);
//! if let Some(handle) = lookup(&req_ctx) {
//!     let info = query(handle)?;
//!     println!("rtt {}us cwnd {}", info.rtt, info.snd_cwnd);
//! }
//! ```
//!
//! # Modules
//!
//! - [`tcp_info`] - `getsockopt(TCP_INFO)` and the decoded record
//! - [`context`] - Connection hook and per-request lookup
//! - [`serve`] - HTTP/1.1 host server
//! - [`handler`] - Routes
//! - [`output`] - JSON and plain text renderers
//! - [`probe`] - Client-side probe

#[cfg(not(unix))]
compile_error!("httptcpinfo needs Unix socket descriptors");

pub mod config;
pub mod context;
pub mod handler;
pub mod net;
pub mod output;
pub mod probe;
pub mod serve;
pub mod tcp_info;

pub use context::{ConnContext, RequestContext, Transport, lookup, on_connection_established};
pub use serve::{Server, ServerConfig};
pub use tcp_info::{ConnHandle, QueryError, TcpInfo, WScale, query};

//! Connection context propagation
//!
//! The host server runs [`on_connection_established`] once for every accepted
//! connection. The returned [`ConnContext`] becomes the parent of a
//! [`RequestContext`] for each request served on that connection, so a
//! handler can recover the socket that carried its request with [`lookup`].
//!
//! Contexts are immutable after creation and shared through `Arc`; there is
//! no global registry and no locking.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, AsRawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[cfg(any(target_os = "linux", target_os = "android"))]
use socket2::Protocol;
use socket2::{SockRef, Type};
use tracing::{debug, warn};

use crate::tcp_info::ConnHandle;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// A connection that may be backed by an OS TCP socket.
///
/// Transports opt in by overriding [`Transport::tcp_handle`]; the default
/// reports that no TCP socket is available.
pub trait Transport {
    /// Short name used in logs
    fn kind(&self) -> &'static str;

    fn tcp_handle(&self) -> Result<ConnHandle, HandleError> {
        Err(HandleError::NotTcp {
            transport: self.kind(),
        })
    }
}

/// Error returned when a connection's native handle cannot be captured
#[derive(Debug)]
pub enum HandleError {
    /// The connection is not a TCP stream socket
    NotTcp { transport: &'static str },
    /// The socket could not be inspected
    Inspect(io::Error),
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotTcp { transport } => {
                write!(f, "{} connection is not a TCP stream socket", transport)
            }
            Self::Inspect(e) => write!(f, "cannot inspect socket: {}", e),
        }
    }
}

impl std::error::Error for HandleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inspect(e) => Some(e),
            Self::NotTcp { .. } => None,
        }
    }
}

/// Confirm that `socket` is an IPv4/IPv6 stream socket and return its handle
fn inet_stream_handle<S: AsFd + AsRawFd>(
    socket: &S,
    transport: &'static str,
) -> Result<ConnHandle, HandleError> {
    let sock = SockRef::from(socket);
    let ty = sock.r#type().map_err(HandleError::Inspect)?;
    let local = sock.local_addr().map_err(HandleError::Inspect)?;
    if ty != Type::STREAM || local.as_socket().is_none() {
        return Err(HandleError::NotTcp { transport });
    }
    // SCTP one-to-one sockets are inet SOCK_STREAM too
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if sock.protocol().map_err(HandleError::Inspect)? != Some(Protocol::TCP) {
        return Err(HandleError::NotTcp { transport });
    }
    Ok(ConnHandle::from_raw(socket.as_raw_fd()))
}

impl Transport for tokio::net::TcpStream {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn tcp_handle(&self) -> Result<ConnHandle, HandleError> {
        inet_stream_handle(self, self.kind())
    }
}

impl Transport for std::net::TcpStream {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    fn tcp_handle(&self) -> Result<ConnHandle, HandleError> {
        inet_stream_handle(self, self.kind())
    }
}

impl Transport for tokio::net::UnixStream {
    fn kind(&self) -> &'static str {
        "unix"
    }
}

impl Transport for std::os::unix::net::UnixStream {
    fn kind(&self) -> &'static str {
        "unix"
    }
}

/// Per-connection context
///
/// Created by the host at accept time and shared by every request served on
/// the connection.
#[derive(Debug, Clone)]
pub struct ConnContext {
    id: u64,
    peer_addr: Option<SocketAddr>,
    accepted_at: Instant,
    tcp_handle: Option<ConnHandle>,
}

impl ConnContext {
    /// Base context for a freshly accepted connection, without a handle
    pub fn new(peer_addr: Option<SocketAddr>) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            accepted_at: Instant::now(),
            tcp_handle: None,
        }
    }

    fn with_tcp_handle(self, handle: ConnHandle) -> Self {
        Self {
            tcp_handle: Some(handle),
            ..self
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn accepted_at(&self) -> Instant {
        self.accepted_at
    }
}

/// Per-request context, descended from its connection's [`ConnContext`]
#[derive(Debug, Clone)]
pub struct RequestContext {
    conn: Arc<ConnContext>,
    seq: u64,
    received_at: Instant,
}

impl RequestContext {
    /// `seq` numbers requests within one connection, starting at 1
    pub fn new(conn: Arc<ConnContext>, seq: u64) -> Self {
        Self {
            conn,
            seq,
            received_at: Instant::now(),
        }
    }

    pub fn conn(&self) -> &ConnContext {
        &self.conn
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}

impl AsRef<ConnContext> for ConnContext {
    fn as_ref(&self) -> &ConnContext {
        self
    }
}

impl AsRef<ConnContext> for RequestContext {
    fn as_ref(&self) -> &ConnContext {
        &self.conn
    }
}

/// Connection hook: attach the connection's TCP handle to `base`.
///
/// Never fails the connection. When the transport is not a TCP socket the
/// failure is logged and `base` is returned unchanged, so requests on that
/// connection simply have no telemetry.
pub fn on_connection_established<T: Transport + ?Sized>(
    base: ConnContext,
    conn: &T,
) -> ConnContext {
    match conn.tcp_handle() {
        Ok(handle) => {
            debug!("conn {}: captured {}", base.id, handle);
            base.with_tcp_handle(handle)
        }
        Err(e) => {
            warn!("conn {}: can't extract socket handle: {}", base.id, e);
            base
        }
    }
}

/// Find the TCP handle attached to the connection that `ctx` descends from.
///
/// `None` is a normal outcome: the connection was not TCP, or the context
/// never went through [`on_connection_established`].
pub fn lookup<C: AsRef<ConnContext> + ?Sized>(ctx: &C) -> Option<ConnHandle> {
    ctx.as_ref().tcp_handle
}

/// [`lookup`] through the [`RequestContext`] stored in a request's extensions
pub fn lookup_request<B>(req: &hyper::Request<B>) -> Option<ConnHandle> {
    req.extensions()
        .get::<RequestContext>()
        .and_then(lookup::<RequestContext>)
}

//! Server mode implementation
//!
//! Accepts connections, runs the connection hook on each one before any
//! request is read, and serves HTTP/1.1 with a [`RequestContext`] attached to
//! every request.

use std::convert::Infallible;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hyper::Request;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{ConnContext, RequestContext, Transport, on_connection_established};
use crate::handler;
use crate::net::{self, AddressFamily};

pub const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause after a failed accept (e.g. EMFILE) before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Hook run once per accepted connection; its result is the parent context
/// of every request on that connection.
pub type ConnHook = Arc<dyn Fn(ConnContext, &dyn Transport) -> ConnContext + Send + Sync>;

pub struct ServerConfig {
    /// Listen address; `None` binds the family's wildcard address
    pub bind: Option<IpAddr>,
    pub port: u16,
    pub address_family: AddressFamily,
    /// Additional Unix-domain listener
    pub unix_socket: Option<PathBuf>,
    /// Indent JSON unless the request says otherwise
    pub pretty: bool,
    /// Exit after the first connection closes
    pub one_off: bool,
    /// Time allowed for a client to send request headers
    pub header_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: None,
            port: DEFAULT_PORT,
            address_family: AddressFamily::default(),
            unix_socket: None,
            pretty: false,
            one_off: false,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
        }
    }
}

pub struct Server {
    config: ServerConfig,
    conn_hook: ConnHook,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            conn_hook: Arc::new(|base: ConnContext, conn: &dyn Transport| {
                on_connection_established(base, conn)
            }),
        }
    }

    /// Replace the connection hook
    pub fn with_conn_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(ConnContext, &dyn Transport) -> ConnContext + Send + Sync + 'static,
    {
        self.conn_hook = Arc::new(hook);
        self
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let tcp = net::create_tcp_listener(
            self.config.bind,
            self.config.port,
            self.config.address_family,
        )?;
        let unix = match &self.config.unix_socket {
            Some(path) => Some(net::create_unix_listener(path)?),
            None => None,
        };

        let result = self.serve(tcp, unix).await;

        if let Some(path) = &self.config.unix_socket {
            let _ = std::fs::remove_file(path);
        }
        result
    }

    /// Serve on already-bound listeners
    pub async fn serve(
        &self,
        tcp: TcpListener,
        unix: Option<UnixListener>,
    ) -> anyhow::Result<()> {
        loop {
            let handle = tokio::select! {
                accepted = tcp.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let peer = net::normalize_addr(peer);
                        info!("Client connected: {}", peer);
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("set_nodelay failed for {}: {}", peer, e);
                        }
                        self.spawn_connection(stream, Some(peer))
                    }
                    Err(e) => {
                        warn!("TCP accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
                accepted = accept_unix(unix.as_ref()) => match accepted {
                    Ok(stream) => {
                        info!("Client connected on unix socket");
                        self.spawn_connection(stream, None)
                    }
                    Err(e) => {
                        warn!("Unix accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            if self.config.one_off {
                join_connection(handle).await;
                break;
            }
        }

        Ok(())
    }

    fn spawn_connection<S>(&self, stream: S, peer: Option<SocketAddr>) -> JoinHandle<()>
    where
        S: Transport + AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // The hook runs before the connection is handed to hyper, so it
        // always precedes the first request.
        let transport: &dyn Transport = &stream;
        let conn = Arc::new((self.conn_hook)(ConnContext::new(peer), transport));
        let pretty = self.config.pretty;
        let header_timeout = self.config.header_timeout;

        tokio::spawn(async move {
            let conn_id = conn.id();
            let requests = AtomicU64::new(0);

            let service = service_fn(move |mut req: Request<Incoming>| {
                let seq = requests.fetch_add(1, Ordering::Relaxed) + 1;
                req.extensions_mut().insert(RequestContext::new(conn.clone(), seq));
                let response = handler::route(&req, pretty);
                async move { Ok::<_, Infallible>(response) }
            });

            let mut builder = http1::Builder::new();
            builder
                .timer(TokioTimer::new())
                .header_read_timeout(header_timeout);

            if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
                warn!("conn {}: {}", conn_id, e);
            }
            debug!("conn {} closed", conn_id);
        })
    }
}

/// Wait for a connection task; returns false if it panicked or was cancelled
async fn join_connection(handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            warn!("connection task failed: {}", e);
            false
        }
    }
}

async fn accept_unix(listener: Option<&UnixListener>) -> io::Result<UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}

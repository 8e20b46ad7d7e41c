//! Listener creation and address resolution.
//!
//! TCP listeners are built with socket2 so IPV6_V6ONLY can be chosen before
//! bind. Unix-domain listeners serve local clients; those connections carry
//! no TCP telemetry.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tracing::{debug, info};

const LISTEN_BACKLOG: i32 = 1024;

/// Which IP versions a listener accepts, or a client resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    /// 0.0.0.0
    V4Only,
    /// :: with IPV6_V6ONLY set
    V6Only,
    /// :: with IPV6_V6ONLY cleared, IPv4 peers arrive as ::ffff:a.b.c.d
    #[default]
    DualStack,
}

impl std::str::FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "4" | "v4" | "ipv4" => Ok(Self::V4Only),
            "6" | "v6" | "ipv6" => Ok(Self::V6Only),
            "dual" | "dual-stack" | "both" => Ok(Self::DualStack),
            other => Err(format!(
                "unknown address family '{}' (expected ipv4, ipv6 or dual)",
                other
            )),
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V4Only => write!(f, "IPv4"),
            Self::V6Only => write!(f, "IPv6"),
            Self::DualStack => write!(f, "dual-stack"),
        }
    }
}

impl AddressFamily {
    /// Wildcard address for a listener of this family
    pub fn unspecified(&self, port: u16) -> SocketAddr {
        match self {
            Self::V4Only => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            Self::V6Only | Self::DualStack => {
                SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port)
            }
        }
    }

    fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Self::V4Only => addr.is_ipv4(),
            Self::V6Only => addr.is_ipv6(),
            Self::DualStack => true,
        }
    }
}

/// Bind a TCP listener.
///
/// `addr` overrides the wildcard address chosen from `family`; when it is
/// given, the family only decides IPV6_V6ONLY for IPv6 addresses.
pub fn create_tcp_listener(
    addr: Option<IpAddr>,
    port: u16,
    family: AddressFamily,
) -> io::Result<TcpListener> {
    let addr = match addr {
        Some(ip) => SocketAddr::new(ip, port),
        None => family.unspecified(port),
    };
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        let v6only = family == AddressFamily::V6Only;
        socket.set_only_v6(v6only)?;
        debug!("IPV6_V6ONLY={} ({})", v6only, family);
    }
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let listener = TcpListener::from_std(socket.into())?;
    info!("Listening on {} ({})", listener.local_addr()?, family);
    Ok(listener)
}

/// Bind a Unix-domain stream listener, replacing a stale socket file
pub fn create_unix_listener(path: &Path) -> io::Result<UnixListener> {
    if path.exists() {
        debug!("Removing stale socket {}", path.display());
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!("Listening on unix:{}", path.display());
    Ok(listener)
}

/// Resolve `host:port`, keeping only addresses of the preferred family
pub fn resolve_host(host: &str, port: u16, family: AddressFamily) -> io::Result<Vec<SocketAddr>> {
    let resolved: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
    if resolved.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("could not resolve host: {}", host),
        ));
    }

    let filtered: Vec<SocketAddr> = resolved
        .into_iter()
        .filter(|a| family.accepts(a))
        .collect();
    if filtered.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no {} addresses for host: {}", family, host),
        ));
    }
    Ok(filtered)
}

/// Connect to the first reachable address of `host`
pub async fn connect_tcp(
    host: &str,
    port: u16,
    family: AddressFamily,
    timeout: Duration,
) -> io::Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;

    for addr in resolve_host(host, port, family)? {
        debug!("Connecting to {}", addr);
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                info!("Connected to {}", addr);
                return Ok((stream, addr));
            }
            Ok(Err(e)) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
            Err(_) => {
                debug!("Connect to {} timed out", addr);
                last_err = Some(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotConnected, "no addresses to connect to")
    }))
}

/// Convert IPv4-mapped IPv6 to IPv4 so dual-stack peers log naturally
pub fn normalize_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        SocketAddr::V4(_) => addr,
    }
}

//! TCP_INFO extraction and decoding
//!
//! Reads the kernel's `struct tcp_info` for a connected socket with a single
//! `getsockopt(IPPROTO_TCP, TCP_INFO)` call and exposes it as a typed record.
//! The record layout mirrors `include/uapi/linux/tcp.h` up to and including
//! `tcpi_reord_seen`, which is 224 bytes on every Linux architecture.

use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use serde::{Deserialize, Serialize};

/// Size in bytes of the kernel structure this crate decodes
pub const TCP_INFO_SIZE: usize = 224;

/// Native handle of an open stream socket
///
/// This is only the integer. It is never closed or duplicated here; whoever
/// owns the socket keeps it alive for as long as the handle is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(RawFd);

impl ConnHandle {
    pub fn from_raw(fd: RawFd) -> Self {
        Self(fd)
    }

    pub fn as_raw(&self) -> RawFd {
        self.0
    }
}

impl AsRawFd for ConnHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// Kernel `struct tcp_info`
///
/// Field order and widths follow the kernel ABI exactly. The 64-bit byte
/// counters are declared signed so that "unknown" values such as a pacing
/// rate of `~0` read back as -1 instead of a huge unsigned number.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpInfo {
    pub state: u8,
    pub ca_state: u8,
    pub retransmits: u8,
    pub probes: u8,
    pub backoff: u8,
    pub options: u8,
    /// snd_wscale:4, rcv_wscale:4
    pub wscale: u8,
    /// delivery_rate_app_limited:1, fastopen_client_fail:2
    pub app_limited: u8,

    pub rto: u32,
    pub ato: u32,
    pub snd_mss: u32,
    pub rcv_mss: u32,

    pub unacked: u32,
    pub sacked: u32,
    pub lost: u32,
    pub retrans: u32,
    pub fackets: u32,

    // Elapsed milliseconds, relative to an unspecified reference. They wrap.
    pub last_data_sent: u32,
    pub last_ack_sent: u32,
    pub last_data_recv: u32,
    pub last_ack_recv: u32,

    pub pmtu: u32,
    pub rcv_ss_thresh: u32,
    pub rtt: u32,
    pub rtt_var: u32,
    pub snd_ss_thresh: u32,
    pub snd_cwnd: u32,
    pub adv_mss: u32,
    pub reordering: u32,

    pub rcv_rtt: u32,
    pub rcv_space: u32,

    pub total_retrans: u32,

    pub pacing_rate: i64,
    pub max_pacing_rate: i64,
    pub bytes_acked: i64,
    pub bytes_received: i64,
    pub segs_out: i32,
    pub segs_in: i32,

    pub notsent_bytes: u32,
    pub min_rtt: u32,
    pub data_segs_in: u32,
    pub data_segs_out: u32,

    pub delivery_rate: i64,

    pub busy_time: i64,
    pub rwnd_limited: i64,
    pub snd_buf_limited: i64,

    pub delivered: u32,
    pub delivered_ce: u32,

    pub bytes_sent: i64,
    pub bytes_retrans: i64,
    pub dsack_dups: u32,
    pub reord_seen: u32,
}

const _: () = assert!(std::mem::size_of::<TcpInfo>() == TCP_INFO_SIZE);

/// Window scale factors unpacked from [`TcpInfo::wscale`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WScale {
    pub send: u8,
    pub recv: u8,
}

impl WScale {
    /// Split the packed byte: low nibble is the send scale, high nibble the
    /// receive scale.
    pub fn from_raw(raw: u8) -> Self {
        Self {
            send: raw & 0x0F,
            recv: raw >> 4,
        }
    }
}

/// Kernel TCP connection state (`include/net/tcp_states.h`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Established,
    SynSent,
    SynRecv,
    FinWait1,
    FinWait2,
    TimeWait,
    Close,
    CloseWait,
    LastAck,
    Listen,
    Closing,
    NewSynRecv,
    Unknown(u8),
}

impl From<u8> for TcpState {
    fn from(raw: u8) -> Self {
        match raw {
            1 => Self::Established,
            2 => Self::SynSent,
            3 => Self::SynRecv,
            4 => Self::FinWait1,
            5 => Self::FinWait2,
            6 => Self::TimeWait,
            7 => Self::Close,
            8 => Self::CloseWait,
            9 => Self::LastAck,
            10 => Self::Listen,
            11 => Self::Closing,
            12 => Self::NewSynRecv,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Established => write!(f, "ESTABLISHED"),
            Self::SynSent => write!(f, "SYN_SENT"),
            Self::SynRecv => write!(f, "SYN_RECV"),
            Self::FinWait1 => write!(f, "FIN_WAIT1"),
            Self::FinWait2 => write!(f, "FIN_WAIT2"),
            Self::TimeWait => write!(f, "TIME_WAIT"),
            Self::Close => write!(f, "CLOSE"),
            Self::CloseWait => write!(f, "CLOSE_WAIT"),
            Self::LastAck => write!(f, "LAST_ACK"),
            Self::Listen => write!(f, "LISTEN"),
            Self::Closing => write!(f, "CLOSING"),
            Self::NewSynRecv => write!(f, "NEW_SYN_RECV"),
            Self::Unknown(raw) => write!(f, "UNKNOWN({})", raw),
        }
    }
}

/// Congestion-avoidance state (`enum tcp_ca_state`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaState {
    Open,
    Disorder,
    Cwr,
    Recovery,
    Loss,
    Unknown(u8),
}

impl From<u8> for CaState {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::Open,
            1 => Self::Disorder,
            2 => Self::Cwr,
            3 => Self::Recovery,
            4 => Self::Loss,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for CaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "Open"),
            Self::Disorder => write!(f, "Disorder"),
            Self::Cwr => write!(f, "CWR"),
            Self::Recovery => write!(f, "Recovery"),
            Self::Loss => write!(f, "Loss"),
            Self::Unknown(raw) => write!(f, "Unknown({})", raw),
        }
    }
}

const TCPI_OPT_TIMESTAMPS: u8 = 1;
const TCPI_OPT_SACK: u8 = 2;
const TCPI_OPT_WSCALE: u8 = 4;
const TCPI_OPT_ECN: u8 = 8;
const TCPI_OPT_ECN_SEEN: u8 = 16;
const TCPI_OPT_SYN_DATA: u8 = 32;

/// Negotiated TCP options decoded from [`TcpInfo::options`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TcpOptions {
    pub timestamps: bool,
    pub sack: bool,
    pub wscale: bool,
    pub ecn: bool,
    pub ecn_seen: bool,
    pub syn_data: bool,
}

impl TcpOptions {
    pub fn from_raw(raw: u8) -> Self {
        Self {
            timestamps: raw & TCPI_OPT_TIMESTAMPS != 0,
            sack: raw & TCPI_OPT_SACK != 0,
            wscale: raw & TCPI_OPT_WSCALE != 0,
            ecn: raw & TCPI_OPT_ECN != 0,
            ecn_seen: raw & TCPI_OPT_ECN_SEEN != 0,
            syn_data: raw & TCPI_OPT_SYN_DATA != 0,
        }
    }

    /// Names of the enabled options, in kernel bit order
    pub fn names(&self) -> Vec<&'static str> {
        [
            (self.timestamps, "timestamps"),
            (self.sack, "sack"),
            (self.wscale, "wscale"),
            (self.ecn, "ecn"),
            (self.ecn_seen, "ecn_seen"),
            (self.syn_data, "syn_data"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}

impl TcpInfo {
    pub fn wscale(&self) -> WScale {
        WScale::from_raw(self.wscale)
    }

    /// Delivery rate sample was application limited
    pub fn app_limited(&self) -> bool {
        self.app_limited & 0x01 != 0
    }

    /// Reason a TCP Fast Open client attempt failed (0 = not applicable)
    pub fn fastopen_client_fail(&self) -> u8 {
        (self.app_limited >> 1) & 0x03
    }

    pub fn tcp_state(&self) -> TcpState {
        TcpState::from(self.state)
    }

    pub fn ca_state(&self) -> CaState {
        CaState::from(self.ca_state)
    }

    pub fn tcp_options(&self) -> TcpOptions {
        TcpOptions::from_raw(self.options)
    }
}

/// Error returned when the kernel structure could not be read
#[derive(Debug)]
pub enum QueryError {
    /// getsockopt failed (bad descriptor, not a TCP socket, closed, ...)
    Os(io::Error),
    /// The kernel wrote fewer bytes than the structure holds
    ShortRead { expected: usize, actual: usize },
    /// No compatible TCP_INFO option on this platform
    Unsupported,
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Os(e) => write!(f, "getsockopt(TCP_INFO) failed: {}", e),
            Self::ShortRead { expected, actual } => write!(
                f,
                "short TCP_INFO read: kernel returned {} of {} bytes",
                actual, expected
            ),
            Self::Unsupported => write!(f, "TCP_INFO is not supported on this platform"),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Os(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::mem;

    /// The single unsafe boundary: have the kernel fill a zeroed `TcpInfo`.
    /// Returns the record and the number of bytes the kernel wrote.
    pub(super) fn getsockopt_tcp_info(fd: RawFd) -> io::Result<(TcpInfo, usize)> {
        let mut info = TcpInfo::default();
        let mut len = mem::size_of::<TcpInfo>() as libc::socklen_t;

        // SAFETY: `info` is a repr(C) plain-old-data struct valid for any bit
        // pattern, `len` holds its exact size, and the kernel writes at most
        // `len` bytes. An invalid fd is reported through the return value.
        let ret = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_INFO,
                &mut info as *mut TcpInfo as *mut libc::c_void,
                &mut len,
            )
        };

        if ret == 0 {
            Ok((info, len as usize))
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Accept the record only if the kernel filled all of it
    pub(super) fn check_len(info: TcpInfo, len: usize) -> Result<TcpInfo, QueryError> {
        if len != TCP_INFO_SIZE {
            return Err(QueryError::ShortRead {
                expected: TCP_INFO_SIZE,
                actual: len,
            });
        }
        Ok(info)
    }

    pub fn query(handle: ConnHandle) -> Result<TcpInfo, QueryError> {
        let (info, len) = getsockopt_tcp_info(handle.as_raw()).map_err(QueryError::Os)?;
        check_len(info, len)
    }
}

#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::*;

    pub fn query(_handle: ConnHandle) -> Result<TcpInfo, QueryError> {
        Err(QueryError::Unsupported)
    }
}

/// Read the current `tcp_info` for an open TCP socket owned by this process.
///
/// Either the whole structure is returned or an error is; the call has no
/// effect on the connection.
#[cfg(target_os = "linux")]
pub use linux::query;

#[cfg(not(target_os = "linux"))]
pub use fallback::query;

/// [`query`] for anything exposing a raw descriptor, such as a
/// `tokio::net::TcpStream`.
pub fn query_socket<S: AsRawFd>(socket: &S) -> Result<TcpInfo, QueryError> {
    query(ConnHandle::from_raw(socket.as_raw_fd()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_layout_matches_kernel() {
        assert_eq!(std::mem::size_of::<TcpInfo>(), 224);
        assert_eq!(offset_of!(TcpInfo, rto), 8);
        assert_eq!(offset_of!(TcpInfo, unacked), 24);
        assert_eq!(offset_of!(TcpInfo, last_data_sent), 44);
        assert_eq!(offset_of!(TcpInfo, pmtu), 60);
        assert_eq!(offset_of!(TcpInfo, total_retrans), 100);
        assert_eq!(offset_of!(TcpInfo, pacing_rate), 104);
        assert_eq!(offset_of!(TcpInfo, segs_out), 136);
        assert_eq!(offset_of!(TcpInfo, notsent_bytes), 144);
        assert_eq!(offset_of!(TcpInfo, delivery_rate), 160);
        assert_eq!(offset_of!(TcpInfo, delivered), 192);
        assert_eq!(offset_of!(TcpInfo, bytes_sent), 200);
        assert_eq!(offset_of!(TcpInfo, dsack_dups), 216);
        assert_eq!(offset_of!(TcpInfo, reord_seen), 220);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_partial_record_rejected() {
        let info = TcpInfo {
            state: 1,
            ..Default::default()
        };

        for len in [104, 223, 232] {
            let err = linux::check_len(info, len).unwrap_err();
            assert!(matches!(
                err,
                QueryError::ShortRead { expected: 224, actual } if actual == len
            ));
            assert_eq!(
                err.to_string(),
                format!("short TCP_INFO read: kernel returned {} of 224 bytes", len)
            );
        }

        assert_eq!(linux::check_len(info, 224).unwrap(), info);
    }

    #[test]
    fn test_wscale_all_bytes() {
        for raw in 0..=u8::MAX {
            let ws = WScale::from_raw(raw);
            assert_eq!(ws.send, raw & 0x0F);
            assert_eq!(ws.recv, raw >> 4);
            assert_eq!((ws.recv << 4) | ws.send, raw);
        }
    }

    #[test]
    fn test_wscale_accessor() {
        let info = TcpInfo {
            wscale: 0x97,
            ..Default::default()
        };
        assert_eq!(info.wscale(), WScale { send: 7, recv: 9 });
    }

    #[test]
    fn test_app_limited_bits() {
        let mut info = TcpInfo::default();
        assert!(!info.app_limited());
        assert_eq!(info.fastopen_client_fail(), 0);

        info.app_limited = 0b0000_0101;
        assert!(info.app_limited());
        assert_eq!(info.fastopen_client_fail(), 2);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(TcpState::from(1), TcpState::Established);
        assert_eq!(TcpState::from(10).to_string(), "LISTEN");
        assert_eq!(TcpState::from(200), TcpState::Unknown(200));
        assert_eq!(CaState::from(3), CaState::Recovery);
        assert_eq!(CaState::from(2).to_string(), "CWR");
    }

    #[test]
    fn test_options_decode() {
        let opts = TcpOptions::from_raw(TCPI_OPT_TIMESTAMPS | TCPI_OPT_SACK | TCPI_OPT_WSCALE);
        assert!(opts.timestamps && opts.sack && opts.wscale);
        assert!(!opts.ecn && !opts.ecn_seen && !opts.syn_data);
        assert_eq!(opts.names(), vec!["timestamps", "sack", "wscale"]);
        assert!(TcpOptions::from_raw(0).names().is_empty());
    }

    #[test]
    fn test_json_keys_and_signed_values() {
        let info = TcpInfo {
            pacing_rate: -1,
            max_pacing_rate: -1,
            rtt_var: 42,
            ..Default::default()
        };
        let value = serde_json::to_value(info).unwrap();
        let obj = value.as_object().unwrap();

        assert_eq!(obj.len(), 52);
        assert_eq!(obj["pacing_rate"], -1);
        assert_eq!(obj["max_pacing_rate"], -1);
        assert_eq!(obj["rtt_var"], 42);
        for key in ["ca_state", "snd_ss_thresh", "rcv_ss_thresh", "dsack_dups", "reord_seen"] {
            assert!(obj.contains_key(key), "missing key {}", key);
        }
    }

    #[test]
    fn test_query_invalid_handle_errors() {
        let err = query(ConnHandle::from_raw(-1)).unwrap_err();
        #[cfg(target_os = "linux")]
        match err {
            QueryError::Os(e) => assert_eq!(e.raw_os_error(), Some(libc::EBADF)),
            other => panic!("unexpected error: {}", other),
        }
        #[cfg(not(target_os = "linux"))]
        assert!(matches!(err, QueryError::Unsupported));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_query_udp_socket_errors() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let err = query_socket(&socket).unwrap_err();
        assert!(matches!(err, QueryError::Os(_)), "got {}", err);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_query_loopback_established() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let info = query_socket(&server).unwrap();
        assert_eq!(info.tcp_state(), TcpState::Established);
        assert_eq!(info.total_retrans, 0);
        assert_eq!(info.bytes_retrans, 0);

        let client_info = query_socket(&client).unwrap();
        assert_eq!(client_info.tcp_state(), TcpState::Established);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_query_counters_do_not_decrease() {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        server.write_all(b"pong").unwrap();
        client.read_exact(&mut buf).unwrap();

        let first = query_socket(&server).unwrap();
        let second = query_socket(&server).unwrap();

        assert!(second.total_retrans >= first.total_retrans);
        assert!(second.bytes_sent >= first.bytes_sent);
        assert!(second.bytes_received >= first.bytes_received);
        assert!(second.bytes_acked >= first.bytes_acked);
        assert!(second.segs_out >= first.segs_out);
        assert!(second.segs_in >= first.segs_in);
        assert!(second.bytes_received >= 4);
    }
}

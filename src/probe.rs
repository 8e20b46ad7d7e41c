//! Client-side probe
//!
//! Connects to a server, optionally sends one HTTP request, and reads the
//! `tcp_info` of the local end of that connection.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::net::{self, AddressFamily};
use crate::tcp_info::{TcpInfo, query_socket};

/// Longest status line accepted from the server
const MAX_STATUS_LINE: usize = 8192;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub host: String,
    pub port: u16,
    pub address_family: AddressFamily,
    pub timeout: Duration,
    /// Send `GET /` and wait for the status line before sampling
    pub send_request: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub remote: SocketAddr,
    pub local: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_line: Option<String>,
    pub tcp_info: TcpInfo,
}

pub async fn probe(config: &ProbeConfig) -> anyhow::Result<ProbeReport> {
    let (mut stream, remote) =
        net::connect_tcp(&config.host, config.port, config.address_family, config.timeout)
            .await
            .with_context(|| format!("connect to {}:{}", config.host, config.port))?;
    let local = stream.local_addr()?;

    if !config.send_request {
        let tcp_info = query_socket(&stream)?;
        return Ok(ProbeReport {
            remote,
            local,
            status_line: None,
            tcp_info,
        });
    }

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUser-Agent: httptcpinfo/{}\r\nConnection: close\r\n\r\n",
        config.host,
        env!("CARGO_PKG_VERSION")
    );
    stream.write_all(request.as_bytes()).await?;

    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let mut limited = (&mut reader).take(MAX_STATUS_LINE as u64);
    tokio::time::timeout(config.timeout, limited.read_until(b'\n', &mut line))
        .await
        .context("timed out waiting for response")??;
    let status_line = String::from_utf8_lossy(&line).trim_end().to_string();
    debug!("{} answered: {}", remote, status_line);

    let tcp_info = query_socket(reader.get_ref())?;
    Ok(ProbeReport {
        remote,
        local,
        status_line: Some(status_line),
        tcp_info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_probe_reads_local_tcp_info() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let config = ProbeConfig {
            host: "127.0.0.1".to_string(),
            port,
            address_family: AddressFamily::V4Only,
            timeout: Duration::from_secs(5),
            send_request: true,
        };
        let report = probe(&config).await.unwrap();

        assert_eq!(report.remote.port(), port);
        assert_eq!(report.status_line.as_deref(), Some("HTTP/1.1 200 OK"));
        assert_eq!(report.tcp_info.state, 1);
        assert!(report.tcp_info.bytes_received > 0);
        assert!(report.tcp_info.bytes_acked > 0);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_long_status_line_is_bounded() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            // Byte 8192 lands inside the two-byte 'é'
            let line = format!("{}é\r\n", "H".repeat(MAX_STATUS_LINE - 1));
            stream.write_all(line.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let config = ProbeConfig {
            host: "127.0.0.1".to_string(),
            port,
            address_family: AddressFamily::V4Only,
            timeout: Duration::from_secs(5),
            send_request: true,
        };
        let report = probe(&config).await.unwrap();

        let status = report.status_line.unwrap();
        assert!(status.starts_with("HHHH"));
        assert_eq!(status.chars().filter(|c| *c == 'H').count(), MAX_STATUS_LINE - 1);
        assert!(!status.contains('é'));
        assert_eq!(report.tcp_info.state, 1);
    }

    #[tokio::test]
    async fn test_probe_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = ProbeConfig {
            host: "127.0.0.1".to_string(),
            port,
            address_family: AddressFamily::V4Only,
            timeout: Duration::from_secs(2),
            send_request: false,
        };
        assert!(probe(&config).await.is_err());
    }
}

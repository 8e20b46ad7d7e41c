//! Renderers for a decoded [`TcpInfo`](crate::tcp_info::TcpInfo)

pub mod json;
pub mod plain;

pub use json::output_json;
pub use plain::output_plain;

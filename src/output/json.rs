//! JSON output

use std::fs;
use std::path::Path;

use crate::tcp_info::TcpInfo;

/// Flat object keyed by the kernel field names, signed fields kept signed
pub fn output_json(info: &TcpInfo, pretty: bool) -> String {
    let encoded = if pretty {
        serde_json::to_string_pretty(info)
    } else {
        serde_json::to_string(info)
    };
    encoded.unwrap_or_else(|_| "{}".to_string())
}

pub fn save_json(info: &TcpInfo, path: &Path) -> anyhow::Result<()> {
    let json = output_json(info, true);
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_and_pretty() {
        let info = TcpInfo {
            state: 1,
            rtt: 1500,
            pacing_rate: -1,
            ..Default::default()
        };

        let compact = output_json(&info, false);
        assert!(compact.starts_with("{\"state\":1,\"ca_state\":0,"));
        assert!(compact.contains("\"rtt\":1500"));
        assert!(compact.contains("\"pacing_rate\":-1"));
        assert!(!compact.contains('\n'));

        let pretty = output_json(&info, true);
        assert!(pretty.contains("\n  \"rtt\": 1500"));

        let decoded: TcpInfo = serde_json::from_str(&pretty).unwrap();
        assert_eq!(decoded, info);
    }
}

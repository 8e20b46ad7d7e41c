//! Plain text output

use crate::tcp_info::TcpInfo;

pub fn bytes_to_human(bytes: i64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    if bytes < 0 {
        return "n/a".to_string();
    }

    let b = bytes as f64;
    if b >= TB {
        format!("{:.2} TB", b / TB)
    } else if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Kernel rates are bytes per second; -1 means unknown
pub fn rate_to_human(bytes_per_sec: i64) -> String {
    if bytes_per_sec < 0 {
        return "n/a".to_string();
    }

    let mbps = bytes_per_sec as f64 * 8.0 / 1_000_000.0;
    if mbps >= 1000.0 {
        format!("{:.2} Gbps", mbps / 1000.0)
    } else {
        format!("{:.2} Mbps", mbps)
    }
}

fn usecs_to_ms(us: u32) -> String {
    format!("{:.2}ms", us as f64 / 1000.0)
}

pub fn output_plain(info: &TcpInfo) -> String {
    let mut output = String::new();
    let ws = info.wscale();
    let options = info.tcp_options().names();

    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push_str("  TCP Info\n");
    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push('\n');

    output.push_str(&format!("  State:         {}\n", info.tcp_state()));
    output.push_str(&format!("  CA State:      {}\n", info.ca_state()));
    output.push_str(&format!(
        "  Options:       {}\n",
        if options.is_empty() {
            "none".to_string()
        } else {
            options.join(", ")
        }
    ));
    output.push_str(&format!(
        "  Window Scale:  snd {} / rcv {}\n",
        ws.send, ws.recv
    ));
    output.push_str(&format!("  App Limited:   {}\n", info.app_limited()));
    output.push('\n');

    output.push_str("  Timing:\n");
    output.push_str(&format!(
        "    RTT:         {} (var {})\n",
        usecs_to_ms(info.rtt),
        usecs_to_ms(info.rtt_var)
    ));
    output.push_str(&format!("    Min RTT:     {}\n", usecs_to_ms(info.min_rtt)));
    output.push_str(&format!("    RTO:         {}\n", usecs_to_ms(info.rto)));
    output.push_str(&format!("    ATO:         {}\n", usecs_to_ms(info.ato)));
    output.push('\n');

    output.push_str("  Window:\n");
    output.push_str(&format!("    Cwnd:        {} segs\n", info.snd_cwnd));
    output.push_str(&format!("    Ssthresh:    {}\n", info.snd_ss_thresh));
    output.push_str(&format!(
        "    MSS:         snd {} / rcv {} / adv {}\n",
        info.snd_mss, info.rcv_mss, info.adv_mss
    ));
    output.push_str(&format!("    PMTU:        {}\n", info.pmtu));
    output.push('\n');

    output.push_str("  Transfer:\n");
    output.push_str(&format!(
        "    Sent:        {} ({} segs)\n",
        bytes_to_human(info.bytes_sent),
        info.segs_out
    ));
    output.push_str(&format!(
        "    Received:    {} ({} segs)\n",
        bytes_to_human(info.bytes_received),
        info.segs_in
    ));
    output.push_str(&format!(
        "    Acked:       {}\n",
        bytes_to_human(info.bytes_acked)
    ));
    output.push_str(&format!(
        "    Retrans:     {} ({} total)\n",
        bytes_to_human(info.bytes_retrans),
        info.total_retrans
    ));
    output.push_str(&format!(
        "    Pacing:      {}\n",
        rate_to_human(info.pacing_rate)
    ));
    output.push_str(&format!(
        "    Delivery:    {}\n",
        rate_to_human(info.delivery_rate)
    ));
    output.push('\n');

    output.push_str("─".repeat(60).as_str());
    output.push('\n');

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_human() {
        assert_eq!(bytes_to_human(512), "512 B");
        assert_eq!(bytes_to_human(2048), "2.00 KB");
        assert_eq!(bytes_to_human(3 * 1024 * 1024), "3.00 MB");
        assert_eq!(bytes_to_human(-1), "n/a");
    }

    #[test]
    fn test_rate_to_human() {
        assert_eq!(rate_to_human(-1), "n/a");
        assert_eq!(rate_to_human(125_000), "1.00 Mbps");
        assert_eq!(rate_to_human(250_000_000), "2.00 Gbps");
    }

    #[test]
    fn test_output_plain() {
        let info = TcpInfo {
            state: 1,
            options: 0b0111,
            wscale: 0x77,
            rtt: 1250,
            snd_cwnd: 10,
            pacing_rate: -1,
            ..Default::default()
        };
        let text = output_plain(&info);

        assert!(text.contains("State:         ESTABLISHED"));
        assert!(text.contains("timestamps, sack, wscale"));
        assert!(text.contains("snd 7 / rcv 7"));
        assert!(text.contains("RTT:         1.25ms"));
        assert!(text.contains("Cwnd:        10 segs"));
        assert!(text.contains("Pacing:      n/a"));
    }
}

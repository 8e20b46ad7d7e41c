//! httptcpinfo - kernel TCP_INFO for every HTTP request

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use httptcpinfo::config::Config;
use httptcpinfo::net::AddressFamily;
use httptcpinfo::output::{json::save_json, output_plain};
use httptcpinfo::probe::{ProbeConfig, probe};
use httptcpinfo::serve::{DEFAULT_PORT, Server, ServerConfig};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Initialize logging with optional file output
///
/// The returned guard flushes the file writer on drop and must outlive the
/// program's logging.
fn init_logging(log_file: Option<&str>, log_level: Option<&str>) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = log_level.unwrap_or("info");
    let env_filter =
        EnvFilter::from_default_env().add_directive(format!("httptcpinfo={}", level).parse()?);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time();

    let Some(file_path) = log_file else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        return Ok(None);
    };

    let expanded_path = match file_path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(file_path)),
        None => PathBuf::from(file_path),
    };
    if let Some(parent) = expanded_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file_appender = tracing_appender::rolling::daily(
        expanded_path
            .parent()
            .unwrap_or_else(|| std::path::Path::new(".")),
        expanded_path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("httptcpinfo.log")),
    );
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(non_blocking)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(Some(guard))
}

#[derive(Parser)]
#[command(name = "httptcpinfo")]
#[command(author, version, about = "Kernel TCP_INFO for the connection carrying each HTTP request")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Serve options when no subcommand is given
    #[command(flatten)]
    serve: ServeArgs,

    /// Generate shell completions
    #[arg(long, value_name = "SHELL", value_parser = ["bash", "zsh", "fish", "powershell", "elvish"])]
    completions: Option<String>,

    /// Config file (default: ~/.config/httptcpinfo/config.toml)
    #[arg(long, global = true, env = "HTTPTCPINFO_CONFIG")]
    config: Option<PathBuf>,

    /// Log file path (e.g., "~/.config/httptcpinfo/httptcpinfo.log")
    #[arg(long, global = true, env = "HTTPTCPINFO_LOG_FILE")]
    log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "HTTPTCPINFO_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve TCP_INFO over HTTP (default)
    Serve(ServeArgs),

    /// Connect to a server and print the local socket's TCP_INFO
    Probe(ProbeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Listen port
    #[arg(short, long, env = "HTTPTCPINFO_PORT")]
    port: Option<u16>,

    /// Listen address (default: wildcard for the address family)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Address family (ipv4, ipv6, dual)
    #[arg(long, value_parser = parse_family)]
    family: Option<AddressFamily>,

    /// Also serve on a Unix-domain socket (no TCP_INFO for those clients)
    #[arg(long)]
    unix_socket: Option<PathBuf>,

    /// Indent JSON responses by default
    #[arg(long)]
    pretty: bool,

    /// Exit after the first connection closes
    #[arg(long)]
    one_off: bool,

    /// Time allowed for request headers
    #[arg(long, value_parser = parse_duration)]
    header_timeout: Option<Duration>,
}

#[derive(Args)]
struct ProbeArgs {
    /// Target host
    host: String,

    /// Target port
    #[arg(short, long)]
    port: Option<u16>,

    /// Address family (ipv4, ipv6, dual)
    #[arg(long, value_parser = parse_family)]
    family: Option<AddressFamily>,

    /// Connect and response timeout
    #[arg(short, long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// JSON output
    #[arg(long)]
    json: bool,

    /// Only connect; do not send an HTTP request
    #[arg(long)]
    no_request: bool,

    /// Also save the TCP_INFO record as JSON to this file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_family(s: &str) -> Result<AddressFamily, String> {
    s.parse::<AddressFamily>()
}

fn generate_completions(shell: &str) {
    use clap::CommandFactory;
    use clap_complete::{Shell, generate};

    let mut cmd = Cli::command();
    let shell = match shell {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "powershell" => Shell::PowerShell,
        "elvish" => Shell::Elvish,
        _ => {
            eprintln!("Unknown shell: {}", shell);
            std::process::exit(1);
        }
    };
    generate(shell, &mut cmd, "httptcpinfo", &mut std::io::stdout());
}

/// Parse an optional family string from the config file
fn config_family(value: Option<&str>) -> Result<Option<AddressFamily>> {
    value
        .map(|s| s.parse::<AddressFamily>().map_err(anyhow::Error::msg))
        .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(ref shell) = cli.completions {
        generate_completions(shell);
        return Ok(());
    }

    let file_config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_default(),
    };

    let command = match cli.command {
        Some(command) => command,
        None => Commands::Serve(cli.serve),
    };

    match command {
        Commands::Serve(args) => {
            let defaults = &file_config.server;
            let _guard = init_logging(
                cli.log_file.as_deref().or(defaults.log_file.as_deref()),
                cli.log_level.as_deref().or(defaults.log_level.as_deref()),
            )?;

            let bind = match (args.bind, defaults.bind.as_deref()) {
                (Some(ip), _) => Some(ip),
                (None, Some(s)) => Some(s.parse::<IpAddr>()?),
                (None, None) => None,
            };
            let address_family = match args.family {
                Some(family) => family,
                None => config_family(defaults.address_family.as_deref())?.unwrap_or_default(),
            };
            let unix_socket = args.unix_socket.or_else(|| defaults.unix_socket.clone());

            let config = ServerConfig {
                bind,
                port: args.port.or(defaults.port).unwrap_or(DEFAULT_PORT),
                address_family,
                unix_socket: unix_socket.clone(),
                pretty: args.pretty || defaults.pretty.unwrap_or(false),
                one_off: args.one_off,
                header_timeout: args.header_timeout.unwrap_or(DEFAULT_HEADER_TIMEOUT),
            };

            let server = Server::new(config);
            tokio::select! {
                result = server.run() => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                    if let Some(path) = unix_socket {
                        let _ = std::fs::remove_file(path);
                    }
                }
            }
        }

        Commands::Probe(args) => {
            let defaults = &file_config.probe;
            let _guard = init_logging(
                cli.log_file.as_deref().or(defaults.log_file.as_deref()),
                cli.log_level
                    .as_deref()
                    .or(defaults.log_level.as_deref())
                    .or(Some("warn")),
            )?;

            let timeout = match (args.timeout, defaults.timeout.as_deref()) {
                (Some(t), _) => t,
                (None, Some(s)) => parse_duration(s).map_err(anyhow::Error::msg)?,
                (None, None) => DEFAULT_PROBE_TIMEOUT,
            };
            let address_family = match args.family {
                Some(family) => family,
                None => config_family(defaults.address_family.as_deref())?.unwrap_or_default(),
            };

            let config = ProbeConfig {
                host: args.host,
                port: args.port.or(defaults.port).unwrap_or(DEFAULT_PORT),
                address_family,
                timeout,
                send_request: !args.no_request,
            };
            let report = probe(&config).await?;

            if let Some(path) = &args.output {
                save_json(&report.tcp_info, path)?;
            }

            if args.json || defaults.json.unwrap_or(false) {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("  Remote:        {}", report.remote);
                println!("  Local:         {}", report.local);
                if let Some(status) = &report.status_line {
                    println!("  Response:      {}", status);
                }
                print!("{}", output_plain(&report.tcp_info));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_is_default_command() {
        let cli = Cli::try_parse_from(["httptcpinfo", "--port", "9000", "--one-off"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.serve.port, Some(9000));
        assert!(cli.serve.one_off);

        let cli = Cli::try_parse_from(["httptcpinfo", "serve", "--port", "9001"]).unwrap();
        match cli.command {
            Some(Commands::Serve(args)) => assert_eq!(args.port, Some(9001)),
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_default_serve_reads_port_env() {
        // SAFETY: no other test asserts on a port taken from the environment
        unsafe { std::env::set_var("HTTPTCPINFO_PORT", "9100") };
        let cli = Cli::try_parse_from(["httptcpinfo"]).unwrap();
        unsafe { std::env::remove_var("HTTPTCPINFO_PORT") };

        assert!(cli.command.is_none());
        assert_eq!(cli.serve.port, Some(9100));
    }

    #[test]
    fn test_probe_subcommand() {
        let cli = Cli::try_parse_from(["httptcpinfo", "probe", "example.com", "--json"]).unwrap();
        match cli.command {
            Some(Commands::Probe(args)) => {
                assert_eq!(args.host, "example.com");
                assert!(args.json);
            }
            _ => panic!("expected probe"),
        }
    }
}

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use pmmn::config::{ServerConfig, Transport};
use pmmn::plugins::CommandExecutor;
use pmmn::server;

#[derive(Parser)]
#[command(
    name = "pmmn",
    about = "Poor man's munin node - answers the munin protocol and relays plugin output",
    version
)]
struct Cli {
    /// TCP port to listen on; without a port the node serves stdin/stdout
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Directory containing the munin plugins
    #[arg(short = 'd', long, default_value = "plugins")]
    plugin_dir: PathBuf,

    /// Hostname reported to the poller (default: this machine's hostname)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Directory holding spoolfetch_<host> helpers; enables the spool capability
    #[arg(short = 's', long)]
    spoolfetch_dir: Option<PathBuf>,

    /// Seconds of silence tolerated before an idle session is closed
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Append logs to this file instead of stderr
    #[arg(short = 'l', long)]
    log_file: Option<PathBuf>,
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.is_dir() {
                bail!("log directory {} does not exist", dir.display());
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    let host = cli.host.unwrap_or_else(default_hostname);
    let config = ServerConfig::resolve(
        cli.port,
        cli.plugin_dir,
        host,
        cli.spoolfetch_dir,
        Duration::from_secs(cli.timeout),
    )?;

    match config.transport {
        Transport::Stream => server::run_stream(&config, CommandExecutor)?,
        Transport::Socket(port) => {
            // All interfaces; std's TcpListener sets SO_REUSEADDR on Unix so
            // a restarted node can rebind immediately.
            let listener = TcpListener::bind(("0.0.0.0", port))
                .with_context(|| format!("cannot listen on port {port}"))?;
            server::run_socket(listener, &config, CommandExecutor)?;
        }
    }
    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use flexpar::config::{DeploymentConfig, Session};
use flexpar::server::SapServer;
use flexpar::transport::{TcpTransport, TcpTransportOptions};
use flexpar::wire::Rank;
use log::info;
use std::io::Write;
use std::path::PathBuf;

/// Runs the set-aside process for one flexpar service over a TCP mesh.
#[derive(Parser, Debug, Clone)]
#[command(name = "flexpar-sap", version)]
struct Cli {
    /// Path to the deployment YAML (`service` and `mesh` sections)
    #[arg(long)]
    config: PathBuf,

    /// Rank to run as; defaults to the configured server rank
    #[arg(long)]
    rank: Option<Rank>,

    /// Write the final metrics snapshot here instead of stdout
    #[arg(long)]
    metrics_out: Option<PathBuf>,

    /// env_logger-style filter string (e.g. "info,flexpar::server=debug"); overrides RUST_LOG/defaults
    #[arg(long)]
    log_filter: Option<String>,
}

const DEFAULT_LOG_FILTER: &str = "info,flexpar=info";

fn init_logging(cli_filter: Option<&str>) {
    let env = Env::default().default_filter_or(DEFAULT_LOG_FILTER);
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(filter) = cli_filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_secs();
    builder.format(|buf, record| {
        let ts = buf.timestamp();
        writeln!(
            buf,
            "[{} {:<5} {}] {}",
            ts,
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder.init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_filter.as_deref());

    let deployment = DeploymentConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let rank = cli.rank.unwrap_or(deployment.service.server_rank);
    let session = Session::new(deployment.service.clone(), rank)?;
    info!(
        "event=sap_boot rank={} participants={} config={}",
        rank,
        session.config.participants,
        cli.config.display()
    );

    let transport = TcpTransport::connect(&deployment.mesh, rank, TcpTransportOptions::default())
        .context("forming the TCP mesh")?;
    let mut server = SapServer::new(transport, &session)?;
    let snapshot = server.run()?;

    let json = serde_json::to_string_pretty(&snapshot)?;
    match cli.metrics_out {
        Some(path) => std::fs::write(&path, json)
            .with_context(|| format!("writing metrics to {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}

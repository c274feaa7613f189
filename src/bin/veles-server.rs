//! Veles server binary
//!
//! Opens the database, listens on the configured URL and serves clients
//! until interrupted.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::info;
use veles::backend::SqliteBackend;
use veles::config::{ConfigLoader, VelesConfig};
use veles::conn::LocalConnection;
use veles::logging::init_logging;
use veles::proto::VelesUrl;
use veles::{Server, Tracker};

#[derive(Parser)]
#[command(name = "veles-server")]
#[command(about = "Hierarchical object store server")]
#[command(version)]
struct Cli {
    /// Database file
    #[arg(long)]
    database: Option<PathBuf>,

    /// Listen URL, e.g. veles://KEY@127.0.0.1:3135 or veles+unix://KEY@/run/veles.sock
    #[arg(long)]
    url: Option<String>,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    log_format: Option<String>,

    /// Log output (stdout, stderr, file, file+stderr, both)
    #[arg(long)]
    log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print the effective configuration (toml or json) and exit
    #[arg(long, value_name = "FORMAT")]
    print_config: Option<String>,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<VelesConfig> {
        let mut config = match &self.config {
            Some(path) => ConfigLoader::load_from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => ConfigLoader::load().context("loading config")?,
        };
        if let Some(database) = &self.database {
            config.server.database = Some(database.clone());
        }
        if let Some(url) = &self.url {
            config.server.url = url.clone();
        }
        let logging = &mut config.logging;
        if let Some(level) = &self.log_level {
            logging.level = level.clone();
        }
        if let Some(format) = &self.log_format {
            logging.format = format.clone();
        }
        if let Some(output) = &self.log_output {
            logging.output = output.clone();
        }
        if let Some(file) = &self.log_file {
            logging.file = Some(file.clone());
        }
        Ok(config)
    }
}

fn render_config(config: &VelesConfig, format: &str) -> anyhow::Result<String> {
    match format {
        "toml" => Ok(toml::to_string_pretty(config)?),
        "json" => Ok(serde_json::to_string_pretty(config)?),
        other => anyhow::bail!("unknown config format {} (expected toml or json)", other),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.load_config()?;
    if let Some(format) = &cli.print_config {
        println!("{}", render_config(&config, format)?);
        return Ok(());
    }
    init_logging(Some(&config.logging)).context("initializing logging")?;
    config.validate()?;
    let url = VelesUrl::parse(&config.server.url)?;

    let path = config.server.database_path()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let backend = SqliteBackend::open(&path)
        .with_context(|| format!("opening database {}", path.display()))?;
    info!(database = %path.display(), "Opened database");

    let tracker = Tracker::new(Box::new(backend), config.tracker.handle_cache_size);
    let conn = LocalConnection::new(tracker);
    let server = Arc::new(Server::new(conn, url.key()).with_max_frame_size(config.server.max_frame_size));

    info!(url = %url, "Serving");
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Could not wait for SIGINT");
        }
    };
    server.listen(&url.endpoint, shutdown).await?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use pvwatch::duration::parse_duration;
use pvwatch::logging::init_logging;
use pvwatch::{
    Channel, EngineSettings, MonitorConfig, MonitorEngine, MonitorError, SimulatedTransport,
    StreamTransport, Transport,
};

#[derive(Parser, Debug)]
#[command(name = "pvwatch", version)]
#[command(about = "Monitor process variables and log every change to CSV")]
struct Args {
    /// Channel names to monitor
    #[arg(value_name = "PV_NAME")]
    pv_names: Vec<String>,

    /// Read channel names from a file (one per line, '#' comments allowed)
    #[arg(short, long, conflicts_with = "pv_names")]
    file: Option<PathBuf>,

    /// Prefix prepended to every channel name
    #[arg(short, long)]
    prefix: Option<String>,

    /// Clock offset in seconds added to source timestamps
    #[arg(short = 'o', long, allow_hyphen_values = true)]
    offset: Option<f64>,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    /// Also write log output to this file
    #[arg(short, long)]
    log_file: Option<PathBuf>,

    /// CSV dataset file (relative paths land under --data-dir)
    #[arg(short, long)]
    data_file: Option<PathBuf>,

    /// Directory for relative dataset paths
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Configuration file (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Clock skew warning threshold (e.g., "1s", "500ms")
    #[arg(long, value_parser = parse_duration)]
    skew_warn: Option<Duration>,

    /// Clock skew error threshold (e.g., "5s")
    #[arg(long, value_parser = parse_duration)]
    skew_error: Option<Duration>,

    /// Interval between status lines
    #[arg(long, value_parser = parse_duration)]
    status_interval: Option<Duration>,

    /// Report channels still unconnected after this long
    #[arg(long, value_parser = parse_duration)]
    connect_timeout: Option<Duration>,

    /// Write final run statistics to a JSON file
    #[arg(long)]
    summary: Option<PathBuf>,

    #[command(flatten)]
    source: SourceArgs,

    /// Update period of simulated channels
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    sim_period: Duration,
}

/// Where channel updates come from.
#[derive(clap::Args, Debug)]
#[group(required = true, multiple = false)]
struct SourceArgs {
    /// Use the built-in simulated IOC
    #[arg(long)]
    simulate: bool,

    /// Read JSON-line events from a TCP endpoint (host:port)
    #[arg(long)]
    connect: Option<String>,

    /// Read JSON-line events from standard input
    #[arg(long)]
    stdin: bool,
}

impl Args {
    /// Layer command-line flags over the loaded configuration.
    fn apply(&self, config: &mut MonitorConfig) {
        if !self.pv_names.is_empty() {
            config.channels = self.pv_names.clone();
            config.channel_file = None;
        }
        if let Some(file) = &self.file {
            config.channel_file = Some(file.clone());
            config.channels.clear();
        }
        if let Some(prefix) = &self.prefix {
            config.prefix = prefix.clone();
        }
        if let Some(offset) = self.offset {
            config.clock_offset = offset;
        }
        if self.verbose {
            config.verbose = true;
        }
        if let Some(path) = &self.log_file {
            config.log_file = Some(path.clone());
        }
        if let Some(path) = &self.data_file {
            config.data_file = Some(path.clone());
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(d) = self.skew_warn {
            config.skew_warning = d;
        }
        if let Some(d) = self.skew_error {
            config.skew_error = d;
        }
        if let Some(d) = self.status_interval {
            config.status_interval = d;
        }
        if let Some(d) = self.connect_timeout {
            config.connect_timeout = d;
        }
        if let Some(path) = &self.summary {
            config.summary_file = Some(path.clone());
        }
    }
}

/// Exit status for a failed run: 2 when [`MonitorError::is_fatal`] says
/// startup was rejected, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<MonitorError>() {
        Some(e) if e.is_fatal() => 2,
        _ => 1,
    }
}

fn main() -> ExitCode {
    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

fn try_main() -> Result<()> {
    let args = Args::parse();

    let mut config = MonitorConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    let _log_guard = init_logging(config.verbose, config.log_file.as_deref())?;

    let channels = config.resolve_channels()?;
    let settings = config.engine_settings()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(&args, channels, settings))
}

async fn run(args: &Args, channels: Vec<Channel>, settings: EngineSettings) -> Result<()> {
    let transport = open_transport(args).await?;
    let engine = MonitorEngine::new(transport, settings);

    engine.start(channels).await?;
    tracing::info!("Press Ctrl+C to stop monitoring");

    shutdown_signal().await;
    engine.stop().await;
    Ok(())
}

async fn open_transport(args: &Args) -> Result<Arc<dyn Transport>> {
    if args.source.simulate {
        return Ok(Arc::new(SimulatedTransport::new(args.sim_period)));
    }

    if let Some(addr) = &args.source.connect {
        tracing::info!("Connecting to {}...", addr);
        let stream = tokio::net::TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        tracing::info!("Connected");
        return Ok(Arc::new(StreamTransport::spawn(stream, addr)));
    }

    Ok(Arc::new(StreamTransport::spawn(tokio::io::stdin(), "stdin")))
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Cannot listen for Ctrl+C: {}", e);
    }
}

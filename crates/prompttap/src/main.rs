//! prompttap daemon - records AI assistant conversations from IDE traffic

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use prompttap::capture::TransportPath;
use prompttap::capture::authority::CertificateAuthority;
use prompttap::capture::loopback::LoopbackSniffer;
use prompttap::capture::mitm::MitmProxy;
use prompttap::config::Config;
use prompttap::error::{Result, TapError};
use prompttap::pipeline::{Pipeline, PipelineCounters};
use prompttap::status::{self, StatusState};
use prompttap::storage::{JsonlSink, MongoSink, PersistenceAdapter, RecordSink};

const DEFAULT_MONGO_PORT: u16 = 27017;

/// prompttap - capture prompts and responses exchanged by AI coding assistants
#[derive(Parser)]
#[command(name = "prompttap")]
#[command(about = "Capture prompts and responses exchanged by AI coding assistants")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the capture daemon (default command)
    #[command(name = "serve")]
    Serve {
        /// Do not start the TLS-terminating proxy
        #[arg(long)]
        no_mitm: bool,

        /// Do not start the loopback sniffer
        #[arg(long)]
        no_loopback: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let mut config = Config::load(cli.config.as_deref())?;
    match cli.command {
        None => {}
        Some(Command::Serve {
            no_mitm,
            no_loopback,
        }) => {
            if no_mitm {
                config.proxy.enabled = false;
            }
            if no_loopback {
                config.loopback.enabled = false;
            }
        }
    }

    serve(config).await
}

fn init_logging(debug: bool) {
    let default_filter = if debug {
        "debug,prompttap=trace"
    } else {
        "info,prompttap=debug"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve(config: Config) -> Result<()> {
    if !config.proxy.enabled && !config.loopback.enabled {
        return Err(TapError::Config(
            "both the proxy and the loopback sniffer are disabled".to_string(),
        ));
    }

    tracing::info!("Starting prompttap");
    tracing::debug!("Config loaded: {:?}", config);

    let config = Arc::new(config);
    let adapter = Arc::new(build_storage(&config).await);
    let counters = Arc::new(PipelineCounters::new());
    let pipeline = Pipeline::start(config.clone(), adapter, counters.clone());

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let running = start_capture(&config, &pipeline, &shutdown, &mut tasks).await;
    if running.is_empty() {
        pipeline
            .shutdown(Duration::from_secs(config.pipeline.shutdown_grace_secs))
            .await;
        return Err(TapError::Capture(
            "no capture path could be started".to_string(),
        ));
    }

    if config.status.enabled {
        match status::bind(&config.status).await {
            Ok(listener) => {
                let state = StatusState {
                    pipeline: pipeline.clone(),
                    started_at: Utc::now(),
                };
                tasks.spawn(status::serve(listener, state, shutdown.clone()));
            }
            Err(e) => tracing::warn!("Status endpoint disabled: {e}"),
        }
    }

    tokio::select! {
        _ = shutdown_signal() => {}
        Some(joined) = tasks.join_next() => {
            match joined {
                Ok(Ok(())) => tracing::warn!("A capture task stopped unexpectedly"),
                Ok(Err(e)) => tracing::error!("A capture task failed: {e}"),
                Err(e) => tracing::error!("A capture task panicked: {e}"),
            }
        }
    }

    tracing::info!("Shutting down");
    shutdown.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Err(e)) = joined {
            tracing::warn!("Task ended with error during shutdown: {e}");
        }
    }

    pipeline
        .shutdown(Duration::from_secs(config.pipeline.shutdown_grace_secs))
        .await;

    tracing::info!("prompttap stopped");
    Ok(())
}

/// Start every enabled capture path and return the ones that came up.
///
/// A path that cannot start is logged and left out; the others keep running.
async fn start_capture(
    config: &Arc<Config>,
    pipeline: &Arc<Pipeline>,
    shutdown: &CancellationToken,
    tasks: &mut JoinSet<Result<()>>,
) -> Vec<TransportPath> {
    let mut running = Vec::new();

    if config.proxy.enabled {
        match start_mitm(config, pipeline).await {
            Ok((proxy, listener)) => {
                tasks.spawn(proxy.serve(listener, shutdown.clone()));
                running.push(TransportPath::Mitm);
            }
            Err(e) => tracing::error!("MITM capture disabled: {e}"),
        }
    }

    if config.loopback.enabled {
        let sniffer = LoopbackSniffer::new(
            config.loopback.clone(),
            own_ports(config),
            pipeline.clone(),
            pipeline.counters().clone(),
        );
        match sniffer.start().await {
            Ok((child, stdout)) => {
                let token = shutdown.clone();
                tasks.spawn(async move {
                    // Dropping the child stops the capture tool.
                    let _child = child;
                    sniffer.run(stdout, token).await
                });
                running.push(TransportPath::Loopback);
            }
            Err(e) => tracing::error!("Loopback capture disabled: {e}"),
        }
    }

    running
}

async fn start_mitm(config: &Config, pipeline: &Arc<Pipeline>) -> Result<(Arc<MitmProxy>, TcpListener)> {
    let authority = CertificateAuthority::load(
        &config.proxy.ca_cert_path,
        &config.proxy.ca_key_path,
        config.proxy.leaf_cache_size,
    )?;
    let proxy = Arc::new(MitmProxy::new(
        config.proxy.clone(),
        Arc::new(authority),
        pipeline.clone(),
        pipeline.counters().clone(),
    )?);
    let listener = proxy.bind().await?;
    Ok((proxy, listener))
}

/// Primary store is optional; an unreachable one starts the adapter degraded
async fn build_storage(config: &Config) -> PersistenceAdapter {
    let storage = &config.storage;
    let fallback: Arc<dyn RecordSink> = Arc::new(JsonlSink::new(storage.fallback_dir.clone()));
    tracing::info!("Fallback records go to {}", storage.fallback_dir.display());

    if !storage.mongo_enabled {
        tracing::info!("Primary store disabled, writing fallback files only");
        return PersistenceAdapter::new(None, fallback, storage);
    }

    let sink = match MongoSink::new(storage).await {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            tracing::error!("Primary store unusable, writing fallback files only: {e}");
            return PersistenceAdapter::new(None, fallback, storage);
        }
    };

    let init = sink.init().await;
    let adapter = PersistenceAdapter::new(Some(sink as Arc<dyn RecordSink>), fallback, storage);
    match init {
        Ok(()) => tracing::info!(database = %storage.database, "Connected to primary store"),
        Err(e) => adapter.start_degraded(&e.to_string()).await,
    }
    adapter
}

/// Ports of our own traffic that the sniffer must never capture
fn own_ports(config: &Config) -> Vec<u16> {
    let mut ports = Vec::new();
    if let Some(port) = config.proxy.port() {
        ports.push(port);
    }
    if config.status.enabled {
        if let Some((_, port)) = config.status.listen_addr.rsplit_once(':') {
            if let Ok(port) = port.parse() {
                ports.push(port);
            }
        }
    }
    if config.storage.mongo_enabled {
        ports.push(mongo_port(&config.storage.mongo_uri));
    }
    ports
}

fn mongo_port(uri: &str) -> u16 {
    url::Url::parse(uri)
        .ok()
        .and_then(|url| url.port())
        .unwrap_or(DEFAULT_MONGO_PORT)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

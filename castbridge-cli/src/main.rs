use std::sync::Arc;

use castbridge_engine::{
    Channel, ChannelManager, HttpProvider, SessionStore, StreamServer, UpstreamProvider,
    create_client,
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod cli;
mod config;
mod error;

use cli::CliArgs;
use config::{ACCOUNT, FileConfig, ProgramConfig};
use error::AppError;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();
    let _log_guard = init_logging(&args)?;

    info!("Castbridge {}", env!("CARGO_PKG_VERSION"));

    let file = FileConfig::load(args.config.as_deref())?;
    let ProgramConfig {
        engine: config,
        credentials,
    } = ProgramConfig::resolve(file, &args)?;

    let client = create_client(&config.http)?;
    let provider: Arc<dyn UpstreamProvider> =
        Arc::new(HttpProvider::new(client, config.upstream.clone()));
    let sessions = Arc::new(SessionStore::new(provider.clone(), config.session.clone()));
    sessions.register(credentials);

    // Log in up front so bad credentials fail at startup
    sessions.acquire(ACCOUNT).await?;

    let lineup = provider.lineup().await?;
    let channels: Vec<Channel> = lineup
        .iter()
        .map(|entry| Channel::from_lineup(entry, ACCOUNT))
        .collect();
    if channels.is_empty() {
        warn!("Upstream lineup is empty");
    }
    info!(channels = channels.len(), "Channel lineup loaded");

    let manager = ChannelManager::new(config.clone(), provider, sessions, channels)?;

    if args.list {
        for channel in manager.list_channels() {
            println!(
                "{:>4}  {:<32} {:<20} {}",
                channel.number, channel.name, channel.genre, channel.stream_url
            );
        }
        manager.shutdown().await;
        return Ok(());
    }

    let server = StreamServer::new(manager.clone(), &config);
    let listener = server.bind().await?;
    info!("Stream URLs look like {}channel/<number>", config.server.base_url());

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    server.run(listener, cancel).await?;
    manager.shutdown().await;
    info!("Bye");
    Ok(())
}

fn init_logging(args: &CliArgs) -> Result<WorkerGuard, AppError> {
    let filter = if args.quiet {
        EnvFilter::new("warn")
    } else if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&args.log_file)?;
    let (file_writer, guard) = tracing_appender::non_blocking(log_file);

    let multi_writer = MakeWriterExt::and(std::io::stdout, file_writer);

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(multi_writer)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    Ok(guard)
}

/// Cancel `cancel` on Ctrl-C or SIGTERM
async fn watch_signals(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("Shutdown requested");
    cancel.cancel();
}

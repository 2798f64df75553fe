use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtp_broadcast::broadcast::{BroadcastHandle, RtpIngest};
use rtp_broadcast::config::AppConfig;
use rtp_broadcast::events::EventBus;
use rtp_broadcast::state::AppState;
use rtp_broadcast::utils::bind_tcp_listener;
use rtp_broadcast::web;
use rtp_broadcast::webrtc::RtcEngine;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// rtp-broadcast command line arguments
#[derive(Parser, Debug)]
#[command(name = "rtp-broadcast")]
#[command(version, about = "Broadcast a live RTP stream to WebRTC viewers", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML); defaults are used when omitted
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// UDP address for RTP ingest, e.g. 0.0.0.0:6969 (overrides config)
    #[arg(short = 'i', long, value_name = "ADDR:PORT")]
    ingest: Option<String>,

    /// Track ID announced to viewers
    #[arg(long, value_name = "ID")]
    track_id: Option<String>,

    /// Stream ID announced to viewers
    #[arg(long, value_name = "ID")]
    stream_id: Option<String>,

    /// Largest accepted RTP datagram in bytes
    #[arg(long, value_name = "BYTES")]
    mtu: Option<usize>,

    /// Maximum concurrent viewers
    #[arg(long, value_name = "N")]
    max_viewers: Option<usize>,

    /// Directory served at `/` (viewer page)
    #[arg(long, value_name = "DIR")]
    static_dir: Option<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting rtp-broadcast v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path).await?,
        None => AppConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    let http_addr: SocketAddr =
        format!("{}:{}", config.web.bind_address, config.web.http_port).parse()?;

    let events = std::sync::Arc::new(EventBus::new());
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let engine = RtcEngine::new(config.webrtc.clone());
    let handle = BroadcastHandle::new(
        config.broadcast.clone(),
        &config.stream,
        engine,
        events.clone(),
    );

    // Ingest failure ends the broadcast, but the web server keeps answering
    let ingest = RtpIngest::bind(&config.ingest, config.stream.mtu, handle.clone())?;
    let ingest_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        if let Err(e) = ingest.run(ingest_shutdown).await {
            tracing::error!("RTP ingest stopped: {}", e);
        }
    });

    let state = AppState::new(config, handle.clone(), events, shutdown_tx.clone());
    let app = web::create_router(state);

    let listener = tokio::net::TcpListener::from_std(bind_tcp_listener(http_addr)?)?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
        handle.shutdown().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Command-line flags win over the config file
fn apply_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(address) = &args.address {
        config.web.bind_address = address.clone();
    }
    if let Some(port) = args.http_port {
        config.web.http_port = port;
    }
    if let Some(ingest) = &args.ingest {
        config.ingest.bind_address = ingest.clone();
    }
    if let Some(track_id) = &args.track_id {
        config.stream.track_id = track_id.clone();
    }
    if let Some(stream_id) = &args.stream_id {
        config.stream.stream_id = stream_id.clone();
    }
    if let Some(mtu) = args.mtu {
        config.stream.mtu = mtu;
    }
    if let Some(max_viewers) = args.max_viewers {
        config.broadcast.max_viewers = max_viewers;
    }
    if let Some(dir) = &args.static_dir {
        config.web.static_dir = Some(dir.clone());
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "rtp_broadcast=error,tower_http=error",
        LogLevel::Warn => "rtp_broadcast=warn,tower_http=warn",
        LogLevel::Info => "rtp_broadcast=info,tower_http=info",
        LogLevel::Verbose => "rtp_broadcast=debug,tower_http=info",
        LogLevel::Debug => "rtp_broadcast=debug,tower_http=debug,webrtc=info",
        LogLevel::Trace => "rtp_broadcast=trace,tower_http=debug,webrtc=debug",
    };

    // RUST_LOG takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

//! privhelperd - privileged helper service.
//!
//! Started by the registrar as `privhelperd --descriptor <path>`. Reads the
//! installed service descriptor, checks that its own executable is the one the
//! descriptor names, binds the helper socket, and serves requests until
//! SIGTERM or SIGINT.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use privhelper_core::CodeIdentity;
use privhelper_core::install::ServiceDescriptor;
use privhelper_daemon::listener::DEFAULT_MAX_CONNECTIONS;
use privhelper_daemon::operations::{DEFAULT_MARKER_PATH, DEFAULT_PROTECTED_PATH};
use privhelper_daemon::{
    CallerPolicy, HelperDispatcher, ListenerConfig, ProtectedFileAccess, ServiceListener,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// privhelperd - privileged helper service
#[derive(Parser, Debug)]
#[command(name = "privhelperd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Installed service descriptor
    #[arg(long)]
    descriptor: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Seconds in-flight requests get to finish on shutdown
    #[arg(long, default_value_t = 5)]
    drain_timeout_secs: u64,

    /// File read by the privileged operation
    #[arg(long, default_value = DEFAULT_PROTECTED_PATH)]
    protected_path: PathBuf,

    /// Marker written by the privileged operation when the protected file is
    /// missing
    #[arg(long, default_value = DEFAULT_MARKER_PATH)]
    marker_path: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Refuse to serve under a descriptor recorded for a different binary.
fn verify_own_identity(descriptor: &ServiceDescriptor) -> Result<()> {
    let exe = std::env::current_exe().context("failed to locate own executable")?;
    let own = CodeIdentity::of_file(&exe)
        .with_context(|| format!("failed to hash {}", exe.display()))?;
    if own != descriptor.code_identity {
        bail!(
            "executable {} has code identity {}, descriptor expects {}",
            exe.display(),
            own.short(),
            descriptor.code_identity.short()
        );
    }
    Ok(())
}

async fn async_main(args: Args) -> Result<()> {
    init_tracing(&args)?;

    let descriptor = ServiceDescriptor::from_file(&args.descriptor)
        .with_context(|| format!("failed to load descriptor {}", args.descriptor.display()))?;
    verify_own_identity(&descriptor)?;

    info!(
        label = %descriptor.label,
        version = env!("CARGO_PKG_VERSION"),
        uid = nix::unistd::getuid().as_raw(),
        "Helper starting"
    );

    let config = ListenerConfig::for_descriptor(&descriptor)
        .with_max_connections(args.max_connections)
        .with_drain_timeout(Duration::from_secs(args.drain_timeout_secs));
    let policy = Arc::new(CallerPolicy::from_rules(&descriptor.accept));
    let listener = Arc::new(
        ServiceListener::bind(config, policy).context("failed to bind helper socket")?,
    );

    let operation = ProtectedFileAccess::new(&args.protected_path, &args.marker_path);
    let handler = Arc::new(HelperDispatcher::new(Arc::new(operation)));

    let mut server = tokio::spawn({
        let listener = Arc::clone(&listener);
        async move { listener.run(handler).await }
    });

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
        result = &mut server => {
            // The accept loop only returns on its own when something broke.
            match result {
                Ok(Ok(())) => {},
                Ok(Err(e)) => error!("Listener failed: {e}"),
                Err(e) => error!("Listener task panicked: {e}"),
            }
            listener.stop().await;
            bail!("listener exited unexpectedly");
        },
    }

    listener.stop().await;
    server
        .await
        .context("listener task panicked")?
        .context("listener failed")?;
    info!(label = %descriptor.label, "Helper stopped");
    Ok(())
}

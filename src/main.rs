use anyhow::Result;
use clap::Parser;
use hologram_sidecar::{SidecarServer, UnavailableFactory};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Hologram sidecar - context engine TCP daemon")]
struct Args {
    /// Host to bind
    #[clap(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 = OS assigns)
    #[clap(short, long, default_value_t = 0)]
    port: u16,

    /// Path to write the assigned TCP port number (PID file is written
    /// alongside it as hologram.pid)
    #[clap(long)]
    port_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short, long, default_value = "info")]
    log_level: String,
}

/// Port and PID files removed on exit, on both the signal path and the
/// normal shutdown path.
#[derive(Default)]
struct CleanupFiles {
    files: Vec<PathBuf>,
}

impl Drop for CleanupFiles {
    fn drop(&mut self) {
        for file in &self.files {
            if let Err(e) = fs::remove_file(file) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", file.display(), e);
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting hologram sidecar v{}", env!("CARGO_PKG_VERSION"));

    let mut server = SidecarServer::new(&args.host, args.port, Arc::new(UnavailableFactory));
    let port = server.start().await?;

    // Write port and PID files only after a successful bind.
    let mut cleanup = CleanupFiles::default();
    if let Some(port_file) = &args.port_file {
        if let Some(parent) = port_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(port_file, port.to_string())?;
        cleanup.files.push(port_file.clone());
        info!("Port file written: {} (port {})", port_file.display(), port);

        let pid_file = port_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("hologram.pid");
        fs::write(&pid_file, std::process::id().to_string())?;
        info!(
            "PID file written: {} (pid {})",
            pid_file.display(),
            std::process::id()
        );
        cleanup.files.push(pid_file);
    }

    // Route SIGTERM/SIGINT into the cooperative shutdown signal.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let state = server.state();
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            }
            state.request_shutdown();
        });
    }

    info!("Sidecar ready on {}:{}", args.host, port);
    server.serve().await?;

    drop(cleanup);
    info!("Sidecar shutdown complete");
    Ok(())
}

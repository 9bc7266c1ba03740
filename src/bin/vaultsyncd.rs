use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use vaultsync::cli::DaemonOpts;
use vaultsync::config::ServerSettings;
use vaultsync::logger::init_tracing;
use vaultsync::net::server::Server;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(if opts.verbose { "debug" } else { "info" });

    let settings = ServerSettings::load_or_create(&opts.config)?;
    let bind = opts
        .bind
        .clone()
        .unwrap_or_else(|| format!("0.0.0.0:{}", settings.port));

    if settings.folders.is_empty() {
        tracing::warn!(config = %opts.config.display(), "no backup folders configured");
    }
    for f in &settings.folders {
        if !f.real_path.is_dir() {
            tracing::warn!(folder = %f.virtual_name, path = %f.real_path.display(), "folder path does not exist yet");
        }
        tracing::info!(
            folder = %f.virtual_name,
            path = %f.real_path.display(),
            backup_type = %f.backup_type,
            "serving folder"
        );
    }
    if bind.starts_with("0.0.0.0") {
        tracing::warn!("binding to 0.0.0.0 exposes the daemon on every interface; traffic is not encrypted");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(async move {
        let server = Arc::new(Server::new(settings)?);
        let listener = Server::bind(&bind).await?;
        server.run(listener).await
    })
}

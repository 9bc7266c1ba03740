//! Clap options shared by the vaultsync binaries

use crate::config::BackupType;
use crate::net::client::Direction;
use crate::protocol::timeouts::KEEP_ALIVE_MS;
use crate::protocol::{DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PACKET_SIZE};
use clap::{ArgAction, Parser};
use std::path::PathBuf;

/// vaultsyncd: serve backup folders to vaultsync clients
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct DaemonOpts {
    /// Settings file (created with an admin/admin account if missing)
    #[arg(long, short = 'c', default_value = "vaultsyncd.toml")]
    pub config: PathBuf,

    /// Bind address (host:port); defaults to 0.0.0.0 and the configured port
    #[arg(long)]
    pub bind: Option<String>,

    /// Debug-level logging unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,
}

/// vaultsync: back up, restore or two-way sync a folder with a vaultsyncd server
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct ClientOpts {
    /// Remote folder (vault://host[:port]/folder)
    pub url: String,

    /// Local folder
    pub source: PathBuf,

    /// What the job does
    #[arg(long, short = 'd', value_enum, default_value = "backup")]
    pub direction: Direction,

    #[arg(long, short = 'u', default_value = "admin")]
    pub user: String,

    /// Password (or set VAULTSYNC_PASSWORD)
    #[arg(long, short = 'p', env = "VAULTSYNC_PASSWORD", default_value = "")]
    pub password: String,

    /// Report what would change without changing anything
    #[arg(short = 'l', long, alias = "list-only")]
    pub dry_run: bool,

    /// Parallel connections to propose
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Largest data block to propose, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_PACKET_SIZE)]
    pub max_packet_size: usize,

    #[arg(long)]
    pub ignore_hidden: bool,

    #[arg(long)]
    pub ignore_system: bool,

    /// Ignore files matching a glob; prefix with @ for a regex
    #[arg(long = "ignore", action = ArgAction::Append)]
    pub ignored_patterns: Vec<String>,

    /// Refuse to run unless the folder has this backup type
    #[arg(long, value_enum)]
    pub backup_type: Option<BackupType>,

    #[arg(long, default_value_t = KEEP_ALIVE_MS)]
    pub keep_alive_ms: u64,

    /// Compact the local operation log after a two-way sync
    #[arg(long)]
    pub compact_log: bool,

    /// Append job events to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Show a spinner and print each file as it completes
    #[arg(long)]
    pub progress: bool,

    /// Debug-level logging unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,
}

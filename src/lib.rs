//! vaultsync: backup, restore and two-way sync over a compressed TCP protocol.
//!
//! A client opens one main connection per job, negotiates a session with the
//! daemon and moves files over a pool of auxiliary connections that share
//! the session id.

pub mod buffer;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod file_info;
pub mod fs_enum;
pub mod log;
pub mod logger;
pub mod message;
pub mod net;
pub mod orchestrator;
pub mod packet;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
#[cfg(feature = "server")]
pub mod session;
pub mod strategy;
pub mod tracker;
pub mod transfer;
pub mod url;

pub use error::{SyncError, SyncResult};

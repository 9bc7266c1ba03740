//! Shared protocol constants for the vaultsync framed transport

// Defaults proposed in the handshake; the session uses min(client, server)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;
pub const DEFAULT_MAX_CONNECTIONS: usize = 5;
pub const DEFAULT_PORT: u16 = 8090;

// Negotiated values are clamped into these bounds
pub const MIN_PACKET_SIZE: usize = 1024;
pub const MAX_PACKET_SIZE_LIMIT: usize = 64 * 1024 * 1024;
pub const MAX_CONNECTIONS_LIMIT: usize = 64;

// Allowance above max packet size for header, message fields and deflate expansion
pub const FRAME_OVERHEAD: usize = 16 * 1024;

// length(4) | connection id(4) | session id(16) | packet id(4) | type(2)
pub const HEADER_LEN: usize = 30;

// Connection id 0 is the main connection; auxiliary connections use 1..=N
pub const MAIN_CONNECTION_ID: u32 = 0;

// Two-character message codes (stable; extend by adding, never reuse)
pub mod code {
    pub const CONNECT: [u8; 2] = *b"CN";
    pub const CONNECT_RESPONSE: [u8; 2] = *b"CR";
    pub const FILE_LIST: [u8; 2] = *b"FL";
    pub const FILE_LIST_RESPONSE: [u8; 2] = *b"FR";
    pub const FILE_DESCRIPTOR: [u8; 2] = *b"FD";
    pub const FILE_DESCRIPTOR_ACK: [u8; 2] = *b"FA";
    pub const FILE_DATA: [u8; 2] = *b"FT";
    pub const FILE_DATA_ACK: [u8; 2] = *b"FK";
    pub const FILE_END: [u8; 2] = *b"FE";
    pub const FILE_END_ACK: [u8; 2] = *b"EA";
    pub const SYNC_END: [u8; 2] = *b"SE";
    pub const SYNC_END_ACK: [u8; 2] = *b"SA";
    pub const ERROR: [u8; 2] = *b"ER";
    pub const START_RESTORE: [u8; 2] = *b"RS";
    pub const START_RESTORE_ACK: [u8; 2] = *b"RK";
    pub const KEEP_ALIVE: [u8; 2] = *b"KA";
    pub const FILE_SYNC: [u8; 2] = *b"SY";
    pub const FILE_SYNC_ACK: [u8; 2] = *b"SK";
}

// Error codes carried by ER messages
pub mod error_code {
    pub const PROTOCOL: &str = "ERR_PROTOCOL";
    pub const AUTH: &str = "ERR_AUTH";
    pub const ACCESS: &str = "ERR_ACCESS";
    pub const BUSY: &str = "ERR_BUSY";
    pub const BACKUP_TYPE: &str = "ERR_BACKUP_TYPE";
}

/// Name prefix of files still being received. They are never scanned.
pub const PARTIAL_PREFIX: &str = ".vaultsync-";

// Bookkeeping files kept at the root of every two-way folder; never scanned or sent
pub mod logs {
    pub const LAST_UPDATE: &str = ".lastupdate.log";
    pub const OPERATIONS: &str = ".operation.log";
    pub const LAST_COMPACT: &str = ".lastcompact.log";
    pub const CONFLICTS: &str = ".conflicts.log";
    /// Written by compaction and renamed over `OPERATIONS`.
    pub const OPERATIONS_TMP: &str = ".operation.log.tmp";

    pub const ALL: [&str; 5] = [LAST_UPDATE, OPERATIONS, LAST_COMPACT, CONFLICTS, OPERATIONS_TMP];

    pub fn is_log_file(relative_path: &str) -> bool {
        ALL.contains(&relative_path)
    }
}

pub mod timeouts {
    // Heartbeat on the idle main connection (ms)
    pub const KEEP_ALIVE_MS: u64 = 3000;

    // Sessions untouched for this long are swept by the daemon (s)
    pub const SESSION_TIMEOUT_SECS: u64 = 30;

    // How often the sweep runs (ms)
    pub const SESSION_SWEEP_MS: u64 = 5000;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5000;
}

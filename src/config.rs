//! Server settings: users, backup folders and transport limits.
//!
//! Stored as TOML. A missing file is created with one admin user so a fresh
//! daemon can be reached before anyone edits it.

use crate::buffer::WireEnum;
use crate::protocol::{timeouts, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PACKET_SIZE, DEFAULT_PORT};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// How a server folder stores and diffs incoming files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackupType {
    Preserve,
    Mirror,
    DateSeparated,
    TwoWaySync,
}

impl WireEnum for BackupType {
    const KIND: &'static str = "backup type";

    fn to_wire(&self) -> u8 {
        match self {
            BackupType::Preserve => 0,
            BackupType::Mirror => 1,
            BackupType::DateSeparated => 2,
            BackupType::TwoWaySync => 3,
        }
    }

    fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(BackupType::Preserve),
            1 => Some(BackupType::Mirror),
            2 => Some(BackupType::DateSeparated),
            3 => Some(BackupType::TwoWaySync),
            _ => None,
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupType::Preserve => "preserve",
            BackupType::Mirror => "mirror",
            BackupType::DateSeparated => "date-separated",
            BackupType::TwoWaySync => "two-way-sync",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u32,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFolder {
    pub virtual_name: String,
    pub real_path: PathBuf,
    #[serde(default = "default_backup_type")]
    pub backup_type: BackupType,
    #[serde(default)]
    pub allowed_users: Vec<u32>,
    #[serde(default)]
    pub ignore_hidden: bool,
    #[serde(default)]
    pub ignore_system: bool,
    #[serde(default)]
    pub ignored_patterns: Vec<String>,
}

fn default_backup_type() -> BackupType {
    BackupType::Preserve
}

impl BackupFolder {
    pub fn is_accessible_by(&self, user: &User) -> bool {
        user.admin || self.allowed_users.contains(&user.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    pub max_packet_size: usize,
    pub max_connections: usize,
    pub session_timeout_secs: u64,
    pub users: Vec<User>,
    pub folders: Vec<BackupFolder>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            session_timeout_secs: timeouts::SESSION_TIMEOUT_SECS,
            users: Vec::new(),
            folders: Vec::new(),
        }
    }
}

/// Why a Connect was refused. Maps onto the ER codes sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDenied {
    BadCredentials,
    UnknownFolder(String),
    NotAllowed(String),
}

impl fmt::Display for AccessDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessDenied::BadCredentials => write!(f, "invalid username or password"),
            AccessDenied::UnknownFolder(name) => write!(f, "no backup folder named {:?}", name),
            AccessDenied::NotAllowed(name) => write!(f, "no access to folder {:?}", name),
        }
    }
}

impl ServerSettings {
    /// Settings with a single admin account.
    pub fn with_admin(username: &str, password: &str) -> Self {
        Self {
            users: vec![User {
                id: 1,
                username: username.to_string(),
                password: password.to_string(),
                admin: true,
            }],
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings {}", path.display()))?;
        let settings: Self =
            toml::from_str(&text).with_context(|| format!("parsing settings {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load `path`, writing a default file first if it does not exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let settings = Self::with_admin("admin", "admin");
        settings.save(path)?;
        tracing::warn!(path = %path.display(), "created default settings with user admin/admin");
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let text = toml::to_string_pretty(self).context("serializing settings")?;
        std::fs::write(path, text).with_context(|| format!("writing settings {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size == 0 || self.max_connections == 0 {
            bail!("max_packet_size and max_connections must be positive");
        }
        for (i, f) in self.folders.iter().enumerate() {
            if f.virtual_name.is_empty() {
                bail!("folder #{} has an empty virtual_name", i + 1);
            }
            if self.folders[..i].iter().any(|o| o.virtual_name == f.virtual_name) {
                bail!("folder {:?} is defined twice", f.virtual_name);
            }
        }
        for (i, u) in self.users.iter().enumerate() {
            if self.users[..i].iter().any(|o| o.id == u.id || o.username == u.username) {
                bail!("user {:?} is defined twice", u.username);
            }
        }
        Ok(())
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Option<&User> {
        self.users
            .iter()
            .find(|u| u.username == username && u.password == password)
    }

    pub fn folder(&self, virtual_name: &str) -> Option<&BackupFolder> {
        self.folders.iter().find(|f| f.virtual_name == virtual_name)
    }

    /// Authenticate and resolve the folder in one step.
    pub fn authorize(
        &self,
        username: &str,
        password: &str,
        folder: &str,
    ) -> std::result::Result<(&User, &BackupFolder), AccessDenied> {
        let user = self
            .authenticate(username, password)
            .ok_or(AccessDenied::BadCredentials)?;
        let folder_cfg = self
            .folder(folder)
            .ok_or_else(|| AccessDenied::UnknownFolder(folder.to_string()))?;
        if !folder_cfg.is_accessible_by(user) {
            return Err(AccessDenied::NotAllowed(folder.to_string()));
        }
        Ok((user, folder_cfg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
port = 9100
max_connections = 3

[[users]]
id = 1
username = "root"
password = "pw"
admin = true

[[users]]
id = 7
username = "alice"
password = "secret"

[[folders]]
virtual_name = "photos"
real_path = "/srv/photos"
backup_type = "date-separated"
allowed_users = [7]
ignored_patterns = ["*.tmp"]

[[folders]]
virtual_name = "private"
real_path = "/srv/private"
"#;

    #[test]
    fn test_parse_settings_with_defaults() {
        let s: ServerSettings = toml::from_str(SAMPLE).unwrap();
        s.validate().unwrap();
        assert_eq!(s.port, 9100);
        assert_eq!(s.max_connections, 3);
        assert_eq!(s.max_packet_size, DEFAULT_MAX_PACKET_SIZE);
        assert_eq!(s.folders[0].backup_type, BackupType::DateSeparated);
        assert_eq!(s.folders[1].backup_type, BackupType::Preserve);
        assert!(!s.folders[1].ignore_hidden);
    }

    #[test]
    fn test_authorize() {
        let s: ServerSettings = toml::from_str(SAMPLE).unwrap();
        assert_eq!(s.authorize("alice", "secret", "photos").unwrap().0.id, 7);
        assert_eq!(
            s.authorize("alice", "wrong", "photos").unwrap_err(),
            AccessDenied::BadCredentials
        );
        assert_eq!(
            s.authorize("alice", "secret", "private").unwrap_err(),
            AccessDenied::NotAllowed("private".into())
        );
        assert!(matches!(
            s.authorize("alice", "secret", "nope").unwrap_err(),
            AccessDenied::UnknownFolder(_)
        ));
        // Admins see every folder
        assert!(s.authorize("root", "pw", "private").is_ok());
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("conf/vaultsyncd.toml");
        let created = ServerSettings::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert!(created.authenticate("admin", "admin").unwrap().admin);
        let again = ServerSettings::load_or_create(&path).unwrap();
        assert_eq!(created, again);
    }

    #[test]
    fn test_duplicate_folder_rejected() {
        let mut s = ServerSettings::with_admin("a", "b");
        let f = BackupFolder {
            virtual_name: "x".into(),
            real_path: "/x".into(),
            backup_type: BackupType::Mirror,
            allowed_users: vec![],
            ignore_hidden: false,
            ignore_system: false,
            ignored_patterns: vec![],
        };
        s.folders = vec![f.clone(), f];
        assert!(s.validate().is_err());
    }
}

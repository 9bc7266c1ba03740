//! URL parsing for the vault:// scheme

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub host: String,
    pub port: u16,
    pub folder: String,
}

/// Parse `vault://host[:port]/folder`. The folder is the server's virtual
/// folder name and must not be empty.
pub fn parse_remote_url(s: &str) -> Option<RemoteFolder> {
    let s_trim = s.trim();
    let lower = s_trim.to_ascii_lowercase();
    let scheme_end = lower.find(':')?;
    if &lower[..=scheme_end] != "vault:" {
        return None;
    }
    let rest = s_trim[scheme_end + 1..].strip_prefix("//")?;
    let (hp, folder) = rest.split_once('/')?;
    let folder = folder.trim_end_matches('/');
    if hp.is_empty() || folder.is_empty() {
        return None;
    }
    let (host, port) = match hp.rsplit_once(':') {
        Some((h, pr)) => (h.to_string(), pr.parse().ok()?),
        None => (hp.to_string(), DEFAULT_PORT),
    };
    if host.is_empty() {
        return None;
    }
    Some(RemoteFolder {
        host,
        port,
        folder: folder.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_remote_url() {
        let r = parse_remote_url("vault://nas:9000/photos").unwrap();
        assert_eq!(r.host, "nas");
        assert_eq!(r.port, 9000);
        assert_eq!(r.folder, "photos");

        let r = parse_remote_url("VAULT://nas/Docs/").unwrap();
        assert_eq!(r.port, DEFAULT_PORT);
        assert_eq!(r.folder, "Docs");

        assert!(parse_remote_url("vault://nas").is_none());
        assert!(parse_remote_url("vault://nas:x/docs").is_none());
        assert!(parse_remote_url("http://nas/docs").is_none());
        assert!(parse_remote_url("vault:///docs").is_none());
    }
}

//! URL parsing for ws:// base addresses

use crate::protocol::{CONTROL_PATH, UPLOAD_PREFIX};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUrl {
    pub host: String,
    pub port: u16,
    /// Path prefix the server is mounted under, without a trailing slash
    pub prefix: String,
}

pub fn parse_base_url(s: &str) -> Option<BaseUrl> {
    let s_trim = s.trim();
    let lower = s_trim.to_ascii_lowercase();
    let scheme_end = lower.find(':')?;
    if &lower[..=scheme_end] != "ws:" {
        return None;
    }
    let rest = s_trim[scheme_end + 1..].strip_prefix("//")?;
    let (hp, p) = rest.split_once('/').unwrap_or((rest, ""));
    if hp.is_empty() {
        return None;
    }
    let (host, port) = match hp.rsplit_once(':') {
        Some((h, pr)) => (h.to_string(), pr.parse().ok()?),
        None => (hp.to_string(), 80),
    };
    if host.is_empty() {
        return None;
    }
    let prefix = p.trim_end_matches('/');
    Some(BaseUrl {
        host,
        port,
        prefix: if prefix.is_empty() {
            String::new()
        } else {
            format!("/{}", prefix)
        },
    })
}

fn is_valid_transfer_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        && id != "."
        && id != ".."
}

impl BaseUrl {
    fn origin(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.prefix)
    }

    pub fn control_url(&self) -> String {
        format!("{}{}", self.origin(), CONTROL_PATH)
    }

    /// Per-transfer upload endpoint. Ids are embedded verbatim, so anything
    /// that would need escaping is rejected.
    pub fn upload_url(&self, transfer_id: &str) -> Option<String> {
        if !is_valid_transfer_id(transfer_id) {
            return None;
        }
        Some(format!("{}{}{}", self.origin(), UPLOAD_PREFIX, transfer_id))
    }
}

impl std::fmt::Display for BaseUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.origin())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let b = parse_base_url("ws://127.0.0.1:8080").unwrap();
        assert_eq!(b.host, "127.0.0.1");
        assert_eq!(b.port, 8080);
        assert_eq!(b.prefix, "");
        assert_eq!(b.control_url(), "ws://127.0.0.1:8080/control");
    }

    #[test]
    fn default_port_and_prefix() {
        let b = parse_base_url("WS://files.local/app/").unwrap();
        assert_eq!(b.port, 80);
        assert_eq!(b.prefix, "/app");
        assert_eq!(
            b.upload_url("0b6c9a2e-1f7d-4c1e-9d4b-2f0f8c1a7e55").as_deref(),
            Some("ws://files.local:80/app/api/uploads/0b6c9a2e-1f7d-4c1e-9d4b-2f0f8c1a7e55")
        );
    }

    #[test]
    fn rejects_other_schemes_and_garbage() {
        assert!(parse_base_url("wss://host").is_none());
        assert!(parse_base_url("http://host").is_none());
        assert!(parse_base_url("ws:host").is_none());
        assert!(parse_base_url("ws://").is_none());
        assert!(parse_base_url("ws://host:notaport").is_none());
        assert!(parse_base_url("ws://:9000").is_none());
    }

    #[test]
    fn rejects_unsafe_transfer_ids() {
        let b = parse_base_url("ws://h:1").unwrap();
        assert!(b.upload_url("").is_none());
        assert!(b.upload_url("..").is_none());
        assert!(b.upload_url("a/b").is_none());
        assert!(b.upload_url("a?b").is_none());
        assert!(b.upload_url("abc_DEF-1.2").is_some());
    }
}

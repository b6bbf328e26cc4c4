//! Upstream resolver discovery from `resolv.conf`

use log::debug;
use std::net::IpAddr;
use std::path::Path;

use crate::{Result, TunnelError};

/// System resolver configuration
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

/// First `nameserver` entry holding a plain IP address
///
/// Comment lines (`#` or `;`) and entries that do not parse as an address,
/// such as scoped IPv6 literals, are skipped.
pub fn parse_nameserver(contents: &str) -> Option<IpAddr> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match fields.next() {
                Some("nameserver") => fields.next(),
                _ => None,
            }
        })
        .find_map(|addr| addr.parse().ok())
}

/// Read `path` and return its first usable nameserver
pub fn upstream_from_file(path: &Path) -> Result<IpAddr> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        TunnelError::Argument(format!(
            "no upstream DNS IP given and {} is unreadable: {}",
            path.display(),
            e
        ))
    })?;

    let ip = parse_nameserver(&contents).ok_or_else(|| {
        TunnelError::Argument(format!(
            "no upstream DNS IP given and {} lists no nameserver",
            path.display()
        ))
    })?;

    debug!("Upstream resolver {} from {}", ip, path.display());
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_nameserver_wins() {
        let conf = "\
# generated by NetworkManager
search lan
nameserver 192.168.1.1
nameserver 8.8.8.8
";
        assert_eq!(parse_nameserver(conf), Some("192.168.1.1".parse().unwrap()));
    }

    #[test]
    fn test_comments_and_bad_entries_skipped() {
        let conf = "\
; nameserver 10.0.0.1
#nameserver 10.0.0.2
nameserver fe80::1%eth0
nameserver   2001:4860:4860::8888
";
        assert_eq!(
            parse_nameserver(conf),
            Some("2001:4860:4860::8888".parse().unwrap())
        );
    }

    #[test]
    fn test_no_nameserver() {
        assert_eq!(parse_nameserver("search example.com\noptions ndots:2\n"), None);
        assert_eq!(parse_nameserver(""), None);
    }

    #[test]
    fn test_missing_file_is_argument_error() {
        let result = upstream_from_file(Path::new("/nonexistent/dnsferry/resolv.conf"));
        assert!(matches!(result, Err(TunnelError::Argument(_))));
    }
}

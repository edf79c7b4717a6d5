//! Address parsing and validation.
//!
//! `validAddr("host:port")` parses `port` as a decimal integer and accepts
//! iff `0 < port < 65535`. The host portion is not further validated here;
//! transport-layer failures (unresolvable host, connection refused, ...)
//! surface through the connect path instead.

use std::fmt;

use crate::error::AddrError;

/// A validated, unresolved peer address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Addr {
    pub host: String,
    pub port: u16,
}

impl Addr {
    /// Parses `"host:port"`, rejecting malformed text and out-of-range
    /// ports. Accepts both bracketed (`[::1]:6881`) and plain IPv4/hostname
    /// forms.
    pub fn parse(s: &str) -> std::result::Result<Self, AddrError> {
        let (host, port) = split_host_port(s).ok_or(AddrError::Malformed)?;
        if host.is_empty() {
            return Err(AddrError::Malformed);
        }
        let port: u32 = port.parse().map_err(|_| AddrError::InvalidPort)?;
        if port == 0 || port >= 65535 {
            return Err(AddrError::InvalidPort);
        }
        Ok(Self {
            host: host.to_string(),
            port: port as u16,
        })
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Splits `"host:port"` on the last `:`, supporting a bracketed IPv6 host
/// (`"[::1]:6881"`) as well as plain hosts (`"example.com:6881"`).
fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let close = rest.find(']')?;
        let host = &rest[..close];
        let tail = &rest[close + 1..];
        let port = tail.strip_prefix(':')?;
        return Some((host, port));
    }
    let idx = s.rfind(':')?;
    Some((&s[..idx], &s[idx + 1..]))
}

/// Returns whether `addr` is a syntactically valid `host:port` pair.
pub fn is_valid(addr: &str) -> bool {
    Addr::parse(addr).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_host_port() {
        let a = Addr::parse("127.0.0.1:6881").unwrap();
        assert_eq!(a.host, "127.0.0.1");
        assert_eq!(a.port, 6881);
    }

    #[test]
    fn accepts_bracketed_ipv6() {
        let a = Addr::parse("[::1]:6881").unwrap();
        assert_eq!(a.host, "::1");
        assert_eq!(a.port, 6881);
    }

    #[test]
    fn rejects_zero_port() {
        assert_eq!(Addr::parse("127.0.0.1:0"), Err(AddrError::InvalidPort));
    }

    #[test]
    fn rejects_port_at_upper_bound() {
        // spec: 0 < port < 65535, so 65535 itself is invalid.
        assert_eq!(Addr::parse("127.0.0.1:65535"), Err(AddrError::InvalidPort));
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert_eq!(Addr::parse("127.0.0.1:http"), Err(AddrError::InvalidPort));
    }

    #[test]
    fn rejects_missing_separator() {
        assert_eq!(Addr::parse("127.0.0.1"), Err(AddrError::Malformed));
    }

    #[test]
    fn rejects_empty_host() {
        assert_eq!(Addr::parse(":6881"), Err(AddrError::Malformed));
    }

    #[test]
    fn is_valid_matches_parse() {
        assert!(is_valid("example.com:6881"));
        assert!(!is_valid("example.com:0"));
    }
}

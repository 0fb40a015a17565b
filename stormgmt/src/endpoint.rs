//! Cluster endpoint addresses and canonical endpoint sets.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A single `host:port` management endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

fn invalid(endpoint: &str, reason: impl Into<String>) -> Error {
    Error::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.into(),
    }
}

fn is_host_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '[' | ']' | ':' | '%' | '-')
}

/// Split `host:port`, accepting a bracketed IPv6 literal host.
fn split_host_port(s: &str) -> Result<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid(s, "missing ']' in address"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| invalid(s, "missing port in address"))?;
        if host.contains('[') || host.contains(']') || port.contains(']') {
            return Err(invalid(s, "unexpected bracket in address"));
        }
        return Ok((host, port));
    }
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| invalid(s, "missing port in address"))?;
    if host.contains(':') {
        return Err(invalid(s, "too many colons in address"));
    }
    if host.contains('[') || host.contains(']') {
        return Err(invalid(s, "unexpected bracket in address"));
    }
    Ok((host, port))
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.is_empty() {
            return Err(invalid(&format!(":{port}"), "empty host"));
        }
        if !host.chars().all(is_host_char) {
            return Err(invalid(&host, "host contains invalid characters"));
        }
        Ok(Self { host, port })
    }

    /// Parse `host:port` exactly as given, without trimming.
    pub fn parse_strict(s: &str) -> Result<Self> {
        let (host, port) = split_host_port(s)?;
        if host.is_empty() {
            return Err(invalid(s, "empty host"));
        }
        if !host.chars().all(is_host_char) {
            return Err(invalid(s, "host contains invalid characters"));
        }
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid(s, format!("invalid port '{port}'")));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| invalid(s, format!("port '{port}' out of range")))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Parse `host:port`, ignoring surrounding whitespace.
    pub fn parse(s: &str) -> Result<Self> {
        Self::parse_strict(s.trim())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// The canonical set of endpoints reaching one cluster.
///
/// Members are deduplicated and sorted by their string form, so two sets
/// holding the same endpoints in a different order compare equal and share
/// a [`key`](Self::key). An empty set can be constructed but is not
/// [valid](Self::is_valid); consumers reject it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct EndpointSet(Vec<Endpoint>);

impl EndpointSet {
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let mut keyed: Vec<(String, Endpoint)> = endpoints
            .into_iter()
            .map(|ep| (ep.to_string(), ep))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.dedup_by(|a, b| a.0 == b.0);
        Self(keyed.into_iter().map(|(_, ep)| ep).collect())
    }

    /// Parse each element leniently and canonicalize the result.
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        let endpoints = items
            .iter()
            .map(|s| Endpoint::parse(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(endpoints))
    }

    /// Parse a comma-separated list such as `"10.0.0.1:80,10.0.0.2:80"`.
    pub fn parse_csv(csv: &str) -> Result<Self> {
        let endpoints = csv
            .split(',')
            .map(Endpoint::parse_strict)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(endpoints))
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }

    /// Fail with `InvalidArgument` unless the set can identify a cluster.
    pub fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::InvalidArgument(
                "endpoint set must contain at least one endpoint".to_string(),
            ))
        }
    }

    /// Canonical string form, used as the pool's cache key.
    pub fn key(&self) -> String {
        self.to_string()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Endpoint> {
        self.0.iter()
    }
}

impl fmt::Display for EndpointSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, ep) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{ep}")?;
        }
        Ok(())
    }
}

impl FromStr for EndpointSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_csv(s)
    }
}

impl<'a> IntoIterator for &'a EndpointSet {
    type Item = &'a Endpoint;
    type IntoIter = std::slice::Iter<'a, Endpoint>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parse_valid() {
        let ep = Endpoint::parse("10.0.0.1:80").unwrap();
        assert_eq!(ep.host(), "10.0.0.1");
        assert_eq!(ep.port(), 80);
        assert_eq!(ep.to_string(), "10.0.0.1:80");
    }

    #[test]
    fn endpoint_parse_trims_whitespace() {
        let ep = Endpoint::parse("  mgmt.example.com:443 \n").unwrap();
        assert_eq!(ep.host(), "mgmt.example.com");
        assert!(Endpoint::parse_strict(" mgmt.example.com:443").is_err());
    }

    #[test]
    fn endpoint_parse_ipv6_brackets_round_trip() {
        let ep = Endpoint::parse("[fe80::1%eth0]:8080").unwrap();
        assert_eq!(ep.host(), "fe80::1%eth0");
        assert_eq!(ep.to_string(), "[fe80::1%eth0]:8080");
    }

    #[test]
    fn endpoint_parse_rejects_bare_ipv6() {
        let err = Endpoint::parse("fe80::1:80").unwrap_err();
        assert!(err.to_string().contains("too many colons"));
    }

    #[test]
    fn endpoint_parse_missing_port() {
        assert!(Endpoint::parse("10.0.0.1").is_err());
        assert!(Endpoint::parse("10.0.0.1:").is_err());
    }

    #[test]
    fn endpoint_parse_port_overflow() {
        assert!(Endpoint::parse("10.0.0.1:65536").is_err());
        assert!(Endpoint::parse("10.0.0.1:-1").is_err());
        assert!(Endpoint::parse("10.0.0.1:65535").is_ok());
    }

    #[test]
    fn endpoint_parse_empty_host() {
        assert!(Endpoint::parse(":80").is_err());
    }

    #[test]
    fn endpoint_parse_invalid_host_chars() {
        assert!(Endpoint::parse("bad_host:80").is_err());
        assert!(Endpoint::parse("bad/host:80").is_err());
    }

    #[test]
    fn endpoint_set_is_order_independent() {
        let a = EndpointSet::parse(&["10.0.0.2:80", "10.0.0.1:80"]).unwrap();
        let b = EndpointSet::parse_csv("10.0.0.1:80,10.0.0.2:80").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.key(), "10.0.0.1:80,10.0.0.2:80");
    }

    #[test]
    fn endpoint_set_dedups() {
        let set = EndpointSet::parse(&["h:1", "h:1", " h:1"]).unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn endpoint_set_empty_is_invalid() {
        let set = EndpointSet::parse::<&str>(&[]).unwrap();
        assert!(!set.is_valid());
        assert!(matches!(set.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn endpoint_set_csv_rejects_bad_member() {
        assert!(EndpointSet::parse_csv("10.0.0.1:80,nope").is_err());
        assert!(EndpointSet::parse_csv("").is_err());
    }
}

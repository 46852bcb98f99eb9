// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use crate::error::ParseError;

/// A single concrete address an upstream may be reached at. DNS names
/// resolve to one or more of these; UNIX socket paths and literal IPs map
/// to exactly one.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum UpstreamAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl UpstreamAddr {
    /// Preference weight of the address family: UNIX sockets are preferred
    /// over IPv4, IPv4 over IPv6.
    pub fn family_weight(&self) -> u8 {
        match self {
            UpstreamAddr::Unix(_) => 2,
            UpstreamAddr::Inet(sa) if sa.is_ipv4() => 1,
            UpstreamAddr::Inet(_) => 0,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            UpstreamAddr::Inet(sa) => Some(sa.port()),
            UpstreamAddr::Unix(_) => None,
        }
    }

    pub fn set_port(&mut self, port: u16) {
        if let UpstreamAddr::Inet(sa) = self {
            sa.set_port(port);
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, UpstreamAddr::Unix(_))
    }
}

impl From<SocketAddr> for UpstreamAddr {
    fn from(sa: SocketAddr) -> Self {
        UpstreamAddr::Inet(sa)
    }
}

impl fmt::Display for UpstreamAddr {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UpstreamAddr::Inet(sa) => sa.fmt(fmt),
            UpstreamAddr::Unix(path) => path.display().fmt(fmt),
        }
    }
}

// Outcome of parsing one upstream specification span.
#[doc(hidden)]
#[derive(Debug)]
pub struct ParsedHost {
    pub name: String,
    pub addrs: Vec<UpstreamAddr>,
    pub priority: u32,
    pub numeric: bool,
}

/// Parse a `host[:port][:priority]` specification. Numeric specifications
/// (literal IPs and UNIX paths) yield a single address; DNS names are
/// looked up synchronously through the system resolver and may yield
/// several. The optional trailing priority is only meaningful for the
/// weighted rotation policies.
pub fn parse_host_port_priority(
    spec: &str,
    def_port: u16,
) -> Result<ParsedHost, ParseError> {
    if spec.is_empty() {
        return Err(ParseError::EmptySpec);
    }

    if spec.starts_with('/') || spec.starts_with("./") {
        return Ok(ParsedHost {
            name: spec.to_string(),
            addrs: vec![UpstreamAddr::Unix(PathBuf::from(spec))],
            priority: 0,
            numeric: true,
        });
    }

    // A bare IPv6 literal contains colons of its own and cannot carry a
    // port suffix without brackets
    if let Ok(ip) = spec.parse::<IpAddr>() {
        return Ok(ParsedHost {
            name: spec.to_string(),
            addrs: vec![UpstreamAddr::Inet(SocketAddr::new(ip, def_port))],
            priority: 0,
            numeric: true,
        });
    }

    if spec.starts_with('[') {
        return parse_bracketed(spec, def_port);
    }

    let mut parts = spec.split(':');
    let host = parts.next().unwrap_or("");
    let m_port = parts.next();
    let m_priority = parts.next();

    if host.is_empty() || parts.next().is_some() {
        return Err(ParseError::MalformedSpec(spec.to_string()));
    }

    let port = match m_port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| ParseError::BadPort(p.to_string()))?,
        None => def_port,
    };
    let priority = match m_priority {
        Some(p) => p
            .parse::<u32>()
            .map_err(|_| ParseError::BadPriority(p.to_string()))?,
        None => 0,
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ParsedHost {
            name: host.to_string(),
            addrs: vec![UpstreamAddr::Inet(SocketAddr::new(ip, port))],
            priority,
            numeric: true,
        });
    }

    let addrs: Vec<UpstreamAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| ParseError::Unresolvable(host.to_string()))?
        .map(UpstreamAddr::Inet)
        .collect();

    if addrs.is_empty() {
        return Err(ParseError::Unresolvable(host.to_string()));
    }

    Ok(ParsedHost {
        name: host.to_string(),
        addrs,
        priority,
        numeric: false,
    })
}

/// Parse a literal address only: an IP with an optional port. This is the
/// strict form used for nameserver specifications.
pub fn parse_inet_address(
    spec: &str,
    def_port: u16,
) -> Result<UpstreamAddr, ParseError> {
    if let Ok(ip) = spec.parse::<IpAddr>() {
        return Ok(UpstreamAddr::Inet(SocketAddr::new(ip, def_port)));
    }

    if let Ok(sa) = spec.parse::<SocketAddr>() {
        return Ok(UpstreamAddr::Inet(sa));
    }

    Err(ParseError::MalformedSpec(spec.to_string()))
}

// `[v6addr]` or `[v6addr]:port`, possibly with a trailing `:priority`
fn parse_bracketed(
    spec: &str,
    def_port: u16,
) -> Result<ParsedHost, ParseError> {
    let close = spec
        .find(']')
        .ok_or_else(|| ParseError::MalformedSpec(spec.to_string()))?;
    let host = &spec[1..close];
    let rest = &spec[close + 1..];

    let ip = host
        .parse::<IpAddr>()
        .map_err(|_| ParseError::MalformedSpec(spec.to_string()))?;

    let (port, priority) = if rest.is_empty() {
        (def_port, 0)
    } else {
        let mut parts = rest
            .strip_prefix(':')
            .ok_or_else(|| ParseError::MalformedSpec(spec.to_string()))?
            .split(':');
        let port = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| ParseError::BadPort(rest.to_string()))?;
        let priority = match parts.next() {
            Some(p) => p
                .parse::<u32>()
                .map_err(|_| ParseError::BadPriority(p.to_string()))?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(ParseError::MalformedSpec(spec.to_string()));
        }
        (port, priority)
    };

    Ok(ParsedHost {
        name: host.to_string(),
        addrs: vec![UpstreamAddr::Inet(SocketAddr::new(ip, port))],
        priority,
        numeric: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_v4_with_port_and_priority() {
        let parsed = parse_host_port_priority("10.0.0.1:8080:5", 53).unwrap();
        assert_eq!(parsed.name, "10.0.0.1");
        assert_eq!(parsed.priority, 5);
        assert!(parsed.numeric);
        assert_eq!(
            parsed.addrs,
            vec![UpstreamAddr::Inet("10.0.0.1:8080".parse().unwrap())]
        );
    }

    #[test]
    fn parse_v4_default_port() {
        let parsed = parse_host_port_priority("192.168.1.1", 11333).unwrap();
        assert_eq!(parsed.addrs[0].port(), Some(11333));
        assert!(parsed.numeric);
    }

    #[test]
    fn parse_bare_v6() {
        let parsed = parse_host_port_priority("::1", 53).unwrap();
        assert!(parsed.numeric);
        assert_eq!(parsed.addrs[0].port(), Some(53));
    }

    #[test]
    fn parse_bracketed_v6_with_port() {
        let parsed = parse_host_port_priority("[::1]:8080", 53).unwrap();
        assert_eq!(parsed.name, "::1");
        assert_eq!(
            parsed.addrs,
            vec![UpstreamAddr::Inet("[::1]:8080".parse().unwrap())]
        );
    }

    #[test]
    fn parse_unix_path() {
        let parsed = parse_host_port_priority("/var/run/svc.sock", 53).unwrap();
        assert!(parsed.numeric);
        assert!(parsed.addrs[0].is_unix());
        assert_eq!(parsed.addrs[0].port(), None);
    }

    #[test]
    fn parse_bad_port_rejected() {
        assert!(parse_host_port_priority("10.0.0.1:notaport", 53).is_err());
    }

    #[test]
    fn parse_empty_rejected() {
        assert!(parse_host_port_priority("", 53).is_err());
    }

    #[test]
    fn nameserver_literal_only() {
        assert!(parse_inet_address("8.8.8.8", 53).is_ok());
        assert!(parse_inet_address("8.8.8.8:5353", 53).is_ok());
        assert!(parse_inet_address("dns.example.com", 53).is_err());
    }

    #[test]
    fn family_weight_order() {
        let unix = UpstreamAddr::Unix(PathBuf::from("/tmp/x.sock"));
        let v4 = UpstreamAddr::Inet("127.0.0.1:1".parse().unwrap());
        let v6 = UpstreamAddr::Inet("[::1]:1".parse().unwrap());
        assert!(unix.family_weight() > v4.family_weight());
        assert!(v4.family_weight() > v6.family_weight());
    }
}

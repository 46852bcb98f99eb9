// Copyright 2020 Joyent, Inc.

//! A [`NameResolver`](upstream_pool::resolver::NameResolver)
//! implementation backed by plain UDP DNS, for upstream-pool contexts
//! that refresh their address sets from real nameservers. Nameservers
//! are given explicitly or bootstrapped from `/etc/resolv.conf`.

use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use slog::{debug, info, Logger};
use trust_dns_client::client::{Client, SyncClient};
use trust_dns_client::op::ResponseCode;
use trust_dns_client::rr::{DNSClass, RData, RecordType};
use trust_dns_client::udp::UdpClientConnection;
use trust_dns_proto::rr::domain::Name;

use upstream_pool::error::ResolveError;
use upstream_pool::resolver::NameResolver;

static DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";
static DNS_PORT: u16 = 53;

/// A `NameResolver` that queries a fixed set of nameservers over UDP,
/// trying each one in turn and retransmitting the whole round on
/// failure. Every query opens a fresh client so the caller's timeout can
/// be applied per request.
pub struct UdpNameResolver {
    nameservers: Vec<SocketAddr>,
    log: Logger,
}

impl UdpNameResolver {
    pub fn new(nameservers: Vec<SocketAddr>, log: Logger) -> Self {
        UdpNameResolver { nameservers, log }
    }

    /// Bootstrap the nameserver list from a resolv.conf style file,
    /// `/etc/resolv.conf` when no path is given.
    pub fn from_resolv_conf(
        path: Option<String>,
        log: Logger,
    ) -> Result<Self, ResolveError> {
        let buf = read_resolv_conf(path)?;
        let mut nameservers = Vec::new();
        for ns in parse_ns_resolv_conf(&buf)? {
            let server = SocketAddr::new(ns, DNS_PORT);
            info!(log, "Found resolver: {}", server);
            nameservers.push(server);
        }

        if nameservers.is_empty() {
            return Err(ResolveError::BadConfiguration {
                err: "no nameservers configured".to_string(),
            });
        }

        Ok(UdpNameResolver { nameservers, log })
    }

    fn query_addrs(
        &self,
        name: &str,
        rtype: RecordType,
        timeout: Duration,
        retransmits: u32,
    ) -> Result<Vec<IpAddr>, ResolveError> {
        let n = Name::from_utf8(name).map_err(|e| {
            ResolveError::QueryFailed { err: e.to_string() }
        })?;

        let mut last_err = ResolveError::Timeout;

        for _ in 0..=retransmits {
            for server in &self.nameservers {
                let conn =
                    match UdpClientConnection::with_timeout(*server, timeout) {
                        Ok(conn) => conn,
                        Err(e) => {
                            last_err = ResolveError::QueryFailed {
                                err: e.to_string(),
                            };
                            continue;
                        }
                    };
                let client = SyncClient::new(conn);

                match client.query(&n, DNSClass::IN, rtype) {
                    Ok(resp) => {
                        debug!(self.log, "{:?} response: {:?}", rtype, resp);
                        if resp.response_code() == ResponseCode::NoError {
                            let mut addrs = Vec::new();
                            for rec in resp.answers() {
                                match rec.rdata() {
                                    RData::A(ip)
                                        if rtype == RecordType::A =>
                                    {
                                        addrs.push(IpAddr::V4(*ip))
                                    }
                                    RData::AAAA(ip)
                                        if rtype == RecordType::AAAA =>
                                    {
                                        addrs.push(IpAddr::V6(*ip))
                                    }
                                    _ => (),
                                }
                            }
                            return Ok(addrs);
                        }

                        last_err = ResolveError::QueryFailed {
                            err: format!(
                                "response code {}",
                                resp.response_code()
                            ),
                        };
                    }
                    Err(e) => {
                        debug!(
                            self.log,
                            "query to {} failed: {}, trying next resolver",
                            server,
                            e
                        );
                        last_err =
                            ResolveError::QueryFailed { err: e.to_string() };
                    }
                }
            }
        }

        Err(last_err)
    }
}

impl NameResolver for UdpNameResolver {
    fn lookup_a(
        &self,
        name: &str,
        timeout: Duration,
        retransmits: u32,
    ) -> Result<Vec<Ipv4Addr>, ResolveError> {
        let addrs =
            self.query_addrs(name, RecordType::A, timeout, retransmits)?;
        Ok(addrs
            .into_iter()
            .filter_map(|ip| match ip {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect())
    }

    fn lookup_aaaa(
        &self,
        name: &str,
        timeout: Duration,
        retransmits: u32,
    ) -> Result<Vec<Ipv6Addr>, ResolveError> {
        let addrs =
            self.query_addrs(name, RecordType::AAAA, timeout, retransmits)?;
        Ok(addrs
            .into_iter()
            .filter_map(|ip| match ip {
                IpAddr::V6(v6) => Some(v6),
                IpAddr::V4(_) => None,
            })
            .collect())
    }
}

pub fn parse_ns_resolv_conf(buf: &str) -> Result<Vec<IpAddr>, ResolveError> {
    let cfg = match resolv_conf::Config::parse(&buf) {
        Ok(cfg) => cfg,
        Err(e) => {
            return Err(ResolveError::BadConfiguration {
                err: e.to_string(),
            })
        }
    };

    let mut nameservers = Vec::new();
    for ns in cfg.nameservers {
        let addr = IpAddr::from_str(&ns.to_string()).map_err(|e| {
            ResolveError::BadConfiguration { err: e.to_string() }
        })?;
        nameservers.push(addr);
    }
    Ok(nameservers)
}

pub fn read_resolv_conf(path: Option<String>) -> Result<String, io::Error> {
    let resolv_conf_path =
        path.unwrap_or_else(|| DEFAULT_RESOLV_CONF.to_string());
    let buf = fs::read(resolv_conf_path)?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use slog::{o, Drain, Logger};

    fn test_logger() -> Logger {
        let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
        Logger::root(
            Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
            o!("build-id" => "0.1.0"),
        )
    }

    // The nameserver set the pool conformance tests point their
    // upstreams at
    static THREE_NAMESERVERS: &str = "
options ndots:2 timeout:2 attempts:2

domain pool.example.com
search pool.example.com

nameserver 10.0.0.1
nameserver 10.0.0.2
nameserver 10.0.0.3

options rotate
";

    #[test]
    fn resolv_conf_nameservers_parsed() {
        let resolvers = parse_ns_resolv_conf(THREE_NAMESERVERS).unwrap();
        assert_eq!(resolvers.len(), 3);
        assert_eq!(resolvers[0].to_string(), "10.0.0.1");
        assert_eq!(resolvers[2].to_string(), "10.0.0.3");
    }

    #[test]
    fn resolv_conf_without_nameservers() {
        let config_str = "
domain pool.example.com
search pool.example.com

options rotate
";
        let resolvers = parse_ns_resolv_conf(config_str).unwrap();
        assert!(resolvers.is_empty());
    }

    #[test]
    fn resolv_conf_empty() {
        assert!(parse_ns_resolv_conf("").unwrap().is_empty());
    }

    #[test]
    fn from_resolv_conf_bootstraps_nameservers() {
        let path = std::env::temp_dir().join("upstream-pool-resolv.conf");
        fs::write(&path, THREE_NAMESERVERS).unwrap();

        let resolver = UdpNameResolver::from_resolv_conf(
            Some(path.to_string_lossy().to_string()),
            test_logger(),
        )
        .unwrap();
        assert_eq!(resolver.nameservers.len(), 3);
        assert_eq!(resolver.nameservers[0].port(), DNS_PORT);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn from_resolv_conf_rejects_empty_nameserver_set() {
        let path =
            std::env::temp_dir().join("upstream-pool-resolv-empty.conf");
        fs::write(&path, "domain pool.example.com\n").unwrap();

        let result = UdpNameResolver::from_resolv_conf(
            Some(path.to_string_lossy().to_string()),
            test_logger(),
        );
        assert!(result.is_err());

        let _ = fs::remove_file(path);
    }
}

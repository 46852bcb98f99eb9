// Copyright 2020 Joyent, Inc.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crate::error::ResolveError;

/// The DNS capability consumed by the pool context for background address
/// refresh. Implementations are expected to block for at most roughly
/// `timeout * (retransmits + 1)`; the context always invokes them from
/// dedicated resolution threads, never from a caller's thread.
///
/// The `upstream-pool-dns-resolver` crate provides an implementation
/// backed by UDP DNS; tests use table-driven fakes.
pub trait NameResolver: Send + Sync + 'static {
    fn lookup_a(
        &self,
        name: &str,
        timeout: Duration,
        retransmits: u32,
    ) -> Result<Vec<Ipv4Addr>, ResolveError>;

    fn lookup_aaaa(
        &self,
        name: &str,
        timeout: Duration,
        retransmits: u32,
    ) -> Result<Vec<Ipv6Addr>, ResolveError>;
}

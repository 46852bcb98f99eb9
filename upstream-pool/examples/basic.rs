// Copyright 2020 Joyent, Inc.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{info, o, Drain, Logger};

use upstream_pool::context::{ContextConfig, PoolContext};
use upstream_pool::error::ResolveError;
use upstream_pool::pool::UpstreamPool;
use upstream_pool::resolver::NameResolver;
use upstream_pool::select::RotationPolicy;
use upstream_pool::watch::WatchEvents;

// A resolver that answers every A query with fixed addresses, standing in
// for a real DNS client
struct FixedResolver {
    addrs: Vec<Ipv4Addr>,
}

impl NameResolver for FixedResolver {
    fn lookup_a(
        &self,
        _name: &str,
        _timeout: Duration,
        _retransmits: u32,
    ) -> Result<Vec<Ipv4Addr>, ResolveError> {
        Ok(self.addrs.clone())
    }

    fn lookup_aaaa(
        &self,
        _name: &str,
        _timeout: Duration,
        _retransmits: u32,
    ) -> Result<Vec<Ipv6Addr>, ResolveError> {
        Ok(Vec::new())
    }
}

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    info!(log, "running basic upstream-pool example");

    let ctx = PoolContext::new(Some(log.clone()));
    let resolver = FixedResolver {
        addrs: vec![Ipv4Addr::new(127, 0, 0, 1)],
    };
    ctx.configure(&ContextConfig::default(), Arc::new(resolver));

    let pool = UpstreamPool::new(Some(&ctx));
    pool.parse_line(
        "round-robin:127.0.0.1:8080:5,127.0.0.2:8080,127.0.0.3:8080",
        8080,
    );

    let watch_log = log.clone();
    pool.add_watcher(WatchEvents::ALL, move |up, event, count| {
        info!(watch_log, "upstream {}: {:?} ({})", up.name(), event, count);
    });

    // Weighted rotation: the first member should take five of every
    // seven selections
    for _ in 0..14 {
        let up = pool
            .get(RotationPolicy::RoundRobin, None)
            .expect("non-empty pool always yields an upstream");
        let addr = up.addr_cur();
        info!(log, "selected {} at {}", up.name(), addr);
        up.ok();
    }

    // Report enough failures to trip the breaker on one member
    let up = pool
        .get_forced(RotationPolicy::MasterSlave, None)
        .expect("non-empty pool always yields an upstream");
    for _ in 0..8 {
        up.fail(false);
    }
    info!(
        log,
        "after failures: {} of {} upstreams alive",
        pool.alive_count(),
        pool.count()
    );

    // Consistent hashing: the same key maps to the same member. Forced,
    // so the pool's configured round-robin policy does not override it
    let by_key = pool
        .get_forced(RotationPolicy::Hashed, Some(b"user42"))
        .expect("non-empty pool always yields an upstream");
    info!(log, "key 'user42' maps to {}", by_key.name());

    pool.destroy();
}

// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{thread, time};

use slog::{o, Drain, Logger};

use upstream_pool::addr::UpstreamAddr;
use upstream_pool::clock::{Clock, Entropy};
use upstream_pool::context::{ContextConfig, PoolContext};
use upstream_pool::error::ResolveError;
use upstream_pool::pool::{ParseMode, UpstreamPool};
use upstream_pool::resolver::NameResolver;
use upstream_pool::select::RotationPolicy;
use upstream_pool::upstream::Upstream;
use upstream_pool::watch::{WatchEvent, WatchEvents};

// A clock the tests advance by hand, driving the failure-rate window
// without waiting out wall time
struct ManualClock {
    secs: Mutex<f64>,
}

impl ManualClock {
    fn new() -> Arc<ManualClock> {
        Arc::new(ManualClock {
            secs: Mutex::new(0.0),
        })
    }

    fn advance(&self, dt: f64) {
        *self.secs.lock().unwrap() += dt;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.secs.lock().unwrap()
    }
}

// Pinned randomness: 0.5 keeps jitter at the base value and never fires
// the merge amnesty; anything above 0.9 always fires it
struct FixedEntropy(f64);

impl Entropy for FixedEntropy {
    fn uniform(&self) -> f64 {
        self.0
    }
}

struct FakeResolver {
    a: Vec<Ipv4Addr>,
    aaaa: Vec<Ipv6Addr>,
}

impl NameResolver for FakeResolver {
    fn lookup_a(
        &self,
        _name: &str,
        _timeout: Duration,
        _retransmits: u32,
    ) -> Result<Vec<Ipv4Addr>, ResolveError> {
        Ok(self.a.clone())
    }

    fn lookup_aaaa(
        &self,
        _name: &str,
        _timeout: Duration,
        _retransmits: u32,
    ) -> Result<Vec<Ipv6Addr>, ResolveError> {
        Ok(self.aaaa.clone())
    }
}

fn test_context(entropy: f64) -> (PoolContext, Arc<ManualClock>) {
    let clock = ManualClock::new();
    let ctx = PoolContext::new_with(
        None,
        clock.clone(),
        Arc::new(FixedEntropy(entropy)),
    );
    (ctx, clock)
}

fn configure(ctx: &PoolContext, cfg: ContextConfig) {
    let resolver = FakeResolver {
        a: Vec::new(),
        aaaa: Vec::new(),
    };
    ctx.configure(&cfg, Arc::new(resolver));
}

// Drive an upstream past the breaker threshold: two failures in quick
// succession push the rate over max_errors / error_time
fn trip(up: &Arc<Upstream>, clock: &ManualClock) {
    for _ in 0..5 {
        up.fail(false);
        clock.advance(0.05);
    }
}

#[test]
fn round_robin_smoothness() {
    let pool = UpstreamPool::new(None);
    assert!(pool.parse_line(
        "round-robin:127.0.0.1:8080:5,127.0.0.2:8080:1,127.0.0.3:8080:1",
        8080
    ));
    assert_eq!(pool.count(), 3);

    let mut counts: HashMap<String, u32> = HashMap::new();
    for _ in 0..700 {
        let up = pool.get(RotationPolicy::Random, None).unwrap();
        *counts.entry(up.name().to_string()).or_insert(0) += 1;
    }

    assert_eq!(counts["127.0.0.1"], 500);
    assert_eq!(counts["127.0.0.2"], 100);
    assert_eq!(counts["127.0.0.3"], 100);
}

#[test]
fn circuit_breaker_offline_then_revive() {
    let (ctx, clock) = test_context(0.5);
    configure(
        &ctx,
        ContextConfig {
            revive_time: Some(0.3),
            ..Default::default()
        },
    );

    let pool = UpstreamPool::new(Some(&ctx));
    assert!(pool.parse_line("127.0.0.1:8080,127.0.0.2:8080", 8080));

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    pool.add_watcher(
        WatchEvents::ONLINE | WatchEvents::OFFLINE,
        move |up, event, _count| {
            events_clone
                .lock()
                .unwrap()
                .push((up.name().to_string(), event));
        },
    );

    let target = pool.get_forced(RotationPolicy::Sequential, None).unwrap();
    let name = target.name().to_string();

    trip(&target, &clock);

    assert!(!target.is_alive());
    assert_eq!(pool.alive_count(), 1);

    // The revive timer was armed at 0.3 seconds of wall time (pinned
    // entropy cancels the jitter); wait for it to fire
    let mut revived = false;
    for _ in 0..100 {
        if target.is_alive() {
            revived = true;
            break;
        }
        thread::sleep(time::Duration::from_millis(50));
    }
    assert!(revived);
    assert_eq!(pool.alive_count(), 2);

    let log = events.lock().unwrap();
    let target_events: Vec<WatchEvent> = log
        .iter()
        .filter(|(n, _)| *n == name)
        .map(|(_, e)| *e)
        .collect();
    assert_eq!(
        target_events,
        vec![WatchEvent::Offline, WatchEvent::Online]
    );
}

#[test]
fn empty_alive_reactivation() {
    let (ctx, clock) = test_context(0.5);
    configure(&ctx, ContextConfig::default());

    let pool = UpstreamPool::new(Some(&ctx));
    assert!(pool.parse_line(
        "127.0.0.1:80,127.0.0.2:80,127.0.0.3:80,127.0.0.4:80",
        80
    ));
    assert_eq!(pool.count(), 4);

    let members: Vec<Arc<Upstream>> = pool.alive_upstreams();
    for up in &members {
        trip(up, &clock);
    }
    assert_eq!(pool.alive_count(), 0);

    // A single get over a fully-drained pool revives every member
    let selected = pool.get(RotationPolicy::Random, None);
    assert!(selected.is_some());
    assert_eq!(pool.alive_count(), 4);
    for up in &members {
        assert!(up.is_alive());
    }
}

#[test]
fn single_member_pool_never_drains() {
    let (ctx, clock) = test_context(0.5);
    configure(&ctx, ContextConfig::default());

    let pool = UpstreamPool::new(Some(&ctx));
    assert!(pool.add_upstream(
        "127.0.0.1:80",
        80,
        ParseMode::HostPort,
        None
    ));

    let up = pool.get(RotationPolicy::Random, None).unwrap();
    for _ in 0..100 {
        up.fail(false);
        clock.advance(1.0);
    }

    assert!(up.is_alive());
    assert_eq!(pool.alive_count(), 1);
}

#[test]
fn consistent_hash_minimal_migration() {
    let build = |n: usize| {
        let pool = UpstreamPool::new(None);
        for i in 1..=n {
            assert!(pool.add_upstream(
                &format!("10.0.0.{}:80", i),
                80,
                ParseMode::HostPort,
                None
            ));
        }
        pool
    };

    let full = build(10);
    let smaller = build(9);

    let total = 10_000;
    let mut moved = 0;
    for i in 0..total {
        let key = format!("key-{}", i);
        let before = full
            .get(RotationPolicy::Hashed, Some(key.as_bytes()))
            .unwrap();
        let after = smaller
            .get(RotationPolicy::Hashed, Some(key.as_bytes()))
            .unwrap();
        if before.name() != after.name() {
            moved += 1;
        }
    }

    // Removing one of ten members should migrate about a tenth of the
    // keys
    let fraction = f64::from(moved) / f64::from(total);
    assert!(
        fraction >= 0.08 && fraction <= 0.12,
        "migrated fraction {} out of expected range",
        fraction
    );
}

#[test]
fn hashed_selection_deterministic() {
    let pool = UpstreamPool::new(None);
    assert!(pool.parse_line("10.0.0.1:80,10.0.0.2:80,10.0.0.3:80", 80));

    // Find a key that does not map to the last member, so dropping that
    // neighbour must not move the key
    let mut chosen = None;
    for i in 0..100 {
        let key = format!("user{}", i);
        let up = pool
            .get(RotationPolicy::Hashed, Some(key.as_bytes()))
            .unwrap();
        if up.active_index() != Some(2) {
            chosen = Some((key, up.name().to_string()));
            break;
        }
    }
    let (key, name) = chosen.expect("some key maps below the last member");

    // Same key, same member, every time
    for _ in 0..10 {
        let up = pool
            .get(RotationPolicy::Hashed, Some(key.as_bytes()))
            .unwrap();
        assert_eq!(up.name(), name);
    }

    let without_neighbour = UpstreamPool::new(None);
    assert!(without_neighbour.parse_line("10.0.0.1:80,10.0.0.2:80", 80));
    let up = without_neighbour
        .get(RotationPolicy::Hashed, Some(key.as_bytes()))
        .unwrap();
    assert_eq!(up.name(), name);
}

#[test]
fn sequential_exhaustion() {
    let pool = UpstreamPool::new(None);
    assert!(pool.parse_line(
        "sequential:10.0.0.1:80,10.0.0.2:80,10.0.0.3:80",
        80
    ));
    assert_eq!(pool.rotation(), Some(RotationPolicy::Sequential));

    let names = |m: Option<Arc<Upstream>>| m.map(|u| u.name().to_string());

    assert_eq!(
        names(pool.get(RotationPolicy::Random, None)),
        Some("10.0.0.1".to_string())
    );
    assert_eq!(
        names(pool.get(RotationPolicy::Random, None)),
        Some("10.0.0.2".to_string())
    );
    assert_eq!(
        names(pool.get(RotationPolicy::Random, None)),
        Some("10.0.0.3".to_string())
    );
    // End of iteration: the cursor resets and the caller is told
    assert_eq!(names(pool.get(RotationPolicy::Random, None)), None);
    assert_eq!(
        names(pool.get(RotationPolicy::Random, None)),
        Some("10.0.0.1".to_string())
    );
}

#[test]
fn addr_next_prefers_less_failing() {
    let (ctx, clock) = test_context(0.5);
    configure(&ctx, ContextConfig::default());

    let pool = UpstreamPool::new(Some(&ctx));
    assert!(pool.add_upstream(
        "10.0.0.1:80",
        80,
        ParseMode::HostPort,
        None
    ));
    let up = pool.get(RotationPolicy::Random, None).unwrap();
    up.add_addr(UpstreamAddr::Inet("10.0.0.2:80".parse().unwrap()));
    up.add_addr(UpstreamAddr::Inet("10.0.0.3:80".parse().unwrap()));

    // Accumulate failures on the first address; wide spacing keeps the
    // failure rate below the breaker threshold
    let first = up.addr_cur();
    assert_eq!(first, UpstreamAddr::Inet("10.0.0.1:80".parse().unwrap()));
    for _ in 0..5 {
        up.fail(true);
        clock.advance(100.0);
    }

    // Rotation settles on the clean addresses and avoids the failing one
    let mut seen = Vec::new();
    for _ in 0..10 {
        let addr = up.addr_next();
        assert_ne!(addr, first);
        seen.push(addr);
    }
    assert!(seen
        .contains(&UpstreamAddr::Inet("10.0.0.2:80".parse().unwrap())));
    assert!(seen
        .contains(&UpstreamAddr::Inet("10.0.0.3:80".parse().unwrap())));
}

#[test]
fn dns_merge_carries_address_errors() {
    let clock = ManualClock::new();
    let ctx = PoolContext::new_with(
        None,
        clock.clone(),
        Arc::new(FixedEntropy(0.5)),
    );
    let resolver = FakeResolver {
        a: vec![Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)],
        aaaa: Vec::new(),
    };
    ctx.configure(&ContextConfig::default(), Arc::new(resolver));

    let pool = UpstreamPool::new(Some(&ctx));
    // A resolvable name, so the background refresh applies to it
    assert!(pool.add_upstream(
        "localhost:8080",
        8080,
        ParseMode::HostPort,
        None
    ));
    let up = pool.get(RotationPolicy::Random, None).unwrap();

    let failing = UpstreamAddr::Inet("127.0.0.1:8080".parse().unwrap());
    assert_eq!(up.addr_cur(), failing);
    for _ in 0..3 {
        up.fail(true);
        clock.advance(100.0);
    }

    ctx.reresolve();

    // Wait for both resolution threads to finish and the merge to land:
    // the fresh address shows up in rotation once it has
    let fresh = UpstreamAddr::Inet("10.0.0.2:8080".parse().unwrap());
    let mut merged = false;
    for _ in 0..100 {
        if up.addr_next() == fresh {
            merged = true;
            break;
        }
        thread::sleep(time::Duration::from_millis(20));
    }
    assert!(merged);

    // Carried-over errors keep the failing address out of rotation
    for _ in 0..6 {
        assert_eq!(up.addr_next(), fresh);
    }
}

#[test]
fn dns_merge_amnesty_resets_address_errors() {
    let clock = ManualClock::new();
    // Entropy above 0.9 always fires the amnesty branch of the merge
    let ctx = PoolContext::new_with(
        None,
        clock.clone(),
        Arc::new(FixedEntropy(0.95)),
    );
    let resolver = FakeResolver {
        a: vec![Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)],
        aaaa: Vec::new(),
    };
    ctx.configure(&ContextConfig::default(), Arc::new(resolver));

    let pool = UpstreamPool::new(Some(&ctx));
    assert!(pool.add_upstream(
        "localhost:8080",
        8080,
        ParseMode::HostPort,
        None
    ));
    let up = pool.get(RotationPolicy::Random, None).unwrap();

    let forgiven = UpstreamAddr::Inet("127.0.0.1:8080".parse().unwrap());
    assert_eq!(up.addr_cur(), forgiven);
    for _ in 0..3 {
        up.fail(true);
        clock.advance(100.0);
    }

    ctx.reresolve();

    let fresh = UpstreamAddr::Inet("10.0.0.2:8080".parse().unwrap());
    let mut merged = false;
    for _ in 0..100 {
        if up.addr_next() == fresh {
            merged = true;
            break;
        }
        thread::sleep(time::Duration::from_millis(20));
    }
    assert!(merged);

    // With the error counts wiped the previously failing address comes
    // back into rotation
    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(up.addr_next());
    }
    assert!(seen.contains(&forgiven));
}

#[test]
fn watcher_event_accounting() {
    let (ctx, clock) = test_context(0.5);
    configure(&ctx, ContextConfig::default());

    let pool = UpstreamPool::new(Some(&ctx));

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = events.clone();
    pool.add_watcher(WatchEvents::ALL, move |_up, event, count| {
        events_clone.lock().unwrap().push((event, count));
    });

    assert!(pool.parse_line("127.0.0.1:80,127.0.0.2:80", 80));

    let up = pool.get_forced(RotationPolicy::Sequential, None).unwrap();

    up.fail(false);
    up.ok();
    // A second ok with a clean counter is not an event
    up.ok();

    up.fail(false);
    clock.advance(0.05);
    up.fail(false);
    // Inactive now; further reports are ignored
    up.fail(false);

    let log = events.lock().unwrap();
    let count_of = |kind: WatchEvent| {
        log.iter().filter(|(event, _)| *event == kind).count()
    };

    // One online per member at construction
    assert_eq!(count_of(WatchEvent::Online), 2);
    assert_eq!(count_of(WatchEvent::Success), 1);
    assert_eq!(count_of(WatchEvent::Offline), 1);
    assert_eq!(count_of(WatchEvent::Failure), 3);

    // The failure payload carries the running count of the streak
    let failures: Vec<u32> = log
        .iter()
        .filter(|(event, _)| *event == WatchEvent::Failure)
        .map(|(_, count)| *count)
        .collect();
    assert_eq!(failures, vec![1, 1, 2]);
}

#[test]
#[should_panic(expected = "empty watcher event mask")]
fn watcher_empty_mask_rejected() {
    let pool = UpstreamPool::new(None);
    pool.add_watcher(WatchEvents::default(), |_up, _event, _count| {});
}

#[test]
fn alive_index_consistency() {
    let (ctx, clock) = test_context(0.5);
    configure(&ctx, ContextConfig::default());

    let pool = UpstreamPool::new(Some(&ctx));
    assert!(pool.parse_line(
        "10.0.0.1:80,10.0.0.2:80,10.0.0.3:80,10.0.0.4:80,10.0.0.5:80",
        80
    ));

    let members = pool.alive_upstreams();
    trip(&members[1], &clock);
    trip(&members[3], &clock);

    assert_eq!(pool.alive_count(), 3);

    let alive = pool.alive_upstreams();
    pool.foreach(|up, _i| match up.active_index() {
        Some(idx) => {
            assert!(Arc::ptr_eq(&alive[idx], up));
        }
        None => {
            assert!(!alive.iter().any(|a| Arc::ptr_eq(a, up)));
        }
    });

    // No index is claimed twice
    for (i, up) in alive.iter().enumerate() {
        assert_eq!(up.active_index(), Some(i));
    }
}

#[test]
fn parse_line_policy_prefixes() {
    let pool = UpstreamPool::new(None);
    assert!(pool.parse_line("hash:10.0.0.1:80;10.0.0.2:80", 80));
    assert_eq!(pool.rotation(), Some(RotationPolicy::Hashed));
    assert_eq!(pool.count(), 2);

    // An unknown prefix is not consumed and the span fails address
    // parsing, leaving the policy untouched
    let other = UpstreamPool::new(None);
    assert!(!other.parse_line("fancy:10.0.0.1", 80));
    assert_eq!(other.rotation(), None);
    assert_eq!(other.count(), 0);
}

#[test]
fn parse_line_partial_success() {
    let pool = UpstreamPool::new(None);
    // One entry is garbage, one parses; partial success still counts
    assert!(pool.parse_line("10.0.0.1:80,10.0.0.2:notaport", 80));
    assert_eq!(pool.count(), 1);

    let none = UpstreamPool::new(None);
    assert!(!none.parse_line("", 80));
    assert!(!none.parse_line(" ;,\t", 80));
}

#[test]
fn from_config_values() {
    let pool = UpstreamPool::new(None);
    let value = serde_json::json!([
        "random:10.0.0.1:80",
        "10.0.0.2:80 10.0.0.3:80"
    ]);
    assert!(pool.from_config(&value, 80));
    assert_eq!(pool.count(), 3);
    assert_eq!(pool.rotation(), Some(RotationPolicy::Random));

    let scalar = UpstreamPool::new(None);
    assert!(scalar.from_config(&serde_json::json!("10.0.0.1:80"), 80));
    assert_eq!(scalar.count(), 1);

    assert!(!scalar.from_config(&serde_json::json!(42), 80));
}

#[test]
fn master_slave_prefers_heaviest() {
    let pool = UpstreamPool::new(None);
    assert!(pool.parse_line("master-slave:10.0.0.1:80,10.0.0.2:80", 80));

    // The first member of a weightless master-slave pool is promoted
    let first = pool.get(RotationPolicy::Random, None).unwrap();
    assert_eq!(first.name(), "10.0.0.1");
    assert_eq!(first.weight(), 1);

    for _ in 0..5 {
        let up = pool.get(RotationPolicy::Random, None).unwrap();
        assert_eq!(up.name(), "10.0.0.1");
    }

    // Re-weighting moves the master role
    pool.foreach(|up, _i| {
        if up.name() == "10.0.0.2" {
            up.set_weight(10);
        }
    });
    let up = pool.get(RotationPolicy::Random, None).unwrap();
    assert_eq!(up.name(), "10.0.0.2");
}

#[test]
fn forced_policy_overrides_pool() {
    let pool = UpstreamPool::new(None);
    assert!(pool.parse_line("master-slave:10.0.0.1:80,10.0.0.2:80", 80));

    // The pool policy wins over the caller's default...
    let up = pool.get(RotationPolicy::Sequential, None).unwrap();
    assert_eq!(up.name(), "10.0.0.1");

    // ...but a forced policy wins over the pool's
    let seq: Vec<Option<String>> = (0..3)
        .map(|_| {
            pool.get_forced(RotationPolicy::Sequential, None)
                .map(|u| u.name().to_string())
        })
        .collect();
    assert_eq!(
        seq,
        vec![
            Some("10.0.0.1".to_string()),
            Some("10.0.0.2".to_string()),
            None
        ]
    );
}

#[test]
fn context_config_overrides_limits() {
    let (ctx, _clock) = test_context(0.5);
    configure(
        &ctx,
        ContextConfig {
            max_errors: Some(7),
            error_time: Some(20.0),
            revive_time: Some(123.0),
            ..Default::default()
        },
    );

    let limits = ctx.limits();
    assert_eq!(limits.max_errors, 7);
    assert!((limits.error_time - 20.0).abs() < f64::EPSILON);
    assert!((limits.revive_time - 123.0).abs() < f64::EPSILON);

    // Pools copy the context limits at creation
    let pool = UpstreamPool::new(Some(&ctx));
    assert!((pool.limits().revive_time - 123.0).abs() < f64::EPSILON);
}

#[test]
fn unconfigured_context_registers_without_timers() {
    let (ctx, clock) = test_context(0.5);
    assert!(!ctx.is_configured());

    // Registration works before the context is bound; the breaker runs,
    // but nothing is scheduled
    let pool = UpstreamPool::new(Some(&ctx));
    assert!(pool.parse_line("127.0.0.1:80,127.0.0.2:80", 80));
    assert_eq!(pool.alive_count(), 2);

    let up = pool.get(RotationPolicy::Random, None).unwrap();
    trip(&up, &clock);
    assert!(!up.is_alive());

    configure(&ctx, ContextConfig::default());
    assert!(ctx.is_configured());

    // Without a revive timer the member stays down until a drained pool
    // would revive it; the other member keeps serving
    assert_eq!(pool.alive_count(), 1);
}

#[test]
fn destroyed_pool_ignores_reports() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    let ctx = PoolContext::new(Some(log));
    configure(&ctx, ContextConfig::default());

    let pool = UpstreamPool::new(Some(&ctx));
    assert!(pool.parse_line("127.0.0.1:80,127.0.0.2:80", 80));
    let up = pool.get(RotationPolicy::Random, None).unwrap();

    pool.destroy();
    assert_eq!(pool.count(), 0);
    assert_eq!(pool.alive_count(), 0);

    // A handle that outlived the pool is inert
    up.fail(false);
    up.ok();
    assert_eq!(up.errors(), 0);
}

// Copyright 2020 Joyent, Inc.

//! A library for managing pools of named upstream endpoints
//!
//! An *upstream* is a named target a service talks to: a DNS name, a
//! literal IP address, or a UNIX socket path, optionally with a port and
//! a weight. This library keeps groups of upstreams in selection pools,
//! tracks their liveness from caller-reported successes and failures,
//! rotates selection across the live members under one of several
//! policies, and keeps each upstream's resolved address set fresh through
//! lazy periodic DNS resolution.
//!
//! The library deliberately does *not* open sockets, probe endpoints, or
//! measure latency. Liveness is driven entirely by the callers reporting
//! [`ok`](upstream::Upstream::ok) and
//! [`fail`](upstream::Upstream::fail) after using an upstream, and the
//! library answers one question: *which upstream (and which of its
//! addresses) should I try next?*
//!
//! ## Contexts and pools
//!
//! A [`PoolContext`](context::PoolContext) is the process- or
//! subsystem-scoped registry: it owns the timer thread that drives
//! background resolution and revival, and it holds the
//! [`NameResolver`](resolver::NameResolver) implementation supplied by
//! the embedding program. Contexts use staged initialization: pools and
//! upstreams may be created against an unconfigured context, and timers
//! only start once [`configure`](context::PoolContext::configure) binds
//! the resolver.
//!
//! An [`UpstreamPool`](pool::UpstreamPool) is one selection group.
//! Members are added from specification strings
//! (`host[:port][:priority]`, separated by any of `;, \n\r\t`, with an
//! optional rotation-policy prefix) or from structured configuration
//! values.
//!
//! ## Rotation policies
//!
//! * `random` -- uniform over the alive set.
//! * `round-robin` -- smooth weighted round-robin; a pool with no weights
//!   balances on per-member selection counters instead.
//! * `master-slave` -- the heaviest member always wins; the rest are
//!   spares.
//! * `hash` -- consistent hashing of a caller key, so membership changes
//!   move as few keys as possible.
//! * `sequential` -- in-order iteration that reports exhaustion, for
//!   callers that want to try every member exactly once.
//!
//! ## Liveness
//!
//! Failures are counted as a streak: the first `fail` stamps the time,
//! and once the failure rate since that stamp exceeds
//! `max_errors / error_time` the upstream leaves the alive set and a
//! jittered revive timer is armed. A pool whose every member has gone
//! inactive revives all of them on the next `get` -- handing out a
//! possibly-bad upstream beats handing out none -- and a single-member
//! pool never drains at all. Watchers may subscribe to the
//! online/offline/success/failure transitions.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use slog::{o, Drain, Logger};
//!
//! use upstream_pool::context::{ContextConfig, PoolContext};
//! use upstream_pool::pool::{ParseMode, UpstreamPool};
//! use upstream_pool::select::RotationPolicy;
//! use upstream_pool_dns_resolver::UdpNameResolver;
//!
//! let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//! let log = Logger::root(
//!     std::sync::Mutex::new(
//!         slog_term::FullFormat::new(plain).build()
//!     ).fuse(),
//!     o!("build-id" => "0.1.0")
//! );
//!
//! let ctx = PoolContext::new(Some(log.clone()));
//! let resolver = UdpNameResolver::from_resolv_conf(None, log).unwrap();
//! ctx.configure(&ContextConfig::default(), Arc::new(resolver));
//!
//! let pool = UpstreamPool::new(Some(&ctx));
//! pool.parse_line("round-robin:mx1.example.com:25:5,mx2.example.com:25", 25);
//!
//! let up = pool.get(RotationPolicy::Random, None).unwrap();
//! let addr = up.addr_cur();
//! match try_deliver(&addr) {
//!     Ok(_) => up.ok(),
//!     Err(_) => {
//!         up.fail(true);
//!         // Next attempt prefers a less-failing address
//!         let retry_addr = up.addr_next();
//!     }
//! }
//! ```
//!
//! ## Resolvers
//!
//! DNS is consumed through the [`NameResolver`](resolver::NameResolver)
//! trait: plain blocking A/AAAA lookups that the context schedules on
//! its own threads. The `upstream-pool-dns-resolver` crate implements it
//! over UDP DNS with `/etc/resolv.conf` bootstrapping; tests use
//! table-driven fakes.

#![allow(missing_docs)]

pub mod addr;
pub mod clock;
pub mod context;
pub mod error;
pub mod limits;
pub mod pool;
pub mod resolver;
pub mod select;
pub mod upstream;
pub mod watch;

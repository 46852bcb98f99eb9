// Copyright 2020 Joyent, Inc.

use std::any::Any;
use std::fmt;
use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::Duration;

use sha1::Sha1;
use slog::{debug, warn, Logger};

use crate::addr::UpstreamAddr;
use crate::context::ContextInner;
use crate::limits::Limits;
use crate::pool;
use crate::pool::PoolInner;
use crate::watch::WatchEvent;

/// Flags applied to upstreams as they are added to a pool.
#[derive(Clone, Copy, Debug, Default)]
pub struct UpstreamFlags {
    /// Skip background DNS refresh and resolution-based revival. Set
    /// automatically for upstreams whose specification was a literal
    /// address or UNIX path.
    pub noresolve: bool,
}

// A resolved address together with its private failure count.
#[doc(hidden)]
#[derive(Clone, Debug)]
pub struct AddrEntry {
    pub addr: UpstreamAddr,
    pub errors: u32,
}

// Mutable portion of an upstream, guarded by one coarse mutex. Held only
// for short, bounded sections; no I/O happens under it.
#[doc(hidden)]
pub struct UpstreamState {
    pub weight: u32,
    pub cur_weight: u32,
    pub errors: u32,
    pub checked: u32,
    pub last_fail: f64,
    pub active_idx: Option<usize>,
    pub addrs: Vec<AddrEntry>,
    pub addr_cur: usize,
    pub new_addrs: Vec<UpstreamAddr>,
    pub timer: Option<timer::Guard>,
    pub data: Option<Arc<dyn Any + Send + Sync>>,
}

/// A single named endpoint within a pool: its resolved address set, error
/// accounting, and liveness state. Shared ownership: the owning pool holds
/// the upstreams strongly, armed revive timers and in-flight DNS requests
/// hold strong clones, and the back-references to the pool and the context
/// are weak.
pub struct Upstream {
    name: String,
    uid: String,
    noresolve: bool,
    pub(crate) log: Logger,
    pub(crate) ls: Mutex<Weak<PoolInner>>,
    pub(crate) ctx: Weak<ContextInner>,
    pub(crate) dns_requests: AtomicUsize,
    pub(crate) state: Mutex<UpstreamState>,
}

impl Debug for Upstream {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Upstream")
            .field("name", &self.name)
            .field("uid", &self.uid)
            .field("noresolve", &self.noresolve)
            .finish()
    }
}

impl Upstream {
    pub(crate) fn new(
        name: String,
        addrs: Vec<AddrEntry>,
        weight: u32,
        noresolve: bool,
        log: &Logger,
        ls: Weak<PoolInner>,
        ctx: Weak<ContextInner>,
    ) -> Arc<Upstream> {
        let uid = uid_from_name(&name);
        let log = log.new(slog::o!("uid" => uid.clone()));

        let mut state = UpstreamState {
            weight,
            cur_weight: weight,
            errors: 0,
            checked: 0,
            last_fail: 0.0,
            active_idx: None,
            addrs,
            addr_cur: 0,
            new_addrs: Vec::new(),
            timer: None,
            data: None,
        };
        sort_addrs(&mut state.addrs);

        Arc::new(Upstream {
            name,
            uid,
            noresolve,
            log,
            ls: Mutex::new(ls),
            ctx,
            dns_requests: AtomicUsize::new(0),
            state: Mutex::new(state),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Short stable identifier derived from a hash of the name; used as a
    /// log correlation tag.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn noresolve(&self) -> bool {
        self.noresolve
    }

    pub fn weight(&self) -> u32 {
        self.state_lock().weight
    }

    pub fn set_weight(&self, weight: u32) {
        self.state_lock().weight = weight;
    }

    pub fn errors(&self) -> u32 {
        self.state_lock().errors
    }

    pub fn is_alive(&self) -> bool {
        self.state_lock().active_idx.is_some()
    }

    /// Position in the owning pool's alive array, if currently alive.
    pub fn active_index(&self) -> Option<usize> {
        self.state_lock().active_idx
    }

    /// Attach opaque caller data, returning the previous value.
    pub fn set_data(
        &self,
        data: Arc<dyn Any + Send + Sync>,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        self.state_lock().data.replace(data)
    }

    pub fn get_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.state_lock().data.clone()
    }

    /// Append another resolved address. Keeps the family-preference order.
    pub fn add_addr(&self, addr: UpstreamAddr) {
        let mut st = self.state_lock();
        st.addrs.push(AddrEntry { addr, errors: 0 });
        sort_addrs(&mut st.addrs);
    }

    /// The address the rotation cursor currently points at.
    pub fn addr_cur(&self) -> UpstreamAddr {
        let st = self.state_lock();
        st.addrs[st.addr_cur].addr.clone()
    }

    /// Advance the rotation cursor and return the next address to try,
    /// skipping over addresses that have accumulated more failures than
    /// the one previously considered. The scan is bounded by the address
    /// count, so a full pass always terminates.
    pub fn addr_next(&self) -> UpstreamAddr {
        let mut st = self.state_lock();
        let len = st.addrs.len();
        let mut idx = st.addr_cur;
        let mut next = (idx + 1) % len;

        for _ in 0..len {
            if st.addrs[next].errors > st.addrs[idx].errors {
                idx = next;
                next = (idx + 1) % len;
            } else {
                break;
            }
        }

        st.addr_cur = next;
        st.addrs[next].addr.clone()
    }

    /// Report a successful use. Resets the error streak and the current
    /// address's failure count, and notifies `Success` watchers, if and
    /// only if the upstream is alive and had a non-zero error count.
    pub fn ok(self: &Arc<Self>) {
        let m_ls = self.ls.lock().unwrap().upgrade();
        let ls = match m_ls {
            Some(ls) => ls,
            None => return,
        };

        let mut emit = false;
        {
            let mut st = self.state_lock();
            if st.errors > 0 && st.active_idx.is_some() {
                st.errors = 0;
                let cur = st.addr_cur;
                if let Some(entry) = st.addrs.get_mut(cur) {
                    entry.errors = 0;
                }
                emit = true;
            }
        }

        if emit {
            pool::notify(&ls, self, WatchEvent::Success, 0);
        }
    }

    /// Report a failed use. The error streak starts at the first failure;
    /// once the failure rate since that timestamp exceeds
    /// `max_errors / error_time` the upstream is taken out of rotation,
    /// except in a single-member pool, which never drains and instead
    /// re-resolves once the streak outlives `revive_time`. With
    /// `addr_failure` the current address's own failure count is bumped
    /// as well.
    pub fn fail(self: &Arc<Self>, addr_failure: bool) {
        let ctx = match self.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return,
        };
        let m_ls = self.ls.lock().unwrap().upgrade();
        let ls = match m_ls {
            Some(ls) => ls,
            None => return,
        };

        let (limits, n_members) = {
            let ps = ls.pool_state_lock();
            (ps.limits, ps.ups.len())
        };
        let now = ctx.clock.now();

        let mut emitted = None;
        let mut go_inactive = false;
        let mut reresolve = false;
        {
            let mut st = self.state_lock();

            if st.active_idx.is_none() {
                return;
            }

            if st.errors == 0 {
                // First error of a streak
                st.last_fail = now;
                st.errors = 1;
                emitted = Some(1);
            } else if now >= st.last_fail {
                st.errors += 1;
                emitted = Some(st.errors);

                let (error_rate, max_error_rate) = if now > st.last_fail {
                    (
                        f64::from(st.errors) / (now - st.last_fail),
                        limits.max_error_rate(),
                    )
                } else {
                    (1.0, 0.0)
                };

                if error_rate > max_error_rate {
                    if n_members > 1 {
                        st.errors = 0;
                        go_inactive = true;
                    } else if now - st.last_fail > limits.revive_time {
                        // A single-member pool must never drain
                        st.errors = 0;
                        reresolve = true;
                    }
                }
            }

            if addr_failure {
                let cur = st.addr_cur;
                if let Some(entry) = st.addrs.get_mut(cur) {
                    entry.errors += 1;
                }
            }
        }

        if let Some(count) = emitted {
            pool::notify(&ls, self, WatchEvent::Failure, count);
        }

        if go_inactive {
            pool::set_inactive(&ls, self);
        } else if reresolve {
            Upstream::resolve_addrs(self, &limits);
        }
    }

    // Launch background A/AAAA resolution through the context's resolver.
    // Each request holds a strong clone of the upstream until its thread
    // finishes; the merge runs when the last one completes. No-op unless
    // the context is configured, the upstream is resolvable, and no
    // request is already in flight.
    pub(crate) fn resolve_addrs(up: &Arc<Upstream>, limits: &Limits) {
        let ctx = match up.ctx.upgrade() {
            Some(ctx) => ctx,
            None => return,
        };

        let (configured, m_resolver) = {
            let cs = ctx.ctx_state_lock();
            (cs.configured, cs.resolver.clone())
        };
        let resolver = match m_resolver {
            Some(resolver) => resolver,
            None => return,
        };

        if !configured || up.noresolve || up.name.starts_with('/') {
            return;
        }

        if up.dns_requests.load(AtomicOrdering::SeqCst) != 0 {
            return;
        }

        // One request per record type; account for both up front so an
        // early completion cannot trigger the merge prematurely
        up.dns_requests.fetch_add(2, AtomicOrdering::SeqCst);

        let timeout = Duration::from_secs_f64(limits.dns_timeout);
        let retransmits = limits.dns_retransmits;

        for ipv6 in &[false, true] {
            let ipv6 = *ipv6;
            let up = Arc::clone(up);
            let resolver = Arc::clone(&resolver);

            thread::spawn(move || {
                let result: Result<Vec<IpAddr>, _> = if ipv6 {
                    resolver
                        .lookup_aaaa(up.name(), timeout, retransmits)
                        .map(|addrs| {
                            addrs.into_iter().map(IpAddr::V6).collect()
                        })
                } else {
                    resolver
                        .lookup_a(up.name(), timeout, retransmits)
                        .map(|addrs| {
                            addrs.into_iter().map(IpAddr::V4).collect()
                        })
                };

                match result {
                    Ok(addrs) => {
                        let mut st = up.state_lock();
                        for ip in addrs {
                            // Resolver replies carry no port; the merge
                            // applies the pool's configured one
                            st.new_addrs.push(UpstreamAddr::Inet(
                                SocketAddr::new(ip, 0),
                            ));
                        }
                    }
                    Err(e) => {
                        warn!(
                            up.log,
                            "failed to resolve {}: {}",
                            up.name(),
                            e
                        );
                    }
                }

                if up.dns_requests.fetch_sub(1, AtomicOrdering::SeqCst) == 1 {
                    up.update_addrs();
                }
            });
        }
    }

    // Merge the scratch address list collected by the resolution threads
    // into the live address set. Stale addresses are always preferable to
    // none: when resolution produced nothing, the previous set is kept.
    fn update_addrs(&self) {
        if self.ls.lock().unwrap().upgrade().is_none() {
            // Detached from its pool; the result is of no use
            self.state_lock().new_addrs.clear();
            return;
        }

        let m_entropy = self.ctx.upgrade().map(|ctx| Arc::clone(&ctx.entropy));

        let mut st = self.state_lock();

        if !st.addrs.is_empty() && !st.new_addrs.is_empty() {
            // DNS gives no idea what port has been used previously, so
            // carry the port of the first existing address over
            let port = st.addrs[0].addr.port().unwrap_or(0);

            // At 10% probability reset errors on addr elements
            let reset_errors = match m_entropy {
                Some(entropy) => entropy.uniform() > 0.9,
                None => false,
            };
            if reset_errors {
                debug!(self.log, "reset errors on upstream {}", self.name);
            }

            let incoming: Vec<UpstreamAddr> = st.new_addrs.drain(..).collect();
            let mut merged = Vec::with_capacity(incoming.len());

            for mut addr in incoming {
                addr.set_port(port);

                let prev = st.addrs.iter().find(|entry| entry.addr == addr);
                match prev {
                    Some(entry) => {
                        debug!(
                            self.log,
                            "existing address for {}: {}", self.name, addr
                        );
                        merged.push(AddrEntry {
                            addr,
                            errors: if reset_errors { 0 } else { entry.errors },
                        });
                    }
                    None => {
                        debug!(
                            self.log,
                            "new address for {}: {}", self.name, addr
                        );
                        merged.push(AddrEntry { addr, errors: 0 });
                    }
                }
            }

            st.addrs = merged;
            st.addr_cur = 0;
            sort_addrs(&mut st.addrs);
        } else {
            st.new_addrs.clear();
        }
    }

    // Lazy-resolve timer fired: refresh addresses and re-arm with a fresh
    // jittered delay, as long as the upstream still belongs to a pool.
    pub(crate) fn lazy_resolve_fire(up: &Arc<Upstream>) {
        up.state_lock().timer = None;

        let m_ls = up.ls.lock().unwrap().upgrade();
        if let Some(ls) = m_ls {
            let limits = ls.pool_state_lock().limits;
            Upstream::resolve_addrs(up, &limits);

            if let Some(ctx) = up.ctx.upgrade() {
                pool::arm_lazy_timer(&ctx, up, limits.lazy_resolve_time);
            }
        }
    }

    // Revive timer fired: rejoin the alive set. Dropping the timer guard
    // released the strong handle the armed timer held.
    pub(crate) fn revive_fire(up: &Arc<Upstream>) {
        up.state_lock().timer = None;

        debug!(up.log, "revive upstream {}", up.name);

        let m_ls = up.ls.lock().unwrap().upgrade();
        if let Some(ls) = m_ls {
            pool::set_active(&ls, up);
        }
    }

    pub(crate) fn state_lock(&self) -> MutexGuard<UpstreamState> {
        self.state.lock().unwrap()
    }
}

// UNIX sockets sort before IPv4, IPv4 before IPv6
pub(crate) fn sort_addrs(addrs: &mut Vec<AddrEntry>) {
    addrs.sort_by(|a, b| {
        b.addr.family_weight().cmp(&a.addr.family_weight())
    });
}

fn uid_from_name(name: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(name.as_bytes());

    let mut uid = base64::encode(&sha1.digest().bytes());
    uid.truncate(8);
    uid
}

// Copyright 2020 Joyent, Inc.

use std::any::Any;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use slog::{debug, o, Drain, Logger};

use crate::addr;
use crate::addr::ParsedHost;
use crate::clock::{jitter, Entropy, ThreadRngEntropy};
use crate::context::{ContextInner, PoolContext};
use crate::limits::Limits;
use crate::select;
use crate::select::RotationPolicy;
use crate::upstream::{AddrEntry, Upstream, UpstreamFlags};
use crate::watch::{WatchEvent, WatchEvents, WatchFn, Watcher};

// Fixed seed for consistent hashing, shared by every pool so a given key
// maps stably across pool instances with the same membership
const HASH_SEED: u64 = 0xa574_de7d_f64e_9b9d;

/// How an upstream specification string is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseMode {
    /// `host[:port][:priority]`: DNS name, literal IP, or UNIX path. DNS
    /// names are resolved synchronously at construction and may produce
    /// several addresses.
    HostPort,
    /// A literal IP only, with an optional port defaulted when absent.
    Nameserver,
}

#[doc(hidden)]
pub struct PoolState {
    pub(crate) ups: Vec<Arc<Upstream>>,
    pub(crate) alive: Vec<Arc<Upstream>>,
    pub(crate) watchers: Vec<Watcher>,
    pub(crate) rot: Option<RotationPolicy>,
    pub(crate) limits: Limits,
    pub(crate) flags: UpstreamFlags,
    pub(crate) cur_elt: usize,
}

#[doc(hidden)]
pub struct PoolInner {
    pub(crate) log: Logger,
    pub(crate) ctx: Option<PoolContext>,
    pub(crate) hash_seed: u64,
    pub(crate) entropy: Arc<dyn Entropy>,
    pub(crate) state: Mutex<PoolState>,
}

impl PoolInner {
    pub(crate) fn pool_state_lock(&self) -> MutexGuard<PoolState> {
        self.state.lock().unwrap()
    }
}

/// A selection pool of upstreams sharing a rotation policy, limits, and a
/// watcher list. Cheap to clone; all clones refer to the same pool.
///
/// The pool owns its upstreams. Upstreams keep a weak back-reference to
/// the pool, and the context tracks them weakly for fleet iteration, so
/// dropping every handle (or calling [`destroy`](UpstreamPool::destroy))
/// tears the whole structure down without reference cycles.
#[derive(Clone)]
pub struct UpstreamPool(pub(crate) Arc<PoolInner>);

impl UpstreamPool {
    /// Create a pool, copying limits, logging, and randomness from the
    /// context when one is given.
    pub fn new(ctx: Option<&PoolContext>) -> UpstreamPool {
        let (log, limits, entropy, ctx_handle) = match ctx {
            Some(ctx) => (
                ctx.0.log.new(o!()),
                ctx.limits(),
                Arc::clone(&ctx.0.entropy),
                Some(ctx.clone()),
            ),
            None => (
                Logger::root(slog_stdlog::StdLog.fuse(), o!()),
                Limits::default(),
                Arc::new(ThreadRngEntropy) as Arc<dyn Entropy>,
                None,
            ),
        };

        UpstreamPool(Arc::new(PoolInner {
            log,
            ctx: ctx_handle,
            hash_seed: HASH_SEED,
            entropy,
            state: Mutex::new(PoolState {
                ups: Vec::new(),
                alive: Vec::new(),
                watchers: Vec::new(),
                rot: None,
                limits,
                flags: UpstreamFlags::default(),
                cur_elt: 0,
            }),
        }))
    }

    pub fn count(&self) -> usize {
        self.0.pool_state_lock().ups.len()
    }

    pub fn alive_count(&self) -> usize {
        self.0.pool_state_lock().alive.len()
    }

    /// A snapshot of the alive set, in alive-index order.
    pub fn alive_upstreams(&self) -> Vec<Arc<Upstream>> {
        self.0.pool_state_lock().alive.clone()
    }

    pub fn rotation(&self) -> Option<RotationPolicy> {
        self.0.pool_state_lock().rot
    }

    pub fn set_rotation(&self, rot: RotationPolicy) {
        self.0.pool_state_lock().rot = Some(rot);
    }

    /// Default flags applied to subsequently added upstreams.
    pub fn set_flags(&self, flags: UpstreamFlags) {
        self.0.pool_state_lock().flags = flags;
    }

    pub fn limits(&self) -> Limits {
        self.0.pool_state_lock().limits
    }

    pub fn set_limits(&self, limits: Limits) {
        self.0.pool_state_lock().limits = limits;
    }

    /// Subscribe to state transitions. The callback runs synchronously on
    /// the thread that triggered the transition, with the pool lock held;
    /// it must not re-enter the pool API. Captured state is released when
    /// the pool is destroyed.
    ///
    /// Panics when `events` is empty: a watcher that can never fire is a
    /// programming error.
    pub fn add_watcher<F>(&self, events: WatchEvents, func: F)
    where
        F: Fn(&Upstream, WatchEvent, u32) + Send + Sync + 'static,
    {
        assert!(!events.is_empty(), "empty watcher event mask");

        let func: WatchFn = Box::new(func);
        self.0
            .pool_state_lock()
            .watchers
            .push(Watcher { events, func });
    }

    /// Parse one specification and add the resulting upstream to the
    /// pool. Returns false when nothing was accepted; the pool is
    /// unchanged in that case.
    pub fn add_upstream(
        &self,
        spec: &str,
        def_port: u16,
        mode: ParseMode,
        data: Option<Arc<dyn Any + Send + Sync>>,
    ) -> bool {
        let inner = &self.0;

        let parsed = match mode {
            ParseMode::HostPort => {
                addr::parse_host_port_priority(spec, def_port)
            }
            ParseMode::Nameserver => addr::parse_inet_address(spec, def_port)
                .map(|a| ParsedHost {
                    name: spec.to_string(),
                    addrs: vec![a],
                    priority: 0,
                    numeric: true,
                }),
        };

        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(inner.log, "rejected upstream {}: {}", spec, e);
                return false;
            }
        };

        if parsed.addrs.is_empty() {
            return false;
        }

        let mut ps = inner.pool_state_lock();

        let mut weight = parsed.priority;
        if weight == 0
            && ps.rot == Some(RotationPolicy::MasterSlave)
            && ps.ups.is_empty()
        {
            // Special heuristic for master-slave rotation: prioritize the
            // first member
            weight = 1;
        }

        let noresolve = ps.flags.noresolve || parsed.numeric;
        let entries: Vec<AddrEntry> = parsed
            .addrs
            .into_iter()
            .map(|addr| AddrEntry { addr, errors: 0 })
            .collect();

        let ctx_weak = inner
            .ctx
            .as_ref()
            .map(|ctx| Arc::downgrade(&ctx.0))
            .unwrap_or_else(Weak::new);

        let up = Upstream::new(
            parsed.name,
            entries,
            weight,
            noresolve,
            &inner.log,
            Arc::downgrade(inner),
            ctx_weak,
        );

        debug!(
            up.log,
            "added upstream {} ({})",
            up.name(),
            if noresolve { "numeric ip" } else { "DNS name" }
        );

        if let Some(data) = data {
            up.set_data(data);
        }

        ps.ups.push(Arc::clone(&up));
        if let Some(ctx) = &inner.ctx {
            ctx.register(&up);
        }

        set_active_locked(&mut ps, &up);

        true
    }

    /// Parse a whole upstreams line: an optional rotation prefix followed
    /// by separator-delimited entries. Returns true when at least one
    /// entry was accepted; rejected entries are skipped, so partial
    /// success still counts.
    pub fn parse_line(&self, line: &str, def_port: u16) -> bool {
        const PREFIXES: &[(&str, RotationPolicy)] = &[
            ("random:", RotationPolicy::Random),
            ("master-slave:", RotationPolicy::MasterSlave),
            ("round-robin:", RotationPolicy::RoundRobin),
            ("hash:", RotationPolicy::Hashed),
            ("sequential:", RotationPolicy::Sequential),
        ];

        let mut rest = line;
        for (prefix, rot) in PREFIXES {
            if let Some(stripped) = rest.strip_prefix(prefix) {
                self.set_rotation(*rot);
                rest = stripped;
                break;
            }
        }

        let mut ret = false;
        for span in
            rest.split(|c| matches!(c, ';' | ',' | ' ' | '\n' | '\r' | '\t'))
        {
            if !span.is_empty()
                && self.add_upstream(span, def_port, ParseMode::HostPort, None)
            {
                ret = true;
            }
        }

        ret
    }

    /// Read upstreams from a structured configuration value: a string or
    /// an array of strings, each one a `parse_line` line.
    pub fn from_config(&self, value: &Value, def_port: u16) -> bool {
        match value {
            Value::String(line) => self.parse_line(line, def_port),
            Value::Array(items) => {
                let mut ret = false;
                for item in items {
                    if let Value::String(line) = item {
                        if self.parse_line(line, def_port) {
                            ret = true;
                        }
                    }
                }
                ret
            }
            _ => false,
        }
    }

    pub fn foreach<F>(&self, mut func: F)
    where
        F: FnMut(&Arc<Upstream>, usize),
    {
        let ups = self.0.pool_state_lock().ups.clone();
        for (i, up) in ups.iter().enumerate() {
            func(up, i);
        }
    }

    /// Select an upstream. The pool's own rotation policy, when set,
    /// overrides `default_policy`. Returns `None` only for an empty pool
    /// or for the sequential policy at end of iteration; any other policy
    /// always yields a member, reviving the whole pool first if every
    /// member was inactive.
    pub fn get(
        &self,
        default_policy: RotationPolicy,
        key: Option<&[u8]>,
    ) -> Option<Arc<Upstream>> {
        self.get_common(default_policy, key, false)
    }

    /// Like [`get`](UpstreamPool::get), but the given policy wins over
    /// the pool's configured one.
    pub fn get_forced(
        &self,
        forced_policy: RotationPolicy,
        key: Option<&[u8]>,
    ) -> Option<Arc<Upstream>> {
        self.get_common(forced_policy, key, true)
    }

    fn get_common(
        &self,
        policy: RotationPolicy,
        key: Option<&[u8]>,
        forced: bool,
    ) -> Option<Arc<Upstream>> {
        let inner = &self.0;
        let mut ps = inner.pool_state_lock();

        if ps.ups.is_empty() {
            return None;
        }

        if ps.alive.is_empty() {
            // We have no upstreams alive: restore the whole pool rather
            // than failing the caller
            let ups: Vec<Arc<Upstream>> = ps.ups.clone();
            for up in &ups {
                let errors;
                {
                    let mut st = up.state_lock();
                    st.timer = None;
                    st.active_idx = Some(ps.alive.len());
                    errors = st.errors;
                }
                ps.alive.push(Arc::clone(up));
                notify_locked(&ps.watchers, up, WatchEvent::Online, errors);
            }
        }

        let policy = if forced {
            policy
        } else {
            ps.rot.unwrap_or(policy)
        };

        // Cannot use hashed rotation when no key is given
        let policy = match policy {
            RotationPolicy::Hashed if key.map_or(true, <[u8]>::is_empty) => {
                RotationPolicy::Random
            }
            other => other,
        };

        let selected = match policy {
            RotationPolicy::Random => {
                select::random(&ps.alive, &*inner.entropy)
            }
            RotationPolicy::RoundRobin => select::round_robin(&ps.alive, true),
            RotationPolicy::MasterSlave => {
                select::round_robin(&ps.alive, false)
            }
            RotationPolicy::Hashed => {
                select::hashed(&ps.alive, key.unwrap_or(&[]), inner.hash_seed)
            }
            RotationPolicy::Sequential => {
                let mut cur_elt = ps.cur_elt;
                let selected = select::sequential(&ps.alive, &mut cur_elt);
                ps.cur_elt = cur_elt;
                selected
            }
        };

        if let Some(up) = &selected {
            up.state_lock().checked += 1;
        }

        selected
    }

    /// Tear the pool down: cancel every member's timer, sever the
    /// members' back-references (pending DNS merges become no-ops), and
    /// release the watchers.
    pub fn destroy(&self) {
        let mut ps = self.0.pool_state_lock();

        ps.alive.clear();
        for up in ps.ups.drain(..) {
            *up.ls.lock().unwrap() = Weak::new();
            let mut st = up.state_lock();
            st.timer = None;
            st.active_idx = None;
        }
        ps.watchers.clear();
    }
}

// Join the alive set and (re)start lazy resolution. No-op for an upstream
// that is already alive.
pub(crate) fn set_active(ls: &Arc<PoolInner>, up: &Arc<Upstream>) {
    let mut ps = ls.pool_state_lock();
    set_active_locked(&mut ps, up);
}

pub(crate) fn set_active_locked(ps: &mut PoolState, up: &Arc<Upstream>) {
    let errors;
    {
        let mut st = up.state_lock();
        if st.active_idx.is_some() {
            return;
        }
        st.active_idx = Some(ps.alive.len());
        errors = st.errors;
    }
    ps.alive.push(Arc::clone(up));

    if !up.noresolve() {
        if let Some(ctx) = up.ctx.upgrade() {
            arm_lazy_timer(&ctx, up, ps.limits.lazy_resolve_time);
        }
    }

    notify_locked(&ps.watchers, up, WatchEvent::Online, errors);
}

// Leave the alive set: re-index the remaining members, pre-warm the
// address set, and arm the revive timer. The timer closure owns a strong
// handle on the upstream until it fires or is cancelled.
pub(crate) fn set_inactive(ls: &Arc<PoolInner>, up: &Arc<Upstream>) {
    let mut ps = ls.pool_state_lock();

    let idx = {
        let mut st = up.state_lock();
        match st.active_idx.take() {
            Some(idx) => idx,
            None => return,
        }
    };
    ps.alive.remove(idx);

    // We need to update all indices
    for i in idx..ps.alive.len() {
        ps.alive[i].state_lock().active_idx = Some(i);
    }

    let errors = up.state_lock().errors;
    let limits = ps.limits;

    if let Some(ctx) = up.ctx.upgrade() {
        // Pre-warm the address set before the revive fires
        Upstream::resolve_addrs(up, &limits);

        let configured = ctx.ctx_state_lock().configured;
        let ntim =
            jitter(&*ctx.entropy, limits.revive_time, limits.revive_jitter);
        debug!(
            up.log,
            "mark upstream {} inactive; revive in {:.0} seconds",
            up.name(),
            ntim
        );

        let mut st = up.state_lock();
        st.timer = None;
        if configured {
            let strong = Arc::clone(up);
            st.timer = Some(ctx.schedule(ntim, move || {
                Upstream::revive_fire(&strong);
            }));
        }
    }

    notify_locked(&ps.watchers, up, WatchEvent::Offline, errors);
}

pub(crate) fn arm_lazy_timer(
    ctx: &Arc<ContextInner>,
    up: &Arc<Upstream>,
    lazy_resolve_time: f64,
) {
    if !ctx.ctx_state_lock().configured {
        return;
    }

    let when = jitter(&*ctx.entropy, lazy_resolve_time, 0.1);
    debug!(
        up.log,
        "start lazy resolving for {} in {:.0} seconds",
        up.name(),
        when
    );

    let weak = Arc::downgrade(up);
    let guard = ctx.schedule(when, move || {
        if let Some(up) = weak.upgrade() {
            Upstream::lazy_resolve_fire(&up);
        }
    });

    up.state_lock().timer = Some(guard);
}

pub(crate) fn notify(
    ls: &Arc<PoolInner>,
    up: &Upstream,
    event: WatchEvent,
    count: u32,
) {
    let ps = ls.pool_state_lock();
    notify_locked(&ps.watchers, up, event, count);
}

fn notify_locked(
    watchers: &[Watcher],
    up: &Upstream,
    event: WatchEvent,
    count: u32,
) {
    for watcher in watchers {
        if watcher.events.contains(event) {
            (watcher.func)(up, event, count);
        }
    }
}

// Copyright 2020 Joyent, Inc.

use std::sync::{Arc, Mutex, MutexGuard};

use slog::{o, Drain, Logger};

use crate::clock::{Clock, Entropy, MonotonicClock, ThreadRngEntropy};
use crate::limits::Limits;
use crate::pool;
use crate::resolver::NameResolver;
use crate::upstream::Upstream;

/// Limit overrides applied when a context is configured. Fields left as
/// `None` keep the library defaults.
#[derive(Debug, Default)]
pub struct ContextConfig {
    pub max_errors: Option<u32>,
    pub error_time: Option<f64>,
    pub revive_time: Option<f64>,
    pub lazy_resolve_time: Option<f64>,
    pub dns_timeout: Option<f64>,
    pub dns_retransmits: Option<u32>,
}

#[doc(hidden)]
pub struct CtxState {
    pub(crate) limits: Limits,
    pub(crate) configured: bool,
    pub(crate) resolver: Option<Arc<dyn NameResolver>>,
    pub(crate) upstreams: Vec<std::sync::Weak<Upstream>>,
}

#[doc(hidden)]
pub struct ContextInner {
    pub(crate) log: Logger,
    // The timer is driven through a channel sender, which is not Sync;
    // the mutex makes the scheduler shareable across caller threads
    pub(crate) timer: Mutex<timer::Timer>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) entropy: Arc<dyn Entropy>,
    pub(crate) state: Mutex<CtxState>,
}

impl ContextInner {
    pub(crate) fn ctx_state_lock(&self) -> MutexGuard<CtxState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn schedule<F>(&self, delay_secs: f64, cb: F) -> timer::Guard
    where
        F: 'static + FnMut() + Send,
    {
        self.timer.lock().unwrap().schedule_with_delay(
            chrono::Duration::milliseconds((delay_secs * 1000.0) as i64),
            cb,
        )
    }
}

/// Process- or subsystem-scoped registry of upstreams. Owns the timer
/// thread driving lazy resolution and revival, tracks every upstream
/// weakly for fleet-wide re-resolution, and holds the default limits that
/// new pools copy.
///
/// A context starts unconfigured: pools and upstreams may be registered,
/// but no timers are armed and no resolution happens until
/// [`configure`](PoolContext::configure) supplies a resolver. This staged
/// initialization mirrors the embedding process bringing its resolver up
/// after its configuration is loaded.
#[derive(Clone)]
pub struct PoolContext(pub(crate) Arc<ContextInner>);

impl PoolContext {
    pub fn new(log: Option<Logger>) -> PoolContext {
        Self::new_with(
            log,
            Arc::new(MonotonicClock::new()),
            Arc::new(ThreadRngEntropy),
        )
    }

    /// Construct with explicit time and randomness sources. Conformance
    /// tests use this to pin the clock driving the failure-rate window
    /// and the RNG behind jitter and merge amnesty.
    pub fn new_with(
        log: Option<Logger>,
        clock: Arc<dyn Clock>,
        entropy: Arc<dyn Entropy>,
    ) -> PoolContext {
        let logger = log.unwrap_or_else(|| {
            Logger::root(slog_stdlog::StdLog.fuse(), o!())
        });

        PoolContext(Arc::new(ContextInner {
            log: logger,
            timer: Mutex::new(timer::Timer::new()),
            clock,
            entropy,
            state: Mutex::new(CtxState {
                limits: Limits::default(),
                configured: false,
                resolver: None,
                upstreams: Vec::new(),
            }),
        }))
    }

    pub fn limits(&self) -> Limits {
        self.0.ctx_state_lock().limits
    }

    pub fn is_configured(&self) -> bool {
        self.0.ctx_state_lock().configured
    }

    /// Bind the context to its resolver and apply configuration
    /// overrides, then start lazy resolution for every already-registered
    /// upstream that can use it.
    pub fn configure(
        &self,
        cfg: &ContextConfig,
        resolver: Arc<dyn NameResolver>,
    ) {
        let ups = {
            let mut cs = self.0.ctx_state_lock();

            if let Some(max_errors) = cfg.max_errors {
                cs.limits.max_errors = max_errors;
            }
            if let Some(error_time) = cfg.error_time {
                cs.limits.error_time = error_time;
            }
            if let Some(revive_time) = cfg.revive_time {
                cs.limits.revive_time = revive_time;
            }
            if let Some(lazy_resolve_time) = cfg.lazy_resolve_time {
                cs.limits.lazy_resolve_time = lazy_resolve_time;
            }
            if let Some(dns_timeout) = cfg.dns_timeout {
                cs.limits.dns_timeout = dns_timeout;
            }
            if let Some(dns_retransmits) = cfg.dns_retransmits {
                cs.limits.dns_retransmits = dns_retransmits;
            }

            cs.resolver = Some(resolver);
            cs.configured = true;

            cs.upstreams.retain(|weak| weak.strong_count() > 0);
            cs.upstreams
                .iter()
                .filter_map(std::sync::Weak::upgrade)
                .collect::<Vec<_>>()
        };

        // Start lazy resolving
        for up in ups {
            if up.noresolve() || up.state_lock().timer.is_some() {
                continue;
            }

            let m_ls = up.ls.lock().unwrap().upgrade();
            if let Some(ls) = m_ls {
                let lazy_resolve_time =
                    ls.pool_state_lock().limits.lazy_resolve_time;
                pool::arm_lazy_timer(&self.0, &up, lazy_resolve_time);
            }
        }
    }

    /// Force a resolution pass over every registered upstream, regardless
    /// of its timers. Used when the host's resolver configuration has
    /// changed under us.
    pub fn reresolve(&self) {
        let ups: Vec<Arc<Upstream>> = {
            let cs = self.0.ctx_state_lock();
            cs.upstreams
                .iter()
                .filter_map(std::sync::Weak::upgrade)
                .collect()
        };

        for up in ups {
            let m_ls = up.ls.lock().unwrap().upgrade();
            if let Some(ls) = m_ls {
                let limits = ls.pool_state_lock().limits;
                Upstream::resolve_addrs(&up, &limits);
            }
        }
    }

    pub(crate) fn register(&self, up: &Arc<Upstream>) {
        let mut cs = self.0.ctx_state_lock();
        cs.upstreams.retain(|weak| weak.strong_count() > 0);
        cs.upstreams.push(Arc::downgrade(up));
    }
}

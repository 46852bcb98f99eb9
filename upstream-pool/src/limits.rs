// Copyright 2020 Joyent, Inc.

// 4 errors in 10 seconds
const DEFAULT_MAX_ERRORS: u32 = 4;
const DEFAULT_ERROR_TIME: f64 = 10.0;
const DEFAULT_REVIVE_TIME: f64 = 60.0;
const DEFAULT_REVIVE_JITTER: f64 = 0.4;
const DEFAULT_DNS_TIMEOUT: f64 = 1.0;
const DEFAULT_DNS_RETRANSMITS: u32 = 2;
const DEFAULT_LAZY_RESOLVE_TIME: f64 = 3600.0;

/// Tuning knobs governing the circuit breaker and DNS refresh cadence of
/// a pool. Durations are in seconds. A pool copies the limits of its
/// context at creation; `UpstreamPool::set_limits` replaces the record
/// afterwards.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// Error budget of the breaker: an upstream failing more than
    /// `max_errors` times in `error_time` seconds goes inactive.
    pub max_errors: u32,
    pub error_time: f64,
    /// Base delay before an inactive upstream is put back in rotation.
    pub revive_time: f64,
    /// Fractional jitter applied to `revive_time`.
    pub revive_jitter: f64,
    pub dns_timeout: f64,
    pub dns_retransmits: u32,
    /// Base period of the background DNS refresh for alive upstreams.
    pub lazy_resolve_time: f64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_errors: DEFAULT_MAX_ERRORS,
            error_time: DEFAULT_ERROR_TIME,
            revive_time: DEFAULT_REVIVE_TIME,
            revive_jitter: DEFAULT_REVIVE_JITTER,
            dns_timeout: DEFAULT_DNS_TIMEOUT,
            dns_retransmits: DEFAULT_DNS_RETRANSMITS,
            lazy_resolve_time: DEFAULT_LAZY_RESOLVE_TIME,
        }
    }
}

impl Limits {
    /// The breaker trip threshold, in errors per second.
    pub fn max_error_rate(&self) -> f64 {
        f64::from(self.max_errors) / self.error_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rate() {
        let limits = Limits::default();
        assert!((limits.max_error_rate() - 0.4).abs() < 1e-9);
    }
}

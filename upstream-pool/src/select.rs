// Copyright 2020 Joyent, Inc.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::Arc;

use crate::clock::Entropy;
use crate::upstream::Upstream;

/// Rotation policy applied when selecting an upstream from a pool's alive
/// set. A pool may carry its own policy (set explicitly or by a
/// `parse_line` prefix); `UpstreamPool::get` lets that override the
/// caller's default, while `get_forced` gives the caller's policy
/// precedence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationPolicy {
    /// Uniform random selection.
    Random,
    /// Smooth weighted round-robin; unweighted pools balance on the
    /// selection counters instead.
    RoundRobin,
    /// Highest weight wins, no rotation.
    MasterSlave,
    /// Consistent hashing of a caller key over the alive set.
    Hashed,
    /// Exhaustible in-order iteration.
    Sequential,
}

pub(crate) fn random(
    alive: &[Arc<Upstream>],
    entropy: &dyn Entropy,
) -> Option<Arc<Upstream>> {
    if alive.is_empty() {
        return None;
    }

    let idx = (entropy.uniform() * alive.len() as f64) as usize;
    Some(Arc::clone(&alive[idx.min(alive.len() - 1)]))
}

// Shared by round-robin (use_cur) and master-slave (!use_cur). With every
// configured weight at zero both fall back to balancing on
// `checked * (errors + 1)`, resetting the counters before they can
// overflow.
pub(crate) fn round_robin(
    alive: &[Arc<Upstream>],
    use_cur: bool,
) -> Option<Arc<Upstream>> {
    if alive.is_empty() {
        return None;
    }

    if use_cur {
        let exhausted = alive
            .iter()
            .all(|up| up.state_lock().cur_weight == 0);
        if exhausted {
            // Start the next round of the cycle
            for up in alive {
                let mut st = up.state_lock();
                st.cur_weight = st.weight;
            }
        }
    }

    let mut max_weight = 0u32;
    let mut selected: Option<&Arc<Upstream>> = None;
    let mut min_load = u64::MAX;
    let mut min_checked = 0u32;
    let mut min_checked_sel: Option<&Arc<Upstream>> = None;

    for up in alive {
        let st = up.state_lock();

        let weight = if use_cur { st.cur_weight } else { st.weight };
        if weight > max_weight {
            selected = Some(up);
            max_weight = weight;
        }

        // Candidates compare on the error-weighted load, but the
        // overflow guard below watches the raw selection counter
        let load = u64::from(st.checked) * u64::from(st.errors + 1);
        if load < min_load {
            min_checked_sel = Some(up);
            min_load = load;
            min_checked = st.checked;
        }
    }

    if max_weight == 0 {
        if min_checked > u32::MAX / 2 {
            // Reset all checked counters to avoid overflow
            for up in alive {
                up.state_lock().checked = 0;
            }
        }
        selected = min_checked_sel;
    }

    if use_cur {
        if let Some(up) = selected {
            let mut st = up.state_lock();
            if st.cur_weight > 0 {
                st.cur_weight -= 1;
            } else {
                st.cur_weight = st.weight;
            }
        }
    }

    selected.map(Arc::clone)
}

pub(crate) fn hashed(
    alive: &[Arc<Upstream>],
    key: &[u8],
    seed: u64,
) -> Option<Arc<Upstream>> {
    if alive.is_empty() {
        return None;
    }

    let k = hash_key(key, seed);
    let idx = jump_consistent_hash(k, alive.len() as u32);

    Some(Arc::clone(&alive[idx as usize]))
}

pub(crate) fn sequential(
    alive: &[Arc<Upstream>],
    cur_elt: &mut usize,
) -> Option<Arc<Upstream>> {
    if *cur_elt >= alive.len() {
        *cur_elt = 0;
        return None;
    }

    let up = Arc::clone(&alive[*cur_elt]);
    *cur_elt += 1;
    Some(up)
}

// 64-bit key for consistent hashing: the pool seed folded in ahead of the
// caller-supplied bytes
pub(crate) fn hash_key(key: &[u8], seed: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    hasher.write_u64(seed);
    hasher.write(key);
    hasher.finish()
}

/*
 * The key idea of this function is obtained from the following paper:
 * A Fast, Minimal Memory, Consistent Hash Algorithm
 * John Lamping, Eric Veach
 *
 * http://arxiv.org/abs/1406.2294
 */
pub(crate) fn jump_consistent_hash(mut key: u64, nbuckets: u32) -> u32 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;

    while j < i64::from(nbuckets) {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = (((b + 1) as f64) * f64::from(1u32 << 31)
            / (((key >> 33) + 1) as f64)) as i64;
    }

    b as u32
}

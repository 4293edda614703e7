use std::sync::{LazyLock, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore as _;
use rand::SeedableRng as _;
use rand::rngs::SmallRng;

/// Process-wide selection PRNG, seeded once from the wall clock.
/// Samples only steer backend selection, nothing security-relevant.
static SELECT_RNG: LazyLock<Mutex<SmallRng>> = LazyLock::new(|| {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Mutex::new(SmallRng::seed_from_u64(seed))
});

/// One uniform sample in `[0, n)`. Takes a single 63-bit draw per call.
#[must_use]
pub(crate) fn rand_intn(n: usize) -> usize {
    assert!(n > 0, "rand_intn range must not be empty");
    let sample = SELECT_RNG
        .lock()
        .expect("other users should not panic")
        .next_u64()
        >> 1;
    usize::try_from(sample % n as u64).expect("remainder is below n")
}

/// Wrap-around visit order over `[0, len)`: `start, start+1, .., len-1, 0, ..,
/// start-1`. Every index is yielded exactly once.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WrapOrder {
    len: usize,
    start: usize,
    emitted: usize,
}

impl Iterator for WrapOrder {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.emitted == self.len {
            return None;
        }
        let i = (self.start + self.emitted) % self.len;
        self.emitted += 1;
        Some(i)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.len - self.emitted;
        (rest, Some(rest))
    }
}

#[must_use]
pub(crate) fn random_order(len: usize) -> WrapOrder {
    let start = if len == 0 { 0 } else { rand_intn(len) };
    WrapOrder {
        len,
        start,
        emitted: 0,
    }
}

/// Visit order starting at a weighted-random index: index `i` is the starting
/// point with probability `weights[i] / total`. A zero weight excludes an
/// index from being the start but keeps it in the visit order. A zero total
/// degrades to the uniform order.
#[must_use]
pub(crate) fn weighted_order(weights: &[u32], total: u32) -> WrapOrder {
    let len = weights.len();
    if len == 0 {
        return WrapOrder {
            len: 0,
            start: 0,
            emitted: 0,
        };
    }
    if total == 0 {
        return random_order(len);
    }

    let mut n = u32::try_from(rand_intn(total as usize)).expect("sample is below total");
    let mut start = 0;
    for (i, &w) in weights.iter().enumerate() {
        if n < w {
            start = i;
            break;
        }
        n -= w;
    }

    WrapOrder {
        len,
        start,
        emitted: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(order: WrapOrder) -> Vec<usize> {
        order.collect()
    }

    #[test]
    fn wrap_order_visits_every_index_once() {
        for len in 1..8 {
            for start in 0..len {
                let visited = collect(WrapOrder {
                    len,
                    start,
                    emitted: 0,
                });
                assert_eq!(visited.len(), len);
                assert_eq!(visited[0], start);
                let mut sorted = visited.clone();
                sorted.sort_unstable();
                assert_eq!(sorted, (0..len).collect::<Vec<_>>());
                // consecutive wrap-around
                for w in visited.windows(2) {
                    assert_eq!(w[1], (w[0] + 1) % len);
                }
            }
        }
    }

    #[test]
    fn random_order_covers_all() {
        for _ in 0..32 {
            let mut visited = collect(random_order(5));
            visited.sort_unstable();
            assert_eq!(visited, vec![0, 1, 2, 3, 4]);
        }
        assert_eq!(collect(random_order(0)), Vec::<usize>::new());
    }

    #[test]
    fn weighted_order_zero_total_degrades_to_uniform() {
        for _ in 0..32 {
            let mut visited = collect(weighted_order(&[0, 0, 0], 0));
            visited.sort_unstable();
            assert_eq!(visited, vec![0, 1, 2]);
        }
        assert_eq!(collect(weighted_order(&[], 0)), Vec::<usize>::new());
    }

    #[test]
    fn weighted_order_never_starts_on_zero_weight() {
        for _ in 0..64 {
            let order = weighted_order(&[0, 1, 0, 3], 4);
            let first = collect(order)[0];
            assert!(first == 1 || first == 3, "started at zero-weight {first}");
        }
    }

    #[test]
    fn weighted_order_single_candidate_is_deterministic() {
        for _ in 0..16 {
            assert_eq!(collect(weighted_order(&[0, 7], 7)), vec![1, 0]);
        }
    }

    #[test]
    fn short_circuit_maps_to_any() {
        let mut seen = Vec::new();
        let found = weighted_order(&[1, 1, 1], 3).any(|i| {
            seen.push(i);
            true
        });
        assert!(found);
        assert_eq!(seen.len(), 1);

        let all = weighted_order(&[1, 1, 1], 3).any(|_| false);
        assert!(!all);
    }
}

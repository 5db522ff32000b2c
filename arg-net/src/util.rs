//! Small shared utilities used by the director's timer loops.

use std::sync::atomic::{AtomicI64, Ordering};

/// Boolean rate limiter with atomic (thread-safe) semantics: `gate(now)`
/// returns `true` at most once per `FREQ` milliseconds, letting a single
/// timer thread drive several independently-paced sweeps (director tick,
/// NAT cleanup) without a dedicated thread per period.
#[repr(transparent)]
pub struct AtomicIntervalGate<const FREQ_MS: i64>(AtomicI64);

impl<const FREQ_MS: i64> AtomicIntervalGate<FREQ_MS> {
    pub fn new(initial_ts_ms: i64) -> Self {
        Self(AtomicI64::new(initial_ts_ms))
    }

    pub fn gate(&self, now_ms: i64) -> bool {
        let prev = self.0.load(Ordering::Acquire);
        if (now_ms - prev) < FREQ_MS {
            false
        } else {
            self.0.store(now_ms, Ordering::Release);
            true
        }
    }
}

impl<const FREQ_MS: i64> Default for AtomicIntervalGate<FREQ_MS> {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_fires_once_per_period() {
        let gate = AtomicIntervalGate::<1000>::new(0);
        assert!(gate.gate(1000));
        assert!(!gate.gate(1500));
        assert!(gate.gate(2000));
    }
}

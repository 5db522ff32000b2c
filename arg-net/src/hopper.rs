//! Deterministic time-to-address hopping and per-peer clock offset tracking.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicI64, Ordering};

use arg_crypto::{Crypto, HopKey};

/// Compute the hop address for `(hop_key, interval_ms, base, mask)` at
/// peer-local time `t_peer_ms`.
///
/// `slot = t_peer_ms / interval_ms`; the low 4 bytes of
/// `HMAC_SHA2(hop_key, slot_as_8_bytes)` select a host offset within the
/// range described by `base`/`mask`.
pub fn hop_address(crypto: &dyn Crypto, hop_key: &HopKey, interval_ms: u64, base: Ipv4Addr, mask: Ipv4Addr, t_peer_ms: u64) -> Ipv4Addr {
    let slot = t_peer_ms / interval_ms.max(1);
    let digest = crypto.hmac(hop_key, &slot.to_be_bytes());
    let idx = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);

    let base_bits = u32::from_be_bytes(base.octets());
    let mask_bits = u32::from_be_bytes(mask.octets());
    let host_bits = 32 - mask_bits.count_ones();
    let host = if host_bits >= 32 { idx } else { idx % (1u32 << host_bits) };

    let addr_bits = (base_bits & mask_bits) | (host & !mask_bits);
    Ipv4Addr::from(addr_bits)
}

/// Given the current and previous interval's hop addresses, is `candidate`
/// "for us"? Accepts the current slot or the immediately prior one, to
/// tolerate clock skew and in-flight latency of up to one interval.
pub fn accepts(crypto: &dyn Crypto, hop_key: &HopKey, interval_ms: u64, base: Ipv4Addr, mask: Ipv4Addr, t_peer_ms: u64, candidate: Ipv4Addr) -> bool {
    let current = hop_address(crypto, hop_key, interval_ms, base, mask, t_peer_ms);
    if candidate == current {
        return true;
    }
    if let Some(prior_t) = t_peer_ms.checked_sub(interval_ms.max(1)) {
        let previous = hop_address(crypto, hop_key, interval_ms, base, mask, prior_t);
        if candidate == previous {
            return true;
        }
    }
    false
}

/// Exponential moving average weight applied to each round-trip refinement.
const OFFSET_EMA_ALPHA: f64 = 0.25;

/// Tracks `Δ_peer`, the millisecond offset that converts this gateway's
/// local clock into the peer's clock, i.e. `t_peer = now_local + Δ_peer`.
///
/// Stored as a fixed-point millisecond value in an `AtomicI64` so reads
/// from the hot packet-classification path never block on the peer's
/// `protoLock`.
pub struct ClockOffset {
    offset_ms: AtomicI64,
}

impl ClockOffset {
    pub fn new() -> Self {
        Self { offset_ms: AtomicI64::new(0) }
    }

    /// Set the offset outright. Used the first time it's established,
    /// during the `TIME_REQ`/`TIME_RESP` exchange.
    pub fn set(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Refine the offset from one round-trip measurement: `round_trip` is
    /// the measured request/response latency, `estimated_latency` the
    /// current one-way estimate. The correction is applied with an
    /// exponential moving average (α = 0.25) rather than taken outright,
    /// since a single round-trip is a noisy sample.
    pub fn refine(&self, round_trip_ms: i64, estimated_latency_ms: i64) {
        let correction = round_trip_ms / 2 - estimated_latency_ms;
        let prev = self.offset_ms.load(Ordering::Relaxed);
        let next = prev - (OFFSET_EMA_ALPHA * correction as f64) as i64;
        self.offset_ms.store(next, Ordering::Relaxed);
    }

    /// Translate a local timestamp into the peer's clock.
    pub fn to_peer_time(&self, now_local_ms: u64) -> u64 {
        (now_local_ms as i64 + self.get()).max(0) as u64
    }
}

impl Default for ClockOffset {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arg_crypto::FakeCrypto;

    #[test]
    fn hop_is_deterministic_for_fixed_inputs() {
        let crypto = FakeCrypto::new(1);
        let key = HopKey::new([9u8; 16]);
        let base = Ipv4Addr::new(10, 5, 0, 0);
        let mask = Ipv4Addr::new(255, 255, 0, 0);
        let a = hop_address(&crypto, &key, 1000, base, mask, 5000);
        let b = hop_address(&crypto, &key, 1000, base, mask, 5000);
        assert_eq!(a, b);
    }

    #[test]
    fn hop_stays_within_base_and_mask() {
        let crypto = FakeCrypto::new(7);
        let key = HopKey::new([3u8; 16]);
        let base = Ipv4Addr::new(172, 16, 0, 0);
        let mask = Ipv4Addr::new(255, 255, 0, 0);
        for t in (0..50_000u64).step_by(997) {
            let addr = hop_address(&crypto, &key, 1000, base, mask, t);
            let bits = u32::from_be_bytes(addr.octets());
            let mask_bits = u32::from_be_bytes(mask.octets());
            assert_eq!(bits & mask_bits, u32::from_be_bytes(base.octets()) & mask_bits);
        }
    }

    #[test]
    fn accepts_current_and_previous_interval_only() {
        let crypto = FakeCrypto::new(42);
        let key = HopKey::new([1u8; 16]);
        let base = Ipv4Addr::new(10, 0, 0, 0);
        let mask = Ipv4Addr::new(255, 255, 255, 0);
        let now = 9_500u64;
        let current = hop_address(&crypto, &key, 1000, base, mask, now);
        let previous = hop_address(&crypto, &key, 1000, base, mask, now - 1000);
        let two_back = hop_address(&crypto, &key, 1000, base, mask, now - 2000);

        assert!(accepts(&crypto, &key, 1000, base, mask, now, current));
        assert!(accepts(&crypto, &key, 1000, base, mask, now, previous));
        if two_back != current && two_back != previous {
            assert!(!accepts(&crypto, &key, 1000, base, mask, now, two_back));
        }
    }

    #[test]
    fn clock_offset_refine_moves_toward_correction() {
        let offset = ClockOffset::new();
        offset.set(0);
        offset.refine(100, 10); // correction = 50 - 10 = 40, EMA -> -10
        assert!(offset.get() < 0);
    }
}

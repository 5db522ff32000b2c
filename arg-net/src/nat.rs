//! Bidirectional NAT translation table.
//!
//! Entries are bucketed by external endpoint (`hash(extIP) xor extPort`).
//! Unlike the doubly-linked intrusive list this was ported from, a bucket
//! here just owns a `Vec<NatEntry>` — removal always happens while
//! iterating a specific bucket, so entries never need a back-pointer to it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::NatError;

/// Sweep period: how often the cleanup thread wakes up.
pub const NAT_CLEAN_TIME: Duration = Duration::from_secs(20);
/// Staleness threshold: an entry idle longer than this is removed by the
/// next sweep. Distinct from `NAT_CLEAN_TIME`, which only controls how
/// often that sweep runs.
pub const NAT_OLD_CONN_TIME: Duration = Duration::from_secs(120);

fn bucket_key(ip: Ipv4Addr, port: u16) -> i32 {
    i32::from_be_bytes(ip.octets()) ^ (port as i32)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

struct NatEntry {
    int_ip: Ipv4Addr,
    int_port: u16,
    gate_ip: Ipv4Addr,
    gate_port: u16,
    proto: u8,
    last_used: Instant,
}

struct NatBucket {
    key: i32,
    ext_ip: Ipv4Addr,
    ext_port: u16,
    entries: Vec<NatEntry>,
}

/// The full table, behind a single coarse lock per the concurrency model:
/// any lookup/insert/remove holds it for the duration of a bounded scan
/// within one bucket, never across I/O.
pub struct NatTable {
    buckets: Mutex<HashMap<i32, NatBucket>>,
}

impl NatTable {
    pub fn new() -> Self {
        Self { buckets: Mutex::new(HashMap::new()) }
    }

    /// Outbound: packet from an internal host `(src_ip, src_port)` bound
    /// for external `(dst_ip, dst_port)`. Creates the bucket/entry on
    /// first sight. Returns the `(gate_ip, gate_port)` to rewrite the
    /// source to.
    pub fn outbound_rewrite(&self, src_ip: Ipv4Addr, src_port: u16, dst_ip: Ipv4Addr, dst_port: u16, proto: u8, current_hop_addr: Ipv4Addr) -> Endpoint {
        let key = bucket_key(dst_ip, dst_port);
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key).or_insert_with(|| NatBucket { key, ext_ip: dst_ip, ext_port: dst_port, entries: Vec::new() });

        let now = Instant::now();
        if let Some(e) = bucket.entries.iter_mut().find(|e| e.proto == proto && e.int_port == src_port && e.int_ip == src_ip) {
            e.last_used = now;
            return Endpoint { addr: e.gate_ip, port: e.gate_port };
        }

        // Port preservation: the gateway's source port mirrors the
        // internal host's port. This matches the original implementation
        // exactly (its comment calls this "TBD random port") and carries
        // the same collision risk across internal hosts sharing a port;
        // randomized allocation was judged a separate improvement, not
        // something to silently add here.
        let gate_port = src_port;
        bucket.entries.push(NatEntry { int_ip: src_ip, int_port: src_port, gate_ip: current_hop_addr, gate_port, proto, last_used: now });
        Endpoint { addr: current_hop_addr, port: gate_port }
    }

    /// Inbound: packet arriving from external `(xip, xport)` addressed to
    /// this gateway's `(gate_ip, gate_port)`. Returns the internal
    /// `(int_ip, int_port)` to rewrite the destination to.
    pub fn inbound_rewrite(&self, xip: Ipv4Addr, xport: u16, gate_ip: Ipv4Addr, gate_port: u16, proto: u8) -> Result<Endpoint, NatError> {
        let key = bucket_key(xip, xport);
        let mut buckets = self.buckets.lock();
        let bucket = buckets.get_mut(&key).ok_or(NatError::BucketNotFound)?;

        let now = Instant::now();
        let entry = bucket
            .entries
            .iter_mut()
            .find(|e| e.proto == proto && e.gate_port == gate_port && e.gate_ip == gate_ip)
            .ok_or(NatError::EntryNotFound)?;
        entry.last_used = now;
        Ok(Endpoint { addr: entry.int_ip, port: entry.int_port })
    }

    /// Remove entries idle longer than [`NAT_OLD_CONN_TIME`], then drop
    /// any bucket left with zero entries. Called by the cleanup thread
    /// every [`NAT_CLEAN_TIME`].
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        buckets.retain(|_, bucket| {
            bucket.entries.retain(|e| now.duration_since(e.last_used) <= NAT_OLD_CONN_TIME);
            !bucket.entries.is_empty()
        });
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn entry_count(&self) -> usize {
        self.buckets.lock().values().map(|b| b.entries.len()).sum()
    }
}

impl Default for NatTable {
    fn default() -> Self {
        Self::new()
    }
}

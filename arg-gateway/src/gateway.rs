//! The bundle of long-lived state and background threads that make up a
//! running gateway process. Constructed once at startup from a loaded
//! [`crate::config::Config`] and held behind an `Arc` rather than as
//! module-level statics, so nothing in this crate or `arg-net` depends on
//! a singleton being initialized before use.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use arg_crypto::{Crypto, HopKey, RealCrypto};
use arg_net::engine::ProtocolEngine;
use arg_net::nat::NatTable;
use arg_net::peer::{Peer, PeerRegistry};

use crate::config::{Config, PeerKeyMaterial};
use crate::director::{Capture, Director, SelfIdentity};
use crate::logging::Logger;
use crate::{log_alert, log_debug};

pub struct Gateway<C: Capture + 'static> {
    director: Arc<Director<C>>,
    logger: Arc<Logger>,
    shutdown: Arc<AtomicBool>,
    threads: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Capture + 'static> Gateway<C> {
    /// Build the registry, NAT table, and protocol engine from a loaded
    /// config and its peer key material, then wire a director over `capture`.
    /// The caller resolves `config.our_gate_name` against `known_gates`
    /// (see [`crate::config::find_own_gate`]) before calling this, so a
    /// name mismatch between the config file and the key directory is
    /// reported as a startup error rather than silently defaulting here.
    pub fn new(config: &Config, known_gates: Vec<PeerKeyMaterial>, our_private_key: rsa::RsaPrivateKey, capture: C, logger: Arc<Logger>) -> Self {
        let crypto: Arc<dyn Crypto> = Arc::new(RealCrypto);
        let registry = Arc::new(PeerRegistry::new());
        let nat = Arc::new(NatTable::new());

        let mut self_identity = None;
        for gate in known_gates {
            if gate.name == config.our_gate_name {
                self_identity = Some(SelfIdentity {
                    base_ip: gate.base_ip,
                    mask: gate.mask,
                    hop_key: generate_self_hop_key(crypto.as_ref()),
                    hop_interval_ms: config.hop_rate_ms,
                });
                continue;
            }
            let peer = Peer::new(gate.name, gate.base_ip, gate.mask, gate.public_key, None);
            registry.add(Arc::new(peer));
        }
        let self_identity = self_identity.expect("caller validated our_gate_name against known_gates via find_own_gate");

        // Peers are built above with no private key; re-attach our own so
        // the protocol engine can sign outbound frames toward each of them.
        let registry = rebuild_registry_with_our_key(&registry, &our_private_key);

        let engine = Arc::new(ProtocolEngine::new(crypto.clone()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let director = Arc::new(Director::new(capture, nat, registry, engine, crypto, logger.clone(), self_identity, shutdown.clone()));

        Self { director, logger, shutdown, threads: std::sync::Mutex::new(Vec::new()) }
    }

    /// Spawn the internal-capture, external-capture, handshake-timer, and
    /// NAT-cleanup threads. Returns once all four are running.
    pub fn start(&self) {
        let mut threads = self.threads.lock().unwrap();

        let d = self.director.clone();
        threads.push(std::thread::spawn(move || d.run_internal_loop()));

        let d = self.director.clone();
        threads.push(std::thread::spawn(move || d.run_external_loop()));

        let d = self.director.clone();
        threads.push(std::thread::spawn(move || d.run_timer_loop()));

        let d = self.director.clone();
        threads.push(std::thread::spawn(move || d.run_nat_cleanup_loop()));

        log_alert!(self.logger, "gateway started");
    }

    /// Signal every background thread to stop and join them in the order
    /// the director, NAT table, and hopper state actually depend on each
    /// other: capture loops first (stop accepting new work), then the
    /// timer and cleanup loops, which only ever read state the capture
    /// loops would otherwise still be mutating.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                log_debug!(self.logger, "a background thread panicked during shutdown");
            }
        }
        log_alert!(self.logger, "gateway stopped");
    }
}

fn generate_self_hop_key(crypto: &dyn Crypto) -> HopKey {
    let mut bytes = [0u8; arg_crypto::HOP_KEY_SIZE];
    crypto.random(&mut bytes);
    HopKey::new(bytes)
}

/// `PeerRegistry` holds peers behind `Arc`, and `Peer`'s private key is
/// set at construction time, so re-attaching our own key to peers that
/// were built with `None` means rebuilding the registry rather than
/// mutating in place. Cheap: this runs once at startup over a handful of
/// peer entries, never on a hot path.
fn rebuild_registry_with_our_key(registry: &PeerRegistry, our_private_key: &rsa::RsaPrivateKey) -> Arc<PeerRegistry> {
    let rebuilt = PeerRegistry::new();
    for peer in registry.all() {
        let replacement = Peer::new(peer.name.clone(), peer.base_ip, peer.mask, peer.public_key.clone(), Some(our_private_key.clone()));
        rebuilt.add(Arc::new(replacement));
    }
    Arc::new(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::Level;

    struct NullCapture;
    impl Capture for NullCapture {
        fn recv_internal(&self) -> std::io::Result<Vec<u8>> {
            std::thread::sleep(std::time::Duration::from_millis(10));
            Ok(Vec::new())
        }
        fn send_internal(&self, _packet: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
        fn recv_external(&self) -> std::io::Result<Vec<u8>> {
            std::thread::sleep(std::time::Duration::from_millis(10));
            Ok(Vec::new())
        }
        fn send_external(&self, _packet: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn gateway_starts_and_shuts_down_cleanly() {
        use rsa::rand_core::OsRng;
        let private = rsa::RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = rsa::RsaPublicKey::from(&private);

        let config = Config {
            our_gate_name: "gatea".into(),
            internal_device: "tun0".into(),
            external_device: "eth0".into(),
            hop_rate_ms: 1000,
            dir: std::path::PathBuf::from("."),
        };
        let gates = vec![PeerKeyMaterial { name: "gatea".into(), base_ip: Ipv4Addr::new(192, 0, 2, 0), mask: Ipv4Addr::new(255, 255, 255, 0), public_key: public }];
        let logger = Arc::new(Logger::new(Level::Alert));
        let gateway = Gateway::new(&config, gates, private, NullCapture, logger);
        gateway.start();
        std::thread::sleep(std::time::Duration::from_millis(20));
        gateway.shutdown();
    }
}

//! Classify-and-dispatch loop: the component that actually moves packets.
//!
//! Every captured packet is routed by a single five-way classification,
//! in priority order: internal traffic bound for a connected peer's
//! range is encapsulated; internal traffic bound elsewhere is
//! NAT-translated out through this gateway's own rotating address;
//! external traffic carrying an ARG frame is authenticated and handed to
//! the protocol engine; external traffic addressed to this gateway's
//! current or previous hop address is reverse-translated back to an
//! internal host; everything else is dropped.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arg_crypto::{Crypto, HopKey};
use arg_net::engine::ProtocolEngine;
use arg_net::hopper;
use arg_net::nat::{NatTable, NAT_CLEAN_TIME};
use arg_net::packet::{build_ipv4_packet, proto, PacketView};
use arg_net::peer::PeerRegistry;
use arg_net::protocol::{FrameType, ARG_IP_PROTOCOL};
use arg_net::util::{now_ms, AtomicIntervalGate};

use crate::logging::Logger;
use crate::{log_alert, log_debug};

/// Raw packet I/O, one pair of directions for the internal (LAN-facing)
/// and external (Internet-facing) interfaces. A production binary backs
/// this with TUN/raw-socket capture; tests back it with in-memory queues.
pub trait Capture: Send + Sync {
    fn recv_internal(&self) -> std::io::Result<Vec<u8>>;
    fn send_internal(&self, packet: &[u8]) -> std::io::Result<()>;
    fn recv_external(&self) -> std::io::Result<Vec<u8>>;
    fn send_external(&self, packet: &[u8]) -> std::io::Result<()>;
}

/// This gateway's own rotating identity: the address range and hop key
/// peers and masqueraded internal traffic see it at, distinct from any
/// individual peer's session key.
pub struct SelfIdentity {
    pub base_ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub hop_key: HopKey,
    pub hop_interval_ms: u64,
}

impl SelfIdentity {
    fn current(&self, crypto: &dyn Crypto) -> Ipv4Addr {
        hopper::hop_address(crypto, &self.hop_key, self.hop_interval_ms, self.base_ip, self.mask, now_ms())
    }

    fn previous(&self, crypto: &dyn Crypto) -> Ipv4Addr {
        let t = now_ms().saturating_sub(self.hop_interval_ms.max(1));
        hopper::hop_address(crypto, &self.hop_key, self.hop_interval_ms, self.base_ip, self.mask, t)
    }
}

pub struct Director<C: Capture> {
    capture: C,
    nat: Arc<NatTable>,
    registry: Arc<PeerRegistry>,
    engine: Arc<ProtocolEngine>,
    crypto: Arc<dyn Crypto>,
    logger: Arc<Logger>,
    identity: SelfIdentity,
    shutdown: Arc<AtomicBool>,
    /// Background scan traffic on the external interface produces a
    /// steady trickle of unaddressed packets; logging every one of them
    /// would drown out signal, so this caps the "dropped, not for us"
    /// line to once per second regardless of how often it's hit.
    drop_log_gate: AtomicIntervalGate<1000>,
}

impl<C: Capture> Director<C> {
    pub fn new(
        capture: C,
        nat: Arc<NatTable>,
        registry: Arc<PeerRegistry>,
        engine: Arc<ProtocolEngine>,
        crypto: Arc<dyn Crypto>,
        logger: Arc<Logger>,
        identity: SelfIdentity,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self { capture, nat, registry, engine, crypto, logger, identity, shutdown, drop_log_gate: AtomicIntervalGate::default() }
    }

    /// Process one internal-side packet. Parse/classification failures are
    /// logged and the packet is dropped rather than propagated as an
    /// error, since one malformed packet must never stop the loop.
    pub fn handle_internal(&self, mut packet: Vec<u8>) {
        let view = match PacketView::parse(&mut packet) {
            Ok(v) => v,
            Err(e) => {
                log_debug!(self.logger, "dropping malformed internal packet: {}", e);
                return;
            }
        };
        let dest = view.dest_addr();
        drop(view);

        if let Some(peer) = self.registry.find_by_range(dest) {
            if peer.is_connected() {
                let (hop_key, hop_interval_ms) = {
                    let conn = peer.conn_params();
                    let conn = conn.as_ref().expect("connected peer always has conn params");
                    (conn.hop_key.clone(), conn.hop_interval_ms)
                };
                let peer_now = peer.clock_offset.to_peer_time(now_ms());
                let peer_hop_addr = hopper::hop_address(self.crypto.as_ref(), &hop_key, hop_interval_ms, peer.base_ip, peer.mask, peer_now);
                match self.engine.send_wrapped(&peer, &packet, peer_hop_addr) {
                    Ok(outbound) => self.transmit_control(outbound.dest, outbound.bytes),
                    Err(e) => log_debug!(self.logger, "failed to wrap outbound packet for {}: {}", peer.name, e),
                }
                return;
            }
            log_debug!(self.logger, "dropping packet for {}: handshake not yet complete", peer.name);
            return;
        }

        self.nat_translate_outbound(packet);
    }

    fn nat_translate_outbound(&self, mut packet: Vec<u8>) {
        let current_hop = self.identity.current(self.crypto.as_ref());
        let (src_ip, src_port, dst_ip, dst_port, protocol) = {
            let view = match PacketView::parse(&mut packet) {
                Ok(v) => v,
                Err(_) => return,
            };
            (view.source_addr(), view.source_port(), view.dest_addr(), view.dest_port(), view.protocol())
        };
        let rewritten = self.nat.outbound_rewrite(src_ip, src_port, dst_ip, dst_port, protocol, current_hop);

        let mut view = match PacketView::parse(&mut packet) {
            Ok(v) => v,
            Err(_) => return,
        };
        view.set_source_addr(rewritten.addr);
        view.set_source_port(rewritten.port);
        view.recompute_checksums();
        drop(view);
        if let Err(e) = self.capture.send_external(&packet) {
            log_debug!(self.logger, "failed to send NAT-translated packet: {}", e);
        }
    }

    /// Process one external-side packet.
    pub fn handle_external(&self, mut packet: Vec<u8>) {
        let (src, dest, protocol) = {
            let view = match PacketView::parse(&mut packet) {
                Ok(v) => v,
                Err(e) => {
                    log_debug!(self.logger, "dropping malformed external packet: {}", e);
                    return;
                }
            };
            (view.source_addr(), view.dest_addr(), view.protocol())
        };

        if protocol == ARG_IP_PROTOCOL {
            self.handle_arg_frame(src, &packet);
            return;
        }

        let current = self.identity.current(self.crypto.as_ref());
        let previous = self.identity.previous(self.crypto.as_ref());
        if dest == current || dest == previous {
            self.nat_translate_inbound(packet);
            return;
        }

        if self.drop_log_gate.gate(now_ms() as i64) {
            log_debug!(self.logger, "dropping external packet not addressed to us: {} -> {}", src, dest);
        }
    }

    fn handle_arg_frame(&self, src: Ipv4Addr, ip_packet: &[u8]) {
        let peer = match self.registry.find_by_range(src) {
            Some(p) => p,
            None => {
                log_debug!(self.logger, "dropping ARG frame from unrecognized source {}", src);
                return;
            }
        };
        let mut buf = ip_packet.to_vec();
        let view = match PacketView::parse(&mut buf) {
            Ok(v) => v,
            Err(_) => return,
        };
        let frame_bytes = view.payload().to_vec();
        drop(view);

        let frame = match self.engine.authenticate(&peer, &frame_bytes) {
            Ok(f) => f,
            Err(e) => {
                log_alert!(self.logger, "frame from {} failed authentication: {}", peer.name, e);
                return;
            }
        };

        if frame.frame_type == FrameType::Wrapped {
            match self.engine.receive_wrapped(&peer, frame) {
                Ok(inner) => {
                    if let Err(e) = self.capture.send_internal(&inner) {
                        log_debug!(self.logger, "failed to deliver decapsulated packet: {}", e);
                    }
                }
                Err(e) => log_debug!(self.logger, "failed to decapsulate frame from {}: {}", peer.name, e),
            }
            return;
        }

        match self.engine.receive_control(&peer, frame) {
            Ok(outbound) => {
                for frame in outbound {
                    self.transmit_control(frame.dest, frame.bytes);
                }
            }
            Err(e) => log_debug!(self.logger, "control frame from {} rejected: {}", peer.name, e),
        }
    }

    fn nat_translate_inbound(&self, mut packet: Vec<u8>) {
        let (src_ip, src_port, dst_ip, dst_port, protocol) = {
            let view = match PacketView::parse(&mut packet) {
                Ok(v) => v,
                Err(_) => return,
            };
            (view.source_addr(), view.source_port(), view.dest_addr(), view.dest_port(), view.protocol())
        };
        let restored = match self.nat.inbound_rewrite(src_ip, src_port, dst_ip, dst_port, protocol) {
            Ok(e) => e,
            Err(e) => {
                log_debug!(self.logger, "no NAT entry for inbound packet from {}: {}", src_ip, e);
                return;
            }
        };
        let mut view = match PacketView::parse(&mut packet) {
            Ok(v) => v,
            Err(_) => return,
        };
        view.set_dest_addr(restored.addr);
        view.set_dest_port(restored.port);
        view.recompute_checksums();
        drop(view);
        if let Err(e) = self.capture.send_internal(&packet) {
            log_debug!(self.logger, "failed to deliver NAT-restored packet: {}", e);
        }
    }

    /// Wrap a control/WRAPPED frame in its IP envelope and send it out the
    /// external interface, sourced from this gateway's own current address.
    fn transmit_control(&self, dest: Ipv4Addr, frame_bytes: Vec<u8>) {
        let src = self.identity.current(self.crypto.as_ref());
        let ip_packet = build_ipv4_packet(src, dest, proto::ARG, &frame_bytes);
        if let Err(e) = self.capture.send_external(&ip_packet) {
            log_debug!(self.logger, "failed to transmit frame to {}: {}", dest, e);
        }
    }

    /// One tick of the handshake timer: drive every peer's state machine
    /// forward and flush whatever frames result. Called once per second by
    /// the director's timer thread.
    pub fn tick(&self) {
        for peer in self.registry.all() {
            match self.engine.do_next_action(&peer) {
                Ok(frames) => {
                    for frame in frames {
                        self.transmit_control(frame.dest, frame.bytes);
                    }
                }
                Err(e) => log_debug!(self.logger, "handshake step for {} failed: {}", peer.name, e),
            }
        }
    }

    pub fn run_internal_loop(self: &Arc<Self>) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.capture.recv_internal() {
                Ok(packet) => self.handle_internal(packet),
                Err(e) => log_alert!(self.logger, "internal capture error: {}", e),
            }
        }
    }

    pub fn run_external_loop(self: &Arc<Self>) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.capture.recv_external() {
                Ok(packet) => self.handle_external(packet),
                Err(e) => log_alert!(self.logger, "external capture error: {}", e),
            }
        }
    }

    pub fn run_timer_loop(self: &Arc<Self>) {
        while self.sleep_or_shutdown(Duration::from_secs(1)) {
            self.tick();
        }
    }

    pub fn run_nat_cleanup_loop(self: &Arc<Self>) {
        while self.sleep_or_shutdown(NAT_CLEAN_TIME) {
            self.nat.cleanup();
        }
    }

    /// Sleep in short slices so a shutdown request is noticed within
    /// ~100ms rather than at the end of a whole sweep interval. Returns
    /// `false` if shutdown fired during the sleep, `true` if the full
    /// duration elapsed.
    fn sleep_or_shutdown(&self, total: Duration) -> bool {
        let slice = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while waited < total {
            if self.shutdown.load(Ordering::Relaxed) {
                return false;
            }
            let remaining = total - waited;
            std::thread::sleep(remaining.min(slice));
            waited += slice;
        }
        !self.shutdown.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arg_crypto::FakeCrypto;
    use arg_net::peer::{HandshakeState, Peer};
    use parking_lot::Mutex;
    use rsa::rand_core::OsRng;
    use rsa::{RsaPrivateKey, RsaPublicKey};
    use std::collections::VecDeque;

    struct QueueCapture {
        internal_out: Mutex<VecDeque<Vec<u8>>>,
        external_out: Mutex<VecDeque<Vec<u8>>>,
    }

    impl QueueCapture {
        fn new() -> Self {
            Self { internal_out: Mutex::new(VecDeque::new()), external_out: Mutex::new(VecDeque::new()) }
        }
    }

    impl Capture for QueueCapture {
        fn recv_internal(&self) -> std::io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn send_internal(&self, packet: &[u8]) -> std::io::Result<()> {
            self.internal_out.lock().push_back(packet.to_vec());
            Ok(())
        }
        fn recv_external(&self) -> std::io::Result<Vec<u8>> {
            Ok(Vec::new())
        }
        fn send_external(&self, packet: &[u8]) -> std::io::Result<()> {
            self.external_out.lock().push_back(packet.to_vec());
            Ok(())
        }
    }

    fn test_identity() -> SelfIdentity {
        SelfIdentity { base_ip: Ipv4Addr::new(192, 0, 2, 0), mask: Ipv4Addr::new(255, 255, 255, 0), hop_key: HopKey::new([1u8; 16]), hop_interval_ms: 1000 }
    }

    fn make_director() -> (Arc<Director<QueueCapture>>, Arc<PeerRegistry>, Arc<NatTable>) {
        let crypto: Arc<dyn Crypto> = Arc::new(FakeCrypto::new(1));
        let registry = Arc::new(PeerRegistry::new());
        let nat = Arc::new(NatTable::new());
        let engine = Arc::new(ProtocolEngine::new(crypto.clone()));
        let logger = Arc::new(Logger::new(crate::logging::Level::Debug));
        let director = Arc::new(Director::new(QueueCapture::new(), nat.clone(), registry.clone(), engine, crypto, logger, test_identity(), Arc::new(AtomicBool::new(false))));
        (director, registry, nat)
    }

    fn udp_packet(src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 28];
        buf[0] = 0x45;
        buf[2..4].copy_from_slice(&28u16.to_be_bytes());
        buf[8] = 64;
        buf[9] = proto::UDP;
        buf[12..16].copy_from_slice(&src.octets());
        buf[16..20].copy_from_slice(&dst.octets());
        buf[20..22].copy_from_slice(&sport.to_be_bytes());
        buf[22..24].copy_from_slice(&dport.to_be_bytes());
        buf[24..26].copy_from_slice(&8u16.to_be_bytes());
        buf
    }

    #[test]
    fn internal_packet_to_unknown_destination_is_nat_translated() {
        let (director, _registry, nat) = make_director();
        let packet = udp_packet(Ipv4Addr::new(10, 0, 0, 5), 4000, Ipv4Addr::new(8, 8, 8, 8), 53);
        director.handle_internal(packet);
        assert_eq!(nat.entry_count(), 1);
        assert_eq!(director.capture.external_out.lock().len(), 1);
    }

    #[test]
    fn internal_packet_to_connected_peer_range_is_encapsulated() {
        let (director, registry, _nat) = make_director();
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        let peer = Arc::new(Peer::new("b".into(), Ipv4Addr::new(10, 1, 0, 0), Ipv4Addr::new(255, 255, 255, 0), public, Some(private)));
        peer.proto().handshake = HandshakeState::Connected;
        peer.set_conn_params(arg_net::peer::ConnParams { sym_key: arg_crypto::SymKey::new([1u8; 32]), hop_key: HopKey::new([2u8; 16]), hop_interval_ms: 1000 });
        registry.add(peer);

        let packet = udp_packet(Ipv4Addr::new(10, 0, 0, 5), 4000, Ipv4Addr::new(10, 1, 0, 9), 80);
        director.handle_internal(packet);
        assert_eq!(director.capture.external_out.lock().len(), 1);
        let sent = director.capture.external_out.lock().pop_front().unwrap();
        assert_eq!(sent[9], proto::ARG);
    }

    #[test]
    fn external_arg_frame_from_unknown_source_is_dropped() {
        let (director, _registry, _nat) = make_director();
        let ip_packet = build_ipv4_packet(Ipv4Addr::new(172, 16, 0, 1), Ipv4Addr::new(192, 0, 2, 1), proto::ARG, b"not-a-real-frame");
        director.handle_external(ip_packet);
        assert!(director.capture.internal_out.lock().is_empty());
        assert!(director.capture.external_out.lock().is_empty());
    }

    #[test]
    fn timer_tick_drives_idle_peer_past_grace_period() {
        let (director, registry, _nat) = make_director();
        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        let peer = Arc::new(Peer::new("b".into(), Ipv4Addr::new(10, 1, 0, 0), Ipv4Addr::new(255, 255, 255, 0), public, Some(private)));
        {
            let mut proto = peer.proto();
            proto.handshake_step_at = std::time::Instant::now() - arg_net::engine::INITIAL_CONNECT_WAIT - Duration::from_millis(1);
        }
        registry.add(peer.clone());
        // registered_at still needs to have elapsed past the grace period too.
        std::thread::sleep(Duration::from_millis(1));
        director.tick();
        // Either it sent a Hello (registered_at already elapsed) or it's still waiting;
        // both are valid outcomes of a single tick depending on timing, so just assert
        // the call didn't panic and the peer is still tracked.
        assert_eq!(registry.len(), 1);
    }
}

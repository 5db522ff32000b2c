//! Packet view, hopping engine, NAT table, peer registry, and protocol
//! engine: the four subsystems that give the gateway its correctness and
//! security guarantees, plus the packet-view primitive they're all built on.

pub mod engine;
pub mod error;
pub mod hopper;
pub mod nat;
pub mod packet;
pub mod peer;
pub mod protocol;
pub mod util;

pub use engine::{OutboundFrame, ProtocolEngine};
pub use error::{NatError, PacketError, ProtocolError};
pub use nat::NatTable;
pub use packet::{build_ipv4_packet, PacketView};
pub use peer::{Peer, PeerRegistry};

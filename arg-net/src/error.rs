//! Per-subsystem error taxonomy.
//!
//! Each subsystem boundary gets its own enum rather than one crate-wide
//! error type, so callers can match on exactly the failures relevant to
//! them and `?` doesn't blur "fatal at startup" together with "drop this
//! packet and continue".

use std::fmt;

/// Failures while parsing or mutating an IPv4 packet view.
#[derive(Debug, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer too short to contain a complete IPv4 header.
    Truncated,
    /// IP version nibble was not 4.
    NotIpv4,
    /// IP header declares a length past the end of the buffer.
    BadHeaderLength,
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::Truncated => write!(f, "packet too short"),
            PacketError::NotIpv4 => write!(f, "not an IPv4 packet"),
            PacketError::BadHeaderLength => write!(f, "IP header length exceeds buffer"),
        }
    }
}

impl std::error::Error for PacketError {}

/// Failures while parsing or authenticating a wire frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame shorter than the fixed header.
    Truncated,
    /// `version` field was not the supported value.
    UnsupportedVersion,
    /// `len` field disagreed with the buffer actually received.
    LengthMismatch,
    /// RSA-PKCS1v1.5 signature failed to verify.
    BadSignature,
    /// `seq` was not newer than the peer's last accepted sequence number
    /// (outside the wrap-tolerance window).
    SequenceReplay,
    /// A message type arrived that the current handshake state doesn't expect.
    UnexpectedType,
    /// A handshake correlator (`myID`/`theirID`) didn't match.
    IdMismatch,
    /// Traffic for a peer that is not in the `Connected` state.
    NotConnected,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Truncated => write!(f, "frame too short"),
            ProtocolError::UnsupportedVersion => write!(f, "unsupported frame version"),
            ProtocolError::LengthMismatch => write!(f, "frame length field mismatch"),
            ProtocolError::BadSignature => write!(f, "frame signature verification failed"),
            ProtocolError::SequenceReplay => write!(f, "sequence number replay"),
            ProtocolError::UnexpectedType => write!(f, "unexpected frame type for current state"),
            ProtocolError::IdMismatch => write!(f, "handshake correlator mismatch"),
            ProtocolError::NotConnected => write!(f, "peer is not connected"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Failures from the NAT translation table.
#[derive(Debug, PartialEq, Eq)]
pub enum NatError {
    /// No bucket exists for the external endpoint on an inbound lookup.
    BucketNotFound,
    /// A bucket exists but no entry inside it matches.
    EntryNotFound,
}

impl fmt::Display for NatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatError::BucketNotFound => write!(f, "no NAT bucket for external endpoint"),
            NatError::EntryNotFound => write!(f, "no matching NAT entry in bucket"),
        }
    }
}

impl std::error::Error for NatError {}

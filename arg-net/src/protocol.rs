//! Wire frame format: `version | type | len(2B) | seq(4B) | sig(128B) | payload`.

use arg_crypto::RSA_SIG_SIZE;

use crate::error::ProtocolError;

pub const FRAME_VERSION: u8 = 1;

/// Size of the fixed portion of a frame, before any payload.
pub const FRAME_HEADER_SIZE: usize = 1 + 1 + 2 + 4 + RSA_SIG_SIZE;

/// IP protocol number assigned to ARG frames.
pub const ARG_IP_PROTOCOL: u8 = 253;

/// Legacy admin UDP port, reserved for debug tooling; production traffic
/// goes over IP protocol 253 directly, never this port.
pub const ADMIN_UDP_PORT: u16 = 7654;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Wrapped = 0,
    Hello = 1,
    Welcome = 2,
    Verified = 3,
    Ping = 4,
    Pong = 5,
    ConnData = 6,
    TimeReq = 7,
    TimeResp = 8,
}

impl FrameType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => FrameType::Wrapped,
            1 => FrameType::Hello,
            2 => FrameType::Welcome,
            3 => FrameType::Verified,
            4 => FrameType::Ping,
            5 => FrameType::Pong,
            6 => FrameType::ConnData,
            7 => FrameType::TimeReq,
            8 => FrameType::TimeResp,
            _ => return None,
        })
    }
}

/// A decoded wire frame. `sig` is verified by the caller, not by `decode`
/// itself, since verification needs the sender's public key and `decode`
/// only has bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub seq: u32,
    pub sig: [u8; RSA_SIG_SIZE],
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build the bytes that get signed: the whole frame with the `sig`
    /// field zeroed, matching the original construction exactly so
    /// signatures made by either side verify identically.
    fn signing_bytes(frame_type: FrameType, seq: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.push(FRAME_VERSION);
        buf.push(frame_type as u8);
        let len = (FRAME_HEADER_SIZE + payload.len()) as u16;
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&seq.to_be_bytes());
        buf.extend_from_slice(&[0u8; RSA_SIG_SIZE]);
        buf.extend_from_slice(payload);
        buf
    }

    /// Encode a frame given a precomputed signature over
    /// [`Frame::signing_bytes`].
    pub fn encode(frame_type: FrameType, seq: u32, sig: [u8; RSA_SIG_SIZE], payload: &[u8]) -> Vec<u8> {
        let mut buf = Self::signing_bytes(frame_type, seq, payload);
        let sig_start = 1 + 1 + 2 + 4;
        buf[sig_start..sig_start + RSA_SIG_SIZE].copy_from_slice(&sig);
        buf
    }

    /// Bytes that must be passed to `sign`/`verify`: the frame with `sig`
    /// zeroed.
    pub fn bytes_to_sign(frame_type: FrameType, seq: u32, payload: &[u8]) -> Vec<u8> {
        Self::signing_bytes(frame_type, seq, payload)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Truncated);
        }
        if buf[0] != FRAME_VERSION {
            return Err(ProtocolError::UnsupportedVersion);
        }
        let frame_type = FrameType::from_u8(buf[1]).ok_or(ProtocolError::UnexpectedType)?;
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if len != buf.len() {
            return Err(ProtocolError::LengthMismatch);
        }
        let seq = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let mut sig = [0u8; RSA_SIG_SIZE];
        sig.copy_from_slice(&buf[8..8 + RSA_SIG_SIZE]);
        let payload = buf[FRAME_HEADER_SIZE..].to_vec();
        Ok(Frame { frame_type, seq, sig, payload })
    }

    /// The bytes that should have been signed, reconstructed from a
    /// decoded frame (sig zeroed again) so the caller can pass them to
    /// `verify`.
    pub fn signed_bytes(&self) -> Vec<u8> {
        Self::signing_bytes(self.frame_type, self.seq, &self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_round_trips() {
        let sig = [0x42u8; RSA_SIG_SIZE];
        let payload = b"hello peer".to_vec();
        let bytes = Frame::encode(FrameType::Hello, 7, sig, &payload);
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Hello);
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.sig, sig);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let sig = [0u8; RSA_SIG_SIZE];
        let mut bytes = Frame::encode(FrameType::Ping, 1, sig, &[]);
        bytes.push(0xff); // trailing garbage byte the len field won't account for
        assert_eq!(Frame::decode(&bytes), Err(ProtocolError::LengthMismatch));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bytes = vec![FRAME_VERSION, 1, 0, 5];
        assert_eq!(Frame::decode(&bytes), Err(ProtocolError::Truncated));
    }

    #[test]
    fn signed_bytes_has_sig_zeroed() {
        let sig = [0x99u8; RSA_SIG_SIZE];
        let bytes = Frame::encode(FrameType::Pong, 3, sig, b"x");
        let decoded = Frame::decode(&bytes).unwrap();
        let signed = decoded.signed_bytes();
        let sig_start = 1 + 1 + 2 + 4;
        assert!(signed[sig_start..sig_start + RSA_SIG_SIZE].iter().all(|b| *b == 0));
    }
}

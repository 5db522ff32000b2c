//! Cryptographic capability set used by the gateway's protocol engine and
//! hopping function.
//!
//! Every primitive the protocol needs — sign, verify, symmetric
//! encrypt/decrypt, HMAC, and secure random — is expressed as a single
//! trait, [`Crypto`], rather than called directly from call sites. This
//! lets tests substitute [`FakeCrypto`], a deterministic stand-in, without
//! touching the protocol engine's logic.

use std::fmt;

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size in bytes of an RSA signature at the 1024-bit key size this protocol
/// was designed around. Also the modulus size, since PKCS#1 v1.5 signatures
/// are exactly one modulus wide.
pub const RSA_SIG_SIZE: usize = 128;

/// Size in bytes of an AES-256 key.
pub const AES_KEY_SIZE: usize = 32;

/// AES block size, and therefore the CTR nonce/counter width.
pub const AES_BLOCK_SIZE: usize = 16;

/// Size in bytes of a hop key, the HMAC key used by the hopping function.
pub const HOP_KEY_SIZE: usize = 16;

/// Width of an HMAC-SHA256 digest.
pub const HMAC_SIZE: usize = 32;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// A symmetric key that zeroes its backing memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret<const N: usize>(pub [u8; N]);

impl<const N: usize> Secret<N> {
    pub fn new(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> fmt::Debug for Secret<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret<{}>(...)", N)
    }
}

pub type SymKey = Secret<AES_KEY_SIZE>;
pub type HopKey = Secret<HOP_KEY_SIZE>;

#[derive(Debug)]
pub enum CryptoError {
    /// Signature did not verify against the supplied public key.
    BadSignature,
    /// A key was malformed (wrong length, non-invertible RSA parameters, etc).
    BadKey,
    /// Ciphertext/plaintext length did not match the expected block geometry.
    BadLength,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::BadSignature => write!(f, "signature verification failed"),
            CryptoError::BadKey => write!(f, "malformed key material"),
            CryptoError::BadLength => write!(f, "ciphertext/plaintext length mismatch"),
        }
    }
}

impl std::error::Error for CryptoError {}

/// The capability set a peer's protocol state needs from the outside world.
///
/// Implementations must be `Send + Sync` since peers are shared across the
/// capture, director, and cleanup threads.
pub trait Crypto: Send + Sync {
    /// Sign `data` with `private_key`, returning an `RSA_SIG_SIZE`-byte signature.
    fn sign(&self, private_key: &RsaPrivateKey, data: &[u8]) -> Result<[u8; RSA_SIG_SIZE], CryptoError>;

    /// Verify `sig` over `data` against `public_key`.
    fn verify(&self, public_key: &RsaPublicKey, data: &[u8], sig: &[u8; RSA_SIG_SIZE]) -> Result<(), CryptoError>;

    /// AES-256-CTR encrypt `plaintext` in place under `key`, using a nonce
    /// derived from `seq` (high 96 bits zero, low 32 bits `seq`, big-endian).
    fn encrypt(&self, key: &SymKey, seq: u32, plaintext: &mut [u8]);

    /// AES-256-CTR decrypt `ciphertext` in place under `key` with the same
    /// seq-derived nonce construction as [`Crypto::encrypt`]. CTR mode is an
    /// involution, so this and `encrypt` share an implementation, but the
    /// method is kept distinct so call sites read as intent rather than as
    /// a cipher implementation detail.
    fn decrypt(&self, key: &SymKey, seq: u32, ciphertext: &mut [u8]);

    /// HMAC-SHA256 over `data` under `key`.
    fn hmac(&self, key: &HopKey, data: &[u8]) -> [u8; HMAC_SIZE];

    /// Fill `buf` with cryptographically secure random bytes.
    fn random(&self, buf: &mut [u8]);

    /// Convenience wrapper returning a random `u32`, used for handshake
    /// correlators (`myID`, ping IDs).
    fn random_u32(&self) -> u32 {
        let mut buf = [0u8; 4];
        self.random(&mut buf);
        u32::from_be_bytes(buf)
    }
}

fn ctr_nonce(seq: u32) -> [u8; AES_BLOCK_SIZE] {
    let mut nonce = [0u8; AES_BLOCK_SIZE];
    nonce[AES_BLOCK_SIZE - 4..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

/// The production implementation, backed by the `rsa`, `aes`, `ctr`,
/// `hmac`, and `sha2` crates with randomness drawn from the OS CSPRNG.
#[derive(Default)]
pub struct RealCrypto;

impl Crypto for RealCrypto {
    fn sign(&self, private_key: &RsaPrivateKey, data: &[u8]) -> Result<[u8; RSA_SIG_SIZE], CryptoError> {
        let signing_key = SigningKey::<Sha256>::new(private_key.clone());
        let sig = signing_key.try_sign_with_rng(&mut OsRng, data).map_err(|_| CryptoError::BadKey)?;
        let bytes = sig.to_bytes();
        if bytes.len() != RSA_SIG_SIZE {
            return Err(CryptoError::BadLength);
        }
        let mut out = [0u8; RSA_SIG_SIZE];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    fn verify(&self, public_key: &RsaPublicKey, data: &[u8], sig: &[u8; RSA_SIG_SIZE]) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
        let signature = Signature::try_from(sig.as_slice()).map_err(|_| CryptoError::BadSignature)?;
        verifying_key.verify(data, &signature).map_err(|_| CryptoError::BadSignature)
    }

    fn encrypt(&self, key: &SymKey, seq: u32, plaintext: &mut [u8]) {
        let nonce = ctr_nonce(seq);
        let mut cipher = Aes256Ctr::new(key.as_bytes().into(), &nonce.into());
        cipher.apply_keystream(plaintext);
    }

    fn decrypt(&self, key: &SymKey, seq: u32, ciphertext: &mut [u8]) {
        // AES-CTR is its own inverse: keystream XOR is symmetric.
        self.encrypt(key, seq, ciphertext);
    }

    fn hmac(&self, key: &HopKey, data: &[u8]) -> [u8; HMAC_SIZE] {
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key length");
        mac.update(data);
        let result = mac.finalize().into_bytes();
        let mut out = [0u8; HMAC_SIZE];
        out.copy_from_slice(&result);
        out
    }

    fn random(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }
}

/// A deterministic stand-in for [`RealCrypto`], used by protocol-engine and
/// director tests that would otherwise need real RSA key material. Every
/// "signature" is a keyed checksum the fake itself can verify; every
/// "encryption" is a reversible, clearly-not-secure XOR keystream. Never
/// compiled into a release binary.
#[cfg(any(test, feature = "fake"))]
pub struct FakeCrypto {
    /// Seed mixed into the deterministic RNG and checksum so that two
    /// `FakeCrypto` instances with different seeds disagree, emulating
    /// mismatched keys without needing real RSA key generation in tests.
    pub seed: u64,
}

#[cfg(any(test, feature = "fake"))]
impl FakeCrypto {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn checksum(&self, data: &[u8]) -> [u8; RSA_SIG_SIZE] {
        let mut state = self.seed;
        let mut out = [0u8; RSA_SIG_SIZE];
        for (i, b) in data.iter().enumerate() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(*b as u64).wrapping_add(i as u64);
            out[i % RSA_SIG_SIZE] ^= (state >> 33) as u8;
        }
        out
    }
}

#[cfg(any(test, feature = "fake"))]
impl Crypto for FakeCrypto {
    fn sign(&self, _private_key: &RsaPrivateKey, data: &[u8]) -> Result<[u8; RSA_SIG_SIZE], CryptoError> {
        Ok(self.checksum(data))
    }

    fn verify(&self, _public_key: &RsaPublicKey, data: &[u8], sig: &[u8; RSA_SIG_SIZE]) -> Result<(), CryptoError> {
        if self.checksum(data) == *sig {
            Ok(())
        } else {
            Err(CryptoError::BadSignature)
        }
    }

    fn encrypt(&self, key: &SymKey, seq: u32, plaintext: &mut [u8]) {
        let mut state = self.seed ^ (seq as u64);
        for (i, b) in key.as_bytes().iter().enumerate() {
            state = state.wrapping_add((*b as u64) << (i % 8));
        }
        for byte in plaintext.iter_mut() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            *byte ^= (state >> 24) as u8;
        }
    }

    fn decrypt(&self, key: &SymKey, seq: u32, ciphertext: &mut [u8]) {
        self.encrypt(key, seq, ciphertext);
    }

    fn hmac(&self, key: &HopKey, data: &[u8]) -> [u8; HMAC_SIZE] {
        let mut state = self.seed;
        for b in key.as_bytes() {
            state = state.wrapping_mul(1099511628211).wrapping_add(*b as u64);
        }
        for b in data {
            state = state.wrapping_mul(1099511628211).wrapping_add(*b as u64);
        }
        let mut out = [0u8; HMAC_SIZE];
        for (i, chunk) in out.chunks_mut(8).enumerate() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(i as u64 + 1);
            chunk.copy_from_slice(&state.to_be_bytes());
        }
        out
    }

    fn random(&self, buf: &mut [u8]) {
        let mut state = self.seed ^ 0x9e3779b97f4a7c15;
        for byte in buf.iter_mut() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            *byte = (state >> 33) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctr_encrypt_decrypt_round_trips() {
        let crypto = RealCrypto;
        let key = SymKey::new([7u8; AES_KEY_SIZE]);
        let mut data = b"the quick brown fox jumps".to_vec();
        let original = data.clone();
        crypto.encrypt(&key, 42, &mut data);
        assert_ne!(data, original);
        crypto.decrypt(&key, 42, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn different_seq_gives_different_ciphertext() {
        let crypto = RealCrypto;
        let key = SymKey::new([3u8; AES_KEY_SIZE]);
        let mut a = b"identical-plaintext-block".to_vec();
        let mut b = a.clone();
        crypto.encrypt(&key, 1, &mut a);
        crypto.encrypt(&key, 2, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn rsa_sign_then_verify_succeeds_and_mutation_fails() {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, RSA_SIG_SIZE * 8).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        let crypto = RealCrypto;
        let data = b"frame-bytes-with-sig-field-zeroed";
        let sig = crypto.sign(&private_key, data).unwrap();
        crypto.verify(&public_key, data, &sig).unwrap();

        let mut mutated = *data;
        mutated[0] ^= 0xff;
        assert!(crypto.verify(&public_key, &mutated, &sig).is_err());
    }

    #[test]
    fn fake_crypto_sign_verify_round_trips() {
        let fake = FakeCrypto::new(1234);
        let private_key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public_key = RsaPublicKey::from(&private_key);
        let data = b"hello";
        let sig = fake.sign(&private_key, data).unwrap();
        fake.verify(&public_key, data, &sig).unwrap();

        let other = FakeCrypto::new(9999);
        assert!(other.verify(&public_key, data, &sig).is_err());
    }

    #[test]
    fn hmac_is_deterministic() {
        let crypto = RealCrypto;
        let key = HopKey::new([1u8; HOP_KEY_SIZE]);
        let a = crypto.hmac(&key, &8u64.to_be_bytes());
        let b = crypto.hmac(&key, &8u64.to_be_bytes());
        assert_eq!(a, b);
        let c = crypto.hmac(&key, &9u64.to_be_bytes());
        assert_ne!(a, c);
    }
}

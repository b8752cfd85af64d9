//! Key exchange and per-direction stream encryption
//!
//! X25519 produces the shared secret; each side signs its public key with
//! HMAC-SHA256 under the session handshake key so the peer can reject a
//! substituted key. HKDF-SHA256 expands the secret into two independent
//! keystreams (one per direction). A keystream is AES-128 in counter mode,
//! addressed by byte position, and re-keyed every `EPOCH_BYTES` so no
//! single key covers an unbounded amount of data.

use aes_gcm::aes::cipher::{BlockEncrypt, KeyInit};
use aes_gcm::aes::{Aes128, Block};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use super::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// AES block size
pub const BLOCK_SIZE: u64 = 16;

/// Bytes covered by one key epoch (1 MiB)
pub const EPOCH_BYTES: u64 = 1 << 20;

/// Keystream direction index for data we send
pub const DIRECTION_LOCAL: u8 = 2;

/// Keystream direction index for data we receive
pub const DIRECTION_REMOTE: u8 = 3;

/// Index of the pre-key stream used to obfuscate the launch spec
pub const LAUNCH_SPEC_INDEX: u8 = 1;

const SECRET_SIZE: usize = 32;

/// ECDH key pair for one handshake attempt
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Signature over our public key, sent alongside it
    pub fn signature(&self, handshake_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        sign_public_key(handshake_key, &self.public_key_bytes())
    }
}

/// HMAC-SHA256(handshake_key, public_key)
pub fn sign_public_key(handshake_key: &[u8], public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(handshake_key).map_err(|_| CryptoError::InvalidKey)?;
    mac.update(public_key);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Shared secret derived by the key exchange
#[derive(Clone)]
pub struct SharedSecret([u8; SECRET_SIZE]);

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; SECRET_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Verify the peer's signature and derive the shared secret.
///
/// The signature is checked (in constant time) before any Diffie-Hellman
/// work happens, so a substituted key never produces a secret.
pub fn derive_secret(
    local: &KeyPair,
    peer_public_key: &[u8],
    peer_signature: &[u8],
    handshake_key: &[u8],
) -> Result<SharedSecret, CryptoError> {
    let peer_public: [u8; 32] = peer_public_key
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;

    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(handshake_key).map_err(|_| CryptoError::InvalidKey)?;
    mac.update(&peer_public);
    mac.verify_slice(peer_signature)
        .map_err(|_| CryptoError::SignatureMismatch)?;

    let shared = local.secret.diffie_hellman(&PublicKey::from(peer_public));
    if !shared.was_contributory() {
        return Err(CryptoError::NonContributory);
    }
    Ok(SharedSecret(shared.to_bytes()))
}

/// Build the keystream for one direction
pub fn new_keystream(
    secret: &SharedSecret,
    handshake_key: &[u8],
    direction_index: u8,
) -> Result<Keystream, CryptoError> {
    Keystream::new(secret.as_bytes(), handshake_key, direction_index)
}

/// Position-addressed AES-128-CTR keystream with per-epoch key rotation
pub struct Keystream {
    index: u8,
    hkdf: Hkdf<Sha256>,
    iv: u128,
    /// Cipher for the most recently used epoch
    current: Mutex<(u64, Aes128)>,
}

impl Keystream {
    pub fn new(ikm: &[u8], salt: &[u8], index: u8) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);

        let mut iv = [0u8; 16];
        hkdf.expand(&[b"iv".as_slice(), &[index]].concat(), &mut iv)
            .map_err(|_| CryptoError::KeyDerivation)?;

        let first = epoch_cipher(&hkdf, index, 0)?;
        Ok(Self {
            index,
            hkdf,
            iv: u128::from_be_bytes(iv),
            current: Mutex::new((0, first)),
        })
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    fn block(&self, block_index: u64) -> Result<[u8; 16], CryptoError> {
        let epoch = block_index * BLOCK_SIZE / EPOCH_BYTES;
        let mut current = self.current.lock();
        if current.0 != epoch {
            *current = (epoch, epoch_cipher(&self.hkdf, self.index, epoch)?);
        }
        let counter = self.iv.wrapping_add(u128::from(block_index));
        let mut block = Block::from(counter.to_be_bytes());
        current.1.encrypt_block(&mut block);
        Ok(block.into())
    }

    /// XOR `buf` with the keystream starting at byte `key_pos`
    pub fn apply(&self, key_pos: u64, buf: &mut [u8]) -> Result<(), CryptoError> {
        let mut pos = key_pos;
        let mut done = 0;
        while done < buf.len() {
            let block = self.block(pos / BLOCK_SIZE)?;
            let offset = (pos % BLOCK_SIZE) as usize;
            let n = (16 - offset).min(buf.len() - done);
            for (b, k) in buf[done..done + n].iter_mut().zip(&block[offset..offset + n]) {
                *b ^= k;
            }
            done += n;
            pos += n as u64;
        }
        Ok(())
    }

    pub fn encrypt(&self, key_pos: u64, buf: &mut [u8]) -> Result<(), CryptoError> {
        self.apply(key_pos, buf)
    }

    pub fn decrypt(&self, key_pos: u64, buf: &mut [u8]) -> Result<(), CryptoError> {
        self.apply(key_pos, buf)
    }
}

fn epoch_cipher(hkdf: &Hkdf<Sha256>, index: u8, epoch: u64) -> Result<Aes128, CryptoError> {
    let mut key = [0u8; 16];
    let info = [b"key".as_slice(), &[index], &epoch.to_be_bytes()].concat();
    hkdf.expand(&info, &mut key)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Aes128::new_from_slice(&key).map_err(|_| CryptoError::KeyDerivation)
}

/// Both directional keystreams of an established session
pub struct StreamKeys {
    pub local: Keystream,
    pub remote: Keystream,
}

impl StreamKeys {
    pub fn new(secret: &SharedSecret, handshake_key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            local: new_keystream(secret, handshake_key, DIRECTION_LOCAL)?,
            remote: new_keystream(secret, handshake_key, DIRECTION_REMOTE)?,
        })
    }
}

/// Keystream hiding the launch spec before any secret is shared
pub fn launch_spec_keystream(morning: &[u8], session_id: &str) -> Result<Keystream, CryptoError> {
    Keystream::new(morning, session_id.as_bytes(), LAUNCH_SPEC_INDEX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HANDSHAKE_KEY: [u8; 16] = [0x11; 16];

    #[test]
    fn test_key_exchange() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let alice_sig = alice.signature(&HANDSHAKE_KEY).unwrap();
        let bob_sig = bob.signature(&HANDSHAKE_KEY).unwrap();

        let a = derive_secret(&alice, &bob.public_key_bytes(), &bob_sig, &HANDSHAKE_KEY).unwrap();
        let b =
            derive_secret(&bob, &alice.public_key_bytes(), &alice_sig, &HANDSHAKE_KEY).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_signature_mismatch_fails_closed() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut sig = bob.signature(&HANDSHAKE_KEY).unwrap();
        sig[0] ^= 1;

        let result = derive_secret(&alice, &bob.public_key_bytes(), &sig, &HANDSHAKE_KEY);
        assert_eq!(result.unwrap_err(), CryptoError::SignatureMismatch);
    }

    #[test]
    fn test_signature_under_wrong_key_rejected() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let sig = bob.signature(&[0x22; 16]).unwrap();
        let result = derive_secret(&alice, &bob.public_key_bytes(), &sig, &HANDSHAKE_KEY);
        assert_eq!(result.unwrap_err(), CryptoError::SignatureMismatch);
    }

    #[test]
    fn test_low_order_point_rejected() {
        let alice = KeyPair::generate();
        let zero = [0u8; 32];
        let sig = sign_public_key(&HANDSHAKE_KEY, &zero).unwrap();
        let result = derive_secret(&alice, &zero, &sig, &HANDSHAKE_KEY);
        assert_eq!(result.unwrap_err(), CryptoError::NonContributory);
    }

    #[test]
    fn test_bad_public_key_length() {
        let alice = KeyPair::generate();
        let result = derive_secret(&alice, &[1, 2, 3], &[0; 32], &HANDSHAKE_KEY);
        assert_eq!(result.unwrap_err(), CryptoError::InvalidPublicKey);
    }

    #[test]
    fn test_directions_are_independent() {
        let secret = SharedSecret([0x42; 32]);
        let keys = StreamKeys::new(&secret, &HANDSHAKE_KEY).unwrap();

        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        keys.local.apply(0, &mut a).unwrap();
        keys.remote.apply(0, &mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_position_addressing() {
        let ks = Keystream::new(&[0x42; 32], &HANDSHAKE_KEY, DIRECTION_REMOTE).unwrap();

        let mut whole = [0u8; 64];
        ks.apply(100, &mut whole).unwrap();

        // Decrypting a slice at its own offset yields the same stream bytes
        let mut part = [0u8; 20];
        ks.apply(100 + 30, &mut part).unwrap();
        assert_eq!(&part[..], &whole[30..50]);
    }

    #[test]
    fn test_roundtrip_across_epoch_boundary() {
        let ks = Keystream::new(&[0x42; 32], &HANDSHAKE_KEY, DIRECTION_LOCAL).unwrap();
        let plaintext: Vec<u8> = (0..64u8).collect();
        let start = EPOCH_BYTES - 24;

        let mut buf = plaintext.clone();
        ks.encrypt(start, &mut buf).unwrap();
        assert_ne!(buf, plaintext);
        ks.decrypt(start, &mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn test_epochs_use_different_keys() {
        let ks = Keystream::new(&[0x42; 32], &HANDSHAKE_KEY, DIRECTION_LOCAL).unwrap();
        // Same counter offset inside two epochs must not repeat the stream
        let mut first = [0u8; 16];
        let mut second = [0u8; 16];
        ks.apply(0, &mut first).unwrap();
        ks.apply(EPOCH_BYTES, &mut second).unwrap();
        assert_ne!(first, second);
    }
}

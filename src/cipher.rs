//! Payload cipher key lifecycle and the optional data-packet encryption.
//!
//! Each authenticated connection holds *two* (key, IV) pairs addressed by a single-bit index
//!  (even/odd). A rotation replaces the inactive pair and flips the index, so packets encrypted
//!  with the previous pair remain decryptable while the rotation push is in flight. The whole
//!  set is replaced wholesale via [crate::atomic_swap::AtomicValue], never mutated field by
//!  field.
//!
//! `UpdateCipherKeys` payload:
//! ```ascii
//! 0: active cipher index (u8, 0 or 1)
//! 1: even key length (u32 BE) + even key
//! *: even IV length (u32 BE) + even IV
//! *: odd key length (u32 BE) + odd key
//! *: odd IV length (u32 BE) + odd IV
//! ```
//!
//! Encryption itself is AES-256-GCM. Per packet, a 12-byte nonce is built from the first four
//!  bytes of the pair's IV plus an incrementing u64 counter and sent in clear ahead of the
//!  ciphertext; the GCM tag makes tampering detectable.

use std::sync::atomic::{AtomicU64, Ordering};

use aead::{Aead, KeyInit, Nonce};
use anyhow::{anyhow, bail};
use aes_gcm::Aes256Gcm;
use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
const NONCE_LEN: usize = 12;

#[derive(Clone, PartialEq, Eq)]
pub struct CipherKeyPair {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl CipherKeyPair {
    fn generate() -> CipherKeyPair {
        let mut key = vec![0u8; KEY_LEN];
        let mut iv = vec![0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        rand::thread_rng().fill_bytes(&mut iv);
        CipherKeyPair { key, iv }
    }
}

impl std::fmt::Debug for CipherKeyPair {
    // key material stays out of logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CipherKeyPair[{} key bytes]", self.key.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherKeySet {
    pub cipher_index: u8,
    pub even: CipherKeyPair,
    pub odd: CipherKeyPair,
}

impl CipherKeySet {
    /// The first rotation on a connection creates both pairs and starts on the even index.
    pub fn initial() -> CipherKeySet {
        CipherKeySet {
            cipher_index: 0,
            even: CipherKeyPair::generate(),
            odd: CipherKeyPair::generate(),
        }
    }

    /// Every later rotation replaces the inactive pair and flips the index.
    pub fn rotated(&self) -> CipherKeySet {
        if self.cipher_index == 0 {
            CipherKeySet {
                cipher_index: 1,
                even: self.even.clone(),
                odd: CipherKeyPair::generate(),
            }
        }
        else {
            CipherKeySet {
                cipher_index: 0,
                even: CipherKeyPair::generate(),
                odd: self.odd.clone(),
            }
        }
    }

    pub fn active_pair(&self) -> &CipherKeyPair {
        self.pair(self.cipher_index == 1)
    }

    /// Selects a pair by the data-packet `CipherIndex` flag.
    pub fn pair(&self, odd: bool) -> &CipherKeyPair {
        if odd { &self.odd } else { &self.even }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.cipher_index);
        for bytes in [&self.even.key, &self.even.iv, &self.odd.key, &self.odd.iv] {
            buf.put_u32(bytes.len() as u32);
            buf.put_slice(bytes);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<CipherKeySet> {
        let cipher_index = buf.try_get_u8()?;
        if cipher_index > 1 {
            bail!("cipher index out of range: {}", cipher_index);
        }

        let mut parts = Vec::with_capacity(4);
        for _ in 0..4 {
            let len = buf.try_get_u32()? as usize;
            if buf.remaining() < len {
                bail!("cipher key payload truncated");
            }
            let mut bytes = vec![0u8; len];
            buf.copy_to_slice(&mut bytes);
            parts.push(bytes);
        }
        let [even_key, even_iv, odd_key, odd_iv]: [Vec<u8>; 4] = parts.try_into()
            .map_err(|_| anyhow!("cipher key payload invalid"))?;

        for (key, iv) in [(&even_key, &even_iv), (&odd_key, &odd_iv)] {
            if key.len() != KEY_LEN {
                bail!("cipher key must be {} bytes, got {}", KEY_LEN, key.len());
            }
            if iv.len() != IV_LEN {
                bail!("cipher IV must be {} bytes, got {}", IV_LEN, iv.len());
            }
        }

        Ok(CipherKeySet {
            cipher_index,
            even: CipherKeyPair { key: even_key, iv: even_iv },
            odd: CipherKeyPair { key: odd_key, iv: odd_iv },
        })
    }
}

/// One per connection: encrypts/decrypts data-packet payloads with whatever pair is handed in,
///  keeping the monotonic nonce counter.
pub struct PayloadCipher {
    nonce_counter: AtomicU64,
}

impl Default for PayloadCipher {
    fn default() -> Self {
        PayloadCipher::new()
    }
}

impl PayloadCipher {
    pub fn new() -> PayloadCipher {
        PayloadCipher {
            nonce_counter: AtomicU64::new(0),
        }
    }

    pub fn encrypt(&self, pair: &CipherKeyPair, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&pair.key)
            .map_err(|e| anyhow!("invalid cipher key: {}", e))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes[..4].copy_from_slice(&pair.iv[..4]);
        nonce_bytes[4..].copy_from_slice(&self.nonce_counter.fetch_add(1, Ordering::AcqRel).to_be_bytes());
        let nonce = Nonce::<Aes256Gcm>::from_slice(&nonce_bytes);

        let ciphertext = cipher.encrypt(nonce, plaintext)
            .map_err(|e| anyhow!("payload encryption failed: {}", e))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, pair: &CipherKeyPair, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        if payload.len() < NONCE_LEN {
            bail!("encrypted payload shorter than the nonce");
        }
        let (nonce_bytes, ciphertext) = payload.split_at(NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(&pair.key)
            .map_err(|e| anyhow!("invalid cipher key: {}", e))?;
        cipher.decrypt(Nonce::<Aes256Gcm>::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| anyhow!("payload decryption failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_initial_starts_even() {
        let set = CipherKeySet::initial();
        assert_eq!(set.cipher_index, 0);
        assert_eq!(set.active_pair(), &set.even);
        assert_ne!(set.even, set.odd);
    }

    #[test]
    fn test_rotation_flips_index_and_keeps_active_pair() {
        let initial = CipherKeySet::initial();

        let rotated = initial.rotated();
        assert_eq!(rotated.cipher_index, 1);
        // the previously active pair survives so in-flight packets stay decryptable
        assert_eq!(rotated.even, initial.even);
        assert_ne!(rotated.odd, initial.odd);
        assert_eq!(rotated.active_pair(), &rotated.odd);

        let rotated_again = rotated.rotated();
        assert_eq!(rotated_again.cipher_index, 0);
        assert_eq!(rotated_again.odd, rotated.odd);
        assert_ne!(rotated_again.even, rotated.even);
    }

    #[test]
    fn test_ser_deser_round_trip() {
        let original = CipherKeySet::initial().rotated();

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), 1 + 4 * 4 + 2 * KEY_LEN + 2 * IV_LEN);

        let mut b: &[u8] = &buf;
        let deser = CipherKeySet::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[rstest]
    #[case::bad_index(|buf: &mut BytesMut| { buf[0] = 2; })]
    #[case::truncated(|buf: &mut BytesMut| { let l = buf.len(); buf.truncate(l - 1); })]
    fn test_deser_rejects(#[case] corrupt: fn(&mut BytesMut)) {
        let mut buf = BytesMut::new();
        CipherKeySet::initial().ser(&mut buf);
        corrupt(&mut buf);
        let mut b: &[u8] = &buf;
        assert!(CipherKeySet::deser(&mut b).is_err());
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let set = CipherKeySet::initial();
        let cipher = PayloadCipher::new();

        let plaintext = b"\x02\x00\x00\x00\x01data packet bytes";
        let encrypted = cipher.encrypt(set.active_pair(), plaintext).unwrap();
        assert_ne!(&encrypted[NONCE_LEN..], plaintext.as_slice());

        let decrypted = cipher.decrypt(set.active_pair(), &encrypted).unwrap();
        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_with_wrong_pair_fails() {
        let set = CipherKeySet::initial();
        let cipher = PayloadCipher::new();

        let encrypted = cipher.encrypt(&set.even, b"payload").unwrap();
        assert!(cipher.decrypt(&set.odd, &encrypted).is_err());
    }

    #[test]
    fn test_nonces_are_unique() {
        let set = CipherKeySet::initial();
        let cipher = PayloadCipher::new();

        let a = cipher.encrypt(set.active_pair(), b"x").unwrap();
        let b = cipher.encrypt(set.active_pair(), b"x").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }
}

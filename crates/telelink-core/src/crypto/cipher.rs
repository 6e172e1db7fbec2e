//! CryptoBox and the block cipher seam.

use blowfish::Blowfish;
use cbc::cipher::{
    block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::frame::{BLOCK_SIZE, IV_LEN};

/// Number of random bytes prepended to every non-empty plaintext.
pub const FILLER_LEN: usize = 8;

/// Errors from the payload cipher.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("cipher rejected a key of {0} bytes")]
    InvalidKeyLength(usize),
    #[error("initialisation vector must be {IV_LEN} bytes")]
    InvalidIv,
    #[error("ciphertext length {0} is not a multiple of {BLOCK_SIZE}")]
    MisalignedCiphertext(usize),
    #[error("decrypted payload is shorter than the {FILLER_LEN}-byte filler")]
    MissingFiller,
    /// Zero padding makes trailing NUL bytes indistinguishable from padding.
    #[error("plaintext must not end in a NUL byte")]
    TrailingNul,
}

/// Block-aligned CBC transform.  Implementations never pad; callers hand in
/// whole blocks.
pub trait PayloadCipher: Send + Sync {
    /// Encrypts `data`, which is a multiple of [`BLOCK_SIZE`] bytes.
    fn encrypt_blocks(&self, key: &[u8], iv: &[u8; IV_LEN], data: &[u8])
        -> Result<Vec<u8>, CryptoError>;

    /// Decrypts `data`, which is a multiple of [`BLOCK_SIZE`] bytes.
    fn decrypt_blocks(&self, key: &[u8], iv: &[u8; IV_LEN], data: &[u8])
        -> Result<Vec<u8>, CryptoError>;
}

// ── XTEA ──────────────────────────────────────────────────────────────────────

const XTEA_KEY_LEN: usize = 16;
const XTEA_DELTA: u32 = 0x9E37_79B9;
const XTEA_CYCLES: u32 = 32;

/// XTEA-CBC with a 16-byte key, 32 cycles and big-endian words.  This is
/// the cipher telemetry servers speak.
#[derive(Debug, Default, Clone, Copy)]
pub struct XteaCbc;

impl XteaCbc {
    fn schedule(key: &[u8]) -> Result<[u32; 4], CryptoError> {
        if key.len() != XTEA_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        let mut words = [0u32; 4];
        for (word, chunk) in words.iter_mut().zip(key.chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Ok(words)
    }

    fn encrypt_block(k: &[u32; 4], block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let (mut v0, mut v1) = split_block(block);
        let mut sum = 0u32;
        for _ in 0..XTEA_CYCLES {
            v0 = v0.wrapping_add(
                (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1)) ^ sum.wrapping_add(k[(sum & 3) as usize]),
            );
            sum = sum.wrapping_add(XTEA_DELTA);
            v1 = v1.wrapping_add(
                (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                    ^ sum.wrapping_add(k[((sum >> 11) & 3) as usize]),
            );
        }
        join_block(v0, v1)
    }

    fn decrypt_block(k: &[u32; 4], block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let (mut v0, mut v1) = split_block(block);
        let mut sum = XTEA_DELTA.wrapping_mul(XTEA_CYCLES);
        for _ in 0..XTEA_CYCLES {
            v1 = v1.wrapping_sub(
                (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                    ^ sum.wrapping_add(k[((sum >> 11) & 3) as usize]),
            );
            sum = sum.wrapping_sub(XTEA_DELTA);
            v0 = v0.wrapping_sub(
                (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1)) ^ sum.wrapping_add(k[(sum & 3) as usize]),
            );
        }
        join_block(v0, v1)
    }
}

fn split_block(block: [u8; BLOCK_SIZE]) -> (u32, u32) {
    (
        u32::from_be_bytes([block[0], block[1], block[2], block[3]]),
        u32::from_be_bytes([block[4], block[5], block[6], block[7]]),
    )
}

fn join_block(v0: u32, v1: u32) -> [u8; BLOCK_SIZE] {
    let mut out = [0u8; BLOCK_SIZE];
    out[..4].copy_from_slice(&v0.to_be_bytes());
    out[4..].copy_from_slice(&v1.to_be_bytes());
    out
}

fn xor_block(a: &mut [u8; BLOCK_SIZE], b: &[u8]) {
    for (x, y) in a.iter_mut().zip(b) {
        *x ^= y;
    }
}

impl PayloadCipher for XteaCbc {
    fn encrypt_blocks(
        &self,
        key: &[u8],
        iv: &[u8; IV_LEN],
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::MisalignedCiphertext(data.len()));
        }
        let k = Self::schedule(key)?;
        let mut chain = *iv;
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks_exact(BLOCK_SIZE) {
            xor_block(&mut chain, chunk);
            chain = Self::encrypt_block(&k, chain);
            out.extend_from_slice(&chain);
        }
        Ok(out)
    }

    fn decrypt_blocks(
        &self,
        key: &[u8],
        iv: &[u8; IV_LEN],
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::MisalignedCiphertext(data.len()));
        }
        let k = Self::schedule(key)?;
        let mut chain = *iv;
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks_exact(BLOCK_SIZE) {
            let mut block = [0u8; BLOCK_SIZE];
            block.copy_from_slice(chunk);
            let mut plain = Self::decrypt_block(&k, block);
            xor_block(&mut plain, &chain);
            out.extend_from_slice(&plain);
            chain = block;
        }
        Ok(out)
    }
}

// ── Blowfish ──────────────────────────────────────────────────────────────────

/// Blowfish-CBC over the RustCrypto block cipher.  Accepts keys of 4 to 56
/// bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlowfishCbc;

impl BlowfishCbc {
    fn cipher(key: &[u8]) -> Result<Blowfish, CryptoError> {
        Blowfish::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))
    }
}

impl PayloadCipher for BlowfishCbc {
    fn encrypt_blocks(
        &self,
        key: &[u8],
        iv: &[u8; IV_LEN],
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::MisalignedCiphertext(data.len()));
        }
        let encryptor = cbc::Encryptor::<Blowfish>::inner_iv_slice_init(Self::cipher(key)?, iv)
            .map_err(|_| CryptoError::InvalidIv)?;
        Ok(encryptor.encrypt_padded_vec_mut::<NoPadding>(data))
    }

    fn decrypt_blocks(
        &self,
        key: &[u8],
        iv: &[u8; IV_LEN],
        data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::MisalignedCiphertext(data.len()));
        }
        let decryptor = cbc::Decryptor::<Blowfish>::inner_iv_slice_init(Self::cipher(key)?, iv)
            .map_err(|_| CryptoError::InvalidIv)?;
        decryptor
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .map_err(|_| CryptoError::MisalignedCiphertext(data.len()))
    }
}

/// Block cipher selected per connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherKind {
    #[default]
    Xtea,
    Blowfish,
}

/// IV and ciphertext produced by [`CryptoBox::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

/// Seals and opens frame payloads.
///
/// Non-empty plaintext is prefixed with [`FILLER_LEN`] random bytes and
/// zero-padded to a whole block before encryption.  Empty plaintext stays
/// empty so KEEPALIVE and ACK frames carry no payload.
///
/// The padding is not length-prefixed, so `decrypt` drops trailing zero
/// bytes.  `encrypt` therefore rejects plaintext ending in NUL, and every
/// plaintext it accepts decrypts back unchanged.
pub struct CryptoBox {
    cipher: Box<dyn PayloadCipher>,
}

impl CryptoBox {
    /// CryptoBox over [`XteaCbc`].
    pub fn new() -> Self {
        Self::with_cipher(XteaCbc)
    }

    pub fn for_kind(kind: CipherKind) -> Self {
        match kind {
            CipherKind::Xtea => Self::with_cipher(XteaCbc),
            CipherKind::Blowfish => Self::with_cipher(BlowfishCbc),
        }
    }

    pub fn with_cipher(cipher: impl PayloadCipher + 'static) -> Self {
        Self {
            cipher: Box::new(cipher),
        }
    }

    /// Encrypts `plaintext` under a freshly drawn random IV.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the cipher rejects `key`
    /// and [`CryptoError::TrailingNul`] if `plaintext` ends in a zero byte.
    pub fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Sealed, CryptoError> {
        if plaintext.last() == Some(&0) {
            return Err(CryptoError::TrailingNul);
        }

        let mut rng = rand::thread_rng();
        let mut iv = [0u8; IV_LEN];
        rng.fill_bytes(&mut iv);

        if plaintext.is_empty() {
            return Ok(Sealed {
                iv,
                ciphertext: Vec::new(),
            });
        }

        let unpadded = FILLER_LEN + plaintext.len();
        let padded = unpadded.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        let mut buf = vec![0u8; padded];
        rng.fill_bytes(&mut buf[..FILLER_LEN]);
        buf[FILLER_LEN..unpadded].copy_from_slice(plaintext);

        let ciphertext = self.cipher.encrypt_blocks(key, &iv, &buf)?;
        Ok(Sealed { iv, ciphertext })
    }

    /// Decrypts `ciphertext`, stripping the filler prefix and zero padding.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] for a rejected key, misaligned ciphertext, or
    /// a payload too short to hold the filler.
    pub fn decrypt(
        &self,
        key: &[u8],
        iv: &[u8; IV_LEN],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }

        let mut plain = self.cipher.decrypt_blocks(key, iv, ciphertext)?;
        if plain.len() < FILLER_LEN {
            return Err(CryptoError::MissingFiller);
        }
        let end = plain.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        plain.truncate(end.max(FILLER_LEN));
        Ok(plain.split_off(FILLER_LEN))
    }
}

impl Default for CryptoBox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8; 16] = b"0123456789abcdef";

    #[test]
    fn test_encrypt_then_decrypt_recovers_plaintext() {
        // Arrange
        let crypto = CryptoBox::new();
        let plaintext = br#"{"power":1250.5,"energy":null}"#;

        // Act
        let sealed = crypto.encrypt(KEY, plaintext).unwrap();
        let opened = crypto.decrypt(KEY, &sealed.iv, &sealed.ciphertext).unwrap();

        // Assert
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_encrypt_recovers_every_length_across_block_boundaries() {
        let crypto = CryptoBox::new();
        for len in 1..=33 {
            let plaintext: Vec<u8> = (0..len).map(|i| b'a' + (i % 26) as u8).collect();
            let sealed = crypto.encrypt(KEY, &plaintext).unwrap();
            assert_eq!(sealed.ciphertext.len() % BLOCK_SIZE, 0);
            assert!(sealed.ciphertext.len() >= FILLER_LEN + len);
            assert_eq!(
                crypto.decrypt(KEY, &sealed.iv, &sealed.ciphertext).unwrap(),
                plaintext
            );
        }
    }

    #[test]
    fn test_empty_plaintext_has_empty_ciphertext() {
        let crypto = CryptoBox::new();
        let sealed = crypto.encrypt(KEY, b"").unwrap();
        assert!(sealed.ciphertext.is_empty());
        assert!(crypto.decrypt(KEY, &sealed.iv, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_repeated_encrypt_draws_fresh_iv() {
        let crypto = CryptoBox::new();
        let a = crypto.encrypt(KEY, b"same text").unwrap();
        let b = crypto.encrypt(KEY, b"same text").unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_decrypt_with_wrong_key_does_not_recover_plaintext() {
        let crypto = CryptoBox::new();
        let sealed = crypto.encrypt(KEY, b"secret setup text").unwrap();
        let opened = crypto
            .decrypt(b"fedcba9876543210", &sealed.iv, &sealed.ciphertext)
            .unwrap_or_default();
        assert_ne!(opened, b"secret setup text");
    }

    #[test]
    fn test_decrypt_rejects_misaligned_ciphertext() {
        let crypto = CryptoBox::new();
        assert_eq!(
            crypto.decrypt(KEY, &[0; IV_LEN], &[1, 2, 3]),
            Err(CryptoError::MisalignedCiphertext(3))
        );
    }

    #[test]
    fn test_encrypt_rejects_trailing_nul() {
        let crypto = CryptoBox::new();
        assert_eq!(crypto.encrypt(KEY, b"ab\0"), Err(CryptoError::TrailingNul));
    }

    #[test]
    fn test_interior_nul_survives_roundtrip() {
        let crypto = CryptoBox::new();
        let sealed = crypto.encrypt(KEY, b"a\0b").unwrap();
        assert_eq!(
            crypto.decrypt(KEY, &sealed.iv, &sealed.ciphertext).unwrap(),
            b"a\0b"
        );
    }

    #[test]
    fn test_xtea_matches_published_block_vectors() {
        let key: Vec<u8> = (0u8..16).collect();
        let k = XteaCbc::schedule(&key).unwrap();

        assert_eq!(
            XteaCbc::encrypt_block(&k, *b"ABCDEFGH"),
            [0x49, 0x7d, 0xf3, 0xd0, 0x72, 0x61, 0x2c, 0xb5]
        );
        assert_eq!(
            XteaCbc::encrypt_block(&k, *b"AAAAAAAA"),
            [0xe7, 0x8f, 0x2d, 0x13, 0x74, 0x43, 0x41, 0xd8]
        );
        let zero = XteaCbc::schedule(&[0; 16]).unwrap();
        assert_eq!(
            XteaCbc::encrypt_block(&zero, [0; 8]),
            [0xde, 0xe9, 0xd4, 0xd8, 0xf7, 0x13, 0x1e, 0xd9]
        );
    }

    #[test]
    fn test_xtea_cbc_chains_blocks() {
        // Arrange
        let key: Vec<u8> = (0u8..16).collect();
        let expected = [
            0x6b, 0x98, 0x2b, 0xec, 0x15, 0xa7, 0xb5, 0x58, 0x5e, 0x23, 0x2a, 0x84, 0x55, 0x43,
            0x45, 0xe6,
        ];

        // Act
        let ciphertext = XteaCbc
            .encrypt_blocks(&key, b"abcdefgh", b"ABCDEFGHIJKLMNOP")
            .unwrap();
        let plaintext = XteaCbc.decrypt_blocks(&key, b"abcdefgh", &ciphertext).unwrap();

        // Assert
        assert_eq!(ciphertext, expected);
        assert_eq!(plaintext, b"ABCDEFGHIJKLMNOP");
    }

    #[test]
    fn test_xtea_rejects_wrong_key_length() {
        let crypto = CryptoBox::new();
        assert_eq!(
            crypto.encrypt(b"abc", b"x"),
            Err(CryptoError::InvalidKeyLength(3))
        );
    }

    #[test]
    fn test_blowfish_box_roundtrip() {
        let crypto = CryptoBox::for_kind(CipherKind::Blowfish);
        let sealed = crypto.encrypt(KEY, br#"{"mode":2}"#).unwrap();
        assert_eq!(
            crypto.decrypt(KEY, &sealed.iv, &sealed.ciphertext).unwrap(),
            br#"{"mode":2}"#
        );
    }

    #[test]
    fn test_blowfish_rejects_short_key() {
        let crypto = CryptoBox::for_kind(CipherKind::Blowfish);
        assert_eq!(
            crypto.encrypt(b"abc", b"x"),
            Err(CryptoError::InvalidKeyLength(3))
        );
    }

    #[test]
    fn test_cipher_kind_deserializes_lowercase() {
        let kind: CipherKind = serde_json::from_str(r#""blowfish""#).unwrap();
        assert_eq!(kind, CipherKind::Blowfish);
        assert_eq!(CipherKind::default(), CipherKind::Xtea);
    }
}

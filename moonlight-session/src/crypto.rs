//! AES-128-CBC and AES-128-GCM wrappers for the input-send pipeline, grounded
//! in `PlatformCrypto.c` and `InputStream.c`'s `encryptData`.
//!
//! Pre-Gen-7 hosts use a persistent CBC context whose IV chains across
//! packets; Gen-7+ hosts use GCM with a fresh random IV per packet and a
//! 16-byte tag prefixed to the ciphertext. Both take a 16-byte key shared
//! out-of-band with the host (see `config::StreamConfig`).

use aes::Aes128;
use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::{Aead, KeyInit as AeadKeyInit};
use aes_gcm::{AesGcm, Nonce as GcmNonce};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes128Gcm16 = AesGcm<Aes128, U16>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("ciphertext is too short or not a valid block multiple")]
    InvalidLength,
    #[error("gcm authentication failed")]
    AuthenticationFailed,
}

/// A persistent AES-128-CBC encryption context. The IV advances in place after
/// every call to `encrypt`, matching the single cipher-context-per-session
/// behaviour the original keeps as a file-static.
pub struct CbcContext {
    key: [u8; 16],
    iv: [u8; 16],
}

impl CbcContext {
    pub fn new(key: [u8; 16], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// PKCS7-pads `plaintext` to a 16-byte multiple and encrypts it with the
    /// current IV. If `chain_iv` is set (Gen >= 5), the IV used for the next
    /// call becomes the last 16 bytes of this call's ciphertext.
    pub fn encrypt(&mut self, plaintext: &[u8], chain_iv: bool) -> Vec<u8> {
        let encryptor = Aes128CbcEnc::new((&self.key).into(), (&self.iv).into());
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        if chain_iv && ciphertext.len() >= 16 {
            self.iv.copy_from_slice(&ciphertext[ciphertext.len() - 16..]);
        }

        ciphertext
    }

    /// Decrypts a full PKCS7-padded ciphertext with the current IV, without
    /// advancing it (used only by tests to check round-trips).
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let decryptor = Aes128CbcDec::new((&self.key).into(), (&self.iv).into());
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::InvalidLength)
    }

    pub fn iv(&self) -> [u8; 16] {
        self.iv
    }
}

/// AES-128-GCM with a fresh random 16-byte IV per packet, emitting
/// `tag(16) || ciphertext` per the wire framing in `InputStream.c`.
pub struct GcmContext {
    key: [u8; 16],
}

impl GcmContext {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// Encrypts with a freshly generated IV, returning `(iv, tag_then_ciphertext)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<([u8; 16], Vec<u8>), CryptoError> {
        let mut iv = [0u8; 16];
        openssl::rand::rand_bytes(&mut iv).map_err(|_| CryptoError::AuthenticationFailed)?;
        let out = self.encrypt_with_iv(&iv, plaintext)?;
        Ok((iv, out))
    }

    /// Encrypts with a caller-supplied IV (used when the wire protocol
    /// replaces the IV with the trailing bytes of the previous ciphertext).
    pub fn encrypt_with_iv(&self, iv: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = Aes128Gcm16::new((&self.key).into());
        let nonce = GcmNonce::from_slice(iv);
        let mut sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        // `aead::Aead::encrypt` appends the tag; the wire format wants it first.
        let tag_start = sealed.len() - 16;
        let tag: Vec<u8> = sealed.split_off(tag_start);
        let mut framed = tag;
        framed.extend_from_slice(&sealed);
        Ok(framed)
    }

    pub fn decrypt(&self, iv: &[u8; 16], tag_then_ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if tag_then_ciphertext.len() < 16 {
            return Err(CryptoError::InvalidLength);
        }
        let (tag, ciphertext) = tag_then_ciphertext.split_at(16);
        let mut sealed = ciphertext.to_vec();
        sealed.extend_from_slice(tag);

        let cipher = Aes128Gcm16::new((&self.key).into());
        let nonce = GcmNonce::from_slice(iv);
        cipher
            .decrypt(nonce, sealed.as_slice())
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

/// PKCS#7-padded length of a buffer of `len` bytes, for callers that need to
/// precompute the framed wire size before encrypting.
pub fn pkcs7_padded_len(len: usize) -> usize {
    let remainder = len % 16;
    if remainder == 0 {
        len + 16
    } else {
        len + (16 - remainder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbc_roundtrip_without_chaining() {
        let key = [1u8; 16];
        let iv = [2u8; 16];
        let mut ctx = CbcContext::new(key, iv);
        let plaintext = b"hello moonlight!";
        let ciphertext = ctx.encrypt(plaintext, false);
        assert_eq!(ciphertext.len() % 16, 0);

        let decryptor = CbcContext::new(key, iv);
        let decrypted = decryptor.decrypt(&ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn cbc_chains_iv_across_packets() {
        let key = [3u8; 16];
        let iv = [4u8; 16];
        let mut ctx = CbcContext::new(key, iv);

        let c1 = ctx.encrypt(b"A", true);
        let expected_next_iv: [u8; 16] = c1[c1.len() - 16..].try_into().unwrap();
        assert_eq!(ctx.iv(), expected_next_iv);

        let c2 = ctx.encrypt(b"B", true);
        // Decrypting packet 2 standalone must use the chained IV, not the original.
        let chained_decryptor = CbcContext::new(key, expected_next_iv);
        let decrypted = chained_decryptor.decrypt(&c2).unwrap();
        assert_eq!(decrypted, b"B");
    }

    #[test]
    fn gcm_roundtrip_with_prefixed_tag() {
        let key = [5u8; 16];
        let ctx = GcmContext::new(key);
        let plaintext = b"controller state";
        let (iv, framed) = ctx.encrypt(plaintext).unwrap();
        assert!(framed.len() >= 16);

        let decrypted = ctx.decrypt(&iv, &framed).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn gcm_ciphertext_never_shorter_than_tag_plus_one() {
        let ctx = GcmContext::new([6u8; 16]);
        let (_, framed) = ctx.encrypt(b"x").unwrap();
        assert!(framed.len() >= 17);
    }
}

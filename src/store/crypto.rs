//! Cache payload encryption
//!
//! This module provides:
//! - AES-256-CBC encryption of image payloads, each prefixed by its IV
//! - The machine-derived key: SHA-256 of `machine|user|salt`
//! - Package key derivation: SHA-256 hex of `path|size|ticks`
//!
//! The key binds the cache file to the machine and user that wrote it; a
//! copied cache file decrypts to garbage elsewhere and is simply rebuilt.

use crate::archive::Fingerprint;
use crate::error::{CoreError, CoreResult};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Salt mixed into the machine key derivation.
const KEY_SALT: &str = "VPM_ImageCache_v1";

/// Length of the IV prefix on every payload.
const IV_LEN: usize = 16;

/// Derive the package key for an archive identity.
pub fn package_key(path: &str, fingerprint: Fingerprint) -> String {
    let digest = Sha256::digest(
        format!("{}|{}|{}", path, fingerprint.size, fingerprint.ticks).as_bytes(),
    );
    hex::encode(digest)
}

/// AES-256-CBC cipher bound to this machine and user
pub struct PayloadCipher {
    key: [u8; 32],
}

impl PayloadCipher {
    /// Derive the cipher from the local machine and user names.
    pub fn from_machine_identity() -> Self {
        let machine =
            sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown-user".to_string());
        Self::derive(&machine, &user)
    }

    /// Derive the cipher from explicit identity parts.
    pub fn derive(machine: &str, user: &str) -> Self {
        let digest = Sha256::digest(format!("{machine}|{user}|{KEY_SALT}").as_bytes());
        Self { key: digest.into() }
    }

    /// Encrypt a payload; the result is `IV(16) || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypt an `IV || ciphertext` payload.
    pub fn decrypt(&self, payload: &[u8]) -> CoreResult<Vec<u8>> {
        if payload.len() < IV_LEN {
            return Err(CoreError::Corrupt("payload shorter than IV".to_string()));
        }
        let (iv, ciphertext) = payload.split_at(IV_LEN);
        let iv: [u8; IV_LEN] = iv.try_into().expect("split length");
        Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CoreError::Corrupt("payload decryption failed".to_string()))
    }
}

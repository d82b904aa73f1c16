use std::fmt;

use aes_gcm::{
    Aes256Gcm, Key as AesKey, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};

use crate::{
    cipher::kdf::Key,
    types::{ENCRYPTION_OVERHEAD, NONCE_SIZE, PageId, error::DatabaseError},
};

/// Seals and opens page images with one derived key.
///
/// Image layout: `nonce(12) || ciphertext || tag(16)`. The nonce is eight
/// random bytes followed by the low 32 bits of the page id, and the full page
/// id is authenticated as associated data, so an image copied to another page
/// slot fails to open.
#[derive(Clone)]
pub struct PageCodec {
    cipher: Aes256Gcm,
}

impl PageCodec {
    pub fn new(key: &Key) -> Self {
        Self {
            cipher: Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key.as_bytes())),
        }
    }

    /// Size of the image produced for a plaintext of `plaintext_len` bytes.
    pub fn sealed_len(plaintext_len: usize) -> usize {
        plaintext_len + ENCRYPTION_OVERHEAD
    }

    pub fn encrypt_page(&self, page_id: PageId, plaintext: &[u8]) -> Result<Vec<u8>, DatabaseError> {
        let nonce = page_nonce(page_id);
        let aad = page_id.to_le_bytes();
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| DatabaseError::SerializationError {
                details: format!("failed to encrypt page {}", page_id),
            })?;

        let mut image = Vec::with_capacity(Self::sealed_len(plaintext.len()));
        image.extend_from_slice(&nonce);
        image.extend_from_slice(&sealed);
        Ok(image)
    }

    pub fn decrypt_page(&self, page_id: PageId, image: &[u8]) -> Result<Vec<u8>, DatabaseError> {
        if image.len() < ENCRYPTION_OVERHEAD {
            return Err(DatabaseError::AuthenticationFailure { page_id });
        }
        let (nonce, sealed) = image.split_at(NONCE_SIZE);
        if nonce[8..] != (page_id as u32).to_le_bytes() {
            return Err(DatabaseError::AuthenticationFailure { page_id });
        }
        let aad = page_id.to_le_bytes();
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| DatabaseError::AuthenticationFailure { page_id })
    }
}

impl fmt::Debug for PageCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PageCodec(AES-256-GCM)")
    }
}

pub fn encrypt_page(key: &Key, page_id: PageId, plaintext: &[u8]) -> Result<Vec<u8>, DatabaseError> {
    PageCodec::new(key).encrypt_page(page_id, plaintext)
}

pub fn decrypt_page(key: &Key, page_id: PageId, image: &[u8]) -> Result<Vec<u8>, DatabaseError> {
    PageCodec::new(key).decrypt_page(page_id, image)
}

fn page_nonce(page_id: PageId) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce[..8]);
    nonce[8..].copy_from_slice(&(page_id as u32).to_le_bytes());
    nonce
}

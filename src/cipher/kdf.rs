use std::fmt;

use rand::{RngCore, rngs::OsRng};
use sha2::Sha512;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{KEY_SIZE, MIN_KDF_ITERATIONS, SALT_SIZE, error::DatabaseError};

/// Derived page key. Wiped from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(<redacted>)")
    }
}

pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a page key from a passphrase and the salt stored in the file header.
pub fn derive_key(
    passphrase: &[u8],
    salt: &[u8; SALT_SIZE],
    iterations: u32,
) -> Result<Key, DatabaseError> {
    if iterations < MIN_KDF_ITERATIONS {
        return Err(DatabaseError::InvalidConfig {
            reason: format!(
                "key derivation needs at least {} iterations, got {}",
                MIN_KDF_ITERATIONS, iterations
            ),
        });
    }
    let mut key = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha512>(passphrase, salt, iterations, &mut key);
    let derived = Key(key);
    key.zeroize();
    Ok(derived)
}

//! Page encryption.
//!
//! Keys come from a passphrase through PBKDF2-HMAC-SHA512; each page is sealed
//! independently with AES-256-GCM so any page can be decrypted on its own.

pub mod codec;
pub mod kdf;

pub use codec::{PageCodec, decrypt_page, encrypt_page};
pub use kdf::{Key, derive_key, generate_salt};

/// Identifier of the page cipher recorded in the file header.
pub const CIPHER_AES_256_GCM: u8 = 1;

/// Identifier of the key derivation function recorded in the file header.
pub const KDF_PBKDF2_HMAC_SHA512: u8 = 1;

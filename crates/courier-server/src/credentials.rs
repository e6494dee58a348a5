//! Password verification material.
//!
//! The dispatcher only talks to the [`CredentialVerifier`] trait, so the
//! hashing scheme can be swapped without touching the protocol code.

use rand::RngCore;
use subtle::ConstantTimeEq;

/// BLAKE3 key-derivation context for password digests.
const KDF_CONTEXT_PASSWORD: &str = "courier-password-v1";

/// Random salt length in bytes.
const SALT_SIZE: usize = 16;

pub trait CredentialVerifier: Send + Sync {
    /// Produce storable verification material for `password`.
    fn hash(&self, password: &str) -> String;

    /// Check `password` against material previously returned by [`hash`].
    ///
    /// [`hash`]: CredentialVerifier::hash
    fn verify(&self, password: &str, stored: &str) -> bool;
}

/// Salted BLAKE3 derive-key digests, stored as `salt_hex$digest_hex`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Credentials;

impl Blake3Credentials {
    fn digest(salt: &[u8], password: &str) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_PASSWORD);
        hasher.update(salt);
        hasher.update(password.as_bytes());
        *hasher.finalize().as_bytes()
    }
}

impl CredentialVerifier for Blake3Credentials {
    fn hash(&self, password: &str) -> String {
        let mut salt = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let digest = Self::digest(&salt, password);
        format!("{}${}", hex::encode(salt), hex::encode(digest))
    }

    fn verify(&self, password: &str, stored: &str) -> bool {
        let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
            return false;
        };
        let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(digest_hex)) else {
            return false;
        };

        let actual = Self::digest(&salt, password);
        expected.len() == actual.len() && actual[..].ct_eq(&expected[..]).unwrap_u8() == 1
    }
}

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pbkdf2::pbkdf2_hmac_array;
use sha2::Sha256;

use crate::error::VaultError;

/// Size of the key-derivation salt stored next to the ciphertext.
pub const SALT_SIZE: usize = 16;
/// AES-GCM nonce size.
const NONCE_SIZE: usize = 12;
/// PBKDF2-HMAC-SHA256 iteration count, shared by manual and auto-derived keys.
pub const PBKDF2_ITERATIONS: u32 = 100_000;
/// Derived key size (AES-256).
pub const KEY_SIZE: usize = 32;
/// On-disk container version tag. Bump when the layout changes.
const MAGIC: &[u8; 4] = b"TLV1";

/// Derive a 256-bit key from a password using PBKDF2-HMAC-SHA256.
/// Deterministic: the same (password, salt) pair always yields the same key.
pub fn derive_key(password: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    pbkdf2_hmac_array::<Sha256, KEY_SIZE>(password.as_bytes(), salt, PBKDF2_ITERATIONS)
}

pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Encrypt `plaintext` into the versioned container:
/// base64( MAGIC ‖ nonce ‖ AES-256-GCM ciphertext ).
/// The salt is not part of the container; it lives in the vault's `salt` file.
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<String, VaultError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::Manager(format!("cipher init: {:?}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| VaultError::Manager(format!("encryption failed: {:?}", e)))?;

    let mut container = Vec::with_capacity(MAGIC.len() + NONCE_SIZE + ciphertext.len());
    container.extend_from_slice(MAGIC);
    container.extend_from_slice(&nonce_bytes);
    container.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(container))
}

/// Decrypt a container produced by [`encrypt`]. A wrong key or tampered
/// ciphertext fails the GCM tag check and is reported as a security error.
pub fn decrypt(key: &[u8; KEY_SIZE], container: &str) -> Result<Vec<u8>, VaultError> {
    let data = BASE64
        .decode(container.trim())
        .map_err(|e| VaultError::Security(format!("invalid container encoding: {}", e)))?;

    if data.len() < MAGIC.len() + NONCE_SIZE + 16 {
        return Err(VaultError::Security("container too short".into()));
    }
    if &data[..MAGIC.len()] != MAGIC {
        return Err(VaultError::Security("unknown container version".into()));
    }

    let nonce = Nonce::from_slice(&data[MAGIC.len()..MAGIC.len() + NONCE_SIZE]);
    let ciphertext = &data[MAGIC.len() + NONCE_SIZE..];

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| VaultError::Manager(format!("cipher init: {:?}", e)))?;
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| VaultError::Security("decryption failed: wrong key or corrupted data".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_key_is_deterministic() {
        let salt = [7u8; SALT_SIZE];
        assert_eq!(derive_key("secret", &salt), derive_key("secret", &salt));
    }

    #[test]
    fn derive_key_varies_with_salt_and_password() {
        let salt_a = [0u8; SALT_SIZE];
        let mut salt_b = [0u8; SALT_SIZE];
        salt_b[0] = 1;
        assert_ne!(derive_key("secret", &salt_a), derive_key("secret", &salt_b));
        assert_ne!(derive_key("secret", &salt_a), derive_key("other", &salt_a));
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = derive_key("pw", &random_salt());
        let container = encrypt(&key, b"credentials payload").unwrap();
        let plain = decrypt(&key, &container).unwrap();
        assert_eq!(plain, b"credentials payload");
    }

    #[test]
    fn wrong_key_is_rejected() {
        let salt = random_salt();
        let container = encrypt(&derive_key("pw", &salt), b"x").unwrap();
        let result = decrypt(&derive_key("other", &salt), &container);
        assert!(matches!(result, Err(VaultError::Security(_))));
    }

    #[test]
    fn tampered_container_is_rejected() {
        let key = derive_key("pw", &random_salt());
        let container = encrypt(&key, b"payload").unwrap();
        let mut raw = BASE64.decode(&container).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(matches!(decrypt(&key, &tampered), Err(VaultError::Security(_))));
    }

    #[test]
    fn same_plaintext_encrypts_differently() {
        let key = derive_key("pw", &random_salt());
        let a = encrypt(&key, b"payload").unwrap();
        let b = encrypt(&key, b"payload").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn unversioned_container_is_rejected() {
        let key = derive_key("pw", &random_salt());
        let bogus = BASE64.encode([0u8; 64]);
        assert!(matches!(decrypt(&key, &bogus), Err(VaultError::Security(_))));
    }
}

// Login credential derivation — challenge-salted password hash and PBKDF2 derived key.

use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Hash sent in place of the plain password:
/// hex-encoded SHA-256 of `challenge ":" password`.
pub fn hash_password(challenge: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(challenge.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Secondary credential the device requires alongside the session id:
/// PBKDF2-HMAC-SHA1 over the hex SHA-256 of the password, salted with the
/// first 16 characters of the challenge, 1000 rounds, 16 bytes out.
pub fn derive_key(challenge: &str, password: &str) -> String {
    let password_hex = hex::encode(Sha256::digest(password.as_bytes()));
    let salt: String = challenge.chars().take(16).collect();
    let mut derived = [0u8; 16];
    pbkdf2_hmac::<Sha1>(password_hex.as_bytes(), salt.as_bytes(), 1000, &mut derived);
    hex::encode(derived)
}

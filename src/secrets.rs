//! Secret generation and password hashing
//!
//! All randomness comes from the operating system CSPRNG (`OsRng`).
//!
//! - Protocol passwords mix all four character classes
//! - Pre-shared keys and WireGuard keys are base64, as the daemons expect
//! - Account passwords are stored as salted Argon2id output together with
//!   the work factor used, so the factor can change without breaking
//!   existing accounts

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{PanelError, PanelResult};
use crate::protocol::{HashedPassword, KdfParams};

pub const MIN_PASSWORD_LENGTH: usize = 12;
pub const MIN_PSK_BYTES: usize = 32;

const SALT_SIZE: usize = 16;
const KEY_SIZE: usize = 32;

const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const DIGITS: &[u8] = b"23456789";
/// No quotes, backslash, `#`, `:` or whitespace: generated passwords go
/// inside quoted chap-secrets fields and through `chpasswd`'s `user:pass`
const PUNCT: &[u8] = b"!@%^&*()-_=+[]{}<>,.?~";

/// Generate a random password of `length` characters
///
/// Contains at least one upper, lower, digit and punctuation character.
pub fn generate_password(length: usize) -> PanelResult<String> {
    if length < MIN_PASSWORD_LENGTH {
        return Err(PanelError::InvalidParameter(format!(
            "Password length must be at least {}",
            MIN_PASSWORD_LENGTH
        )));
    }

    let mut rng = OsRng;
    let classes = [UPPER, LOWER, DIGITS, PUNCT];
    let all: Vec<u8> = classes.concat();

    let mut chars: Vec<u8> = classes
        .iter()
        .map(|class| class[rng.gen_range(0..class.len())])
        .collect();
    while chars.len() < length {
        chars.push(all[rng.gen_range(0..all.len())]);
    }
    chars.shuffle(&mut rng);

    String::from_utf8(chars).map_err(|e| PanelError::Crypto(e.to_string()))
}

/// Generate a base64 pre-shared key from `byte_length` random bytes
pub fn generate_psk(byte_length: usize) -> PanelResult<String> {
    if byte_length < MIN_PSK_BYTES {
        return Err(PanelError::InvalidParameter(format!(
            "PSK must be at least {} bytes",
            MIN_PSK_BYTES
        )));
    }

    let mut bytes = vec![0u8; byte_length];
    OsRng.fill_bytes(&mut bytes);
    Ok(STANDARD.encode(bytes))
}

/// A WireGuard-style key pair, base64 encoded
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Generate an X25519 key pair
pub fn generate_keypair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    KeyPair {
        private_key: STANDARD.encode(secret.to_bytes()),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Derive the public key for a base64 X25519 private key
pub fn public_key_for(private_key: &str) -> PanelResult<String> {
    let bytes = STANDARD
        .decode(private_key)
        .map_err(|e| PanelError::Crypto(format!("Invalid private key encoding: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| PanelError::Crypto("Private key must be 32 bytes".to_string()))?;

    let secret = StaticSecret::from(bytes);
    Ok(STANDARD.encode(PublicKey::from(&secret).as_bytes()))
}

fn argon2_for(params: &KdfParams) -> PanelResult<Argon2<'static>> {
    let params = Params::new(params.memory_kib, params.iterations, params.parallelism, Some(KEY_SIZE))
        .map_err(|e| PanelError::Crypto(format!("Invalid Argon2 parameters: {}", e)))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash `plain` with a fresh random salt
pub fn hash_password(plain: &str, params: KdfParams) -> PanelResult<HashedPassword> {
    let mut salt = vec![0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    let mut key = vec![0u8; KEY_SIZE];
    argon2_for(&params)?
        .hash_password_into(plain.as_bytes(), &salt, &mut key)
        .map_err(|e| PanelError::Crypto(format!("Password hashing failed: {}", e)))?;

    Ok(HashedPassword { salt, key, params })
}

/// Check `plain` against a stored hash
///
/// The derived key is compared in constant time.
pub fn verify_password(plain: &str, stored: &HashedPassword) -> bool {
    let argon2 = match argon2_for(&stored.params) {
        Ok(argon2) => argon2,
        Err(_) => return false,
    };

    let mut key = vec![0u8; stored.key.len().max(1)];
    if argon2
        .hash_password_into(plain.as_bytes(), &stored.salt, &mut key)
        .is_err()
    {
        return false;
    }

    constant_time_eq(&key, &stored.key)
}

/// Constant-time comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

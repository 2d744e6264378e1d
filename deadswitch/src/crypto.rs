//! Cryptography module
//!
//! Payload codec for switch messages plus the small set of secret helpers
//! the rest of the crate relies on.
//!
//! A message is encrypted under a random data key with AES-256-GCM. The data
//! key is then wrapped once per second factor (management token, recovery
//! key). Each wrapping key is derived with Argon2id from the stored key
//! fragment concatenated with that factor, so the stored `content` and
//! `key_fragment` together still cannot decrypt anything.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use crate::config::TOKEN_BYTES;
use crate::error::{AppError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const NONCE_SIZE: usize = 12; // 96 bits for GCM
const SALT_SIZE: usize = 16; // 128 bits
const KEY_SIZE: usize = 32; // AES-256
const ENVELOPE_VERSION: u8 = 1;

/// Which second factor a key slot was sealed for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    ManagementToken,
    RecoveryKey,
}

/// The data key wrapped under one second factor
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeySlot {
    kind: SlotKind,
    salt: String,
    nonce: String,
    wrapped_key: String,
}

/// Serialized form stored in the `content` column
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    v: u8,
    nonce: String,
    ciphertext: String,
    slots: Vec<KeySlot>,
}

/// Second factors a payload is sealed for. Neither is ever persisted.
pub struct SecondFactors<'a> {
    pub management_token: &'a str,
    pub recovery_key: &'a str,
}

/// Result of sealing a message
#[derive(Debug, Clone)]
pub struct SealedPayload {
    /// JSON envelope for the `content` column
    pub content: String,
    /// Base64 key fragment for the `key_fragment` column
    pub key_fragment: String,
}

/// Encrypt a message so that it can be opened with the key fragment plus
/// either of the supplied second factors.
pub fn encrypt(plaintext: &[u8], factors: &SecondFactors<'_>) -> Result<SealedPayload> {
    let mut fragment = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut fragment);

    let mut data_key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut data_key);

    let (nonce, ciphertext) = seal(&data_key, plaintext)?;

    let slots = vec![
        wrap_key(&data_key, &fragment, factors.management_token, SlotKind::ManagementToken)?,
        wrap_key(&data_key, &fragment, factors.recovery_key, SlotKind::RecoveryKey)?,
    ];

    let envelope = Envelope {
        v: ENVELOPE_VERSION,
        nonce: STANDARD.encode(nonce),
        ciphertext: STANDARD.encode(ciphertext),
        slots,
    };

    Ok(SealedPayload {
        content: serde_json::to_string(&envelope)?,
        key_fragment: STANDARD.encode(fragment),
    })
}

/// Decrypt a stored payload with its key fragment and one second factor.
///
/// `hint` names the slot to try first when the caller knows which factor it
/// holds; each slot costs one Argon2 derivation and a wrong hint only
/// changes the order. Every failure (malformed envelope, bad fragment, wrong
/// factor, tampered ciphertext) surfaces as [`AppError::Decryption`]; GCM
/// authentication guarantees a wrong factor never yields plausible plaintext.
pub fn decrypt(
    content: &str,
    key_fragment: &str,
    second_factor: &str,
    hint: Option<SlotKind>,
) -> Result<Vec<u8>> {
    let envelope: Envelope = serde_json::from_str(content)
        .map_err(|e| AppError::Decryption(format!("Malformed payload envelope: {}", e)))?;

    if envelope.v != ENVELOPE_VERSION {
        return Err(AppError::Decryption(format!(
            "Unsupported envelope version {}",
            envelope.v
        )));
    }

    let fragment = decode(key_fragment, "key fragment")?;
    if fragment.len() != KEY_SIZE {
        return Err(AppError::Decryption("Key fragment has wrong length".to_string()));
    }

    let mut slots: Vec<&KeySlot> = envelope.slots.iter().collect();
    if let Some(kind) = hint {
        slots.sort_by_key(|slot| slot.kind != kind);
    }

    let data_key = slots
        .into_iter()
        .find_map(|slot| unwrap_key(slot, &fragment, second_factor).ok())
        .ok_or_else(|| {
            AppError::Decryption("No key slot accepts the supplied second factor".to_string())
        })?;

    let nonce = decode(&envelope.nonce, "nonce")?;
    let ciphertext = decode(&envelope.ciphertext, "ciphertext")?;

    open(&data_key, &nonce, &ciphertext)
}

fn wrap_key(
    data_key: &[u8; KEY_SIZE],
    fragment: &[u8],
    factor: &str,
    kind: SlotKind,
) -> Result<KeySlot> {
    if factor.is_empty() {
        return Err(AppError::Validation("Second factor must not be empty".to_string()));
    }

    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    let wrapping_key = derive_key(fragment, factor, &salt)?;
    let (nonce, wrapped) = seal(&wrapping_key, data_key)?;

    Ok(KeySlot {
        kind,
        salt: STANDARD.encode(salt),
        nonce: STANDARD.encode(nonce),
        wrapped_key: STANDARD.encode(wrapped),
    })
}

fn unwrap_key(slot: &KeySlot, fragment: &[u8], factor: &str) -> Result<Vec<u8>> {
    let salt = decode(&slot.salt, "slot salt")?;
    let nonce = decode(&slot.nonce, "slot nonce")?;
    let wrapped = decode(&slot.wrapped_key, "wrapped key")?;

    let wrapping_key = derive_key(fragment, factor, &salt)?;
    let data_key = open(&wrapping_key, &nonce, &wrapped)?;

    if data_key.len() != KEY_SIZE {
        return Err(AppError::Decryption("Unwrapped key has wrong length".to_string()));
    }
    Ok(data_key)
}

fn seal(key: &[u8], plaintext: &[u8]) -> Result<([u8; NONCE_SIZE], Vec<u8>)> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| AppError::Generic(format!("Cipher initialization failed: {}", e)))?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| AppError::Generic(format!("Encryption failed: {}", e)))?;

    Ok((nonce_bytes, ciphertext))
}

fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_SIZE {
        return Err(AppError::Decryption("Nonce has wrong length".to_string()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| AppError::Decryption(format!("Cipher initialization failed: {}", e)))?;

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| AppError::Decryption("Authentication failed".to_string()))
}

/// Derive a 256-bit wrapping key from fragment ‖ factor using Argon2id
fn derive_key(fragment: &[u8], factor: &str, salt: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let mut input = Vec::with_capacity(fragment.len() + factor.len());
    input.extend_from_slice(fragment);
    input.extend_from_slice(factor.as_bytes());

    let mut key = [0u8; KEY_SIZE];
    Argon2::default()
        .hash_password_into(&input, salt, &mut key)
        .map_err(|e| AppError::Generic(format!("Key derivation failed: {}", e)))?;

    Ok(key)
}

fn decode(value: &str, what: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|_| AppError::Decryption(format!("Invalid base64 in {}", what)))
}

/// Generate a random URL-safe token (management token, recovery key, heartbeat token)
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex digest of a high-entropy token, used as its lookup key
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash a low-entropy secret (master password, recovery key) into a PHC string
pub fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| AppError::Generic(format!("Secret hashing failed: {}", e)))?;
    Ok(hash.to_string())
}

/// Check a secret against a stored PHC hash
pub fn verify_secret(secret: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!("Stored secret hash is unreadable: {}", e);
            false
        }
    }
}

/// Compare two tokens without leaking the position of the first mismatch
pub fn tokens_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "management-token-for-tests";
    const RECOVERY: &str = "recovery-key-for-tests";

    fn factors() -> SecondFactors<'static> {
        SecondFactors {
            management_token: TOKEN,
            recovery_key: RECOVERY,
        }
    }

    #[test]
    fn test_encrypt_decrypt_with_either_factor() {
        let plaintext = b"If you are reading this, I have not checked in.";

        let sealed = encrypt(plaintext, &factors()).unwrap();

        let via_token = decrypt(&sealed.content, &sealed.key_fragment, TOKEN, None).unwrap();
        let via_recovery = decrypt(&sealed.content, &sealed.key_fragment, RECOVERY, None).unwrap();

        assert_eq!(via_token, plaintext);
        assert_eq!(via_recovery, plaintext);
    }

    #[test]
    fn test_wrong_second_factor() {
        let sealed = encrypt(b"Secret data", &factors()).unwrap();

        let result = decrypt(&sealed.content, &sealed.key_fragment, "wrong_factor", None);

        assert!(matches!(result, Err(AppError::Decryption(_))));
    }

    #[test]
    fn test_fragment_alone_is_not_enough() {
        let sealed = encrypt(b"Secret data", &factors()).unwrap();

        // The stored columns contain neither factor
        assert!(!sealed.content.contains(TOKEN));
        assert!(!sealed.content.contains(RECOVERY));
        assert!(decrypt(&sealed.content, &sealed.key_fragment, "", None).is_err());
        assert!(decrypt(&sealed.content, &sealed.key_fragment, &sealed.key_fragment, None).is_err());
    }

    #[test]
    fn test_wrong_fragment() {
        let sealed = encrypt(b"Secret data", &factors()).unwrap();
        let other = encrypt(b"Other data", &factors()).unwrap();

        let result = decrypt(&sealed.content, &other.key_fragment, TOKEN, None);
        assert!(matches!(result, Err(AppError::Decryption(_))));
    }

    #[test]
    fn test_fresh_material_per_message() {
        let sealed1 = encrypt(b"Same data", &factors()).unwrap();
        let sealed2 = encrypt(b"Same data", &factors()).unwrap();

        assert_ne!(sealed1.key_fragment, sealed2.key_fragment);
        assert_ne!(sealed1.content, sealed2.content);
    }

    #[test]
    fn test_empty_plaintext() {
        let sealed = encrypt(b"", &factors()).unwrap();
        let decrypted = decrypt(&sealed.content, &sealed.key_fragment, TOKEN, None).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_corrupted_ciphertext() {
        let sealed = encrypt(b"Original message", &factors()).unwrap();

        let mut envelope: Envelope = serde_json::from_str(&sealed.content).unwrap();
        let mut ciphertext = STANDARD.decode(&envelope.ciphertext).unwrap();
        ciphertext[0] ^= 0xFF;
        envelope.ciphertext = STANDARD.encode(ciphertext);
        let tampered = serde_json::to_string(&envelope).unwrap();

        let result = decrypt(&tampered, &sealed.key_fragment, TOKEN, None);
        assert!(matches!(result, Err(AppError::Decryption(_))));
    }

    #[test]
    fn test_malformed_envelope() {
        let result = decrypt("not json", "AAAA", TOKEN, None);
        assert!(matches!(result, Err(AppError::Decryption(_))));
    }

    #[test]
    fn test_empty_factor_rejected_at_encryption() {
        let result = encrypt(
            b"data",
            &SecondFactors {
                management_token: TOKEN,
                recovery_key: "",
            },
        );
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_secret_hash_roundtrip() {
        let hash = hash_secret("correct horse battery staple").unwrap();
        assert!(verify_secret("correct horse battery staple", &hash));
        assert!(!verify_secret("incorrect horse", &hash));
        assert!(!verify_secret("anything", "not-a-phc-string"));
    }

    #[test]
    fn test_tokens() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(hash_token(&a), hash_token(&a));
        assert_eq!(hash_token(&a).len(), 64);
        assert!(tokens_match(&a, &a));
        assert!(!tokens_match(&a, &b));
    }

    #[test]
    fn test_decrypt_with_slot_hint() {
        let sealed = encrypt(b"hinted", &factors()).unwrap();

        let right = decrypt(&sealed.content, &sealed.key_fragment, RECOVERY, Some(SlotKind::RecoveryKey));
        assert_eq!(right.unwrap(), b"hinted");

        // A wrong hint only changes the order slots are tried in
        let wrong = decrypt(&sealed.content, &sealed.key_fragment, TOKEN, Some(SlotKind::RecoveryKey));
        assert_eq!(wrong.unwrap(), b"hinted");

        let bad = decrypt(&sealed.content, &sealed.key_fragment, "nope", Some(SlotKind::ManagementToken));
        assert!(matches!(bad, Err(AppError::Decryption(_))));
    }
}

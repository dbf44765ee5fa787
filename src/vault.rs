//! Passphrase-based encryption for secrets at rest
//!
//! Produces a self-identifying text envelope so callers can test
//! [`is_ciphertext`] before deciding to decrypt (or to refuse
//! double-encryption). The envelope header matches the widely used
//! `$ANSIBLE_VAULT;1.1;AES256` marker; the body is hex of
//! `salt || hmac || ciphertext` wrapped at 80 columns.
//!
//! Key derivation is PBKDF2-HMAC-SHA256 over passphrase and salt,
//! yielding the AES-256 key, the HMAC-SHA256 key and the CTR IV. The
//! HMAC is verified over the ciphertext before any decryption happens.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const HEADER: &str = "$ANSIBLE_VAULT;1.1;AES256";
const MAGIC: &str = "$ANSIBLE_VAULT;";

const SALT_LEN: usize = 32;
const HMAC_LEN: usize = 32;
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const PBKDF2_ROUNDS: u32 = 10_000;
const WRAP_WIDTH: usize = 80;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault passphrase must not be empty")]
    EmptyPassphrase,

    #[error("input is not a vault envelope")]
    NotCiphertext,

    #[error("malformed vault envelope: {0}")]
    Malformed(String),

    #[error("wrong vault passphrase or corrupt ciphertext")]
    WrongPassphraseOrCorrupt,
}

/// True iff the trimmed input begins with the vault header.
pub fn is_ciphertext(s: &str) -> bool {
    s.trim_start().starts_with(MAGIC)
}

/// Encrypt `plaintext` under `passphrase` into a vault envelope.
///
/// Encoding is not idempotent: callers must check [`is_ciphertext`]
/// before encoding to avoid wrapping an envelope in another envelope.
pub fn encode(plaintext: &str, passphrase: &str) -> Result<String, VaultError> {
    if passphrase.is_empty() {
        return Err(VaultError::EmptyPassphrase);
    }

    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let keys = derive_keys(passphrase, &salt);

    let mut ciphertext = plaintext.as_bytes().to_vec();
    cipher(&keys)?.apply_keystream(&mut ciphertext);

    let tag = hmac_tag(&keys, &ciphertext)?;

    let mut body = Vec::with_capacity(SALT_LEN + HMAC_LEN + ciphertext.len());
    body.extend_from_slice(&salt);
    body.extend_from_slice(&tag);
    body.extend_from_slice(&ciphertext);

    let hex_body = hex::encode(body);
    let mut out = String::with_capacity(HEADER.len() + hex_body.len() + hex_body.len() / WRAP_WIDTH + 2);
    out.push_str(HEADER);
    for chunk_start in (0..hex_body.len()).step_by(WRAP_WIDTH) {
        let chunk_end = (chunk_start + WRAP_WIDTH).min(hex_body.len());
        out.push('\n');
        out.push_str(&hex_body[chunk_start..chunk_end]);
    }
    out.push('\n');

    Ok(out)
}

/// Decrypt a vault envelope. The HMAC is checked before decryption;
/// a mismatch means a wrong passphrase or a tampered body.
pub fn decode(ciphertext: &str, passphrase: &str) -> Result<Zeroizing<String>, VaultError> {
    if passphrase.is_empty() {
        return Err(VaultError::EmptyPassphrase);
    }

    let trimmed = ciphertext.trim();
    let mut lines = trimmed.lines();
    let header = lines.next().ok_or(VaultError::NotCiphertext)?;
    if !header.starts_with(MAGIC) {
        return Err(VaultError::NotCiphertext);
    }

    let hex_body: String = lines.map(str::trim).collect();
    let body = hex::decode(&hex_body).map_err(|e| VaultError::Malformed(e.to_string()))?;
    if body.len() < SALT_LEN + HMAC_LEN {
        return Err(VaultError::Malformed("body too short".to_string()));
    }

    let (salt, rest) = body.split_at(SALT_LEN);
    let (tag, encrypted) = rest.split_at(HMAC_LEN);

    let keys = derive_keys(passphrase, salt);

    let expected = hmac_tag(&keys, encrypted)?;
    if expected.as_slice().ct_eq(tag).unwrap_u8() != 1 {
        return Err(VaultError::WrongPassphraseOrCorrupt);
    }

    let mut plaintext = encrypted.to_vec();
    cipher(&keys)?.apply_keystream(&mut plaintext);

    String::from_utf8(plaintext)
        .map(Zeroizing::new)
        .map_err(|_| VaultError::WrongPassphraseOrCorrupt)
}

/// PBKDF2 output split as cipher key || hmac key || iv.
struct DerivedKeys(Zeroizing<[u8; KEY_LEN * 2 + IV_LEN]>);

impl DerivedKeys {
    fn cipher_key(&self) -> &[u8] {
        &self.0[..KEY_LEN]
    }

    fn hmac_key(&self) -> &[u8] {
        &self.0[KEY_LEN..KEY_LEN * 2]
    }

    fn iv(&self) -> &[u8] {
        &self.0[KEY_LEN * 2..]
    }
}

fn derive_keys(passphrase: &str, salt: &[u8]) -> DerivedKeys {
    let mut okm = Zeroizing::new([0u8; KEY_LEN * 2 + IV_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut *okm);
    DerivedKeys(okm)
}

fn cipher(keys: &DerivedKeys) -> Result<Aes256Ctr, VaultError> {
    Aes256Ctr::new_from_slices(keys.cipher_key(), keys.iv())
        .map_err(|_| VaultError::Malformed("bad key material length".to_string()))
}

fn hmac_tag(keys: &DerivedKeys, data: &[u8]) -> Result<[u8; HMAC_LEN], VaultError> {
    let mut mac = HmacSha256::new_from_slice(keys.hmac_key())
        .map_err(|_| VaultError::Malformed("bad hmac key length".to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_recovers_plaintext() {
        let envelope = encode("s3cr3t-password", "vault-pass").unwrap();
        let plain = decode(&envelope, "vault-pass").unwrap();
        assert_eq!(&*plain, "s3cr3t-password");
    }

    #[test]
    fn wrong_passphrase_is_rejected_before_decrypt() {
        let envelope = encode("s3cr3t-password", "vault-pass").unwrap();
        assert!(matches!(
            decode(&envelope, "other-pass"),
            Err(VaultError::WrongPassphraseOrCorrupt)
        ));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let envelope = encode("payload", "k").unwrap();
        // Flip one hex digit in the ciphertext section (past salt + hmac).
        let mut chars: Vec<char> = envelope.chars().collect();
        let idx = envelope.len() - 3;
        chars[idx] = if chars[idx] == '0' { '1' } else { '0' };
        let tampered: String = chars.into_iter().collect();
        assert!(matches!(
            decode(&tampered, "k"),
            Err(VaultError::WrongPassphraseOrCorrupt)
        ));
    }

    #[test]
    fn header_detection() {
        assert!(is_ciphertext("$ANSIBLE_VAULT;1.1;AES256\n3132\n"));
        assert!(is_ciphertext("  $ANSIBLE_VAULT;1.1;AES256\nabcd"));
        assert!(!is_ciphertext("hunter2"));
        assert!(!is_ciphertext(""));
    }

    #[test]
    fn encode_output_is_a_detectable_envelope() {
        let envelope = encode("x", "k").unwrap();
        assert!(is_ciphertext(&envelope));
        assert!(envelope.starts_with(HEADER));
    }

    #[test]
    fn body_lines_are_wrapped() {
        let envelope = encode(&"a".repeat(200), "k").unwrap();
        for line in envelope.lines().skip(1) {
            assert!(line.len() <= WRAP_WIDTH);
        }
    }

    #[test]
    fn empty_passphrase_is_rejected() {
        assert!(matches!(encode("x", ""), Err(VaultError::EmptyPassphrase)));
        assert!(matches!(decode("x", ""), Err(VaultError::EmptyPassphrase)));
    }

    #[test]
    fn encode_is_randomized_per_call() {
        let a = encode("same input", "k").unwrap();
        let b = encode("same input", "k").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn garbage_input_is_not_ciphertext() {
        assert!(matches!(
            decode("not an envelope", "k"),
            Err(VaultError::NotCiphertext)
        ));
    }

    #[test]
    fn truncated_body_is_malformed() {
        assert!(matches!(
            decode("$ANSIBLE_VAULT;1.1;AES256\nabcd\n", "k"),
            Err(VaultError::Malformed(_))
        ));
    }

    #[test]
    fn empty_plaintext_roundtrips() {
        let envelope = encode("", "k").unwrap();
        assert_eq!(&*decode(&envelope, "k").unwrap(), "");
    }
}

//! Encrypted mailbox credentials
//!
//! `email.address` and `email.password` may be stored as `enc:<token>`,
//! where the token is the UTF-8 text XORed with the SHA-256 digest of the
//! key in [`SECRET_KEY_ENV`], encoded as padded URL-safe base64. Values
//! without the prefix are plain text.

use crate::error::{CliError, CliResult};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use flow_engine::{MailboxConfig, SecretString};
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};

/// Environment variable holding the credential key
pub const SECRET_KEY_ENV: &str = "REGISTER_EMAIL_SECRET_KEY";

/// Marks an encrypted value
pub const ENCRYPTED_PREFIX: &str = "enc:";

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

/// Key from [`SECRET_KEY_ENV`]; empty counts as unset
pub fn secret_key_from_env() -> Option<String> {
    std::env::var(SECRET_KEY_ENV).ok().filter(|key| !key.is_empty())
}

/// `enc:` form of `plaintext`; empty stays empty
pub fn encrypt_secret(plaintext: &str, key: &str) -> String {
    if plaintext.is_empty() {
        return String::new();
    }
    format!("{}{}", ENCRYPTED_PREFIX, URL_SAFE.encode(xor_with_key(plaintext.as_bytes(), key)))
}

/// Plain text of `value`, decrypting it when it carries the prefix
pub fn decrypt_secret(value: &str, key: Option<&str>) -> CliResult<String> {
    let Some(token) = value.strip_prefix(ENCRYPTED_PREFIX) else {
        return Ok(value.to_string());
    };
    let key = key.filter(|k| !k.is_empty()).ok_or_else(|| {
        CliError::config(format!(
            "email credentials are encrypted but {} is not set",
            SECRET_KEY_ENV
        ))
    })?;
    let bytes = URL_SAFE
        .decode(token.trim())
        .map_err(|e| CliError::config(format!("encrypted email credential is not valid base64: {}", e)))?;
    String::from_utf8(xor_with_key(&bytes, key))
        .map_err(|_| CliError::config("encrypted email credential does not decrypt with the configured key"))
}

/// Copy of `mailbox` with address and password in plain text
pub fn decrypt_mailbox(mailbox: &MailboxConfig, key: Option<&str>) -> CliResult<MailboxConfig> {
    let mut plain = mailbox.clone();
    plain.address = decrypt_secret(&mailbox.address, key)?;
    plain.password = SecretString::from(decrypt_secret(mailbox.password.expose_secret(), key)?);
    Ok(plain)
}

fn xor_with_key(data: &[u8], key: &str) -> Vec<u8> {
    let digest = Sha256::digest(key.as_bytes());
    data.iter().zip(digest.iter().cycle()).map(|(b, k)| b ^ k).collect()
}

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::RegistryError;

/// Identifier length in hex characters (8 random bytes)
const IDENTIFIER_LEN: usize = 16;
/// Secret entropy in bytes; encodes to 43 base64url characters
const SECRET_BYTES: usize = 32;
const SECRET_LEN: usize = 43;

/// Borrowed parts of a presented key
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedKey<'a> {
    pub prefix: &'a str,
    pub identifier: &'a str,
    pub secret: &'a str,
}

/// Split `prefix_IDENTIFIER.secret` without touching any store.
///
/// The prefix may itself contain underscores (`gk_live`); the identifier is
/// the segment after the last underscore before the dot.
pub fn parse_key(presented: &str) -> Result<ParsedKey<'_>, RegistryError> {
    let (head, secret) = presented
        .rsplit_once('.')
        .ok_or(RegistryError::MalformedKey)?;
    let (prefix, identifier) = head.rsplit_once('_').ok_or(RegistryError::MalformedKey)?;

    if prefix.is_empty()
        || !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(RegistryError::MalformedKey);
    }

    if identifier.len() != IDENTIFIER_LEN
        || !identifier
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
    {
        return Err(RegistryError::MalformedKey);
    }

    if secret.len() != SECRET_LEN
        || !secret
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(RegistryError::MalformedKey);
    }

    Ok(ParsedKey {
        prefix,
        identifier,
        secret,
    })
}

pub fn format_key(prefix: &str, identifier: &str, secret: &str) -> String {
    format!("{}_{}.{}", prefix, identifier, secret)
}

pub(crate) fn generate_identifier() -> String {
    let mut bytes = [0u8; IDENTIFIER_LEN / 2];
    OsRng.fill_bytes(&mut bytes);
    hex::encode_upper(bytes)
}

pub(crate) fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 of the secret, hex encoded.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time check of a presented secret against a stored hash.
pub fn secret_matches(secret: &str, stored_hash: &str) -> bool {
    let computed = hash_secret(secret);
    bool::from(computed.as_bytes().ct_eq(stored_hash.as_bytes()))
}

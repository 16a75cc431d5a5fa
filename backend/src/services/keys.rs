use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

/// Length of a derived key in hex characters.
pub const DERIVED_KEY_LEN: usize = 64;

/// Backend lookup identifier: lowercase hex SHA-256 of a passphrase.
///
/// The same derivation produces both "my key" (stored locally and shared
/// out-of-band) and the partner key typed into the app. Passphrases are
/// hashed byte-for-byte; no case or whitespace normalization is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DerivedKey(String);

impl DerivedKey {
    /// Accept an already-derived key (64 lowercase hex characters).
    pub fn parse(value: &str) -> AppResult<Self> {
        let well_formed = value.len() == DERIVED_KEY_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

        if well_formed {
            Ok(Self(value.to_string()))
        } else {
            Err(AppError::Validation(format!(
                "derived key must be {} lowercase hex characters",
                DERIVED_KEY_LEN
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DerivedKey {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DerivedKey::parse(&value)
    }
}

impl From<DerivedKey> for String {
    fn from(key: DerivedKey) -> Self {
        key.0
    }
}

pub fn derive_key(passphrase: &str) -> DerivedKey {
    let digest = Sha256::digest(passphrase.as_bytes());
    DerivedKey(hex::encode(digest))
}

/// Prefix used when a key has to appear in logs.
pub fn key_fingerprint(key: &DerivedKey) -> &str {
    &key.as_str()[..8]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_matches_known_digest() {
        assert_eq!(
            derive_key("hello").as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(
            derive_key("").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn derived_keys_are_64_lowercase_hex() {
        for input in ["", "hello", "상대방 암호", "  spaced  ", "🙂"] {
            let key = derive_key(input);
            assert_eq!(key.as_str().len(), DERIVED_KEY_LEN);
            assert!(key
                .as_str()
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        }
    }

    #[test]
    fn derivation_is_deterministic() {
        assert_eq!(derive_key("pair-code"), derive_key("pair-code"));
        assert_ne!(derive_key("pair-code"), derive_key("pair-codf"));
    }

    #[test]
    fn trailing_whitespace_changes_the_key() {
        // No normalization: visually identical passphrases can differ.
        assert_ne!(derive_key("hello"), derive_key("hello "));
        assert_ne!(derive_key("Hello"), derive_key("hello"));
    }

    #[test]
    fn parse_accepts_derived_and_rejects_other_strings() {
        let key = derive_key("hello");
        assert_eq!(DerivedKey::parse(key.as_str()).unwrap(), key);

        assert!(DerivedKey::parse("hello").is_err());
        assert!(DerivedKey::parse(&key.as_str().to_uppercase()).is_err());
        assert!(DerivedKey::parse(&key.as_str()[..63]).is_err());
    }

    #[test]
    fn serde_round_trips_through_string() {
        let key = derive_key("hello");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key));
        assert!(serde_json::from_str::<DerivedKey>("\"nope\"").is_err());
    }

    #[test]
    fn fingerprint_is_a_prefix() {
        let key = derive_key("hello");
        assert_eq!(key_fingerprint(&key), "2cf24dba");
    }
}

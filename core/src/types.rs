use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// SHA-256 digest identifying plaintext content (the dedup key) or stored
/// ciphertext. Rendered as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_data(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Uppercased leading hex characters, used for directory fan-out.
    pub fn upper_prefix(&self, len: usize) -> String {
        self.to_hex()[..len].to_ascii_uppercase()
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }
}

impl From<[u8; 32]> for ContentHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl FromStr for ContentHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self(array))
    }
}

impl Serialize for ContentHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Argon2id cost parameters used to turn the password into key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

#[derive(Clone, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub salt: String,
}

impl Credentials {
    pub fn new(password: impl Into<String>, salt: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            salt: salt.into(),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.password.is_empty() {
            return Err(crate::Error::Configuration("missing encryption password".to_string()));
        }
        if self.salt.is_empty() {
            return Err(crate::Error::Configuration("missing encryption salt".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &"<redacted>")
            .field("salt", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_roundtrip() {
        let hash = ContentHash::from_data(b"keepvault");
        let parsed: ContentHash = hash.to_hex().parse().unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(hash.to_hex().len(), 64);
    }

    #[test]
    fn test_upper_prefix() {
        let hash: ContentHash = "ab12cd00000000000000000000000000000000000000000000000000000000ff"
            .parse()
            .unwrap();
        assert_eq!(hash.upper_prefix(1), "A");
        assert_eq!(hash.upper_prefix(4), "AB12");
    }

    #[test]
    fn test_invalid_hash_rejected() {
        assert!("abc".parse::<ContentHash>().is_err());
        assert!("zz".repeat(32).parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_missing_credentials() {
        assert!(Credentials::new("", "salt").validate().is_err());
        assert!(Credentials::new("pw", "").validate().is_err());
        assert!(Credentials::new("pw", "salt").validate().is_ok());
    }
}

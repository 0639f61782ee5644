// Config Module - Master Key Loading
// =======================================================
// The master key is the only configuration the vault needs. It is read once
// at startup, validated, and then handed to the encryptor and decryptor
// explicitly. Nothing in the cryptographic code reads the environment.

use crate::error::{Result, VaultError};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::info;

/// Environment variable holding the hex-encoded master key.
pub const KEY_ENV_VAR: &str = "FILE_ENCRYPTION_KEY";

/// AES-256 key length in bytes.
pub const KEY_SIZE: usize = 32;

/// A 256-bit AES key shared by every encrypted attachment.
///
/// `Debug` never prints the key bytes; use [`MasterKey::fingerprint`] to
/// tell keys apart in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a key from 64 hex characters. Surrounding whitespace is ignored.
    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value.trim())
            .map_err(|err| VaultError::Config(format!("master key is not valid hex: {err}")))?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            VaultError::Config(format!(
                "master key must be {KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Generate a fresh random key, e.g. for provisioning a new deployment.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes of SHA-256 over the key, hex encoded.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MasterKey").field(&self.fingerprint()).finish()
    }
}

/// Process-wide vault settings.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub key: MasterKey,
}

impl VaultConfig {
    /// Load the key from [`KEY_ENV_VAR`]. A missing variable is a
    /// configuration error just like a malformed one.
    pub fn from_env() -> Result<Self> {
        Self::from_env_var(KEY_ENV_VAR)
    }

    /// Load the key from the environment variable `name`.
    pub fn from_env_var(name: &str) -> Result<Self> {
        let value = std::env::var(name)
            .map_err(|err| VaultError::Config(format!("{name}: {err}")))?;
        Self::from_hex(&value)
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let key = MasterKey::from_hex(value)?;
        info!(fingerprint = %key.fingerprint(), "loaded master key");
        Ok(Self { key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "48ba0d4d0a7a821eb996581c82d93956e569032bad1aaeb24774635ef2b4c635";

    #[test]
    fn parses_valid_hex_key() {
        let config = VaultConfig::from_hex(KEY_HEX).unwrap();
        assert_eq!(config.key.to_hex(), KEY_HEX);
        assert_eq!(config.key.as_bytes()[0], 0x48);
    }

    #[test]
    fn trims_whitespace() {
        let key = MasterKey::from_hex(&format!("  {KEY_HEX}\n")).unwrap();
        assert_eq!(key.to_hex(), KEY_HEX);
    }

    #[test]
    fn rejects_short_key() {
        // 16 bytes is a valid AES-128 key but not what the vault uses.
        let err = MasterKey::from_hex("12345678901234567890123456789012").unwrap_err();
        assert!(matches!(err, VaultError::Config(ref msg) if msg.contains("32 bytes")));
    }

    #[test]
    fn rejects_non_hex() {
        let err = MasterKey::from_hex(&"zz".repeat(32)).unwrap_err();
        assert!(matches!(err, VaultError::Config(_)));
    }

    #[test]
    fn debug_output_hides_key() {
        let key = MasterKey::from_hex(KEY_HEX).unwrap();
        let printed = format!("{key:?}");
        assert!(!printed.contains(KEY_HEX));
        assert!(printed.contains(&key.fingerprint()));
        assert_eq!(key.fingerprint().len(), 16);
    }

    #[test]
    fn missing_variable_is_config_error() {
        let err = VaultConfig::from_env_var("ATTACHMENT_VAULT_UNSET_KEY_VAR").unwrap_err();
        assert!(
            matches!(err, VaultError::Config(ref msg) if msg.contains("ATTACHMENT_VAULT_UNSET_KEY_VAR"))
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn generated_keys_differ() {
        assert_ne!(MasterKey::generate(), MasterKey::generate());
    }
}

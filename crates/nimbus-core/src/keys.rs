//! Wire-level key containers exchanged with the service.
//!
//! Binary fields travel as standard base64 strings. Versions are carried as
//! free-form strings so that key generations this client does not understand
//! still deserialize (they are skipped, not rejected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Symmetric file cipher generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileKeyVersion {
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
}

/// Asymmetric user key pair generation.
///
/// Both generations use X25519; V2 raises the default Argon2id cost of the
/// passphrase-protected private key container.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum UserKeyPairVersion {
    V1,
    V2,
    Unsupported(String),
}

impl UserKeyPairVersion {
    pub fn as_str(&self) -> &str {
        match self {
            UserKeyPairVersion::V1 => "X25519-1",
            UserKeyPairVersion::V2 => "X25519-2",
            UserKeyPairVersion::Unsupported(s) => s,
        }
    }
}

impl From<String> for UserKeyPairVersion {
    fn from(s: String) -> Self {
        match s.as_str() {
            "X25519-1" => UserKeyPairVersion::V1,
            "X25519-2" => UserKeyPairVersion::V2,
            _ => UserKeyPairVersion::Unsupported(s),
        }
    }
}

impl From<UserKeyPairVersion> for String {
    fn from(v: UserKeyPairVersion) -> Self {
        v.as_str().to_string()
    }
}

impl fmt::Display for UserKeyPairVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generation of a wrapped file key: which user key wrapped which file cipher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EncryptedFileKeyVersion {
    V1Aes256Gcm,
    V2Aes256Gcm,
    Unsupported(String),
}

impl EncryptedFileKeyVersion {
    pub fn for_user_key(version: &UserKeyPairVersion) -> Option<Self> {
        match version {
            UserKeyPairVersion::V1 => Some(EncryptedFileKeyVersion::V1Aes256Gcm),
            UserKeyPairVersion::V2 => Some(EncryptedFileKeyVersion::V2Aes256Gcm),
            UserKeyPairVersion::Unsupported(_) => None,
        }
    }

    /// The user key generation able to open this wrapped key.
    pub fn user_key_version(&self) -> UserKeyPairVersion {
        match self {
            EncryptedFileKeyVersion::V1Aes256Gcm => UserKeyPairVersion::V1,
            EncryptedFileKeyVersion::V2Aes256Gcm => UserKeyPairVersion::V2,
            EncryptedFileKeyVersion::Unsupported(s) => UserKeyPairVersion::Unsupported(s.clone()),
        }
    }

    pub fn file_key_version(&self) -> Option<FileKeyVersion> {
        match self {
            EncryptedFileKeyVersion::Unsupported(_) => None,
            _ => Some(FileKeyVersion::Aes256Gcm),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EncryptedFileKeyVersion::V1Aes256Gcm => "X25519-1/AES-256-GCM",
            EncryptedFileKeyVersion::V2Aes256Gcm => "X25519-2/AES-256-GCM",
            EncryptedFileKeyVersion::Unsupported(s) => s,
        }
    }
}

impl From<String> for EncryptedFileKeyVersion {
    fn from(s: String) -> Self {
        match s.as_str() {
            "X25519-1/AES-256-GCM" => EncryptedFileKeyVersion::V1Aes256Gcm,
            "X25519-2/AES-256-GCM" => EncryptedFileKeyVersion::V2Aes256Gcm,
            _ => EncryptedFileKeyVersion::Unsupported(s),
        }
    }
}

impl From<EncryptedFileKeyVersion> for String {
    fn from(v: EncryptedFileKeyVersion) -> Self {
        v.as_str().to_string()
    }
}

impl fmt::Display for EncryptedFileKeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file key wrapped for one recipient. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFileKey {
    pub version: EncryptedFileKeyVersion,
    #[serde(with = "b64")]
    pub key: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub tag: Vec<u8>,
}

/// Public half of a user key pair (age `age1...` recipient string).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPublicKey {
    pub version: UserKeyPairVersion,
    pub public_key: String,
}

/// Argon2id cost parameters recorded next to a sealed private key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfSettings {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

/// Private half of a user key pair, sealed under a passphrase.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPrivateKey {
    pub version: UserKeyPairVersion,
    pub kdf: KdfSettings,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    /// `[24-byte nonce][sealed identity + 16-byte tag]`
    #[serde(with = "b64")]
    pub sealed: Vec<u8>,
}

impl fmt::Debug for UserPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserPrivateKey")
            .field("version", &self.version)
            .field("kdf", &self.kdf)
            .field("sealed", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserKeyPair {
    pub public_key_container: UserPublicKey,
    pub private_key_container: UserPrivateKey,
}

impl UserKeyPair {
    pub fn version(&self) -> &UserKeyPairVersion {
        &self.public_key_container.version
    }
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

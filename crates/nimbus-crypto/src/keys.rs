//! Per-file keys: generation, wrapping to a recipient, unwrapping

use nimbus_core::keys::{
    EncryptedFileKey, EncryptedFileKeyVersion, FileKeyVersion, UserPrivateKey, UserPublicKey,
};
use nimbus_core::CryptoError;
use rand::RngCore;
use secrecy::SecretString;
use zeroize::{Zeroize, Zeroizing};

use crate::keypair::{unlock_private_key, UnlockedPrivateKey};
use crate::{IV_SIZE, KEY_SIZE, TAG_SIZE};

/// A per-file content key in clear. Zeroized on drop.
///
/// `tag` is only known once the upload cipher has been finalized.
#[derive(Clone)]
pub struct PlainFileKey {
    version: FileKeyVersion,
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
    tag: Option<[u8; TAG_SIZE]>,
}

impl PlainFileKey {
    pub fn from_parts(
        version: FileKeyVersion,
        key: [u8; KEY_SIZE],
        iv: [u8; IV_SIZE],
        tag: Option<[u8; TAG_SIZE]>,
    ) -> Self {
        Self {
            version,
            key,
            iv,
            tag,
        }
    }

    pub fn version(&self) -> FileKeyVersion {
        self.version
    }

    pub fn key_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    pub fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    pub fn tag(&self) -> Option<[u8; TAG_SIZE]> {
        self.tag
    }

    pub fn set_tag(&mut self, tag: [u8; TAG_SIZE]) {
        self.tag = Some(tag);
    }
}

impl Drop for PlainFileKey {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

impl std::fmt::Debug for PlainFileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainFileKey")
            .field("version", &self.version)
            .field("key", &"[REDACTED]")
            .field("has_tag", &self.tag.is_some())
            .finish()
    }
}

/// Generate a random file key and IV. No tag yet.
pub fn generate_file_key(version: FileKeyVersion) -> PlainFileKey {
    let mut key = [0u8; KEY_SIZE];
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    rand::thread_rng().fill_bytes(&mut iv);
    PlainFileKey::from_parts(version, key, iv, None)
}

/// Wrap (encrypt) a finalized file key for one recipient.
///
/// The key bytes are age-encrypted to the recipient's X25519 public key; IV
/// and tag travel in clear next to them.
pub fn wrap_file_key(
    plain: &PlainFileKey,
    recipient: &UserPublicKey,
) -> Result<EncryptedFileKey, CryptoError> {
    let version = EncryptedFileKeyVersion::for_user_key(&recipient.version).ok_or_else(|| {
        CryptoError::Internal(format!(
            "unsupported recipient key version: {}",
            recipient.version
        ))
    })?;
    let tag = plain
        .tag()
        .ok_or_else(|| CryptoError::Internal("file key has no authentication tag yet".into()))?;
    let age_recipient: age::x25519::Recipient = recipient
        .public_key
        .parse()
        .map_err(|e: &str| CryptoError::Internal(format!("invalid recipient public key: {e}")))?;

    let wrapped = age::encrypt(&age_recipient, plain.key_bytes())
        .map_err(|e| CryptoError::System(format!("key wrapping failed: {e}")))?;

    Ok(EncryptedFileKey {
        version,
        key: wrapped,
        iv: plain.iv().to_vec(),
        tag: tag.to_vec(),
    })
}

/// Unwrap (decrypt) a file key with the holder's private key and passphrase.
pub fn unwrap_file_key(
    encrypted: &EncryptedFileKey,
    private_key: &UserPrivateKey,
    passphrase: &SecretString,
) -> Result<PlainFileKey, CryptoError> {
    let unlocked = unlock_private_key(private_key, passphrase)?;
    unlocked.unwrap_file_key(encrypted)
}

impl UnlockedPrivateKey {
    /// Whether this key generation can open the given wrapped key.
    pub fn can_open(&self, version: &EncryptedFileKeyVersion) -> bool {
        version.file_key_version().is_some() && &version.user_key_version() == self.version()
    }

    pub fn unwrap_file_key(&self, encrypted: &EncryptedFileKey) -> Result<PlainFileKey, CryptoError> {
        if !self.can_open(&encrypted.version) {
            return Err(CryptoError::Internal(format!(
                "private key {} cannot open file key {}",
                self.version(),
                encrypted.version
            )));
        }
        let iv: [u8; IV_SIZE] = encrypted.iv.as_slice().try_into().map_err(|_| {
            CryptoError::BadFile(format!(
                "file key IV must be {IV_SIZE} bytes, got {}",
                encrypted.iv.len()
            ))
        })?;
        let tag: [u8; TAG_SIZE] = encrypted.tag.as_slice().try_into().map_err(|_| {
            CryptoError::BadFile(format!(
                "file key tag must be {TAG_SIZE} bytes, got {}",
                encrypted.tag.len()
            ))
        })?;

        let plaintext = Zeroizing::new(
            age::decrypt(self.identity(), &encrypted.key).map_err(map_decrypt_error)?,
        );
        if plaintext.len() != KEY_SIZE {
            return Err(CryptoError::BadFile(format!(
                "unwrapped key has wrong size: {} bytes (expected {KEY_SIZE})",
                plaintext.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&plaintext);

        let version = encrypted
            .version
            .file_key_version()
            .unwrap_or(FileKeyVersion::Aes256Gcm);
        Ok(PlainFileKey::from_parts(version, key, iv, Some(tag)))
    }
}

fn map_decrypt_error(e: age::DecryptError) -> CryptoError {
    use age::DecryptError;
    match e {
        DecryptError::Io(e) => CryptoError::System(format!("key unwrapping I/O failure: {e}")),
        DecryptError::DecryptionFailed
        | DecryptError::InvalidHeader
        | DecryptError::InvalidMac
        | DecryptError::KeyDecryptionFailed
        | DecryptError::NoMatchingKeys
        | DecryptError::UnknownFormat => {
            CryptoError::BadFile(format!("wrapped file key is invalid: {e}"))
        }
        other => CryptoError::Unknown(other.to_string()),
    }
}

//! Key derivation: Argon2id passphrase → private-key sealing key

use argon2::{Algorithm, Argon2, Params, Version};
use nimbus_core::keys::{KdfSettings, UserKeyPairVersion};
use nimbus_core::CryptoError;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// Key that seals a user's private key container. Zeroized on drop.
pub struct SealingKey {
    bytes: [u8; KEY_SIZE],
}

impl SealingKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SealingKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealingKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters for KDF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub mem_cost_kib: u32,
    /// Time cost / iterations
    pub time_cost: u32,
    /// Parallelism
    pub parallelism: u32,
}

impl KdfParams {
    /// Default cost for a key pair generation.
    pub fn for_version(version: &UserKeyPairVersion) -> Self {
        match version {
            UserKeyPairVersion::V2 => Self {
                mem_cost_kib: 262144,
                time_cost: 4,
                parallelism: 4,
            },
            _ => Self::default(),
        }
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<KdfSettings> for KdfParams {
    fn from(s: KdfSettings) -> Self {
        Self {
            mem_cost_kib: s.mem_cost_kib,
            time_cost: s.time_cost,
            parallelism: s.parallelism,
        }
    }
}

impl From<KdfParams> for KdfSettings {
    fn from(p: KdfParams) -> Self {
        Self {
            mem_cost_kib: p.mem_cost_kib,
            time_cost: p.time_cost,
            parallelism: p.parallelism,
        }
    }
}

/// Argon2id(passphrase, salt) with the parameters stored in the container.
pub fn derive_sealing_key(
    passphrase: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> Result<SealingKey, CryptoError> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::Internal(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::System(format!("Argon2id KDF failed: {e}")))?;

    Ok(SealingKey { bytes: key })
}

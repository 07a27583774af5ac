//! User key pairs: X25519 identity generation and passphrase sealing
//!
//! The private half is the age identity string (`AGE-SECRET-KEY-1...`),
//! sealed with XChaCha20-Poly1305 under an Argon2id key. The container
//! version string is bound as associated data.
//!
//! ```text
//! sealed = [24-byte nonce][ciphertext + 16-byte tag]
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use nimbus_core::keys::{UserKeyPair, UserKeyPairVersion, UserPrivateKey, UserPublicKey};
use nimbus_core::CryptoError;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroizing;

use crate::kdf::{derive_sealing_key, KdfParams};
use crate::{NONCE_SIZE, SALT_SIZE, TAG_SIZE};

/// A private key opened with its passphrase, ready to unwrap file keys.
pub struct UnlockedPrivateKey {
    version: UserKeyPairVersion,
    identity: age::x25519::Identity,
}

impl UnlockedPrivateKey {
    pub fn version(&self) -> &UserKeyPairVersion {
        &self.version
    }

    pub(crate) fn identity(&self) -> &age::x25519::Identity {
        &self.identity
    }

    /// The matching public key, as it would be published.
    pub fn public_key(&self) -> UserPublicKey {
        UserPublicKey {
            version: self.version.clone(),
            public_key: self.identity.to_public().to_string(),
        }
    }
}

impl std::fmt::Debug for UnlockedPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnlockedPrivateKey")
            .field("version", &self.version)
            .field("identity", &"[REDACTED]")
            .finish()
    }
}

/// Generate a key pair with the default KDF cost for `version`.
pub fn generate_user_key_pair(
    version: UserKeyPairVersion,
    passphrase: &SecretString,
) -> Result<UserKeyPair, CryptoError> {
    let params = KdfParams::for_version(&version);
    generate_user_key_pair_with_params(version, passphrase, &params)
}

pub fn generate_user_key_pair_with_params(
    version: UserKeyPairVersion,
    passphrase: &SecretString,
    params: &KdfParams,
) -> Result<UserKeyPair, CryptoError> {
    if let UserKeyPairVersion::Unsupported(v) = &version {
        return Err(CryptoError::Internal(format!(
            "cannot generate key pair of unknown version {v}"
        )));
    }

    let identity = age::x25519::Identity::generate();
    let public_key = UserPublicKey {
        version: version.clone(),
        public_key: identity.to_public().to_string(),
    };

    let mut salt = vec![0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    let sealing_key = derive_sealing_key(passphrase, &salt, params)?;
    let cipher = XChaCha20Poly1305::new(sealing_key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let secret = identity.to_string();
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: secret.expose_secret().as_bytes(),
                aad: version.as_str().as_bytes(),
            },
        )
        .map_err(|e| CryptoError::System(format!("private key sealing failed: {e}")))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);

    tracing::debug!(version = %version, "generated user key pair");

    Ok(UserKeyPair {
        public_key_container: public_key,
        private_key_container: UserPrivateKey {
            version,
            kdf: (*params).into(),
            salt,
            sealed,
        },
    })
}

/// Open a sealed private key.
///
/// A wrong passphrase surfaces as [`CryptoError::InvalidPassword`]; a
/// container that decrypts but does not hold an identity is a bad file.
pub fn unlock_private_key(
    private_key: &UserPrivateKey,
    passphrase: &SecretString,
) -> Result<UnlockedPrivateKey, CryptoError> {
    if let UserKeyPairVersion::Unsupported(v) = &private_key.version {
        return Err(CryptoError::Internal(format!(
            "unsupported private key version {v}"
        )));
    }
    if private_key.sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::BadFile(format!(
            "sealed private key too short: {} bytes",
            private_key.sealed.len()
        )));
    }

    let params = KdfParams::from(private_key.kdf);
    let sealing_key = derive_sealing_key(passphrase, &private_key.salt, &params)?;
    let cipher = XChaCha20Poly1305::new(sealing_key.as_bytes().into());

    let (nonce_bytes, ciphertext) = private_key.sealed.split_at(NONCE_SIZE);
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                XNonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: private_key.version.as_str().as_bytes(),
                },
            )
            .map_err(|_| CryptoError::InvalidPassword)?,
    );

    let encoded = std::str::from_utf8(&plaintext)
        .map_err(|_| CryptoError::BadFile("private key is not valid UTF-8".into()))?;
    let identity: age::x25519::Identity = encoded
        .parse()
        .map_err(|e: &str| CryptoError::BadFile(format!("private key is malformed: {e}")))?;

    Ok(UnlockedPrivateKey {
        version: private_key.version.clone(),
        identity,
    })
}

/// Check that the private half opens with `passphrase` and matches the public half.
pub fn verify_key_pair(pair: &UserKeyPair, passphrase: &SecretString) -> Result<bool, CryptoError> {
    if pair.public_key_container.version != pair.private_key_container.version {
        return Ok(false);
    }
    let unlocked = match unlock_private_key(&pair.private_key_container, passphrase) {
        Ok(u) => u,
        Err(CryptoError::InvalidPassword) => return Ok(false),
        Err(e) => return Err(e),
    };
    Ok(unlocked.public_key() == pair.public_key_container)
}

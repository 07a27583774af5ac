//! nimbus-crypto: client-side encryption for nimbus transfers
//!
//! File content: AES-256-GCM, processed as a stream so that chunks of any
//! size can be fed through without buffering the whole file. The tag is only
//! known after the last chunk.
//!
//! Key hierarchy:
//! ```text
//! Passphrase ──Argon2id──> sealing key
//!   └── seals User private key (X25519 identity, XChaCha20-Poly1305)
//!         └── unwraps File key (256-bit random + 96-bit IV + GCM tag, age-wrapped)
//!               └── File content: AES-256-GCM stream
//! ```

pub mod codec;
pub mod kdf;
pub mod keypair;
pub mod keys;

pub use codec::{ChunkCodec, CipherState, FileDecryptionCipher, FileEncryptionCipher, FinalBlock};
pub use kdf::{derive_sealing_key, KdfParams, SealingKey};
pub use keypair::{
    generate_user_key_pair, generate_user_key_pair_with_params, unlock_private_key,
    verify_key_pair, UnlockedPrivateKey,
};
pub use keys::{generate_file_key, unwrap_file_key, wrap_file_key, PlainFileKey};

/// Size of an AES-256 or sealing key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a GCM IV (96-bit)
pub const IV_SIZE: usize = 12;

/// Size of a GCM or Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// AES block size
pub const BLOCK_SIZE: usize = 16;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of the Argon2id salt stored with a sealed private key
pub const SALT_SIZE: usize = 16;

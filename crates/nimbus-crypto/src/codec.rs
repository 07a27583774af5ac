//! Streaming AES-256-GCM file cipher.
//!
//! The whole file is one GCM message: chunks are transformed in order with the
//! CTR keystream while GHASH accumulates over the ciphertext, and the tag is
//! produced (or verified) once, when the stream is finalized.
//!
//! ```text
//! J0       = IV (12 bytes) || 0x00000001
//! keystream starts at inc32(J0)
//! tag      = GHASH_H(C || len(A)||len(C)) XOR E_K(J0)     (no AAD)
//! ```
//!
//! The codec knows nothing about chunk sizes; it only requires strict chunk
//! order and a single `finalize`. Output is byte-identical to one-shot
//! AES-256-GCM over the concatenated chunks.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use nimbus_core::CryptoError;
use subtle::ConstantTimeEq;

use crate::keys::PlainFileKey;
use crate::{BLOCK_SIZE, IV_SIZE, TAG_SIZE};

type Aes256Ctr = ctr::Ctr32BE<Aes256>;

/// Longest plaintext a single GCM invocation may cover.
pub const MAX_STREAM_LEN: u64 = (1 << 36) - 32;

/// Whether a codec has consumed data and whether it has been sealed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CipherState {
    pub started: bool,
    pub finished: bool,
}

/// Output of [`ChunkCodec::finalize`]: trailing bytes plus the stream tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalBlock {
    pub bytes: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

/// Stateful per-transfer cipher.
///
/// Chunks must be fed in stream order. `finalize` may be called exactly once;
/// afterwards every call fails with [`CryptoError::Internal`].
pub trait ChunkCodec: Send {
    fn process_chunk(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn finalize(&mut self) -> Result<FinalBlock, CryptoError>;

    fn state(&self) -> CipherState;

    /// Bytes consumed but not yet emitted. Always zero for a CTR-based stream.
    fn unflushed_len(&self) -> usize {
        0
    }
}

struct GcmStream {
    ctr: Aes256Ctr,
    ghash: GHash,
    tag_mask: aes::Block,
    pending: [u8; BLOCK_SIZE],
    pending_len: usize,
    processed: u64,
}

impl GcmStream {
    fn new(key: &[u8], iv: &[u8; IV_SIZE]) -> Result<Self, CryptoError> {
        if key.len() != 32 {
            return Err(CryptoError::Internal(format!(
                "file key must be 32 bytes, got {}",
                key.len()
            )));
        }
        let cipher = <Aes256 as KeyInit>::new(aes::cipher::generic_array::GenericArray::from_slice(key));

        let mut h = aes::Block::default();
        cipher.encrypt_block(&mut h);

        let mut j0 = aes::Block::default();
        j0[..IV_SIZE].copy_from_slice(iv);
        j0[BLOCK_SIZE - 1] = 1;
        let mut tag_mask = j0.clone();
        cipher.encrypt_block(&mut tag_mask);

        let mut counter = j0.clone();
        counter[BLOCK_SIZE - 1] = 2;
        let ctr = <Aes256Ctr as KeyIvInit>::new(
            aes::cipher::generic_array::GenericArray::from_slice(key),
            &counter,
        );

        Ok(Self {
            ctr,
            ghash: <GHash as KeyInit>::new(&h),
            tag_mask,
            pending: [0u8; BLOCK_SIZE],
            pending_len: 0,
            processed: 0,
        })
    }

    fn account(&mut self, n: usize) -> Result<(), CryptoError> {
        let next = self.processed + n as u64;
        if next > MAX_STREAM_LEN {
            return Err(CryptoError::Internal(format!(
                "stream length {next} exceeds AES-GCM limit of {MAX_STREAM_LEN} bytes"
            )));
        }
        self.processed = next;
        Ok(())
    }

    fn apply_keystream(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        self.ctr
            .try_apply_keystream(data)
            .map_err(|e| CryptoError::System(format!("keystream exhausted: {e}")))
    }

    /// Feed ciphertext into GHASH, carrying partial blocks across calls.
    fn absorb(&mut self, mut data: &[u8]) {
        if self.pending_len > 0 {
            let take = (BLOCK_SIZE - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];
            if self.pending_len < BLOCK_SIZE {
                return;
            }
            let block = ghash::Block::clone_from_slice(&self.pending);
            self.ghash.update(&[block]);
            self.pending_len = 0;
        }

        let mut blocks = data.chunks_exact(BLOCK_SIZE);
        for b in &mut blocks {
            self.ghash.update(&[ghash::Block::clone_from_slice(b)]);
        }
        let rest = blocks.remainder();
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn seal(mut self) -> [u8; TAG_SIZE] {
        if self.pending_len > 0 {
            self.ghash.update_padded(&self.pending[..self.pending_len]);
        }
        let mut lengths = ghash::Block::default();
        lengths[8..].copy_from_slice(&(self.processed * 8).to_be_bytes());
        self.ghash.update(&[lengths]);

        let s = self.ghash.finalize();
        let mut tag = [0u8; TAG_SIZE];
        for (i, t) in tag.iter_mut().enumerate() {
            *t = s[i] ^ self.tag_mask[i];
        }
        tag
    }
}

fn finalized() -> CryptoError {
    CryptoError::Internal("cipher already finalized".into())
}

/// Encrypting side of the file cipher.
pub struct FileEncryptionCipher {
    stream: Option<GcmStream>,
    state: CipherState,
}

impl FileEncryptionCipher {
    pub fn new(key: &PlainFileKey) -> Result<Self, CryptoError> {
        Ok(Self {
            stream: Some(GcmStream::new(key.key_bytes(), key.iv())?),
            state: CipherState::default(),
        })
    }
}

impl ChunkCodec for FileEncryptionCipher {
    fn process_chunk(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let stream = self.stream.as_mut().ok_or_else(finalized)?;
        stream.account(chunk.len())?;
        let mut out = chunk.to_vec();
        stream.apply_keystream(&mut out)?;
        stream.absorb(&out);
        self.state.started = true;
        Ok(out)
    }

    fn finalize(&mut self) -> Result<FinalBlock, CryptoError> {
        let stream = self.stream.take().ok_or_else(finalized)?;
        let tag = stream.seal();
        self.state = CipherState {
            started: true,
            finished: true,
        };
        Ok(FinalBlock {
            bytes: Vec::new(),
            tag,
        })
    }

    fn state(&self) -> CipherState {
        self.state
    }
}

/// Decrypting side of the file cipher; verifies the key's tag on finalize.
pub struct FileDecryptionCipher {
    stream: Option<GcmStream>,
    expected_tag: [u8; TAG_SIZE],
    state: CipherState,
}

impl FileDecryptionCipher {
    /// Fails with `BadFile` when the key carries no tag to verify against.
    pub fn new(key: &PlainFileKey) -> Result<Self, CryptoError> {
        let expected_tag = key.tag().ok_or_else(|| {
            CryptoError::BadFile("file key carries no authentication tag".into())
        })?;
        Ok(Self {
            stream: Some(GcmStream::new(key.key_bytes(), key.iv())?),
            expected_tag,
            state: CipherState::default(),
        })
    }
}

impl ChunkCodec for FileDecryptionCipher {
    fn process_chunk(&mut self, chunk: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let stream = self.stream.as_mut().ok_or_else(finalized)?;
        stream.account(chunk.len())?;
        stream.absorb(chunk);
        let mut out = chunk.to_vec();
        stream.apply_keystream(&mut out)?;
        self.state.started = true;
        Ok(out)
    }

    fn finalize(&mut self) -> Result<FinalBlock, CryptoError> {
        let stream = self.stream.take().ok_or_else(finalized)?;
        let tag = stream.seal();
        self.state = CipherState {
            started: true,
            finished: true,
        };
        if bool::from(tag.ct_eq(&self.expected_tag)) {
            Ok(FinalBlock {
                bytes: Vec::new(),
                tag,
            })
        } else {
            Err(CryptoError::BadFile("authentication tag mismatch".into()))
        }
    }

    fn state(&self) -> CipherState {
        self.state
    }
}

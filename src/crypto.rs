// Crypto Module - AES-256-CBC Primitives
// =======================================================
// This module contains the cipher layer shared by the encryptor and the
// decryptor: AES-256 in CBC mode with PKCS#7 padding, a 16-byte random IV per
// file, and a 32-byte master key.
//
// Both directions are incremental. Callers feed arbitrary chunks through
// `update` and close with `finalize`, so files of any size are processed
// with a bounded buffer.
//
// CBC carries no authentication tag. A wrong key or a damaged final block
// shows up as a padding error, but a flipped byte in an earlier block can
// decrypt to altered plaintext without any error. The mode is kept because
// existing attachments were written with it.

use crate::config::MasterKey;
use crate::error::{Result, VaultError};
use cbc::cipher::{
    block_padding::Pkcs7,
    generic_array::GenericArray,
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};
use rand::{rngs::OsRng, RngCore};
use std::fmt;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block size, and therefore the IV size, in bytes.
pub const BLOCK_SIZE: usize = 16;
pub const IV_SIZE: usize = BLOCK_SIZE;
/// Length of an IV written as lowercase hex.
pub const IV_HEX_LEN: usize = IV_SIZE * 2;

/// Initialization vector of a single encrypted file.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Iv([u8; IV_SIZE]);

impl Iv {
    /// Draw a fresh IV from the operating system's CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; IV_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse exactly 32 lowercase hex characters.
    pub fn from_hex(value: &str) -> Option<Self> {
        if value.len() != IV_HEX_LEN
            || !value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return None;
        }
        let mut bytes = [0u8; IV_SIZE];
        hex::decode_to_slice(value, &mut bytes).ok()?;
        Some(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; IV_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Iv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iv({})", self.to_hex())
    }
}

/// Size of the ciphertext produced for `plaintext_len` bytes. PKCS#7 always
/// adds between 1 and 16 bytes.
pub fn ciphertext_len(plaintext_len: u64) -> u64 {
    (plaintext_len / BLOCK_SIZE as u64 + 1) * BLOCK_SIZE as u64
}

/// Streaming CBC encryption.
pub struct CbcEncryptor {
    inner: Aes256CbcEnc,
    // Input bytes that do not yet fill a whole block. Always < BLOCK_SIZE.
    pending: Vec<u8>,
}

impl CbcEncryptor {
    pub fn new(key: &MasterKey, iv: &Iv) -> Self {
        let inner = Aes256CbcEnc::new(
            GenericArray::from_slice(key.as_bytes()),
            GenericArray::from_slice(iv.as_bytes()),
        );
        Self {
            inner,
            pending: Vec::with_capacity(BLOCK_SIZE),
        }
    }

    /// Encrypt every complete block available so far.
    pub fn update(&mut self, input: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(input);
        let full = self.pending.len() - self.pending.len() % BLOCK_SIZE;
        let mut output: Vec<u8> = self.pending.drain(..full).collect();
        for block in output.chunks_exact_mut(BLOCK_SIZE) {
            self.inner
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        output
    }

    /// Pad the remaining bytes and emit the final block.
    pub fn finalize(mut self) -> Vec<u8> {
        let padding = BLOCK_SIZE - self.pending.len();
        // PKCS#7: each padding byte holds the padding length.
        self.pending.resize(BLOCK_SIZE, padding as u8);
        let mut block = std::mem::take(&mut self.pending);
        self.inner
            .encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
        block
    }
}

/// Streaming CBC decryption.
///
/// The last complete block is always held back until `finalize`, since only
/// then is it known to carry the padding.
pub struct CbcDecryptor {
    inner: Aes256CbcDec,
    pending: Vec<u8>,
}

impl CbcDecryptor {
    pub fn new(key: &MasterKey, iv: &Iv) -> Self {
        let inner = Aes256CbcDec::new(
            GenericArray::from_slice(key.as_bytes()),
            GenericArray::from_slice(iv.as_bytes()),
        );
        Self {
            inner,
            pending: Vec::with_capacity(BLOCK_SIZE * 2),
        }
    }

    pub fn update(&mut self, input: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(input);
        let keep = match self.pending.len() % BLOCK_SIZE {
            0 => BLOCK_SIZE.min(self.pending.len()),
            partial => partial,
        };
        let ready = self.pending.len() - keep;
        let mut output: Vec<u8> = self.pending.drain(..ready).collect();
        for block in output.chunks_exact_mut(BLOCK_SIZE) {
            self.inner
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        output
    }

    /// Decrypt the held-back block and strip its padding.
    pub fn finalize(mut self) -> Result<Vec<u8>> {
        if self.pending.len() != BLOCK_SIZE {
            return Err(VaultError::Decryption(format!(
                "ciphertext length is not a positive multiple of {BLOCK_SIZE} bytes"
            )));
        }
        let plaintext = self
            .inner
            .decrypt_padded_mut::<Pkcs7>(&mut self.pending)
            .map_err(|_| VaultError::Decryption("invalid padding, wrong key or corrupted file".into()))?;
        Ok(plaintext.to_vec())
    }
}

/// Encrypt a whole buffer in one call.
pub fn encrypt_bytes(key: &MasterKey, iv: &Iv, plaintext: &[u8]) -> Vec<u8> {
    let mut cipher = CbcEncryptor::new(key, iv);
    let mut output = cipher.update(plaintext);
    output.extend(cipher.finalize());
    output
}

/// Decrypt a whole buffer in one call.
pub fn decrypt_bytes(key: &MasterKey, iv: &Iv, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let mut cipher = CbcDecryptor::new(key, iv);
    let mut output = cipher.update(ciphertext);
    output.extend(cipher.finalize()?);
    Ok(output)
}

/*!
 * Streaming encryption for transfer payloads
 *
 * AES-256-CBC with PKCS#7 padding, processed in fixed-size windows so memory
 * use is bounded by the window, not the object. Keys are never used directly:
 * each object's key and IV are derived with HKDF-SHA256 from the master
 * secret and a public identifier, so leaking one object's key exposes nothing
 * else.
 *
 * The logical part a key covers is one encrypted object, identified as
 * `"<remote key>#<suffix>"`. Multipart uploads split the finished ciphertext
 * into byte ranges, and those ranges are not independently decryptable: a
 * CBC chain runs across part boundaries and only the last part carries
 * padding. Ranged downloads rely on this, since they reassemble the
 * ciphertext and decrypt it in one pass. The suffix is regenerated whenever
 * an object is sent again from scratch, so a key and IV pair is never reused
 * for different plaintext.
 *
 * Padding adds 1..=16 bytes on the final write; encrypted sizes are therefore
 * validated against [`padding_range`], never compared for equality.
 */

use aes::Aes256;
use cbc::cipher::{
    block_padding::Pkcs7, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut,
    KeyIvInit,
};
use hkdf::Hkdf;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::io::{self, Read, Write};
use std::ops::RangeInclusive;
use zeroize::{Zeroize, Zeroizing};

use crate::error::{ParsecError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Cipher block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Derived key length in bytes
pub const KEY_LEN: usize = 32;

/// Default processing window
pub const DEFAULT_WINDOW: usize = 16 * 1024;

const MIN_SECRET_LEN: usize = 16;
const KDF_SALT: &[u8] = b"parsec/streaming-cipher/v1";

/// Per-transfer master secret; never persisted by the engine
pub struct MasterSecret(Zeroizing<Vec<u8>>);

impl MasterSecret {
    /// Wrap existing secret material (at least 16 bytes)
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = Zeroizing::new(bytes.into());
        if bytes.len() < MIN_SECRET_LEN {
            return Err(ParsecError::Config(format!(
                "master secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }
        Ok(Self(bytes))
    }

    /// Generate a fresh random 32-byte secret
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new(vec![0u8; KEY_LEN]);
        rand::rng().fill(&mut bytes[..]);
        Self(bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret(<redacted>)")
    }
}

/// Key and IV derived for one encrypted object
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKey {
    key: [u8; KEY_LEN],
    iv: [u8; BLOCK_SIZE],
}

impl DerivedKey {
    /// Rebuild from persisted parameters
    pub fn from_params(params: &EncryptionParams) -> Result<Self> {
        let key = hex::decode(&params.key_hex)
            .map_err(|e| ParsecError::Cipher(format!("invalid key encoding: {}", e)))?;
        let iv = hex::decode(&params.iv_hex)
            .map_err(|e| ParsecError::Cipher(format!("invalid IV encoding: {}", e)))?;

        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| ParsecError::Cipher("derived key must be 32 bytes".into()))?;
        let iv: [u8; BLOCK_SIZE] = iv
            .try_into()
            .map_err(|_| ParsecError::Cipher("IV must be 16 bytes".into()))?;

        Ok(Self { key, iv })
    }

    /// Persistable form (hex)
    pub fn to_params(&self) -> EncryptionParams {
        EncryptionParams {
            key_hex: hex::encode(self.key),
            iv_hex: hex::encode(self.iv),
        }
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Derived key material as stored in resume state and remote metadata
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParams {
    pub key_hex: String,
    pub iv_hex: String,
}

impl fmt::Debug for EncryptionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionParams(<redacted>)")
    }
}

/// Derive the key and IV for `identifier` from the master secret
pub fn derive_key(master: &MasterSecret, identifier: &str) -> Result<DerivedKey> {
    let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), master.as_bytes());
    let mut okm = Zeroizing::new([0u8; KEY_LEN + BLOCK_SIZE]);
    hk.expand(identifier.as_bytes(), &mut okm[..])
        .map_err(|e| ParsecError::Cipher(format!("key derivation failed: {}", e)))?;

    let mut key = [0u8; KEY_LEN];
    let mut iv = [0u8; BLOCK_SIZE];
    key.copy_from_slice(&okm[..KEY_LEN]);
    iv.copy_from_slice(&okm[KEY_LEN..]);
    Ok(DerivedKey { key, iv })
}

/// Random public suffix that keeps retried uploads from reusing a key/IV pair
pub fn random_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Exact ciphertext length produced for `plaintext_len` bytes
pub fn encrypted_len(plaintext_len: u64) -> u64 {
    (plaintext_len / BLOCK_SIZE as u64 + 1) * BLOCK_SIZE as u64
}

/// Accepted ciphertext sizes for a plaintext of `plaintext_len` bytes
pub fn padding_range(plaintext_len: u64) -> RangeInclusive<u64> {
    plaintext_len.saturating_add(1)..=plaintext_len.saturating_add(BLOCK_SIZE as u64)
}

/// Check an encrypted size against the padding range
pub fn is_valid_encrypted_size(plaintext_len: u64, encrypted_len: u64) -> bool {
    padding_range(plaintext_len).contains(&encrypted_len)
}

/// Byte counts of one cipher pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CipherStats {
    pub plaintext_bytes: u64,
    pub ciphertext_bytes: u64,
}

/// Windowed AES-256-CBC transformer
pub struct StreamingCipher {
    key: DerivedKey,
    window: usize,
}

impl StreamingCipher {
    /// Create a cipher processing `window` bytes at a time
    pub fn new(key: DerivedKey, window: usize) -> Result<Self> {
        if window == 0 || window % BLOCK_SIZE != 0 {
            return Err(ParsecError::Config(format!(
                "cipher window must be a positive multiple of {}",
                BLOCK_SIZE
            )));
        }
        Ok(Self { key, window })
    }

    /// Encrypt `reader` into `writer`
    ///
    /// `observer` sees every plaintext window before it is encrypted (used for
    /// checksums, progress and cancellation; returning an error aborts).
    pub fn encrypt<R, W, F>(
        &self,
        mut reader: R,
        mut writer: W,
        mut observer: F,
    ) -> Result<CipherStats>
    where
        R: Read,
        W: Write,
        F: FnMut(&[u8]) -> Result<()>,
    {
        let mut enc = Aes256CbcEnc::new_from_slices(&self.key.key, &self.key.iv)
            .map_err(|e| ParsecError::Cipher(e.to_string()))?;
        let mut buf = vec![0u8; self.window];
        let mut stats = CipherStats::default();

        loop {
            let n = fill(&mut reader, &mut buf)?;
            observer(&buf[..n])?;
            stats.plaintext_bytes += n as u64;

            if n == self.window {
                for block in buf.chunks_exact_mut(BLOCK_SIZE) {
                    enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                writer.write_all(&buf)?;
                stats.ciphertext_bytes += n as u64;
                continue;
            }

            // Final window: whole blocks, then the padded tail block
            let full = n - n % BLOCK_SIZE;
            for block in buf[..full].chunks_exact_mut(BLOCK_SIZE) {
                enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            let tail_len = enc
                .encrypt_padded_mut::<Pkcs7>(&mut buf[full..full + BLOCK_SIZE], n - full)
                .map_err(|_| ParsecError::Cipher("padding failed".into()))?
                .len();
            writer.write_all(&buf[..full + tail_len])?;
            stats.ciphertext_bytes += (full + tail_len) as u64;
            break;
        }

        writer.flush()?;
        Ok(stats)
    }

    /// Decrypt `reader` into `writer`
    ///
    /// The last ciphertext block is held back until end of input so the
    /// padding can be stripped. `observer` sees every plaintext window after
    /// decryption.
    pub fn decrypt<R, W, F>(
        &self,
        mut reader: R,
        mut writer: W,
        mut observer: F,
    ) -> Result<CipherStats>
    where
        R: Read,
        W: Write,
        F: FnMut(&[u8]) -> Result<()>,
    {
        let mut dec = Aes256CbcDec::new_from_slices(&self.key.key, &self.key.iv)
            .map_err(|e| ParsecError::Cipher(e.to_string()))?;
        let mut buf = vec![0u8; self.window + BLOCK_SIZE];
        let mut held = 0usize;
        let mut stats = CipherStats::default();

        loop {
            let n = fill(&mut reader, &mut buf[held..held + self.window])?;
            stats.ciphertext_bytes += n as u64;
            let available = held + n;

            if n < self.window {
                if available == 0 || available % BLOCK_SIZE != 0 {
                    return Err(ParsecError::Cipher(format!(
                        "ciphertext length {} is not a positive multiple of {}",
                        stats.ciphertext_bytes, BLOCK_SIZE
                    )));
                }
                let body = available - BLOCK_SIZE;
                for block in buf[..body].chunks_exact_mut(BLOCK_SIZE) {
                    dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                let tail_len = dec
                    .decrypt_padded_mut::<Pkcs7>(&mut buf[body..available])
                    .map_err(|_| ParsecError::Cipher("invalid padding".into()))?
                    .len();

                let plain = &buf[..body + tail_len];
                observer(plain)?;
                writer.write_all(plain)?;
                stats.plaintext_bytes += plain.len() as u64;
                break;
            }

            let body = available - BLOCK_SIZE;
            for block in buf[..body].chunks_exact_mut(BLOCK_SIZE) {
                dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            observer(&buf[..body])?;
            writer.write_all(&buf[..body])?;
            stats.plaintext_bytes += body as u64;

            buf.copy_within(body..available, 0);
            held = BLOCK_SIZE;
        }

        writer.flush()?;
        Ok(stats)
    }
}

/// Read until `buf` is full or the reader is exhausted
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

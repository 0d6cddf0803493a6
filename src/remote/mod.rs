/*!
 * Remote platform interfaces
 *
 * The engine talks to the platform through two traits:
 * [`CredentialIssuer`] grants storage leases scoped to one backend, and
 * [`ObjectStore`] performs object I/O with such a lease (single-shot puts,
 * multipart sessions with an ordered commit, ranged reads). Every stored
 * object carries an integrity token (`etag`) that changes whenever its
 * content changes.
 */

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

use crate::credentials::CredentialLease;
use crate::crypto::EncryptionParams;
use crate::error::{ParsecError, Result};

pub mod memory;
#[cfg(feature = "s3-native")]
pub mod s3;

pub use memory::{FaultKind, FaultOp, MemoryPlatform, PlatformCounters};

/// Physical storage an object lives in
///
/// One account may hold objects in several backends, so leases are scoped to
/// this, not to the account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageContext {
    /// Backend discriminator, e.g. `s3` or `memory`
    pub backend: String,
    /// Bucket or container
    pub container: String,
}

impl StorageContext {
    pub fn new(backend: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            container: container.into(),
        }
    }
}

impl fmt::Display for StorageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.backend, self.container)
    }
}

/// Engine metadata stored alongside each object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub plaintext_size: u64,
    /// SHA-512 hex of the plaintext
    pub plaintext_checksum: Option<String>,
    /// Derived key material; `None` for unencrypted objects
    pub encryption: Option<EncryptionParams>,
    pub suffix: Option<String>,
}

const META_PLAINTEXT_SIZE: &str = "parsec-plaintext-size";
const META_CHECKSUM: &str = "parsec-sha512";
const META_KEY: &str = "parsec-key";
const META_IV: &str = "parsec-iv";
const META_SUFFIX: &str = "parsec-suffix";

impl ObjectMetadata {
    /// Flatten into string pairs for backends with user metadata headers
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(
            META_PLAINTEXT_SIZE.to_string(),
            self.plaintext_size.to_string(),
        );
        if let Some(checksum) = &self.plaintext_checksum {
            map.insert(META_CHECKSUM.to_string(), checksum.clone());
        }
        if let Some(params) = &self.encryption {
            map.insert(META_KEY.to_string(), params.key_hex.clone());
            map.insert(META_IV.to_string(), params.iv_hex.clone());
        }
        if let Some(suffix) = &self.suffix {
            map.insert(META_SUFFIX.to_string(), suffix.clone());
        }
        map
    }

    /// Rebuild from string pairs; `stored_size` is used when no plaintext size was recorded
    pub fn from_map(map: &HashMap<String, String>, stored_size: u64) -> Result<Self> {
        let plaintext_size = match map.get(META_PLAINTEXT_SIZE) {
            Some(value) => value.parse().map_err(|_| {
                ParsecError::Validation(format!(
                    "invalid {} value '{}'",
                    META_PLAINTEXT_SIZE, value
                ))
            })?,
            None => stored_size,
        };

        let encryption = match (map.get(META_KEY), map.get(META_IV)) {
            (Some(key_hex), Some(iv_hex)) => Some(EncryptionParams {
                key_hex: key_hex.clone(),
                iv_hex: iv_hex.clone(),
            }),
            (None, None) => None,
            _ => {
                return Err(ParsecError::Validation(
                    "object metadata has a key without an IV or vice versa".into(),
                ))
            }
        };

        Ok(Self {
            plaintext_size,
            plaintext_checksum: map.get(META_CHECKSUM).cloned(),
            encryption,
            suffix: map.get(META_SUFFIX).cloned(),
        })
    }
}

/// Platform view of a stored object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    /// Bytes stored (ciphertext size for encrypted objects)
    pub size: u64,
    /// Integrity token; changes whenever content changes
    pub etag: String,
    pub storage: StorageContext,
    pub metadata: ObjectMetadata,
}

/// Part accepted by a multipart session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    /// 1-based, as on the wire
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// Issues storage credentials for one backend
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, context: &StorageContext) -> Result<CredentialLease>;
}

/// Object I/O against the platform's storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Storage a new object under `key` would be written to
    async fn upload_target(&self, key: &str) -> Result<StorageContext>;

    /// Platform metadata of an existing object (`NotFound` if absent)
    async fn describe(&self, key: &str) -> Result<RemoteObject>;

    /// Duplicate check
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Single-shot write
    async fn put_object(
        &self,
        lease: &CredentialLease,
        key: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
    ) -> Result<RemoteObject>;

    /// Open a multipart session, returning its id; `metadata` is attached on commit
    async fn create_upload(
        &self,
        lease: &CredentialLease,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> Result<String>;

    /// Write one part, returning its etag
    async fn upload_part(
        &self,
        lease: &CredentialLease,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String>;

    /// Parts the session has accepted so far
    async fn list_parts(
        &self,
        lease: &CredentialLease,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>>;

    /// Commit the session; `parts` is ordered by part number
    async fn complete_upload(
        &self,
        lease: &CredentialLease,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<RemoteObject>;

    async fn abort_upload(&self, lease: &CredentialLease, key: &str, upload_id: &str)
        -> Result<()>;

    /// Read `range` of the stored bytes
    async fn get_range(
        &self,
        lease: &CredentialLease,
        key: &str,
        range: Range<u64>,
    ) -> Result<Bytes>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_map_roundtrip() {
        let metadata = ObjectMetadata {
            plaintext_size: 42,
            plaintext_checksum: Some("ab".repeat(64)),
            encryption: Some(EncryptionParams {
                key_hex: "11".repeat(32),
                iv_hex: "22".repeat(16),
            }),
            suffix: Some("00ff00ff00ff00ff".into()),
        };
        let map = metadata.to_map();
        assert_eq!(ObjectMetadata::from_map(&map, 64).unwrap(), metadata);
    }

    #[test]
    fn test_foreign_object_metadata() {
        // Objects written by other tools carry no engine metadata
        let metadata = ObjectMetadata::from_map(&HashMap::new(), 1234).unwrap();
        assert_eq!(metadata.plaintext_size, 1234);
        assert!(metadata.encryption.is_none());
        assert!(metadata.plaintext_checksum.is_none());
    }

    #[test]
    fn test_half_key_material_rejected() {
        let mut map = HashMap::new();
        map.insert(META_KEY.to_string(), "11".repeat(32));
        assert!(ObjectMetadata::from_map(&map, 0).is_err());
    }
}

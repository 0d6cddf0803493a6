//! S3-compatible backend (feature `s3-native`)
//!
//! One bucket, addressed with static platform keys for metadata calls. The
//! store doubles as the credential issuer: leases wrap the configured keys
//! with a bounded lifetime, and every object call builds its SDK client from
//! the lease it was handed, so revocation and renewal flow through the
//! engine's credential manager like with any other backend.
//!
//! # Example
//!
//! ```no_run
//! use parsec::remote::s3::{S3Settings, S3Store};
//!
//! # async fn example() -> parsec::Result<()> {
//! let settings = S3Settings::new("simulation-jobs", "AKIA...", "secret")
//!     .with_region("eu-west-1")
//!     .with_endpoint("http://localhost:9000");
//! let store = S3Store::connect(settings).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::debug;

use super::{
    CompletedPart, CredentialIssuer, ObjectMetadata, ObjectStore, RemoteObject, StorageContext,
};
use crate::credentials::CredentialLease;
use crate::error::{ParsecError, Result};

const BACKEND: &str = "s3";

/// Connection settings for one bucket
#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: Option<String>,
    /// Custom endpoint (MinIO, LocalStack, ...)
    pub endpoint: Option<String>,
    pub force_path_style: bool,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    /// Lifetime of issued leases
    pub lease_lifetime: Duration,
}

impl S3Settings {
    pub fn new(
        bucket: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            region: None,
            endpoint: None,
            force_path_style: false,
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            lease_lifetime: Duration::from_secs(3600),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Custom endpoint; enables path-style addressing
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self.force_path_style = true;
        self
    }
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// Object store backed by an S3-compatible bucket
pub struct S3Store {
    settings: S3Settings,
    base: aws_config::SdkConfig,
    admin: Client,
    serial: AtomicU64,
}

impl S3Store {
    /// Load the SDK configuration and build the metadata client
    pub async fn connect(settings: S3Settings) -> Result<Self> {
        if settings.bucket.is_empty() {
            return Err(ParsecError::Config("s3 bucket name is empty".into()));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &settings.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let base = loader.load().await;

        let admin_credentials = Credentials::new(
            settings.access_key_id.clone(),
            settings.secret_access_key.clone(),
            settings.session_token.clone(),
            None,
            "parsec-platform",
        );
        let admin = build_client(&base, &settings, admin_credentials);

        Ok(Self {
            settings,
            base,
            admin,
            serial: AtomicU64::new(1),
        })
    }

    fn storage(&self) -> StorageContext {
        StorageContext::new(BACKEND, self.settings.bucket.clone())
    }

    fn client_for(&self, lease: &CredentialLease) -> Result<Client> {
        if lease.context != self.storage() {
            return Err(ParsecError::AuthExpired(format!(
                "lease for {} cannot access {}",
                lease.context,
                self.storage()
            )));
        }
        let expiry = SystemTime::from(lease.expires_at);
        let credentials = Credentials::new(
            lease.access_key_id.clone(),
            lease.secret_access_key.clone(),
            lease.session_token.clone(),
            Some(expiry),
            "parsec-lease",
        );
        Ok(build_client(&self.base, &self.settings, credentials))
    }

    async fn head(&self, key: &str) -> Result<RemoteObject> {
        let response = self
            .admin
            .head_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_sdk_error("head_object", key, e))?;

        let size = response.content_length().unwrap_or(0).max(0) as u64;
        let etag = response
            .e_tag()
            .map(|e| e.trim_matches('"').to_string())
            .ok_or_else(|| ParsecError::Validation(format!("no ETag returned for {}", key)))?;
        let metadata = ObjectMetadata::from_map(
            response.metadata().unwrap_or(&HashMap::new()),
            size,
        )?;

        Ok(RemoteObject {
            key: key.to_string(),
            size,
            etag,
            storage: self.storage(),
            metadata,
        })
    }
}

fn build_client(
    base: &aws_config::SdkConfig,
    settings: &S3Settings,
    credentials: Credentials,
) -> Client {
    let mut builder = aws_sdk_s3::config::Builder::from(base).credentials_provider(credentials);
    if let Some(endpoint) = &settings.endpoint {
        builder = builder.endpoint_url(endpoint);
    }
    if settings.force_path_style {
        builder = builder.force_path_style(true);
    }
    Client::from_conf(builder.build())
}

/// Classify an SDK failure into the engine's taxonomy
fn map_sdk_error<E>(operation: &str, key: &str, err: SdkError<E>) -> ParsecError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ParsecError::TransientNetwork(format!("{} {}: {}", operation, key, err))
        }
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            let code = context.err().code().unwrap_or("Unknown").to_string();
            let message = context.err().message().unwrap_or("").to_string();
            let text = format!("{} {}: {} ({}) {}", operation, key, code, status, message);

            match (code.as_str(), status) {
                ("SlowDown" | "Throttling" | "ThrottlingException" | "RequestLimitExceeded", _)
                | (_, 429) => ParsecError::Throttled {
                    message: text,
                    retry_after: None,
                },
                ("ExpiredToken" | "InvalidAccessKeyId" | "InvalidToken" | "AccessDenied"
                | "SignatureDoesNotMatch", _)
                | (_, 401 | 403) => ParsecError::AuthExpired(text),
                ("NoSuchKey" | "NoSuchUpload" | "NotFound", _) | (_, 404) => {
                    ParsecError::NotFound(format!("{} ({})", key, code))
                }
                ("RequestTimeout" | "InternalError" | "ServiceUnavailable", _) => {
                    ParsecError::TransientNetwork(text)
                }
                (_, s) if s >= 500 => ParsecError::TransientNetwork(text),
                _ => ParsecError::Validation(text),
            }
        }
        _ => ParsecError::Validation(format!("{} {}: {}", operation, key, err)),
    }
}

#[async_trait]
impl CredentialIssuer for S3Store {
    async fn issue(&self, context: &StorageContext) -> Result<CredentialLease> {
        if context != &self.storage() {
            return Err(ParsecError::Validation(format!(
                "this issuer only serves {}, not {}",
                self.storage(),
                context
            )));
        }
        let lifetime = chrono::Duration::from_std(self.settings.lease_lifetime)
            .map_err(|e| ParsecError::Config(format!("lease lifetime: {}", e)))?;

        Ok(CredentialLease {
            context: context.clone(),
            access_key_id: self.settings.access_key_id.clone(),
            secret_access_key: self.settings.secret_access_key.clone(),
            session_token: self.settings.session_token.clone(),
            expires_at: Utc::now() + lifetime,
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn upload_target(&self, _key: &str) -> Result<StorageContext> {
        Ok(self.storage())
    }

    async fn describe(&self, key: &str) -> Result<RemoteObject> {
        self.head(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(ParsecError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn put_object(
        &self,
        lease: &CredentialLease,
        key: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
    ) -> Result<RemoteObject> {
        let client = self.client_for(lease)?;
        client
            .put_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .set_metadata(Some(metadata.to_map()))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error("put_object", key, e))?;

        self.head(key).await
    }

    async fn create_upload(
        &self,
        lease: &CredentialLease,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> Result<String> {
        let client = self.client_for(lease)?;
        let response = client
            .create_multipart_upload()
            .bucket(&self.settings.bucket)
            .key(key)
            .set_metadata(Some(metadata.to_map()))
            .send()
            .await
            .map_err(|e| map_sdk_error("create_multipart_upload", key, e))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| ParsecError::Validation(format!("no upload id returned for {}", key)))
    }

    async fn upload_part(
        &self,
        lease: &CredentialLease,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let client = self.client_for(lease)?;
        let part = i32::try_from(part_number).map_err(|_| {
            ParsecError::Validation(format!("part number {} too large", part_number))
        })?;

        let response = client
            .upload_part()
            .bucket(&self.settings.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| map_sdk_error("upload_part", key, e))?;

        response
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| ParsecError::Validation(format!("no ETag returned for part {}", part)))
    }

    async fn list_parts(
        &self,
        lease: &CredentialLease,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>> {
        let client = self.client_for(lease)?;
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let response = client
                .list_parts()
                .bucket(&self.settings.bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.clone())
                .send()
                .await
                .map_err(|e| map_sdk_error("list_parts", key, e))?;

            parts.extend(response.parts().iter().filter_map(|p| {
                Some(CompletedPart {
                    part_number: u32::try_from(p.part_number()?).ok()?,
                    etag: p.e_tag()?.to_string(),
                    size: u64::try_from(p.size()?).ok()?,
                })
            }));

            if response.is_truncated() == Some(true) {
                marker = response.next_part_number_marker().map(str::to_string);
                if marker.is_some() {
                    continue;
                }
            }
            break;
        }

        debug!(key, upload_id, parts = parts.len(), "listed uploaded parts");
        Ok(parts)
    }

    async fn complete_upload(
        &self,
        lease: &CredentialLease,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<RemoteObject> {
        let client = self.client_for(lease)?;
        let completed: Vec<S3CompletedPart> = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        client
            .complete_multipart_upload()
            .bucket(&self.settings.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error("complete_multipart_upload", key, e))?;

        self.head(key).await
    }

    async fn abort_upload(
        &self,
        lease: &CredentialLease,
        key: &str,
        upload_id: &str,
    ) -> Result<()> {
        let client = self.client_for(lease)?;
        client
            .abort_multipart_upload()
            .bucket(&self.settings.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("abort_multipart_upload", key, e))?;
        Ok(())
    }

    async fn get_range(
        &self,
        lease: &CredentialLease,
        key: &str,
        range: Range<u64>,
    ) -> Result<Bytes> {
        if range.is_empty() {
            return Ok(Bytes::new());
        }
        let client = self.client_for(lease)?;
        let response = client
            .get_object()
            .bucket(&self.settings.bucket)
            .key(key)
            .range(format!("bytes={}-{}", range.start, range.end - 1))
            .send()
            .await
            .map_err(|e| map_sdk_error("get_object", key, e))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| ParsecError::TransientNetwork(format!("get_object {}: {}", key, e)))?;
        Ok(body.into_bytes())
    }
}

//! In-process platform: object store and credential issuer in one
//!
//! Behaves like a small S3-compatible service with a credential broker in
//! front of it: leases expire, can be revoked, and are scoped to one storage
//! context. Faults can be injected per operation and every operation is
//! counted, which makes it the backbone of the engine's tests. It is also
//! handy for dry runs of tooling built on the manager.
//!
//! # Example
//!
//! ```
//! use parsec::remote::{FaultKind, FaultOp, MemoryPlatform};
//!
//! let platform = MemoryPlatform::new();
//! // Third part write fails twice with a connection reset, then succeeds
//! platform.inject(FaultOp::UploadPart(3), FaultKind::Transient, 2);
//! assert_eq!(platform.counters().part_writes, 0);
//! ```

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    CompletedPart, CredentialIssuer, ObjectMetadata, ObjectStore, RemoteObject, StorageContext,
};
use crate::credentials::CredentialLease;
use crate::error::{ParsecError, Result};

/// Operation a fault applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Describe,
    Exists,
    Put,
    CreateUpload,
    /// One specific 1-based part number
    UploadPart(u32),
    AnyUploadPart,
    ListParts,
    Complete,
    /// Ranged read starting at this byte offset
    GetRange(u64),
    AnyGetRange,
    Issue,
}

impl FaultOp {
    fn matches(self, actual: FaultOp) -> bool {
        match (self, actual) {
            (FaultOp::AnyUploadPart, FaultOp::UploadPart(_)) => true,
            (FaultOp::AnyGetRange, FaultOp::GetRange(_)) => true,
            (expected, actual) => expected == actual,
        }
    }
}

/// Error an injected fault produces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Connection reset
    Transient,
    /// Slow-down response, optionally with a retry-after hint
    Throttle(Option<Duration>),
    /// Credentials rejected
    AuthExpired,
    /// Non-retryable rejection
    Fatal,
}

impl FaultKind {
    fn to_error(self, op: FaultOp) -> ParsecError {
        match self {
            FaultKind::Transient => {
                ParsecError::TransientNetwork(format!("injected connection reset during {:?}", op))
            }
            FaultKind::Throttle(retry_after) => ParsecError::Throttled {
                message: format!("injected slow down during {:?}", op),
                retry_after,
            },
            FaultKind::AuthExpired => {
                ParsecError::AuthExpired(format!("injected credential rejection during {:?}", op))
            }
            FaultKind::Fatal => {
                ParsecError::Validation(format!("injected fatal failure during {:?}", op))
            }
        }
    }
}

#[derive(Debug)]
struct Fault {
    op: FaultOp,
    kind: FaultKind,
    remaining: u32,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    storage: StorageContext,
    metadata: ObjectMetadata,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    metadata: ObjectMetadata,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct PlatformState {
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    faults: Vec<Fault>,
    part_log: Vec<u32>,
    next_upload: u64,
}

/// Snapshot of operation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlatformCounters {
    pub describes: u64,
    pub exists_checks: u64,
    pub puts: u64,
    pub uploads_created: u64,
    /// Successful part writes
    pub part_writes: u64,
    pub completes: u64,
    pub aborts: u64,
    /// Successful ranged reads
    pub ranged_reads: u64,
    pub credential_issues: u64,
    /// Highest number of part writes, ranged reads and puts in flight at once
    pub peak_in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    describes: AtomicU64,
    exists_checks: AtomicU64,
    puts: AtomicU64,
    uploads_created: AtomicU64,
    part_writes: AtomicU64,
    completes: AtomicU64,
    aborts: AtomicU64,
    ranged_reads: AtomicU64,
    credential_issues: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory object store and credential issuer
#[derive(Debug, Clone)]
pub struct MemoryPlatform {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<PlatformState>,
    counters: Counters,
    upload_context: StorageContext,
    lease_ttl: Mutex<chrono::Duration>,
    latency: Mutex<Duration>,
    next_serial: AtomicU64,
    revoked_below: AtomicU64,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPlatform {
    /// New uploads land in `memory://primary`
    pub fn new() -> Self {
        Self::with_upload_context(StorageContext::new("memory", "primary"))
    }

    pub fn with_upload_context(context: StorageContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(PlatformState::default()),
                counters: Counters::default(),
                upload_context: context,
                lease_ttl: Mutex::new(chrono::Duration::hours(1)),
                latency: Mutex::new(Duration::ZERO),
                next_serial: AtomicU64::new(1),
                revoked_below: AtomicU64::new(0),
            }),
        }
    }

    /// Lifetime of newly issued leases
    pub fn set_lease_ttl(&self, ttl: Duration) {
        *self.inner.lease_ttl.lock() =
            chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
    }

    /// Artificial delay of every part write, ranged read and put
    pub fn set_latency(&self, latency: Duration) {
        *self.inner.latency.lock() = latency;
    }

    /// Fail the next `times` matching operations with `kind`
    pub fn inject(&self, op: FaultOp, kind: FaultKind, times: u32) {
        self.inner.state.lock().faults.push(Fault {
            op,
            kind,
            remaining: times,
        });
    }

    pub fn clear_faults(&self) {
        self.inner.state.lock().faults.clear();
    }

    /// Revoke every lease issued so far
    pub fn expire_leases(&self) {
        let next = self.inner.next_serial.load(Ordering::SeqCst);
        self.inner.revoked_below.store(next, Ordering::SeqCst);
    }

    /// Store an object directly, bypassing credentials and counters
    pub fn insert_object(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        storage: StorageContext,
        metadata: ObjectMetadata,
    ) -> RemoteObject {
        let data = data.into();
        let stored = StoredObject {
            etag: content_etag(&data),
            data,
            storage,
            metadata,
        };
        let object = to_remote(key, &stored);
        self.inner
            .state
            .lock()
            .objects
            .insert(key.to_string(), stored);
        object
    }

    /// Replace an object's bytes in place; the integrity token changes
    pub fn replace_object(&self, key: &str, data: impl Into<Bytes>) -> Result<RemoteObject> {
        let data = data.into();
        let mut state = self.inner.state.lock();
        let stored = state
            .objects
            .get_mut(key)
            .ok_or_else(|| ParsecError::NotFound(key.to_string()))?;
        stored.etag = content_etag(&data);
        stored.data = data;
        Ok(to_remote(key, stored))
    }

    pub fn object(&self, key: &str) -> Option<RemoteObject> {
        let state = self.inner.state.lock();
        state.objects.get(key).map(|stored| to_remote(key, stored))
    }

    pub fn object_bytes(&self, key: &str) -> Option<Bytes> {
        let state = self.inner.state.lock();
        state.objects.get(key).map(|stored| stored.data.clone())
    }

    /// Part numbers accepted so far, in acceptance order
    pub fn part_log(&self) -> Vec<u32> {
        self.inner.state.lock().part_log.clone()
    }

    /// Multipart sessions not yet completed or aborted
    pub fn open_uploads(&self) -> usize {
        self.inner.state.lock().uploads.len()
    }

    pub fn counters(&self) -> PlatformCounters {
        let c = &self.inner.counters;
        PlatformCounters {
            describes: c.describes.load(Ordering::SeqCst),
            exists_checks: c.exists_checks.load(Ordering::SeqCst),
            puts: c.puts.load(Ordering::SeqCst),
            uploads_created: c.uploads_created.load(Ordering::SeqCst),
            part_writes: c.part_writes.load(Ordering::SeqCst),
            completes: c.completes.load(Ordering::SeqCst),
            aborts: c.aborts.load(Ordering::SeqCst),
            ranged_reads: c.ranged_reads.load(Ordering::SeqCst),
            credential_issues: c.credential_issues.load(Ordering::SeqCst),
            peak_in_flight: c.peak_in_flight.load(Ordering::SeqCst),
        }
    }

    fn take_fault(&self, op: FaultOp) -> Result<()> {
        let mut state = self.inner.state.lock();
        if let Some(fault) = state
            .faults
            .iter_mut()
            .find(|f| f.remaining > 0 && f.op.matches(op))
        {
            fault.remaining -= 1;
            return Err(fault.kind.to_error(op));
        }
        Ok(())
    }

    fn check_lease(&self, lease: &CredentialLease, storage: &StorageContext) -> Result<()> {
        if lease.serial < self.inner.revoked_below.load(Ordering::SeqCst) {
            return Err(ParsecError::AuthExpired(format!(
                "lease {} was revoked",
                lease.serial
            )));
        }
        if lease.is_expired() {
            return Err(ParsecError::AuthExpired(format!(
                "lease {} expired at {}",
                lease.serial, lease.expires_at
            )));
        }
        if &lease.context != storage {
            return Err(ParsecError::AuthExpired(format!(
                "lease for {} cannot access {}",
                lease.context, storage
            )));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let latency = *self.inner.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

fn content_etag(data: &[u8]) -> String {
    hex::encode(&Sha256::digest(data)[..16])
}

fn to_remote(key: &str, stored: &StoredObject) -> RemoteObject {
    RemoteObject {
        key: key.to_string(),
        size: stored.data.len() as u64,
        etag: stored.etag.clone(),
        storage: stored.storage.clone(),
        metadata: stored.metadata.clone(),
    }
}

#[async_trait]
impl CredentialIssuer for MemoryPlatform {
    async fn issue(&self, context: &StorageContext) -> Result<CredentialLease> {
        self.take_fault(FaultOp::Issue)?;
        self.inner
            .counters
            .credential_issues
            .fetch_add(1, Ordering::SeqCst);

        let serial = self.inner.next_serial.fetch_add(1, Ordering::SeqCst);
        let ttl = *self.inner.lease_ttl.lock();
        Ok(CredentialLease {
            context: context.clone(),
            access_key_id: format!("MEMAK{:08}", serial),
            secret_access_key: hex::encode(Sha256::digest(serial.to_le_bytes())),
            session_token: Some(format!("session-{}", serial)),
            expires_at: Utc::now() + ttl,
            serial,
        })
    }
}

#[async_trait]
impl ObjectStore for MemoryPlatform {
    async fn upload_target(&self, _key: &str) -> Result<StorageContext> {
        Ok(self.inner.upload_context.clone())
    }

    async fn describe(&self, key: &str) -> Result<RemoteObject> {
        self.take_fault(FaultOp::Describe)?;
        self.inner.counters.describes.fetch_add(1, Ordering::SeqCst);
        self.object(key)
            .ok_or_else(|| ParsecError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.take_fault(FaultOp::Exists)?;
        self.inner
            .counters
            .exists_checks
            .fetch_add(1, Ordering::SeqCst);
        Ok(self.inner.state.lock().objects.contains_key(key))
    }

    async fn put_object(
        &self,
        lease: &CredentialLease,
        key: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
    ) -> Result<RemoteObject> {
        let _in_flight = InFlight::enter(&self.inner.counters);
        self.simulate_latency().await;
        self.take_fault(FaultOp::Put)?;
        self.check_lease(lease, &self.inner.upload_context)?;

        self.inner.counters.puts.fetch_add(1, Ordering::SeqCst);
        Ok(self.insert_object(
            key,
            body,
            self.inner.upload_context.clone(),
            metadata.clone(),
        ))
    }

    async fn create_upload(
        &self,
        lease: &CredentialLease,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> Result<String> {
        self.take_fault(FaultOp::CreateUpload)?;
        self.check_lease(lease, &self.inner.upload_context)?;

        let mut state = self.inner.state.lock();
        state.next_upload += 1;
        let upload_id = format!("upload-{:06}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
            },
        );
        self.inner
            .counters
            .uploads_created
            .fetch_add(1, Ordering::SeqCst);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        lease: &CredentialLease,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String> {
        let _in_flight = InFlight::enter(&self.inner.counters);
        self.simulate_latency().await;
        self.take_fault(FaultOp::UploadPart(part_number))?;
        self.check_lease(lease, &self.inner.upload_context)?;

        if part_number == 0 {
            return Err(ParsecError::Validation("part numbers start at 1".into()));
        }

        let etag = content_etag(&body);
        let mut state = self.inner.state.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| ParsecError::NotFound(format!("upload {} for {}", upload_id, key)))?;
        upload.parts.insert(part_number, (etag.clone(), body));
        state.part_log.push(part_number);
        drop(state);

        self.inner.counters.part_writes.fetch_add(1, Ordering::SeqCst);
        Ok(etag)
    }

    async fn list_parts(
        &self,
        lease: &CredentialLease,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>> {
        self.take_fault(FaultOp::ListParts)?;
        self.check_lease(lease, &self.inner.upload_context)?;

        let state = self.inner.state.lock();
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| ParsecError::NotFound(format!("upload {} for {}", upload_id, key)))?;
        Ok(upload
            .parts
            .iter()
            .map(|(number, (etag, body))| CompletedPart {
                part_number: *number,
                etag: etag.clone(),
                size: body.len() as u64,
            })
            .collect())
    }

    async fn complete_upload(
        &self,
        lease: &CredentialLease,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> Result<RemoteObject> {
        self.take_fault(FaultOp::Complete)?;
        self.check_lease(lease, &self.inner.upload_context)?;

        let mut state = self.inner.state.lock();
        let upload = state
            .uploads
            .get(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| ParsecError::NotFound(format!("upload {} for {}", upload_id, key)))?;

        let mut body = BytesMut::new();
        let mut etags = Vec::with_capacity(parts.len());
        let mut previous = 0;
        for part in parts {
            if part.part_number <= previous {
                return Err(ParsecError::Validation(
                    "parts must be listed in ascending order".into(),
                ));
            }
            previous = part.part_number;

            let (etag, data) = upload.parts.get(&part.part_number).ok_or_else(|| {
                ParsecError::Validation(format!("part {} was never uploaded", part.part_number))
            })?;
            if etag != &part.etag {
                return Err(ParsecError::Validation(format!(
                    "part {} etag mismatch",
                    part.part_number
                )));
            }
            body.extend_from_slice(data);
            etags.push(etag.as_str());
        }

        let composite = format!(
            "{}-{}",
            hex::encode(&Sha256::digest(etags.concat().as_bytes())[..16]),
            parts.len()
        );
        let stored = StoredObject {
            data: body.freeze(),
            etag: composite,
            storage: self.inner.upload_context.clone(),
            metadata: upload.metadata.clone(),
        };
        let object = to_remote(key, &stored);
        state.uploads.remove(upload_id);
        state.objects.insert(key.to_string(), stored);
        drop(state);

        self.inner.counters.completes.fetch_add(1, Ordering::SeqCst);
        Ok(object)
    }

    async fn abort_upload(
        &self,
        lease: &CredentialLease,
        _key: &str,
        upload_id: &str,
    ) -> Result<()> {
        self.check_lease(lease, &self.inner.upload_context)?;
        self.inner.state.lock().uploads.remove(upload_id);
        self.inner.counters.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_range(
        &self,
        lease: &CredentialLease,
        key: &str,
        range: Range<u64>,
    ) -> Result<Bytes> {
        let _in_flight = InFlight::enter(&self.inner.counters);
        self.simulate_latency().await;
        self.take_fault(FaultOp::GetRange(range.start))?;

        let stored = {
            let state = self.inner.state.lock();
            state
                .objects
                .get(key)
                .cloned()
                .ok_or_else(|| ParsecError::NotFound(key.to_string()))?
        };
        self.check_lease(lease, &stored.storage)?;

        let len = stored.data.len() as u64;
        if range.start > range.end || range.end > len {
            return Err(ParsecError::Validation(format!(
                "range {}..{} outside object of {} bytes",
                range.start, range.end, len
            )));
        }

        self.inner
            .counters
            .ranged_reads
            .fetch_add(1, Ordering::SeqCst);
        Ok(stored.data.slice(range.start as usize..range.end as usize))
    }
}

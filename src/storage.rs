//! The cloud-agnostic copy engine.
//!

use crate::blobstore::gs::GsClient;
use crate::blobstore::local::{LocalBlob, LocalBlobStore};
use crate::blobstore::s3::{S3Blob, S3BlobStore};
use crate::blobstore::{
    get_s3_multipart_chunk_size, AnyBlob, AnyBlobStore, Provider, TagMap,
};
use crate::checksum::unordered::{GsCrc32cUnordered, S3EtagUnordered};
use crate::checksum::{md5_hex, Crc32c};
use crate::concurrency::AsyncSet;
use crate::error::Error::{IncorrectChecksum, InvalidValue, MissingChecksum};
use crate::error::{Error, Result};
use aws_sdk_s3::Client;
use futures_util::{pin_mut, StreamExt};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// The tag holding the hex MD5 of an object, or its composite ETag when it
/// was written in parts.
pub const SSDS_MD5: &str = "SSDS_MD5";

/// The tag holding the base64 CRC32C of an object.
pub const SSDS_CRC32C: &str = "SSDS_CRC32C";

/// The number of transfers the engine keeps in flight.
pub const COPY_CONCURRENCY: usize = 10;

/// Routes URLs to blob and blob-store handles over shared client handles.
#[derive(Debug, Clone)]
pub struct Router {
    s3: Client,
    gs: GsClient,
    billing_project: Option<String>,
}

impl Router {
    /// Create a new router.
    pub fn new(s3: Client, gs: GsClient, billing_project: Option<String>) -> Self {
        Self {
            s3,
            gs,
            billing_project,
        }
    }

    /// Get the blob a URL names.
    pub fn blob_for_url(&self, url: &str) -> Result<AnyBlob> {
        match Provider::try_from(url)? {
            Provider::S3 { bucket, key } => {
                Ok(AnyBlob::S3(S3Blob::new(self.s3.clone(), bucket, key)))
            }
            Provider::Gs { bucket, key } => Ok(AnyBlob::Gs(crate::blobstore::gs::GsBlob::new(
                self.gs.clone(),
                bucket,
                key,
                self.billing_project.clone(),
            ))),
            Provider::File { path } => Ok(AnyBlob::Local(LocalBlob::from_path(path))),
        }
    }

    /// Get the store and prefix a URL names. The URL is a prefix, not a key.
    pub fn blobstore_for_url(&self, url: &str) -> Result<(String, AnyBlobStore)> {
        match Provider::try_from(url)? {
            Provider::S3 { bucket, key } => Ok((
                key,
                AnyBlobStore::S3(S3BlobStore::new(self.s3.clone(), bucket)),
            )),
            Provider::Gs { bucket, key } => Ok((
                key,
                AnyBlobStore::Gs(crate::blobstore::gs::GsBlobStore::new(
                    self.gs.clone(),
                    bucket,
                    self.billing_project.clone(),
                )),
            )),
            Provider::File { path } => Ok((
                path.to_string_lossy().trim_start_matches('/').to_string(),
                AnyBlobStore::Local(LocalBlobStore::new(PathBuf::from("/"))),
            )),
        }
    }
}

/// The completion record for one transfer: the pair, and the error if the
/// transfer failed. Each pair is published at most once.
#[derive(Debug)]
pub struct CopyCompleted {
    pub source: AnyBlob,
    pub destination: AnyBlob,
    pub error: Option<Error>,
}

impl CopyCompleted {
    /// Whether the transfer succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Copies blobs between stores, choosing server-side copies when possible
/// and streaming passthrough otherwise. Completions are drained through
/// [`CopyClient::completed`]; [`CopyClient::close`] waits for outstanding
/// work.
pub struct CopyClient {
    ignore_missing_checksums: bool,
    tasks: AsyncSet<()>,
    completed_tx: mpsc::UnboundedSender<CopyCompleted>,
    completed_rx: mpsc::UnboundedReceiver<CopyCompleted>,
}

impl Default for CopyClient {
    fn default() -> Self {
        Self::new(false, COPY_CONCURRENCY)
    }
}

impl CopyClient {
    /// Create a new client.
    pub fn new(ignore_missing_checksums: bool, concurrency: usize) -> Self {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        Self {
            ignore_missing_checksums,
            tasks: AsyncSet::new(concurrency),
            completed_tx,
            completed_rx,
        }
    }

    /// Copy from `source` to `destination`.
    ///
    /// Data passthrough is avoided when possible, e.g. S3->S3 or GS->GS.
    /// For GS->GS copies, passthrough may be forced if the source bucket is
    /// requester pays. Checksums are computed for local->cloud copies.
    pub async fn copy(&mut self, source: AnyBlob, destination: AnyBlob) -> Result<()> {
        match source.exists().await {
            Ok(true) => {}
            Ok(false) => {
                self.publish(CopyCompleted {
                    error: Some(Error::BlobNotFound(source.url())),
                    source,
                    destination,
                });
                return Ok(());
            }
            Err(err) => {
                self.publish(CopyCompleted {
                    error: Some(err),
                    source,
                    destination,
                });
                return Ok(());
            }
        }

        if destination.is_local() {
            self.submit(CopyMethod::Download, source, destination).await
        } else if source.same_store(&destination) {
            // A multipart intra-store copy already spawns server-side work,
            // so it runs on the submitting task.
            if destination.copy_from_is_multipart(&source).await? {
                self.run_inline(CopyMethod::IntraStore, source, destination)
                    .await;
                Ok(())
            } else {
                self.submit(CopyMethod::IntraStore, source, destination)
                    .await
            }
        } else {
            let size = source.size().await?;
            if size <= get_s3_multipart_chunk_size(size) {
                let compute_checksums = source.is_local();
                self.submit(
                    CopyMethod::Oneshot { compute_checksums },
                    source,
                    destination,
                )
                .await
            } else {
                let compute_checksums = source.is_local();
                self.run_inline(
                    CopyMethod::Multipart { compute_checksums },
                    source,
                    destination,
                )
                .await;
                Ok(())
            }
        }
    }

    /// Copy from `source` to `destination`, always streaming the bytes
    /// through this process to compute both canonical checksums. The
    /// destination must be a cloud blob.
    pub async fn copy_compute_checksums(
        &mut self,
        source: AnyBlob,
        destination: AnyBlob,
    ) -> Result<()> {
        if destination.is_local() {
            return Err(InvalidValue(format!(
                "cannot compute checksums for local destination {}",
                destination.url()
            )));
        }

        let size = source.size().await?;
        if size <= get_s3_multipart_chunk_size(size) {
            self.submit(
                CopyMethod::Oneshot {
                    compute_checksums: true,
                },
                source,
                destination,
            )
            .await
        } else {
            self.run_inline(
                CopyMethod::Multipart {
                    compute_checksums: true,
                },
                source,
                destination,
            )
            .await;
            Ok(())
        }
    }

    async fn submit(
        &mut self,
        method: CopyMethod,
        source: AnyBlob,
        destination: AnyBlob,
    ) -> Result<()> {
        let ignore_missing = self.ignore_missing_checksums;
        let tx = self.completed_tx.clone();

        self.tasks
            .put(async move {
                let completed = do_copy(method, source, destination, ignore_missing).await;
                let _ = tx.send(completed);
            })
            .await
    }

    async fn run_inline(&mut self, method: CopyMethod, source: AnyBlob, destination: AnyBlob) {
        let completed = do_copy(method, source, destination, self.ignore_missing_checksums).await;
        self.publish(completed);
    }

    fn publish(&self, completed: CopyCompleted) {
        let _ = self.completed_tx.send(completed);
    }

    /// Drain the completions published so far, without blocking.
    pub fn completed(&mut self) -> impl Iterator<Item = CopyCompleted> + '_ {
        std::iter::from_fn(|| self.completed_rx.try_recv().ok())
    }

    /// Wait for all outstanding transfers, then drain every remaining
    /// completion.
    pub async fn close(mut self) -> Result<Vec<CopyCompleted>> {
        self.tasks.consume().await?;
        drop(self.completed_tx);

        let mut completed = vec![];
        while let Some(event) = self.completed_rx.recv().await {
            completed.push(event);
        }

        Ok(completed)
    }

    /// Wait for all outstanding transfers while keeping the client usable,
    /// returning completions in completion order.
    pub async fn flush(&mut self) -> Result<Vec<CopyCompleted>> {
        self.tasks.consume().await?;
        Ok(self.completed().collect())
    }
}

#[derive(Debug, Clone, Copy)]
enum CopyMethod {
    Download,
    IntraStore,
    Oneshot { compute_checksums: bool },
    Multipart { compute_checksums: bool },
}

/// Execute one transfer through its verify and tag stages, producing the
/// completion record.
async fn do_copy(
    method: CopyMethod,
    source: AnyBlob,
    destination: AnyBlob,
    ignore_missing_checksums: bool,
) -> CopyCompleted {
    let result = run_copy_method(method, &source, &destination, ignore_missing_checksums).await;

    match result {
        Ok(()) => {
            info!("copied {} to {}", source.url(), destination.url());
            CopyCompleted {
                source,
                destination,
                error: None,
            }
        }
        Err(err) => {
            error!("failed to copy {} to {}: {}", source.url(), destination.url(), err);
            CopyCompleted {
                source,
                destination,
                error: Some(err),
            }
        }
    }
}

async fn run_copy_method(
    method: CopyMethod,
    source: &AnyBlob,
    destination: &AnyBlob,
    ignore_missing_checksums: bool,
) -> Result<()> {
    let tags = match method {
        CopyMethod::Download => {
            copy_to_local(source, destination).await?;
            // Downloads carry no tags.
            return Ok(());
        }
        CopyMethod::IntraStore => {
            destination.copy_from(source).await?;
            source.get_tags().await?
        }
        CopyMethod::Oneshot { compute_checksums } => {
            match copy_oneshot_passthrough(source, destination, compute_checksums).await? {
                Some(tags) => tags,
                None => source.get_tags().await?,
            }
        }
        CopyMethod::Multipart { compute_checksums } => {
            match copy_multipart_passthrough(source, destination, compute_checksums).await? {
                Some(tags) => tags,
                None => source.get_tags().await?,
            }
        }
    };

    verify_checksums(
        &source.url(),
        destination,
        &tags,
        ignore_missing_checksums,
    )
    .await?;
    destination.put_tags(&tags).await?;

    Ok(())
}

/// Download a blob to a local destination, creating parent directories.
async fn copy_to_local(source: &AnyBlob, destination: &AnyBlob) -> Result<()> {
    let path = PathBuf::from(destination.url());
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    source.download(Path::new(&path)).await
}

/// Copy with a single get and put, passing data through this process.
/// Optionally compute checksums.
pub async fn copy_oneshot_passthrough(
    source: &AnyBlob,
    destination: &AnyBlob,
    compute_checksums: bool,
) -> Result<Option<TagMap>> {
    let data = source.get().await?;

    let tags = compute_checksums.then(|| {
        let mut crc32c = Crc32c::new();
        crc32c.update(&data);

        TagMap::from([
            (SSDS_MD5.to_string(), md5_hex(&data)),
            (SSDS_CRC32C.to_string(), crc32c.gcs_b64()),
        ])
    });

    destination.put(data).await?;

    Ok(tags)
}

/// Copy part by part, passing data through this process. Parts may arrive
/// from the source in any order; the destination writer restores ordering on
/// close. Optionally compute checksums over the shuffled parts.
pub async fn copy_multipart_passthrough(
    source: &AnyBlob,
    destination: &AnyBlob,
    compute_checksums: bool,
) -> Result<Option<TagMap>> {
    let mut etag = compute_checksums.then(S3EtagUnordered::new);
    let mut crc32c = compute_checksums.then(GsCrc32cUnordered::new);

    let mut writer = destination.multipart_writer().await?;
    let result: Result<()> = async {
        let parts = source.parts().await?;
        pin_mut!(parts);
        while let Some(part) = parts.next().await {
            let part = part?;
            if let Some(etag) = etag.as_mut() {
                etag.update(part.number, &part.data);
            }
            if let Some(crc32c) = crc32c.as_mut() {
                crc32c.update(part.number, part.data.clone());
            }
            writer.put_part(part).await?;
        }
        writer.close().await
    }
    .await;

    if let Err(err) = result {
        writer.abort().await;
        return Err(err);
    }

    match (etag, crc32c) {
        (Some(etag), Some(crc32c)) => Ok(Some(TagMap::from([
            (SSDS_MD5.to_string(), etag.hex_digest()?),
            (SSDS_CRC32C.to_string(), crc32c.gcs_b64()),
        ]))),
        _ => Ok(None),
    }
}

/// Check that the canonical checksum required by the destination's store is
/// present and agrees with the store's native checksum. A missing tag is
/// downgraded to a warning when `ignore_missing_checksums` is set; a
/// mismatch never is.
pub async fn verify_checksums(
    source_url: &str,
    destination: &AnyBlob,
    checksums: &TagMap,
    ignore_missing_checksums: bool,
) -> Result<()> {
    let (checksum_name, checksum_tag) = match destination {
        AnyBlob::S3(_) => ("S3 ETag", SSDS_MD5),
        AnyBlob::Gs(_) => ("GS crc32c", SSDS_CRC32C),
        AnyBlob::Local(_) => return Ok(()),
    };

    match checksums.get(checksum_tag) {
        Some(expected) => {
            let native = destination.cloud_native_checksum().await?;
            if *expected != native {
                return Err(IncorrectChecksum(format!(
                    "incorrect {} for {} -> {}: expected {}, stored {}",
                    checksum_name,
                    source_url,
                    destination.url(),
                    expected,
                    native
                )));
            }

            Ok(())
        }
        None => {
            let msg = format!("missing {} tag for {}", checksum_tag, source_url);
            if ignore_missing_checksums {
                warn!("{}", msg);
                Ok(())
            } else {
                Err(MissingChecksum(msg))
            }
        }
    }
}

/// Copy a single pair with a short-lived client.
pub async fn copy(source: AnyBlob, destination: AnyBlob) -> Result<Vec<CopyCompleted>> {
    let mut client = CopyClient::default();
    client.copy(source, destination).await?;
    client.close().await
}

/// Rewrite a source key under a destination prefix.
pub fn transform_key(source_key: &str, source_prefix: &str, destination_prefix: &str) -> String {
    let source_prefix = source_prefix.trim_matches('/');
    let destination_prefix = destination_prefix.trim_matches('/');

    source_key.replacen(source_prefix, destination_prefix, 1)
}

//! The cloud-agnostic blob contract over S3, GCS, and the local filesystem.
//!

pub mod gs;
pub mod local;
pub mod s3;

use crate::blobstore::gs::{GsBlob, GsBlobStore};
use crate::blobstore::local::{LocalBlob, LocalBlobStore};
use crate::blobstore::s3::{S3Blob, S3BlobStore};
use crate::error::Error::InvalidValue;
use crate::error::{Error, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

pub const MIB: u64 = 1024 * 1024;

/// Files must be larger than this before multipart transfers are considered.
pub const AWS_MIN_CHUNK_SIZE: u64 = 64 * MIB;

/// Maximum number of parts allowed in a multipart upload. This is a
/// limitation imposed by S3.
pub const AWS_MAX_MULTIPART_COUNT: u64 = 10000;

/// Returns the chunk size of the S3 multipart object, given a file's size.
/// The same boundaries are used for every store so that cross-cloud part
/// layouts match.
pub fn get_s3_multipart_chunk_size(size: u64) -> u64 {
    if size <= AWS_MAX_MULTIPART_COUNT * AWS_MIN_CHUNK_SIZE {
        AWS_MIN_CHUNK_SIZE
    } else {
        let raw_part_size = size.div_ceil(AWS_MAX_MULTIPART_COUNT);
        raw_part_size.div_ceil(MIB) * MIB
    }
}

/// The number of parts an object of `size` splits into under the chunk-size
/// law. Zero-byte objects still occupy a single part.
pub fn number_of_parts(size: u64) -> u64 {
    if size == 0 {
        1
    } else {
        size.div_ceil(get_s3_multipart_chunk_size(size))
    }
}

/// A numbered part of an object. Parts are numbered densely from 0.
#[derive(Debug, Clone)]
pub struct Part {
    pub number: u64,
    pub data: Bytes,
}

impl Part {
    /// Create a new part.
    pub fn new(number: u64, data: Bytes) -> Self {
        Self { number, data }
    }
}

/// User-defined object metadata attached to blobs.
pub type TagMap = HashMap<String, String>;

/// A lazy sequence of parts. Cloud sources may yield parts in completion
/// order rather than number order.
pub type PartStream = Pin<Box<dyn Stream<Item = Result<Part>> + Send>>;

/// The location of a blob or prefix parsed from a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    S3 { bucket: String, key: String },
    Gs { bucket: String, key: String },
    File { path: PathBuf },
}

impl Provider {
    /// Format an S3 url.
    pub fn format_s3(bucket: &str, key: &str) -> String {
        format!("s3://{}/{}", bucket, key)
    }

    /// Format a GCS url.
    pub fn format_gs(bucket: &str, key: &str) -> String {
        format!("gs://{}/{}", bucket, key)
    }

    /// Format the provider into a string.
    pub fn format(&self) -> String {
        match self {
            Provider::S3 { bucket, key } => Self::format_s3(bucket, key),
            Provider::Gs { bucket, key } => Self::format_gs(bucket, key),
            Provider::File { path } => path.to_string_lossy().to_string(),
        }
    }

    /// Parse a cloud url of the form `<scheme>://bucket/key`.
    fn parse_cloud_url(s: &str, scheme: &str) -> Result<(String, String)> {
        let Some(s) = s.strip_prefix(scheme) else {
            return Err(Error::ParseError(format!("{} is not a {} url", s, scheme)));
        };

        let (bucket, key) = s.split_once('/').unwrap_or((s, ""));
        if bucket.is_empty() {
            return Err(Error::ParseError(format!("{} is missing a bucket", s)));
        }

        Ok((bucket.to_string(), key.to_string()))
    }

    /// Parse from an S3 url, e.g. `s3://bucket/key`.
    pub fn parse_s3_url(s: &str) -> Result<Self> {
        let (bucket, key) = Self::parse_cloud_url(s, "s3://")?;
        Ok(Self::S3 { bucket, key })
    }

    /// Parse from a GCS url, e.g. `gs://bucket/key`.
    pub fn parse_gs_url(s: &str) -> Result<Self> {
        let (bucket, key) = Self::parse_cloud_url(s, "gs://")?;
        Ok(Self::Gs { bucket, key })
    }

    /// Parse anything that is not a cloud url as a normalized local path.
    pub fn parse_file_path(s: &str) -> Self {
        Self::File {
            path: normalize_path(s.strip_prefix("file://").unwrap_or(s)),
        }
    }

    /// Convert the provider into a cloud bucket and key.
    pub fn into_cloud(self) -> Result<(String, String)> {
        match self {
            Provider::S3 { bucket, key } | Provider::Gs { bucket, key } => Ok((bucket, key)),
            _ => Err(Error::ParseError("not a cloud provider".to_string())),
        }
    }

    /// Check if the provider is an S3 provider.
    pub fn is_s3(&self) -> bool {
        matches!(self, Provider::S3 { .. })
    }

    /// Check if the provider is a GCS provider.
    pub fn is_gs(&self) -> bool {
        matches!(self, Provider::Gs { .. })
    }

    /// Check if the provider is a file provider.
    pub fn is_file(&self) -> bool {
        matches!(self, Provider::File { .. })
    }
}

impl TryFrom<&str> for Provider {
    type Error = Error;

    fn try_from(url: &str) -> Result<Self> {
        if url.starts_with("s3://") {
            Self::parse_s3_url(url)
        } else if url.starts_with("gs://") {
            Self::parse_gs_url(url)
        } else {
            Ok(Self::parse_file_path(url))
        }
    }
}

/// Resolve a path to an absolute, normalized form without requiring it to
/// exist. A canonicalized result is preferred when the path is present.
pub fn normalize_path(path: &str) -> PathBuf {
    let path = Path::new(path);
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            component => normalized.push(component),
        }
    }

    normalized
}

/// A blob in any of the supported stores.
#[derive(Debug, Clone)]
pub enum AnyBlob {
    S3(S3Blob),
    Gs(GsBlob),
    Local(LocalBlob),
}

impl AnyBlob {
    /// The canonical url of the blob.
    pub fn url(&self) -> String {
        match self {
            AnyBlob::S3(blob) => blob.url(),
            AnyBlob::Gs(blob) => blob.url(),
            AnyBlob::Local(blob) => blob.url(),
        }
    }

    /// The key of the blob within its store.
    pub fn key(&self) -> &str {
        match self {
            AnyBlob::S3(blob) => blob.key(),
            AnyBlob::Gs(blob) => blob.key(),
            AnyBlob::Local(blob) => blob.key(),
        }
    }

    /// Check whether the blob exists.
    pub async fn exists(&self) -> Result<bool> {
        match self {
            AnyBlob::S3(blob) => blob.exists().await,
            AnyBlob::Gs(blob) => blob.exists().await,
            AnyBlob::Local(blob) => blob.exists().await,
        }
    }

    /// Get the size of the blob.
    pub async fn size(&self) -> Result<u64> {
        match self {
            AnyBlob::S3(blob) => blob.size().await,
            AnyBlob::Gs(blob) => blob.size().await,
            AnyBlob::Local(blob) => blob.size().await,
        }
    }

    /// Read the whole object.
    pub async fn get(&self) -> Result<Bytes> {
        match self {
            AnyBlob::S3(blob) => blob.get().await,
            AnyBlob::Gs(blob) => blob.get().await,
            AnyBlob::Local(blob) => blob.get().await,
        }
    }

    /// Write the whole object.
    pub async fn put(&self, data: Bytes) -> Result<()> {
        match self {
            AnyBlob::S3(blob) => blob.put(data).await,
            AnyBlob::Gs(blob) => blob.put(data).await,
            AnyBlob::Local(blob) => blob.put(data).await,
        }
    }

    /// Get the blob's tags. Local blobs do not carry tags and always return
    /// an empty map.
    pub async fn get_tags(&self) -> Result<TagMap> {
        match self {
            AnyBlob::S3(blob) => blob.get_tags().await,
            AnyBlob::Gs(blob) => blob.get_tags().await,
            AnyBlob::Local(_) => Ok(TagMap::new()),
        }
    }

    /// Write the blob's tags. A no-op for local blobs.
    pub async fn put_tags(&self, tags: &TagMap) -> Result<()> {
        match self {
            AnyBlob::S3(blob) => blob.put_tags(tags).await,
            AnyBlob::Gs(blob) => blob.put_tags(tags).await,
            AnyBlob::Local(_) => Ok(()),
        }
    }

    /// The store-native checksum: the ETag with quotes stripped for S3, the
    /// base64 CRC32C for GCS.
    pub async fn cloud_native_checksum(&self) -> Result<String> {
        match self {
            AnyBlob::S3(blob) => blob.cloud_native_checksum().await,
            AnyBlob::Gs(blob) => blob.cloud_native_checksum().await,
            AnyBlob::Local(blob) => Err(InvalidValue(format!(
                "local blob {} has no cloud native checksum",
                blob.url()
            ))),
        }
    }

    /// A lazy sequence of the blob's parts under the shared chunk-size law.
    pub async fn parts(&self) -> Result<PartStream> {
        match self {
            AnyBlob::S3(blob) => blob.parts().await,
            AnyBlob::Gs(blob) => blob.parts().await,
            AnyBlob::Local(blob) => blob.parts().await,
        }
    }

    /// Open a multipart writer at this blob's location.
    pub async fn multipart_writer(&self) -> Result<MultipartWriter> {
        match self {
            AnyBlob::S3(blob) => Ok(MultipartWriter::S3(blob.multipart_writer().await?)),
            AnyBlob::Gs(blob) => Ok(MultipartWriter::Gs(blob.multipart_writer())),
            AnyBlob::Local(blob) => Err(InvalidValue(format!(
                "local blob {} does not support multipart writes",
                blob.url()
            ))),
        }
    }

    /// Intra-store server-side copy. Rejects blobs from a different store
    /// kind.
    pub async fn copy_from(&self, source: &AnyBlob) -> Result<()> {
        match (self, source) {
            (AnyBlob::S3(dst), AnyBlob::S3(src)) => dst.copy_from(src).await,
            (AnyBlob::Gs(dst), AnyBlob::Gs(src)) => dst.copy_from(src).await,
            (AnyBlob::Local(dst), AnyBlob::Local(src)) => dst.copy_from(src).await,
            (dst, src) => Err(InvalidValue(format!(
                "cannot copy {} to {} within one store",
                src.url(),
                dst.url()
            ))),
        }
    }

    /// Whether `copy_from(source)` spawns server-side multipart work. Used
    /// by the engine to decide whether to run the copy inline.
    pub async fn copy_from_is_multipart(&self, source: &AnyBlob) -> Result<bool> {
        match (self, source) {
            (AnyBlob::S3(_), AnyBlob::S3(src)) => src.copy_is_multipart().await,
            (AnyBlob::Gs(_), AnyBlob::Gs(src)) => Ok(src.copy_is_multipart()),
            (AnyBlob::Local(_), AnyBlob::Local(_)) => Ok(false),
            (dst, src) => Err(InvalidValue(format!(
                "cannot copy {} to {} within one store",
                src.url(),
                dst.url()
            ))),
        }
    }

    /// Download the object to a local path.
    pub async fn download(&self, path: &Path) -> Result<()> {
        match self {
            AnyBlob::S3(blob) => blob.download(path).await,
            AnyBlob::Gs(blob) => blob.download(path).await,
            AnyBlob::Local(blob) => blob.download(path).await,
        }
    }

    /// Check if the blob is local.
    pub fn is_local(&self) -> bool {
        matches!(self, AnyBlob::Local(_))
    }

    /// Check if the blob is an S3 blob.
    pub fn is_s3(&self) -> bool {
        matches!(self, AnyBlob::S3(_))
    }

    /// Check if the blob is a GCS blob.
    pub fn is_gs(&self) -> bool {
        matches!(self, AnyBlob::Gs(_))
    }

    /// Whether the source and destination live in the same kind of store.
    pub fn same_store(&self, other: &AnyBlob) -> bool {
        matches!(
            (self, other),
            (AnyBlob::S3(_), AnyBlob::S3(_))
                | (AnyBlob::Gs(_), AnyBlob::Gs(_))
                | (AnyBlob::Local(_), AnyBlob::Local(_))
        )
    }
}

/// A blob store in any of the supported variants.
#[derive(Debug, Clone)]
pub enum AnyBlobStore {
    S3(S3BlobStore),
    Gs(GsBlobStore),
    Local(LocalBlobStore),
}

impl AnyBlobStore {
    /// The url scheme of the store, e.g. `s3://`.
    pub fn schema(&self) -> &'static str {
        match self {
            AnyBlobStore::S3(_) => "s3://",
            AnyBlobStore::Gs(_) => "gs://",
            AnyBlobStore::Local(_) => "",
        }
    }

    /// The bucket name, or base path for local stores.
    pub fn bucket(&self) -> String {
        match self {
            AnyBlobStore::S3(store) => store.bucket().to_string(),
            AnyBlobStore::Gs(store) => store.bucket().to_string(),
            AnyBlobStore::Local(store) => store.base_path().to_string_lossy().to_string(),
        }
    }

    /// Get a blob handle for a key.
    pub fn blob(&self, key: &str) -> AnyBlob {
        match self {
            AnyBlobStore::S3(store) => AnyBlob::S3(store.blob(key)),
            AnyBlobStore::Gs(store) => AnyBlob::Gs(store.blob(key)),
            AnyBlobStore::Local(store) => AnyBlob::Local(store.blob(key)),
        }
    }

    /// List blobs under a prefix as a lazy stream.
    pub fn list(&self, prefix: &str) -> Pin<Box<dyn Stream<Item = Result<AnyBlob>> + Send>> {
        match self {
            AnyBlobStore::S3(store) => {
                Box::pin(store.list(prefix).map(|blob| blob.map(AnyBlob::S3)))
            }
            AnyBlobStore::Gs(store) => {
                Box::pin(store.list(prefix).map(|blob| blob.map(AnyBlob::Gs)))
            }
            AnyBlobStore::Local(store) => {
                Box::pin(store.list(prefix).map(|blob| blob.map(AnyBlob::Local)))
            }
        }
    }
}

/// A multipart sink that accepts parts in any order and materializes them in
/// ascending part-number order on close.
pub enum MultipartWriter {
    S3(s3::S3MultipartWriter),
    Gs(gs::GsMultipartWriter),
}

impl MultipartWriter {
    /// Accept a part for upload.
    pub async fn put_part(&mut self, part: Part) -> Result<()> {
        match self {
            MultipartWriter::S3(writer) => writer.put_part(part).await,
            MultipartWriter::Gs(writer) => writer.put_part(part).await,
        }
    }

    /// Finish the upload, ordering the accepted parts.
    pub async fn close(&mut self) -> Result<()> {
        match self {
            MultipartWriter::S3(writer) => writer.close().await,
            MultipartWriter::Gs(writer) => writer.close().await,
        }
    }

    /// Abandon the upload, discarding accepted parts where the store allows
    /// it.
    pub async fn abort(&mut self) {
        match self {
            MultipartWriter::S3(writer) => writer.abort().await,
            MultipartWriter::Gs(writer) => writer.abort().await,
        }
    }
}

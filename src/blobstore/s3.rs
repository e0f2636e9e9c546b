//! The S3 blob adapter.
//!

use crate::blobstore::{
    get_s3_multipart_chunk_size, number_of_parts, Part, PartStream, Provider, TagMap,
};
use crate::concurrency::{AsyncSet, DEFAULT_CONCURRENCY};
use crate::error::Error::{AwsError, BlobNotFound};
use crate::error::{Error, Result};
use async_stream::stream;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Tag, Tagging};
use aws_sdk_s3::Client;
use aws_smithy_runtime_api::client::orchestrator::HttpResponse;
use aws_smithy_types::byte_stream::ByteStream;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use bytes::Bytes;
use futures_util::Stream;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Create the default S3 client from the environment.
pub async fn default_s3_client() -> Client {
    let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    Client::new(&config)
}

/// Check whether an error's metadata marks object absence.
fn code_is_not_found<T: ProvideErrorMetadata>(err: &SdkError<T, HttpResponse>) -> bool {
    if let SdkError::ServiceError(context) = err {
        if context.raw().status().as_u16() == 404 {
            return true;
        }
    }

    err.as_service_error()
        .and_then(|err| err.code())
        .is_some_and(|code| code == "NoSuchKey" || code == "NotFound")
}

/// An S3 bucket.
#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    /// Create a new store for a bucket.
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// The bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Get a blob handle for a key.
    pub fn blob(&self, key: &str) -> S3Blob {
        S3Blob::new(self.client.clone(), self.bucket.clone(), key.to_string())
    }

    /// List blobs under a prefix, following continuation tokens lazily.
    pub fn list(&self, prefix: &str) -> impl Stream<Item = Result<S3Blob>> + Send {
        let store = self.clone();
        let prefix = prefix.to_string();

        stream! {
            let mut continuation: Option<String> = None;
            loop {
                let result = store
                    .client
                    .list_objects_v2()
                    .bucket(&store.bucket)
                    .prefix(&prefix)
                    .set_continuation_token(continuation.take())
                    .send()
                    .await;

                match result {
                    Ok(output) => {
                        for object in output.contents() {
                            if let Some(key) = object.key() {
                                yield Ok(store.blob(key));
                            }
                        }

                        continuation = output
                            .next_continuation_token()
                            .map(ToString::to_string);
                        if continuation.is_none() {
                            break;
                        }
                    }
                    Err(err) => {
                        yield Err(err.into());
                        break;
                    }
                }
            }
        }
    }
}

/// A single S3 object.
#[derive(Debug, Clone)]
pub struct S3Blob {
    client: Client,
    bucket: String,
    key: String,
}

impl S3Blob {
    /// Create a new blob handle.
    pub fn new(client: Client, bucket: String, key: String) -> Self {
        Self {
            client,
            bucket,
            key,
        }
    }

    /// The canonical url of the blob.
    pub fn url(&self) -> String {
        Provider::format_s3(&self.bucket, &self.key)
    }

    /// The key of the blob.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The bucket holding the blob.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn not_found(&self) -> Error {
        BlobNotFound(self.url())
    }

    /// Check whether the object exists. Absence is a `head_object` 404;
    /// other failures propagate.
    pub async fn exists(&self) -> Result<bool> {
        match self.size().await {
            Ok(_) => Ok(true),
            Err(BlobNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Get the size of the object.
    pub async fn size(&self) -> Result<u64> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|err| {
                if matches!(err.as_service_error(), Some(HeadObjectError::NotFound(_)))
                    || code_is_not_found(&err)
                {
                    self.not_found()
                } else {
                    err.into()
                }
            })?;

        Ok(head
            .content_length
            .map(u64::try_from)
            .transpose()?
            .unwrap_or_default())
    }

    /// Read the whole object.
    pub async fn get(&self) -> Result<Bytes> {
        let output = self.get_object(None).await?;
        Ok(output.collect().await?.into_bytes())
    }

    /// Read a byte range of the object.
    pub async fn get_range(&self, start: u64, length: u64) -> Result<Bytes> {
        let range = format!("bytes={}-{}", start, start + length - 1);
        let output = self.get_object(Some(range)).await?;
        Ok(output.collect().await?.into_bytes())
    }

    async fn get_object(&self, range: Option<String>) -> Result<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .set_range(range)
            .send()
            .await
            .map_err(|err| {
                if matches!(err.as_service_error(), Some(GetObjectError::NoSuchKey(_)))
                    || code_is_not_found(&err)
                {
                    self.not_found()
                } else {
                    err.into()
                }
            })?;

        Ok(output.body)
    }

    /// Write the whole object.
    pub async fn put(&self, data: Bytes) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(ByteStream::from(data))
            .send()
            .await?;

        Ok(())
    }

    /// Get the object's tags.
    pub async fn get_tags(&self) -> Result<TagMap> {
        let tags = self
            .client
            .get_object_tagging()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|err| {
                if code_is_not_found(&err) {
                    self.not_found()
                } else {
                    err.into()
                }
            })?;

        Ok(tags
            .tag_set
            .into_iter()
            .map(|tag| (tag.key().to_string(), tag.value().to_string()))
            .collect())
    }

    /// Write the object's tags, replacing the existing tag set.
    pub async fn put_tags(&self, tags: &TagMap) -> Result<()> {
        let tag_set = tags
            .iter()
            .map(|(key, value)| {
                Tag::builder()
                    .key(key)
                    .value(value)
                    .build()
                    .map_err(|err| AwsError(err.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(|err| AwsError(err.to_string()))?;

        self.client
            .put_object_tagging()
            .bucket(&self.bucket)
            .key(&self.key)
            .tagging(tagging)
            .send()
            .await
            .map_err(|err| {
                if code_is_not_found(&err) {
                    self.not_found()
                } else {
                    err.into()
                }
            })?;

        Ok(())
    }

    /// The object's ETag with the surrounding quotes stripped.
    pub async fn cloud_native_checksum(&self) -> Result<String> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|err| {
                if matches!(err.as_service_error(), Some(HeadObjectError::NotFound(_)))
                    || code_is_not_found(&err)
                {
                    self.not_found()
                } else {
                    err.into()
                }
            })?;

        Ok(head
            .e_tag()
            .ok_or_else(|| AwsError(format!("missing etag for {}", self.url())))?
            .trim_matches('"')
            .to_string())
    }

    /// Whether an intra-store copy from this blob spawns server-side
    /// multipart work.
    pub async fn copy_is_multipart(&self) -> Result<bool> {
        let size = self.size().await?;
        Ok(size >= get_s3_multipart_chunk_size(size))
    }

    /// Intra-store server-side copy into this blob. Uses `CopyObject` when a
    /// single chunk covers the source, `UploadPartCopy` per chunk otherwise.
    pub async fn copy_from(&self, source: &S3Blob) -> Result<()> {
        if self.url() == source.url() {
            return Ok(());
        }

        let size = source.size().await?;
        let chunk_size = get_s3_multipart_chunk_size(size);

        if chunk_size >= size {
            self.client
                .copy_object()
                .copy_source(format!("{}/{}", source.bucket, source.key))
                .bucket(&self.bucket)
                .key(&self.key)
                .send()
                .await
                .map_err(|err| {
                    if code_is_not_found(&err) {
                        BlobNotFound(source.url())
                    } else {
                        err.into()
                    }
                })?;

            return Ok(());
        }

        let mut writer = self.multipart_writer().await?;
        let result: Result<()> = async {
            for part_number in 0..number_of_parts(size) {
                writer.put_part_copy(part_number, source, size).await?;
            }
            writer.close().await
        }
        .await;

        if result.is_err() {
            writer.abort().await;
        }

        result
    }

    /// Download the object to a local path.
    pub async fn download(&self, path: &Path) -> Result<()> {
        let body = self.get_object(None).await?;

        let mut file = fs::File::create(path).await?;
        let mut reader = body.into_async_read();
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;

        Ok(())
    }

    /// A lazy sequence of the object's parts. Multiple ranged reads are kept
    /// in flight, so parts are yielded in completion order.
    pub async fn parts(&self) -> Result<PartStream> {
        let size = self.size().await?;
        let chunk_size = get_s3_multipart_chunk_size(size);
        let part_count = number_of_parts(size);
        let blob = self.clone();

        let stream = stream! {
            if part_count == 1 {
                yield blob.get().await.map(|data| Part::new(0, data));
                return;
            }

            let mut fetches = AsyncSet::new(DEFAULT_CONCURRENCY);
            for part_number in 0..part_count {
                let blob = blob.clone();
                let put = fetches
                    .put(async move {
                        blob.get_range(part_number * chunk_size, chunk_size)
                            .await
                            .map(|data| Part::new(part_number, data))
                    })
                    .await;
                if let Err(err) = put {
                    yield Err(err);
                    return;
                }

                match fetches.consume_finished() {
                    Ok(parts) => {
                        for part in parts {
                            yield part;
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }

            match fetches.consume().await {
                Ok(parts) => {
                    for part in parts {
                        yield part;
                    }
                }
                Err(err) => yield Err(err),
            }
        };

        Ok(Box::pin(stream))
    }

    /// Open a multipart upload at this blob's location.
    pub async fn multipart_writer(&self) -> Result<S3MultipartWriter> {
        S3MultipartWriter::open(self.client.clone(), self.bucket.clone(), self.key.clone()).await
    }
}

/// A multipart upload sink. Parts upload concurrently and are ordered by
/// part number on close.
pub struct S3MultipartWriter {
    client: Client,
    bucket: String,
    key: String,
    upload_id: String,
    uploads: AsyncSet<Result<CompletedPart>>,
    parts: Vec<CompletedPart>,
    closed: bool,
}

impl S3MultipartWriter {
    /// Start a new multipart upload.
    pub async fn open(client: Client, bucket: String, key: String) -> Result<Self> {
        let upload = client
            .create_multipart_upload()
            .bucket(&bucket)
            .key(&key)
            .send()
            .await?;

        Ok(Self {
            client,
            bucket,
            key,
            upload_id: upload
                .upload_id
                .ok_or_else(|| AwsError("missing upload id".to_string()))?,
            uploads: AsyncSet::new(DEFAULT_CONCURRENCY),
            parts: vec![],
            closed: false,
        })
    }

    fn collect_finished(&mut self) -> Result<()> {
        for part in self.uploads.consume_finished()? {
            self.parts.push(part?);
        }

        Ok(())
    }

    /// Accept a part for upload. Part numbers are 0-based here and become
    /// S3's 1-based part numbers on the wire.
    pub async fn put_part(&mut self, part: Part) -> Result<()> {
        self.collect_finished()?;

        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        let upload_id = self.upload_id.clone();

        self.uploads
            .put(async move {
                let part_number = i32::try_from(part.number + 1)?;
                let upload = client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(part.data))
                    .send()
                    .await?;

                Ok(CompletedPart::builder()
                    .set_e_tag(upload.e_tag)
                    .part_number(part_number)
                    .build())
            })
            .await
    }

    /// Accept a server-side part copy from a source blob.
    pub async fn put_part_copy(
        &mut self,
        part_number: u64,
        source: &S3Blob,
        source_size: u64,
    ) -> Result<()> {
        self.collect_finished()?;

        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        let upload_id = self.upload_id.clone();
        let source_bucket = source.bucket().to_string();
        let source_key = source.key().to_string();

        let chunk_size = get_s3_multipart_chunk_size(source_size);
        let start = part_number * chunk_size;
        let end = (start + chunk_size - 1).min(source_size - 1);

        self.uploads
            .put(async move {
                let aws_part_number = i32::try_from(part_number + 1)?;
                let upload = client
                    .upload_part_copy()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(aws_part_number)
                    .copy_source(format!("{}/{}", source_bucket, source_key))
                    .copy_source_range(format!("bytes={}-{}", start, end))
                    .send()
                    .await?;

                let result = upload
                    .copy_part_result
                    .ok_or_else(|| AwsError("missing copy part result".to_string()))?;

                Ok(CompletedPart::builder()
                    .set_e_tag(result.e_tag)
                    .part_number(aws_part_number)
                    .build())
            })
            .await
    }

    /// Finish the upload. Parts must be ordered.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        for part in self.uploads.consume().await? {
            self.parts.push(part?);
        }
        self.parts
            .sort_by(|a, b| a.part_number.cmp(&b.part_number));

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(std::mem::take(&mut self.parts)))
                    .build(),
            )
            .send()
            .await?;

        Ok(())
    }

    /// Abandon the upload so the store can reclaim the accepted parts.
    pub async fn abort(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let _ = self.uploads.consume().await;
        let abort = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&self.upload_id)
            .send()
            .await;

        if let Err(err) = abort {
            warn!(
                "failed to abort multipart upload for s3://{}/{}: {}",
                self.bucket, self.key, err
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use anyhow::Result;
    use aws_sdk_s3::operation::get_object_tagging::GetObjectTaggingOutput;
    use aws_sdk_s3::operation::head_object::HeadObjectOutput;
    use aws_sdk_s3::types::error::NotFound;
    use aws_smithy_mocks_experimental::{mock, mock_client, RuleMode};

    fn blob(client: Client) -> S3Blob {
        S3Blob::new(client, "bucket".to_string(), "key".to_string())
    }

    #[tokio::test]
    async fn test_exists_false_on_not_found() -> Result<()> {
        let head_object = mock!(Client::head_object)
            .match_requests(|req| req.bucket() == Some("bucket") && req.key() == Some("key"))
            .then_error(|| HeadObjectError::NotFound(NotFound::builder().build()));
        let client = mock_client!(aws_sdk_s3, RuleMode::Sequential, &[&head_object]);

        assert!(!blob(client).exists().await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_exists_and_size() -> Result<()> {
        let head_object = mock!(Client::head_object)
            .match_requests(|req| req.bucket() == Some("bucket") && req.key() == Some("key"))
            .then_output(|| HeadObjectOutput::builder().content_length(42).build());
        let client = mock_client!(aws_sdk_s3, RuleMode::MatchAny, &[&head_object]);

        let blob = blob(client);
        assert!(blob.exists().await?);
        assert_eq!(blob.size().await?, 42);

        Ok(())
    }

    #[tokio::test]
    async fn test_cloud_native_checksum_strips_quotes() -> Result<()> {
        let head_object = mock!(Client::head_object)
            .match_requests(|req| req.bucket() == Some("bucket") && req.key() == Some("key"))
            .then_output(|| {
                HeadObjectOutput::builder()
                    .e_tag("\"d41d8cd98f00b204e9800998ecf8427e\"")
                    .build()
            });
        let client = mock_client!(aws_sdk_s3, RuleMode::Sequential, &[&head_object]);

        assert_eq!(
            blob(client).cloud_native_checksum().await?,
            "d41d8cd98f00b204e9800998ecf8427e"
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_get_tags() -> Result<()> {
        let get_tagging = mock!(Client::get_object_tagging)
            .match_requests(|req| req.bucket() == Some("bucket") && req.key() == Some("key"))
            .then_output(|| {
                GetObjectTaggingOutput::builder()
                    .tag_set(
                        Tag::builder()
                            .key("SSDS_MD5")
                            .value("d41d8cd98f00b204e9800998ecf8427e")
                            .build()
                            .unwrap(),
                    )
                    .build()
                    .unwrap()
            });
        let client = mock_client!(aws_sdk_s3, RuleMode::Sequential, &[&get_tagging]);

        let tags = blob(client).get_tags().await?;
        assert_eq!(
            tags.get("SSDS_MD5").map(String::as_str),
            Some("d41d8cd98f00b204e9800998ecf8427e")
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_copy_is_multipart() -> Result<()> {
        let head_object = mock!(Client::head_object).then_output(|| {
            HeadObjectOutput::builder()
                .content_length((crate::blobstore::AWS_MIN_CHUNK_SIZE + 1) as i64)
                .build()
        });
        let client = mock_client!(aws_sdk_s3, RuleMode::Sequential, &[&head_object]);

        assert!(blob(client).copy_is_multipart().await?);

        Ok(())
    }

    #[tokio::test]
    async fn test_get_collects_body() -> Result<()> {
        use aws_sdk_s3::operation::get_object::GetObjectOutput;

        let get_object = mock!(Client::get_object)
            .match_requests(|req| req.bucket() == Some("bucket") && req.key() == Some("key"))
            .then_output(|| {
                GetObjectOutput::builder()
                    .body(ByteStream::from_static(b"some data"))
                    .build()
            });
        let client = mock_client!(aws_sdk_s3, RuleMode::Sequential, &[&get_object]);

        assert_eq!(blob(client).get().await?.as_ref(), b"some data");

        Ok(())
    }
}

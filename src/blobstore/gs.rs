//! The GCS blob adapter, speaking the JSON API directly.
//!
//! Credentials are resolved via Application Default Credentials: the
//! `GOOGLE_OAUTH_ACCESS_TOKEN` environment variable, a service-account or
//! authorized-user credentials file, or the GCE metadata server. Requester
//! pays buckets are supported by forwarding a billing project as the
//! `userProject` parameter on every request.

use crate::blobstore::{
    get_s3_multipart_chunk_size, number_of_parts, Part, PartStream, Provider, TagMap,
};
use crate::concurrency::{AsyncQueue, AsyncSet, DEFAULT_CONCURRENCY};
use crate::error::Error::{BlobNotFound, GcsError};
use crate::error::Result;
use crate::retry::{transient, transient_or_not_found, Retry};
use async_stream::stream;
use bytes::Bytes;
use futures_util::{pin_mut, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

/// GCS JSON API base URL.
const GCS_API_BASE: &str = "https://storage.googleapis.com/storage/v1";

/// GCS media upload base URL.
const GCS_UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

/// GCS compose supports at most this many source objects per call.
const MAX_COMPOSE_SOURCES: usize = 32;

/// Resolve a billing project for requester-pays buckets. An explicit value
/// wins, then the first non-empty of `GOOGLE_PROJECT`, `GCLOUD_PROJECT`,
/// `GCP_PROJECT`.
pub fn resolve_billing_project(billing_project: Option<String>) -> Option<String> {
    billing_project.or_else(|| {
        ["GOOGLE_PROJECT", "GCLOUD_PROJECT", "GCP_PROJECT"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|value| !value.is_empty()))
    })
}

#[derive(Debug)]
struct CachedToken {
    access_token: String,
    expiry: Instant,
}

/// OAuth2 access tokens via Application Default Credentials, cached with a
/// safety margin.
#[derive(Debug, Default)]
struct TokenProvider {
    cache: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    async fn token(&self, http: &reqwest::Client) -> Result<String> {
        {
            let cache = self.cache.lock().expect("token cache mutex poisoned");
            if let Some(cached) = cache.as_ref() {
                if cached.expiry > Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let (access_token, expires_in) = self.fetch(http).await?;
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));

        let mut cache = self.cache.lock().expect("token cache mutex poisoned");
        *cache = Some(CachedToken {
            access_token: access_token.clone(),
            expiry,
        });

        Ok(access_token)
    }

    async fn fetch(&self, http: &reqwest::Client) -> Result<(String, u64)> {
        if let Ok(token) = std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            return Ok((token, 3600));
        }

        if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            return Self::token_from_credentials_file(http, &path).await;
        }

        let adc_path = Self::application_default_credentials_path();
        if fs::try_exists(&adc_path).await.unwrap_or(false) {
            return Self::token_from_credentials_file(http, &adc_path).await;
        }

        Self::token_from_metadata_server(http).await
    }

    fn application_default_credentials_path() -> String {
        if let Ok(config_dir) = std::env::var("CLOUDSDK_CONFIG") {
            return format!("{}/application_default_credentials.json", config_dir);
        }
        if let Ok(home) = std::env::var("HOME") {
            return format!(
                "{}/.config/gcloud/application_default_credentials.json",
                home
            );
        }
        ".config/gcloud/application_default_credentials.json".to_string()
    }

    async fn token_from_credentials_file(
        http: &reqwest::Client,
        path: &str,
    ) -> Result<(String, u64)> {
        let contents = fs::read_to_string(path).await?;
        let credentials: serde_json::Value = serde_json::from_str(&contents)?;

        let field = |name: &str| {
            credentials
                .get(name)
                .and_then(|value| value.as_str())
                .unwrap_or("")
                .to_string()
        };

        match field("type").as_str() {
            "authorized_user" => {
                Self::token_from_refresh(
                    http,
                    &field("client_id"),
                    &field("client_secret"),
                    &field("refresh_token"),
                )
                .await
            }
            // Service-account keys need RSA JWT signing; defer to the
            // metadata server or an explicit access token.
            _ => Self::token_from_metadata_server(http).await,
        }
    }

    async fn token_from_refresh(
        http: &reqwest::Client,
        client_id: &str,
        client_secret: &str,
        refresh_token: &str,
    ) -> Result<(String, u64)> {
        let response = http
            .post("https://oauth2.googleapis.com/token")
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GcsError(format!("token refresh failed {}: {}", status, body)));
        }

        let token: serde_json::Value = response.json().await?;
        let access_token = token
            .get("access_token")
            .and_then(|value| value.as_str())
            .ok_or_else(|| GcsError("no access_token in token response".to_string()))?
            .to_string();
        let expires_in = token
            .get("expires_in")
            .and_then(|value| value.as_u64())
            .unwrap_or(3600);

        Ok((access_token, expires_in))
    }

    async fn token_from_metadata_server(http: &reqwest::Client) -> Result<(String, u64)> {
        let response = http
            .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
            .header("Metadata-Flavor", "Google")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|err| {
                GcsError(format!(
                    "no usable GCP credentials: {}. Set GOOGLE_APPLICATION_CREDENTIALS, \
                     run `gcloud auth application-default login`, or set \
                     GOOGLE_OAUTH_ACCESS_TOKEN",
                    err
                ))
            })?;

        if !response.status().is_success() {
            return Err(GcsError(format!(
                "metadata server returned {}",
                response.status()
            )));
        }

        let token: serde_json::Value = response.json().await?;
        let access_token = token
            .get("access_token")
            .and_then(|value| value.as_str())
            .ok_or_else(|| GcsError("no access_token from metadata server".to_string()))?
            .to_string();
        let expires_in = token
            .get("expires_in")
            .and_then(|value| value.as_u64())
            .unwrap_or(3600);

        Ok((access_token, expires_in))
    }
}

/// An object resource returned by the JSON API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GsObjectResource {
    pub name: Option<String>,
    pub size: Option<String>,
    pub crc32c: Option<String>,
    pub metadata: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RewriteResponse {
    done: bool,
    rewrite_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    items: Option<Vec<GsObjectResource>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ComposeSource {
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ComposeRequest {
    source_objects: Vec<ComposeSource>,
    destination: serde_json::Value,
}

/// A shared GCS JSON API client. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct GsClient {
    http: reqwest::Client,
    token: std::sync::Arc<TokenProvider>,
}

impl GsClient {
    /// Create a new client.
    pub fn new() -> Self {
        Self::default()
    }

    fn object_url(bucket: &str, key: &str) -> String {
        format!(
            "{}/b/{}/o/{}",
            GCS_API_BASE,
            bucket,
            urlencoding::encode(key)
        )
    }

    fn billing_query(billing_project: Option<&str>) -> Vec<(&'static str, String)> {
        billing_project
            .map(|project| vec![("userProject", project.to_string())])
            .unwrap_or_default()
    }

    async fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self.token.token(&self.http).await?;
        Ok(request.bearer_auth(token))
    }

    /// Send a request, mapping 404 to `BlobNotFound` with `not_found_url`
    /// and any other failure status to `GcsError`.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        not_found_url: &str,
    ) -> Result<reqwest::Response> {
        let response = self.authorize(request).await?.send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BlobNotFound(not_found_url.to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GcsError(format!("{}: {}", status, body)));
        }

        Ok(response)
    }

    /// Get an object's resource metadata.
    pub async fn object_meta(
        &self,
        bucket: &str,
        key: &str,
        billing_project: Option<&str>,
    ) -> Result<GsObjectResource> {
        let url = Self::object_url(bucket, key);
        let not_found = Provider::format_gs(bucket, key);

        Retry::default()
            .run(transient, || {
                let url = &url;
                let not_found = &not_found;
                async move {
                    let request = self
                        .http
                        .get(url)
                        .query(&Self::billing_query(billing_project));
                    Ok(self.send(request, not_found).await?.json().await?)
                }
            })
            .await
    }

    /// Download an object, or an inclusive byte range of it.
    pub async fn download(
        &self,
        bucket: &str,
        key: &str,
        billing_project: Option<&str>,
        range: Option<(u64, u64)>,
    ) -> Result<Bytes> {
        let url = Self::object_url(bucket, key);
        let not_found = Provider::format_gs(bucket, key);

        Retry::default()
            .run(transient, || {
                let url = &url;
                let not_found = &not_found;
                async move {
                    let mut request = self
                        .http
                        .get(url)
                        .query(&[("alt", "media")])
                        .query(&Self::billing_query(billing_project));
                    if let Some((start, end)) = range {
                        request = request.header("Range", format!("bytes={}-{}", start, end));
                    }

                    Ok(self.send(request, not_found).await?.bytes().await?)
                }
            })
            .await
    }

    /// Upload an object with a single media request.
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        billing_project: Option<&str>,
        data: Bytes,
    ) -> Result<GsObjectResource> {
        let url = format!("{}/b/{}/o", GCS_UPLOAD_BASE, bucket);
        let not_found = Provider::format_gs(bucket, key);

        Retry::default()
            .run(transient, || {
                let url = &url;
                let not_found = &not_found;
                let data = data.clone();
                async move {
                    let request = self
                        .http
                        .post(url)
                        .query(&[("uploadType", "media"), ("name", key)])
                        .query(&Self::billing_query(billing_project))
                        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                        .body(data);
                    Ok(self.send(request, not_found).await?.json().await?)
                }
            })
            .await
    }

    /// Patch an object's custom metadata. Not-found is in the retried fault
    /// set because it appears transiently right after a compose.
    pub async fn patch_metadata(
        &self,
        bucket: &str,
        key: &str,
        billing_project: Option<&str>,
        metadata: &TagMap,
    ) -> Result<()> {
        let url = Self::object_url(bucket, key);
        let not_found = Provider::format_gs(bucket, key);
        let body = serde_json::json!({ "metadata": metadata });

        Retry::default()
            .run(transient_or_not_found, || {
                let url = &url;
                let not_found = &not_found;
                let body = &body;
                async move {
                    let request = self
                        .http
                        .patch(url)
                        .query(&Self::billing_query(billing_project))
                        .json(body);
                    self.send(request, not_found).await?;
                    Ok(())
                }
            })
            .await
    }

    /// One step of a server-side rewrite. Returns the continuation token
    /// until the rewrite reports completion.
    async fn rewrite_step(
        &self,
        source: (&str, &str),
        destination: (&str, &str),
        billing_project: Option<&str>,
        rewrite_token: Option<String>,
    ) -> Result<RewriteResponse> {
        let url = format!(
            "{}/b/{}/o/{}/rewriteTo/b/{}/o/{}",
            GCS_API_BASE,
            source.0,
            urlencoding::encode(source.1),
            destination.0,
            urlencoding::encode(destination.1),
        );
        let not_found = Provider::format_gs(source.0, source.1);

        Retry::default()
            .run(transient, || {
                let url = &url;
                let not_found = &not_found;
                let rewrite_token = rewrite_token.clone();
                async move {
                    let mut request = self
                        .http
                        .post(url)
                        .query(&Self::billing_query(billing_project))
                        .json(&serde_json::json!({}));
                    if let Some(token) = rewrite_token {
                        request = request.query(&[("rewriteToken", token)]);
                    }

                    Ok(self.send(request, not_found).await?.json().await?)
                }
            })
            .await
    }

    /// Server-side copy via rewrite, iterating continuation tokens.
    pub async fn rewrite(
        &self,
        source: (&str, &str),
        destination: (&str, &str),
        billing_project: Option<&str>,
    ) -> Result<()> {
        let mut token: Option<String> = None;
        loop {
            let response = self
                .rewrite_step(source, destination, billing_project, token)
                .await?;
            if response.done {
                return Ok(());
            }

            token = response.rewrite_token;
            if token.is_none() {
                return Err(GcsError("rewrite returned no continuation token".to_string()));
            }
        }
    }

    /// Compose source objects, in the given order, into a destination
    /// object.
    pub async fn compose(
        &self,
        bucket: &str,
        sources: &[String],
        destination_key: &str,
        billing_project: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/compose", Self::object_url(bucket, destination_key));
        let not_found = Provider::format_gs(bucket, destination_key);
        let body = ComposeRequest {
            source_objects: sources
                .iter()
                .map(|name| ComposeSource { name: name.clone() })
                .collect(),
            destination: serde_json::json!({}),
        };

        Retry::default()
            .run(transient, || {
                let url = &url;
                let not_found = &not_found;
                let body = &body;
                async move {
                    let request = self
                        .http
                        .post(url)
                        .query(&Self::billing_query(billing_project))
                        .json(body);
                    self.send(request, not_found).await?;
                    Ok(())
                }
            })
            .await
    }

    /// Delete an object.
    pub async fn delete(
        &self,
        bucket: &str,
        key: &str,
        billing_project: Option<&str>,
    ) -> Result<()> {
        let url = Self::object_url(bucket, key);
        let not_found = Provider::format_gs(bucket, key);

        Retry::default()
            .run(transient, || {
                let url = &url;
                let not_found = &not_found;
                async move {
                    let request = self
                        .http
                        .delete(url)
                        .query(&Self::billing_query(billing_project));
                    self.send(request, not_found).await?;
                    Ok(())
                }
            })
            .await
    }

    /// The email behind the active credentials, for release manifests.
    /// Best effort.
    pub async fn identity_email(&self) -> Option<String> {
        let token = self.token.token(&self.http).await.ok()?;
        let response = self
            .http
            .get("https://www.googleapis.com/oauth2/v1/tokeninfo")
            .query(&[("access_token", token)])
            .send()
            .await
            .ok()?;

        let info: serde_json::Value = response.json().await.ok()?;
        info.get("email")
            .and_then(|email| email.as_str())
            .map(ToString::to_string)
    }

    /// List one page of objects under a prefix.
    async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        billing_project: Option<&str>,
        page_token: Option<String>,
    ) -> Result<ListResponse> {
        let url = format!("{}/b/{}/o", GCS_API_BASE, bucket);
        let not_found = format!("gs://{}", bucket);

        Retry::default()
            .run(transient, || {
                let url = &url;
                let not_found = &not_found;
                let page_token = page_token.clone();
                async move {
                    let mut request = self
                        .http
                        .get(url)
                        .query(&[("prefix", prefix)])
                        .query(&Self::billing_query(billing_project));
                    if let Some(token) = page_token {
                        request = request.query(&[("pageToken", token)]);
                    }

                    Ok(self.send(request, not_found).await?.json().await?)
                }
            })
            .await
    }
}

/// A GCS bucket.
#[derive(Debug, Clone)]
pub struct GsBlobStore {
    client: GsClient,
    bucket: String,
    billing_project: Option<String>,
}

impl GsBlobStore {
    /// Create a new store for a bucket. The billing project falls back to
    /// the environment chain.
    pub fn new(client: GsClient, bucket: String, billing_project: Option<String>) -> Self {
        Self {
            client,
            bucket,
            billing_project: resolve_billing_project(billing_project),
        }
    }

    /// The bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Get a blob handle for a key.
    pub fn blob(&self, key: &str) -> GsBlob {
        GsBlob {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.to_string(),
            billing_project: self.billing_project.clone(),
        }
    }

    /// List blobs under a prefix, following page tokens lazily.
    pub fn list(&self, prefix: &str) -> impl Stream<Item = Result<GsBlob>> + Send {
        let store = self.clone();
        let prefix = prefix.to_string();

        stream! {
            let mut page_token: Option<String> = None;
            loop {
                let page = store
                    .client
                    .list_page(
                        &store.bucket,
                        &prefix,
                        store.billing_project.as_deref(),
                        page_token.take(),
                    )
                    .await;

                match page {
                    Ok(page) => {
                        for item in page.items.unwrap_or_default() {
                            if let Some(name) = item.name {
                                yield Ok(store.blob(&name));
                            }
                        }

                        page_token = page.next_page_token;
                        if page_token.is_none() {
                            break;
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                }
            }
        }
    }
}

/// A single GCS object.
#[derive(Debug, Clone)]
pub struct GsBlob {
    client: GsClient,
    bucket: String,
    key: String,
    billing_project: Option<String>,
}

impl GsBlob {
    /// Create a new blob handle.
    pub fn new(
        client: GsClient,
        bucket: String,
        key: String,
        billing_project: Option<String>,
    ) -> Self {
        Self {
            client,
            bucket,
            key,
            billing_project: resolve_billing_project(billing_project),
        }
    }

    /// The canonical url of the blob.
    pub fn url(&self) -> String {
        Provider::format_gs(&self.bucket, &self.key)
    }

    /// The key of the blob.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The bucket holding the blob.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn billing(&self) -> Option<&str> {
        self.billing_project.as_deref()
    }

    async fn meta(&self) -> Result<GsObjectResource> {
        self.client
            .object_meta(&self.bucket, &self.key, self.billing())
            .await
    }

    /// Check whether the object exists.
    pub async fn exists(&self) -> Result<bool> {
        match self.meta().await {
            Ok(_) => Ok(true),
            Err(BlobNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Get the size of the object.
    pub async fn size(&self) -> Result<u64> {
        let meta = self.meta().await?;
        meta.size
            .ok_or_else(|| GcsError(format!("missing size for {}", self.url())))?
            .parse()
            .map_err(|err| GcsError(format!("invalid size for {}: {}", self.url(), err)))
    }

    /// Read the whole object.
    pub async fn get(&self) -> Result<Bytes> {
        self.client
            .download(&self.bucket, &self.key, self.billing(), None)
            .await
    }

    /// Read an inclusive byte range of the object.
    pub async fn get_range(&self, start: u64, end: u64) -> Result<Bytes> {
        self.client
            .download(&self.bucket, &self.key, self.billing(), Some((start, end)))
            .await
    }

    /// Write the whole object.
    pub async fn put(&self, data: Bytes) -> Result<()> {
        self.client
            .upload(&self.bucket, &self.key, self.billing(), data)
            .await?;

        Ok(())
    }

    /// Get the object's tags from its custom metadata.
    pub async fn get_tags(&self) -> Result<TagMap> {
        Ok(self.meta().await?.metadata.unwrap_or_default())
    }

    /// Write the object's tags into its custom metadata.
    pub async fn put_tags(&self, tags: &TagMap) -> Result<()> {
        self.client
            .patch_metadata(&self.bucket, &self.key, self.billing(), tags)
            .await
    }

    /// The object's base64 CRC32C from its metadata.
    pub async fn cloud_native_checksum(&self) -> Result<String> {
        self.meta()
            .await?
            .crc32c
            .ok_or_else(|| GcsError(format!("missing crc32c for {}", self.url())))
    }

    /// Whether an intra-store copy from `source` must pass data through this
    /// process: rewrite is unavailable when the source bucket is requester
    /// pays.
    pub fn copy_is_multipart(&self) -> bool {
        self.billing_project.is_some()
    }

    /// Intra-store copy into this blob: server-side rewrite, or chunked
    /// passthrough for requester-pays sources.
    pub async fn copy_from(&self, source: &GsBlob) -> Result<()> {
        if self.url() == source.url() {
            return Ok(());
        }

        if source.billing_project.is_none() {
            return self
                .client
                .rewrite(
                    (&source.bucket, &source.key),
                    (&self.bucket, &self.key),
                    self.billing(),
                )
                .await;
        }

        let mut writer = self.multipart_writer();
        let result: Result<()> = async {
            let parts = source.parts().await?;
            pin_mut!(parts);
            while let Some(part) = parts.next().await {
                writer.put_part(part?).await?;
            }
            writer.close().await
        }
        .await;

        if result.is_err() {
            writer.abort().await;
        }

        result
    }

    /// Download the object to a local path, one chunk at a time.
    pub async fn download(&self, path: &Path) -> Result<()> {
        let mut file = fs::File::create(path).await?;

        let parts = self.parts().await?;
        pin_mut!(parts);
        while let Some(part) = parts.next().await {
            file.write_all(&part?.data).await?;
        }
        file.flush().await?;

        Ok(())
    }

    /// A lazy, ordered sequence of the object's parts. Ranged downloads are
    /// pipelined through a FIFO queue so ordering survives the concurrency.
    pub async fn parts(&self) -> Result<PartStream> {
        let size = self.size().await?;
        let chunk_size = get_s3_multipart_chunk_size(size);
        let part_count = number_of_parts(size);
        let blob = self.clone();

        let stream = stream! {
            if part_count == 1 {
                // Zero-byte objects still surface a single empty part.
                yield blob.get().await.map(|data| Part::new(0, data));
                return;
            }

            let mut fetches = AsyncQueue::new(DEFAULT_CONCURRENCY);
            for part_number in 0..part_count {
                let blob = blob.clone();
                let start = part_number * chunk_size;
                let end = (start + chunk_size).min(size) - 1;

                let put = fetches
                    .put(async move {
                        blob.get_range(start, end)
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

    /// Open a multipart writer at this blob's location.
    pub fn multipart_writer(&self) -> GsMultipartWriter {
        GsMultipartWriter::new(self.clone())
    }
}

/// The name of the temporary object holding one part of a multipart write.
fn part_object_name(key: &str, upload_id: &str, part_number: u64) -> String {
    format!("{}.part/{}/{:010}", key, upload_id, part_number)
}

/// Split ordered compose sources into API-sized batches: the first batch
/// takes the full ceiling, later batches lead with the accumulated
/// destination and take one fewer.
fn compose_plan(sources: &[String], destination: &str) -> Vec<Vec<String>> {
    let mut plan = vec![];
    let mut remaining = sources;

    while !remaining.is_empty() {
        let mut batch = vec![];
        let take = if plan.is_empty() {
            MAX_COMPOSE_SOURCES
        } else {
            batch.push(destination.to_string());
            MAX_COMPOSE_SOURCES - 1
        };

        let (head, tail) = remaining.split_at(take.min(remaining.len()));
        batch.extend(head.iter().cloned());
        plan.push(batch);
        remaining = tail;
    }

    plan
}

/// A multipart sink that uploads parts as temporary objects and assembles
/// them with compose on close. Bytes of the final object equal the
/// concatenation of parts in ascending number order.
pub struct GsMultipartWriter {
    blob: GsBlob,
    upload_id: String,
    uploads: AsyncSet<Result<(u64, String)>>,
    part_names: Vec<(u64, String)>,
    closed: bool,
}

impl GsMultipartWriter {
    fn new(blob: GsBlob) -> Self {
        Self {
            blob,
            upload_id: Uuid::new_v4().to_string(),
            uploads: AsyncSet::new(DEFAULT_CONCURRENCY),
            part_names: vec![],
            closed: false,
        }
    }

    fn collect_finished(&mut self) -> Result<()> {
        for part in self.uploads.consume_finished()? {
            self.part_names.push(part?);
        }

        Ok(())
    }

    /// Accept a part for upload.
    pub async fn put_part(&mut self, part: Part) -> Result<()> {
        self.collect_finished()?;

        let client = self.blob.client.clone();
        let bucket = self.blob.bucket.clone();
        let billing_project = self.blob.billing_project.clone();
        let name = part_object_name(&self.blob.key, &self.upload_id, part.number);

        self.uploads
            .put(async move {
                client
                    .upload(&bucket, &name, billing_project.as_deref(), part.data)
                    .await?;
                Ok((part.number, name))
            })
            .await
    }

    /// Finish the upload: compose the parts in ascending number order and
    /// delete the temporaries.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        for part in self.uploads.consume().await? {
            self.part_names.push(part?);
        }
        self.part_names.sort_by_key(|(number, _)| *number);

        if self.part_names.is_empty() {
            return self.blob.put(Bytes::new()).await;
        }

        let sources = self
            .part_names
            .iter()
            .map(|(_, name)| name.clone())
            .collect::<Vec<_>>();
        for batch in compose_plan(&sources, &self.blob.key) {
            self.blob
                .client
                .compose(&self.blob.bucket, &batch, &self.blob.key, self.blob.billing())
                .await?;
        }

        self.delete_parts().await;

        Ok(())
    }

    /// Abandon the upload, deleting any uploaded temporaries.
    pub async fn abort(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Ok(parts) = self.uploads.consume().await {
            self.part_names.extend(parts.into_iter().flatten());
        }
        self.delete_parts().await;
    }

    async fn delete_parts(&self) {
        for (_, name) in &self.part_names {
            let delete = self
                .blob
                .client
                .delete(&self.blob.bucket, name, self.blob.billing())
                .await;
            if let Err(err) = delete {
                warn!(
                    "failed to delete part object gs://{}/{}: {}",
                    self.blob.bucket, name, err
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use anyhow::Result;

    #[test]
    fn test_billing_project_explicit_wins() {
        assert_eq!(
            resolve_billing_project(Some("explicit-project".to_string())),
            Some("explicit-project".to_string())
        );
    }

    #[test]
    fn test_part_object_name_sorts_lexically() {
        let first = part_object_name("data/file.bin", "upload", 2);
        let second = part_object_name("data/file.bin", "upload", 10);

        assert!(first < second);
        assert!(first.starts_with("data/file.bin.part/upload/"));
    }

    #[test]
    fn test_compose_plan_single_batch() {
        let sources = (0..5).map(|n| format!("part-{}", n)).collect::<Vec<_>>();
        let plan = compose_plan(&sources, "final");

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0], sources);
    }

    #[test]
    fn test_compose_plan_exactly_at_ceiling() {
        let sources = (0..32).map(|n| format!("part-{}", n)).collect::<Vec<_>>();
        let plan = compose_plan(&sources, "final");

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].len(), 32);
    }

    #[test]
    fn test_compose_plan_folds_accumulator() {
        let sources = (0..100).map(|n| format!("part-{}", n)).collect::<Vec<_>>();
        let plan = compose_plan(&sources, "final");

        // 32, then 31 more per batch with the accumulated destination first.
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[0].len(), 32);
        for batch in &plan[1..] {
            assert_eq!(batch[0], "final");
            assert!(batch.len() <= 32);
        }

        let composed = plan
            .iter()
            .flat_map(|batch| batch.iter())
            .filter(|name| *name != "final")
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(composed, sources);
    }

    #[test]
    fn test_object_url_encodes_key() {
        let url = GsClient::object_url("bucket", "a/b c+d");
        assert!(url.ends_with("/b/bucket/o/a%2Fb%20c%2Bd"));
    }

    #[test]
    fn test_list_response_parses() -> Result<()> {
        let json = r#"{
            "items": [
                {"name": "submissions/a", "size": "7", "crc32c": "IkVmrQ=="},
                {"name": "submissions/b", "metadata": {"SSDS_MD5": "abc"}}
            ],
            "nextPageToken": "token"
        }"#;

        let response: ListResponse = serde_json::from_str(json)?;
        let items = response.items.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].size.as_deref(), Some("7"));
        assert_eq!(
            items[1].metadata.as_ref().unwrap().get("SSDS_MD5").unwrap(),
            "abc"
        );
        assert_eq!(response.next_page_token.as_deref(), Some("token"));

        Ok(())
    }
}

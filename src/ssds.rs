//! The submission layout service: key composition, naming rules, listings,
//! and the upload/sync/release operations.
//!

use crate::blobstore::{AnyBlob, AnyBlobStore, Provider};
use crate::error::Error::InvalidValue;
use crate::error::{Error, Result};
use crate::storage::{CopyClient, CopyCompleted, Router};
use async_stream::stream;
use aws_config::BehaviorVersion;
use chrono::Utc;
use futures_util::{pin_mut, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::info;

/// The maximum object key length for S3 and GS object names.
pub const MAX_KEY_LENGTH: usize = 1024;

/// The prefix grouping all submissions.
pub const STAGING_PREFIX: &str = "submissions";

/// The prefix release destinations must live under.
pub const RELEASE_PREFIX: &str = "working";

/// Where release manifests are written within a submission.
pub const MANIFEST_PREFIX: &str = "release-transfer-manifests";

/// Separates the submission id from its name. Not using "/" produces
/// friendlier native CLI listings, one submission per row.
const NAME_DELIMITER: &str = "--";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H%M%S%.6fZ";

/// The current UTC time in manifest timestamp form.
pub fn timestamp_now() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Check the naming rules: no spaces and no occurrence of the id/name
/// delimiter.
pub fn validate_name(name: &str) -> Result<()> {
    if name.contains(' ') {
        return Err(InvalidValue(format!(
            "submission name cannot contain spaces: {}",
            name
        )));
    }
    if name.contains(NAME_DELIMITER) {
        return Err(InvalidValue(format!(
            "submission name cannot contain '{}': {}",
            NAME_DELIMITER, name
        )));
    }

    Ok(())
}

/// Split an ssds key into its submission id and name. Keys that do not
/// parse as `<id>--<name>/<rest>` return nothing.
fn parse_ssds_key(ssds_key: &str) -> Option<(String, String)> {
    let (submission_id, rest) = ssds_key.split_once(NAME_DELIMITER)?;
    let (name, _) = rest.split_once('/')?;

    Some((submission_id.to_string(), name.to_string()))
}

/// A submission store bound to one bucket and staging prefix.
#[derive(Debug, Clone)]
pub struct Ssds {
    blobstore: AnyBlobStore,
    prefix: String,
}

impl Ssds {
    /// Create a new service over a store, using the staging prefix.
    pub fn new(blobstore: AnyBlobStore) -> Self {
        Self {
            blobstore,
            prefix: STAGING_PREFIX.to_string(),
        }
    }

    /// The underlying blob store.
    pub fn blobstore(&self) -> &AnyBlobStore {
        &self.blobstore
    }

    /// The staging prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The url of the backing bucket.
    pub fn bucket_url(&self) -> String {
        format!("{}{}", self.blobstore.schema(), self.blobstore.bucket())
    }

    /// The full store key for an ssds key.
    pub fn blobstore_key(&self, ssds_key: &str) -> String {
        format!("{}/{}", self.prefix, ssds_key)
    }

    /// The url of the object holding an ssds key.
    pub fn compose_blobstore_url(&self, ssds_key: &str) -> String {
        format!(
            "{}{}/{}",
            self.blobstore.schema(),
            self.blobstore.bucket(),
            self.blobstore_key(ssds_key)
        )
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&format!("{}/", self.prefix)).unwrap_or(key)
    }

    /// Compose the ssds key for a file in a submission, enforcing the
    /// naming rules and the key-length ceiling.
    pub fn compose_ssds_key(
        &self,
        submission_id: &str,
        name: &str,
        relpath: &str,
    ) -> Result<String> {
        validate_name(name)?;

        let ssds_key = format!(
            "{}{}{}/{}",
            submission_id,
            NAME_DELIMITER,
            name,
            relpath.trim_matches('/')
        );
        let key = self.blobstore_key(&ssds_key);
        if key.len() >= MAX_KEY_LENGTH {
            return Err(InvalidValue(format!(
                "total key length must not exceed {} characters: {} is too long, \
                 use a shorter submission name",
                MAX_KEY_LENGTH, key
            )));
        }

        Ok(ssds_key)
    }

    /// List submissions as `(submission_id, name)` pairs, deduplicated by
    /// id. Keys that do not parse are skipped.
    pub fn list(&self) -> impl Stream<Item = Result<(String, String)>> + Send {
        let service = self.clone();

        stream! {
            let listing = service.blobstore.list(&service.prefix);
            pin_mut!(listing);

            let mut previous_id = String::new();
            while let Some(blob) = listing.next().await {
                let blob = match blob {
                    Ok(blob) => blob,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };

                let Some((submission_id, name)) = parse_ssds_key(service.strip_prefix(blob.key()))
                else {
                    continue;
                };

                if submission_id != previous_id {
                    previous_id = submission_id.clone();
                    yield Ok((submission_id, name));
                }
            }
        }
    }

    /// List the ssds keys of one submission.
    pub fn list_submission(
        &self,
        submission_id: &str,
    ) -> impl Stream<Item = Result<String>> + Send {
        let service = self.clone();
        let prefix = format!("{}/{}", self.prefix, submission_id);

        stream! {
            let listing = service.blobstore.list(&prefix);
            pin_mut!(listing);

            while let Some(blob) = listing.next().await {
                yield blob.map(|blob| service.strip_prefix(blob.key()).to_string());
            }
        }
    }

    /// Get the name of a submission, or nothing when the submission has no
    /// objects.
    pub async fn get_submission_name(&self, submission_id: &str) -> Result<Option<String>> {
        let listing = self
            .blobstore
            .list(&format!("{}/{}", self.prefix, submission_id));
        pin_mut!(listing);

        match listing.next().await {
            Some(blob) => Ok(parse_ssds_key(self.strip_prefix(blob?.key())).map(|(_, name)| name)),
            None => Ok(None),
        }
    }

    /// Get the full store prefix of a submission,
    /// `<prefix>/<id>--<name>`, or nothing when the submission is absent.
    pub async fn get_submission_prefix(&self, submission_id: &str) -> Result<Option<String>> {
        Ok(self
            .get_submission_name(submission_id)
            .await?
            .map(|name| format!("{}/{}{}{}", self.prefix, submission_id, NAME_DELIMITER, name)))
    }

    /// Resolve the name to use for an upload: an omitted name is read from
    /// the existing submission, and a name change is a forbidden rename.
    async fn resolve_name(&self, submission_id: &str, name: Option<&str>) -> Result<String> {
        let existing = self.get_submission_name(submission_id).await?;

        match (name, existing) {
            (None, None) => Err(InvalidValue(
                "must provide name for new submissions".to_string(),
            )),
            (None, Some(existing)) => Ok(existing),
            (Some(name), Some(existing)) if name != existing => Err(InvalidValue(
                "cannot update name of existing submission".to_string(),
            )),
            (Some(name), _) => {
                validate_name(name)?;
                Ok(name.to_string())
            }
        }
    }

    /// Upload a directory tree or cloud prefix into a submission, yielding
    /// each ssds key as its transfer completes. Every destination key is
    /// validated before any bytes move.
    pub fn upload(
        &self,
        router: &Router,
        src_url: &str,
        submission_id: &str,
        name: Option<&str>,
        subdir: Option<&str>,
    ) -> impl Stream<Item = Result<String>> + Send {
        let service = self.clone();
        let router = router.clone();
        let src_url = src_url.to_string();
        let submission_id = submission_id.to_string();
        let name = name.map(ToString::to_string);
        let subdir = subdir
            .map(|subdir| subdir.trim_matches('/').to_string())
            .filter(|subdir| !subdir.is_empty());

        stream! {
            let name = match service.resolve_name(&submission_id, name.as_deref()).await {
                Ok(name) => name,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            let pairs = match service
                .gather_upload_pairs(&router, &src_url, &submission_id, &name, subdir.as_deref())
                .await
            {
                Ok(pairs) => pairs,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            let mut client = CopyClient::default();
            for (source, ssds_key) in pairs {
                info!("uploading {} to {}", source.url(), service.compose_blobstore_url(&ssds_key));
                let destination = service.blobstore.blob(&service.blobstore_key(&ssds_key));
                if let Err(err) = client.copy(source, destination).await {
                    yield Err(err);
                    return;
                }

                for event in client.completed() {
                    yield service.event_to_key(event);
                }
            }

            match client.close().await {
                Ok(events) => {
                    for event in events {
                        yield service.event_to_key(event);
                    }
                }
                Err(err) => yield Err(err),
            }
        }
    }

    /// Collect the source listing and compose every destination key,
    /// enforcing the key-length ceiling for all of them up front.
    async fn gather_upload_pairs(
        &self,
        router: &Router,
        src_url: &str,
        submission_id: &str,
        name: &str,
        subdir: Option<&str>,
    ) -> Result<Vec<(AnyBlob, String)>> {
        let (src_prefix, store) = router.blobstore_for_url(src_url)?;
        let listing = store.list(&src_prefix);
        pin_mut!(listing);

        let mut pairs = vec![];
        while let Some(blob) = listing.next().await {
            let blob = blob?;

            let suffix = blob
                .key()
                .strip_prefix(src_prefix.trim_matches('/'))
                .unwrap_or(blob.key())
                .trim_matches('/')
                .to_string();
            let relpath = match subdir {
                Some(subdir) => format!("{}/{}", subdir, suffix),
                None => suffix,
            };

            let ssds_key = self.compose_ssds_key(submission_id, name, &relpath)?;
            pairs.push((blob, ssds_key));
        }

        Ok(pairs)
    }

    /// Copy a single file into a submission and wait for it to land.
    /// Returns the ssds key.
    pub async fn copy(
        &self,
        router: &Router,
        src_url: &str,
        submission_id: &str,
        name: Option<&str>,
        submission_path: &str,
    ) -> Result<String> {
        let name = self.resolve_name(submission_id, name).await?;
        let ssds_key = self.compose_ssds_key(submission_id, &name, submission_path)?;

        let source = router.blob_for_url(src_url)?;
        let destination = self.blobstore.blob(&self.blobstore_key(&ssds_key));

        let mut client = CopyClient::default();
        client.copy(source, destination).await?;
        for event in client.close().await? {
            if let Some(err) = event.error {
                return Err(err);
            }
        }

        Ok(ssds_key)
    }

    fn event_to_key(&self, event: CopyCompleted) -> Result<String> {
        match event.error {
            Some(err) => Err(err),
            None => Ok(self.strip_prefix(event.destination.key()).to_string()),
        }
    }

    /// Resolve a transfer url into a key within this service's store,
    /// rejecting urls that point at another store or bucket.
    fn key_in_store(&self, url: &str) -> Result<String> {
        let provider = Provider::try_from(url)?;

        match (&self.blobstore, provider) {
            (AnyBlobStore::S3(store), Provider::S3 { bucket, key }) if bucket == store.bucket() => {
                Ok(key)
            }
            (AnyBlobStore::Gs(store), Provider::Gs { bucket, key }) if bucket == store.bucket() => {
                Ok(key)
            }
            (AnyBlobStore::Local(store), Provider::File { path }) => Ok(path
                .strip_prefix(store.base_path())
                .map_err(|_| {
                    InvalidValue(format!("{} is not within {}", url, self.bucket_url()))
                })?
                .to_string_lossy()
                .to_string()),
            _ => Err(InvalidValue(format!(
                "{} is not within {}",
                url,
                self.bucket_url()
            ))),
        }
    }
}

/// Copy everything under a submission from `source` to `destination`,
/// skipping keys whose destination already carries identical tags. Yields
/// the ssds key of each transferred object.
pub fn sync(
    submission_id: &str,
    source: &Ssds,
    destination: &Ssds,
) -> impl Stream<Item = Result<String>> + Send {
    let submission_id = submission_id.to_string();
    let source = source.clone();
    let destination = destination.clone();

    stream! {
        let listing = source
            .blobstore
            .list(&format!("{}/{}", source.prefix, submission_id));
        pin_mut!(listing);

        let mut client = CopyClient::default();
        while let Some(blob) = listing.next().await {
            let src_blob = match blob {
                Ok(blob) => blob,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            let ssds_key = source.strip_prefix(src_blob.key()).to_string();
            let dst_blob = destination
                .blobstore
                .blob(&destination.blobstore_key(&ssds_key));

            match already_synced(&src_blob, &dst_blob).await {
                Ok(true) => {
                    info!("already synced: {}", ssds_key);
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }

            if let Err(err) = client.copy(src_blob, dst_blob).await {
                yield Err(err);
                return;
            }
            for event in client.completed() {
                yield destination.event_to_key(event);
            }
        }

        match client.close().await {
            Ok(events) => {
                for event in events {
                    yield destination.event_to_key(event);
                }
            }
            Err(err) => yield Err(err),
        }
    }
}

/// The already-synced check: the destination exists and its tags match the
/// source's. An optimization, not an interlock.
async fn already_synced(source: &AnyBlob, destination: &AnyBlob) -> Result<bool> {
    Ok(destination.exists().await? && destination.get_tags().await? == source.get_tags().await?)
}

/// One realized transfer in a release manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferEntry {
    pub src_key: String,
    pub dst_key: String,
}

/// The manifest written into a submission after a release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseManifest {
    pub submission_id: String,
    pub src_bucket: String,
    pub dst_bucket: String,
    pub aws_identity: Option<String>,
    pub gcp_identity: Option<String>,
    pub start_timestamp: String,
    pub end_timestamp: String,
    pub transfer_map: Vec<TransferEntry>,
}

/// Caller identities recorded in release manifests. Best effort, discovered
/// by the caller.
#[derive(Debug, Clone, Default)]
pub struct ReleaseIdentity {
    pub aws: Option<String>,
    pub gcp: Option<String>,
}

/// The AWS caller identity ARN, when credentials are available.
pub async fn aws_caller_identity() -> Option<String> {
    let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let client = aws_sdk_sts::Client::new(&config);

    client.get_caller_identity().send().await.ok()?.arn
}

/// Release curated submission objects into the `working/` prefix of the
/// destination store.
///
/// Every precondition is checked before any transfer starts: each source
/// must live inside the submission in the source store's bucket, each
/// destination under the release prefix in the destination store's bucket,
/// and no source or destination may repeat. The manifest is written into
/// the source submission only if at least one transfer succeeded.
pub async fn release(
    submission_id: &str,
    source: &Ssds,
    destination: &Ssds,
    transfers: &[(String, String)],
    identity: ReleaseIdentity,
) -> Result<ReleaseManifest> {
    let submission_prefix = source
        .get_submission_prefix(submission_id)
        .await?
        .ok_or_else(|| {
            InvalidValue(format!("no submission found for {}", submission_id))
        })?;

    let mut pairs = vec![];
    let mut seen_sources = HashSet::new();
    let mut seen_destinations = HashSet::new();
    for (src_url, dst_url) in transfers {
        let src_key = source.key_in_store(src_url)?;
        if !src_key.starts_with(&format!("{}/", submission_prefix)) {
            return Err(InvalidValue(format!(
                "{} is not part of submission {}",
                src_url, submission_id
            )));
        }

        let dst_key = destination.key_in_store(dst_url)?;
        if !dst_key.starts_with(&format!("{}/", RELEASE_PREFIX)) {
            return Err(InvalidValue(format!(
                "release destination {} is not under {}/",
                dst_url, RELEASE_PREFIX
            )));
        }

        if !seen_sources.insert(src_key.clone()) {
            return Err(InvalidValue(format!("duplicate release source {}", src_url)));
        }
        if !seen_destinations.insert(dst_key.clone()) {
            return Err(InvalidValue(format!(
                "duplicate release destination {}",
                dst_url
            )));
        }

        pairs.push((src_key, dst_key));
    }

    let start_timestamp = timestamp_now();

    let mut client = CopyClient::default();
    for (src_key, dst_key) in &pairs {
        let src_blob = source.blobstore.blob(src_key);
        let dst_blob = destination.blobstore.blob(dst_key);
        client.copy(src_blob, dst_blob).await?;
    }

    let transfer_map = client
        .close()
        .await?
        .into_iter()
        .filter(|event| event.is_ok())
        .map(|event| TransferEntry {
            src_key: event.source.key().to_string(),
            dst_key: event.destination.key().to_string(),
        })
        .collect::<Vec<_>>();

    let manifest = ReleaseManifest {
        submission_id: submission_id.to_string(),
        src_bucket: source.blobstore.bucket(),
        dst_bucket: destination.blobstore.bucket(),
        aws_identity: identity.aws,
        gcp_identity: identity.gcp,
        start_timestamp: start_timestamp.clone(),
        end_timestamp: timestamp_now(),
        transfer_map,
    };

    if !manifest.transfer_map.is_empty() {
        let manifest_key = format!("{}/{}/{}", submission_prefix, MANIFEST_PREFIX, start_timestamp);
        let manifest_blob = source.blobstore.blob(&manifest_key);
        manifest_blob
            .put(serde_json::to_vec(&manifest)?.into())
            .await?;
        info!("wrote release manifest to {}", manifest_blob.url());
    }

    Ok(manifest)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::blobstore::local::LocalBlobStore;
    use crate::blobstore::s3::default_s3_client;
    use crate::blobstore::gs::GsClient;
    use anyhow::Result;
    use bytes::Bytes;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};
    use uuid::Uuid;

    pub(crate) async fn test_router() -> Router {
        Router::new(default_s3_client().await, GsClient::new(), None)
    }

    fn local_ssds(directory: &Path) -> Ssds {
        // Canonicalized so url round-trips through path normalization.
        Ssds::new(AnyBlobStore::Local(LocalBlobStore::new(
            directory.canonicalize().expect("temp directory exists"),
        )))
    }

    async fn populate_tree(directory: &Path) -> Result<Vec<(&'static str, &'static [u8])>> {
        let files: Vec<(&str, &[u8])> = vec![
            ("file1.bin", b"seven b"),
            ("subdir1/file2.bin", b"nested contents"),
            ("subdir1/subsubdir/file3.bin", b"deeper contents"),
        ];

        for (relpath, data) in &files {
            let path = directory.join(relpath);
            tokio::fs::create_dir_all(path.parent().unwrap()).await?;
            tokio::fs::write(&path, data).await?;
        }

        Ok(files)
    }

    async fn upload_all(
        service: &Ssds,
        router: &Router,
        src: &Path,
        submission_id: &str,
        name: Option<&str>,
        subdir: Option<&str>,
    ) -> Result<Vec<String>> {
        let upload = service.upload(
            router,
            src.to_str().unwrap(),
            submission_id,
            name,
            subdir,
        );
        pin_mut!(upload);

        let mut keys = vec![];
        while let Some(key) = upload.next().await {
            keys.push(key?);
        }
        keys.sort();

        Ok(keys)
    }

    struct Fixture {
        _src: TempDir,
        _staging: TempDir,
        router: Router,
        service: Ssds,
        src_path: std::path::PathBuf,
    }

    async fn fixture() -> Result<Fixture> {
        let src = tempdir()?;
        let staging = tempdir()?;
        populate_tree(src.path()).await?;

        Ok(Fixture {
            router: test_router().await,
            service: local_ssds(staging.path()),
            src_path: src.path().canonicalize()?,
            _src: src,
            _staging: staging,
        })
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("a_fine_name").is_ok());
        assert!(validate_name("a bad name").is_err());
        assert!(validate_name("a--bad-name").is_err());
    }

    #[test]
    fn test_parse_ssds_key() {
        assert_eq!(
            parse_ssds_key("id--name/some/path"),
            Some(("id".to_string(), "name".to_string()))
        );
        assert_eq!(parse_ssds_key("no-delimiter/path"), None);
        assert_eq!(parse_ssds_key("id--name-without-slash"), None);
    }

    #[tokio::test]
    async fn test_compose_ssds_key_ceiling() -> Result<()> {
        let staging = tempdir()?;
        let service = local_ssds(staging.path());

        let key = service.compose_ssds_key("id", "name", "/a/relative/path/")?;
        assert_eq!(key, "id--name/a/relative/path");

        let long_name = "a".repeat(MAX_KEY_LENGTH);
        let result = service.compose_ssds_key("id", &long_name, "file");
        assert!(matches!(result, Err(Error::InvalidValue(_))));

        Ok(())
    }

    #[tokio::test]
    async fn test_upload_and_listings() -> Result<()> {
        let fixture = fixture().await?;
        let submission_id = Uuid::new_v4().to_string();

        let keys = upload_all(
            &fixture.service,
            &fixture.router,
            &fixture.src_path,
            &submission_id,
            Some("test_submission"),
            None,
        )
        .await?;

        let expected = vec![
            format!("{}--test_submission/file1.bin", submission_id),
            format!("{}--test_submission/subdir1/file2.bin", submission_id),
            format!(
                "{}--test_submission/subdir1/subsubdir/file3.bin",
                submission_id
            ),
        ];
        assert_eq!(keys, expected);

        let listed = fixture
            .service
            .list()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<crate::error::Result<Vec<_>>>()?;
        assert_eq!(
            listed,
            vec![(submission_id.clone(), "test_submission".to_string())]
        );

        let submission_keys = fixture
            .service
            .list_submission(&submission_id)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<crate::error::Result<Vec<_>>>()?;
        assert_eq!(submission_keys, expected);

        assert_eq!(
            fixture.service.get_submission_name(&submission_id).await?,
            Some("test_submission".to_string())
        );
        assert_eq!(
            fixture.service.get_submission_prefix(&submission_id).await?,
            Some(format!("submissions/{}--test_submission", submission_id))
        );

        // Destination bytes match the source tree.
        let destination = fixture
            .service
            .blobstore()
            .blob(&format!("submissions/{}", expected[0]));
        assert_eq!(destination.get().await?.as_ref(), b"seven b");

        Ok(())
    }

    #[tokio::test]
    async fn test_upload_subdir() -> Result<()> {
        let fixture = fixture().await?;
        let submission_id = Uuid::new_v4().to_string();

        let keys = upload_all(
            &fixture.service,
            &fixture.router,
            &fixture.src_path,
            &submission_id,
            Some("subdir_submission"),
            Some("/extra/dir/"),
        )
        .await?;

        assert!(keys
            .iter()
            .all(|key| key.contains("subdir_submission/extra/dir/")));

        Ok(())
    }

    #[tokio::test]
    async fn test_upload_naming_rules() -> Result<()> {
        let fixture = fixture().await?;
        let submission_id = Uuid::new_v4().to_string();

        for bad_name in ["a b", "a--b"] {
            let keys = upload_all(
                &fixture.service,
                &fixture.router,
                &fixture.src_path,
                &submission_id,
                Some(bad_name),
                None,
            )
            .await;
            assert!(keys.is_err());
        }

        // A brand new submission needs a name.
        let keys = upload_all(
            &fixture.service,
            &fixture.router,
            &fixture.src_path,
            &submission_id,
            None,
            None,
        )
        .await;
        assert!(keys.is_err());

        // Renames are forbidden, re-upload without a name resolves the
        // existing one.
        upload_all(
            &fixture.service,
            &fixture.router,
            &fixture.src_path,
            &submission_id,
            Some("first_name"),
            None,
        )
        .await?;
        let rename = upload_all(
            &fixture.service,
            &fixture.router,
            &fixture.src_path,
            &submission_id,
            Some("second_name"),
            None,
        )
        .await;
        assert!(rename.is_err());

        let again = upload_all(
            &fixture.service,
            &fixture.router,
            &fixture.src_path,
            &submission_id,
            None,
            None,
        )
        .await?;
        assert!(!again.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_upload_key_ceiling_rejected_before_bytes_move() -> Result<()> {
        let src = tempdir()?;
        let staging = tempdir()?;
        populate_tree(src.path()).await?;

        let router = test_router().await;
        let service = local_ssds(staging.path());
        let submission_id = Uuid::new_v4().to_string();
        let long_name = "a".repeat(MAX_KEY_LENGTH);

        let keys = upload_all(
            &service,
            &router,
            src.path(),
            &submission_id,
            Some(&long_name),
            None,
        )
        .await;
        assert!(keys.is_err());

        // Nothing landed in the staging store.
        let listed = service.list().collect::<Vec<_>>().await;
        assert!(listed.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_list_skips_unparseable_keys() -> Result<()> {
        let fixture = fixture().await?;
        let submission_id = Uuid::new_v4().to_string();

        upload_all(
            &fixture.service,
            &fixture.router,
            &fixture.src_path,
            &submission_id,
            Some("parseable"),
            None,
        )
        .await?;

        // A stray object with no delimiter under the staging prefix.
        fixture
            .service
            .blobstore()
            .blob("submissions/stray-object")
            .put(Bytes::from_static(b"noise"))
            .await?;

        let listed = fixture
            .service
            .list()
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<crate::error::Result<Vec<_>>>()?;
        assert_eq!(
            listed,
            vec![(submission_id, "parseable".to_string())]
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_sync_and_idempotency() -> Result<()> {
        let fixture = fixture().await?;
        let dst_dir = tempdir()?;
        let dst_service = local_ssds(dst_dir.path());
        let submission_id = Uuid::new_v4().to_string();

        let uploaded = upload_all(
            &fixture.service,
            &fixture.router,
            &fixture.src_path,
            &submission_id,
            Some("sync_submission"),
            None,
        )
        .await?;

        let synced = sync(&submission_id, &fixture.service, &dst_service)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<crate::error::Result<Vec<_>>>()?;
        let mut synced_sorted = synced.clone();
        synced_sorted.sort();
        assert_eq!(synced_sorted, uploaded);

        for key in &uploaded {
            let src_data = fixture
                .service
                .blobstore()
                .blob(&fixture.service.blobstore_key(key))
                .get()
                .await?;
            let dst_data = dst_service
                .blobstore()
                .blob(&dst_service.blobstore_key(key))
                .get()
                .await?;
            assert_eq!(src_data, dst_data);
        }

        // The second sync transfers nothing.
        let resynced = sync(&submission_id, &fixture.service, &dst_service)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<crate::error::Result<Vec<_>>>()?;
        assert!(resynced.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_release_writes_manifest() -> Result<()> {
        let fixture = fixture().await?;
        let dst_dir = tempdir()?;
        let dst_service = local_ssds(dst_dir.path());
        let submission_id = Uuid::new_v4().to_string();

        let uploaded = upload_all(
            &fixture.service,
            &fixture.router,
            &fixture.src_path,
            &submission_id,
            Some("release_submission"),
            None,
        )
        .await?;

        let mut transfers = vec![];
        for (index, key) in uploaded.iter().enumerate() {
            transfers.push((
                fixture.service.compose_blobstore_url(key),
                format!(
                    "{}/working/released-{}",
                    dst_service.bucket_url(),
                    index
                ),
            ));
        }
        // A source that does not exist is excluded from the realized map.
        transfers.push((
            fixture.service.compose_blobstore_url(&format!(
                "{}--release_submission/does-not-exist",
                submission_id
            )),
            format!("{}/working/released-missing", dst_service.bucket_url()),
        ));

        let manifest = release(
            &submission_id,
            &fixture.service,
            &dst_service,
            &transfers,
            ReleaseIdentity::default(),
        )
        .await?;

        assert_eq!(manifest.transfer_map.len(), uploaded.len());
        for entry in &manifest.transfer_map {
            let src_data = fixture.service.blobstore().blob(&entry.src_key).get().await?;
            let dst_data = dst_service.blobstore().blob(&entry.dst_key).get().await?;
            assert_eq!(src_data, dst_data);
        }

        // The manifest object exists under the submission and round-trips.
        let manifest_key = format!(
            "submissions/{}--release_submission/{}/{}",
            submission_id, MANIFEST_PREFIX, manifest.start_timestamp
        );
        let stored = fixture.service.blobstore().blob(&manifest_key).get().await?;
        let stored: ReleaseManifest = serde_json::from_slice(&stored)?;
        assert_eq!(stored.transfer_map, manifest.transfer_map);
        assert_eq!(stored.submission_id, submission_id);

        Ok(())
    }

    #[tokio::test]
    async fn test_release_validation_rejects_before_transfer() -> Result<()> {
        let fixture = fixture().await?;
        let dst_dir = tempdir()?;
        let dst_service = local_ssds(dst_dir.path());
        let submission_id = Uuid::new_v4().to_string();

        let uploaded = upload_all(
            &fixture.service,
            &fixture.router,
            &fixture.src_path,
            &submission_id,
            Some("strict_release"),
            None,
        )
        .await?;

        let good_src = fixture.service.compose_blobstore_url(&uploaded[0]);
        let good_dst = format!("{}/working/fine", dst_service.bucket_url());

        // Unknown submission.
        let unknown = release(
            "does-not-exist",
            &fixture.service,
            &dst_service,
            &[(good_src.clone(), good_dst.clone())],
            ReleaseIdentity::default(),
        )
        .await;
        assert!(unknown.is_err());

        // Destination outside the release prefix rejects the whole call.
        let outside = release(
            &submission_id,
            &fixture.service,
            &dst_service,
            &[
                (good_src.clone(), good_dst.clone()),
                (
                    fixture.service.compose_blobstore_url(&uploaded[1]),
                    format!("{}/elsewhere/nope", dst_service.bucket_url()),
                ),
            ],
            ReleaseIdentity::default(),
        )
        .await;
        assert!(outside.is_err());

        // Source outside the submission.
        let foreign_src = release(
            &submission_id,
            &fixture.service,
            &dst_service,
            &[(
                format!("{}/submissions/other--thing/file", fixture.service.bucket_url()),
                good_dst.clone(),
            )],
            ReleaseIdentity::default(),
        )
        .await;
        assert!(foreign_src.is_err());

        // Duplicate destinations.
        let duplicates = release(
            &submission_id,
            &fixture.service,
            &dst_service,
            &[
                (good_src.clone(), good_dst.clone()),
                (
                    fixture.service.compose_blobstore_url(&uploaded[1]),
                    good_dst.clone(),
                ),
            ],
            ReleaseIdentity::default(),
        )
        .await;
        assert!(duplicates.is_err());

        // No transfer ran: the destination store stayed empty.
        let landed = dst_service
            .blobstore()
            .list("")
            .collect::<Vec<_>>()
            .await;
        assert!(landed.is_empty());

        Ok(())
    }

    #[test]
    fn test_timestamp_format() {
        let timestamp = timestamp_now();

        assert!(timestamp.ends_with('Z'));
        assert!(timestamp.contains('T'));
        assert!(timestamp.contains('.'));
        assert!(chrono::NaiveDateTime::parse_from_str(&timestamp, TIMESTAMP_FORMAT).is_ok());
    }
}

//! Integration tests that run against real S3 and GCS buckets. These
//! require credentials and test buckets, so they are ignored by default.
//!
//! Configure with `SSDS_TEST_S3_URI` and `SSDS_TEST_GS_URI`, e.g.
//! `SSDS_TEST_S3_URI=s3://my-test-bucket SSDS_TEST_GS_URI=gs://my-test-bucket`.

use anyhow::Result;
use futures_util::{pin_mut, StreamExt};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Deserialize;
use ssds::blobstore::gs::GsClient;
use ssds::blobstore::s3::default_s3_client;
use ssds::checksum::{md5_hex, Crc32c};
use ssds::ssds::{sync, Ssds};
use ssds::storage::{Router, SSDS_CRC32C, SSDS_MD5};
use tempfile::TempDir;
use uuid::Uuid;

/// Configuration for integration tests.
#[derive(Debug, Deserialize)]
struct TestConfig {
    s3_uri: String,
    gs_uri: String,
}

impl TestConfig {
    fn load() -> Result<Self> {
        let mut env: Self = envy::prefixed("SSDS_TEST_").from_env()?;

        env.s3_uri = env.s3_uri.trim_end_matches('/').to_string();
        env.gs_uri = env.gs_uri.trim_end_matches('/').to_string();

        Ok(env)
    }
}

async fn test_router() -> Router {
    Router::new(default_s3_client().await, GsClient::new(), None)
}

fn write_tree(directory: &TempDir, oneshot: &[u8], multipart: &[u8]) -> Result<()> {
    std::fs::write(directory.path().join("oneshot.bin"), oneshot)?;
    std::fs::create_dir_all(directory.path().join("nested"))?;
    std::fs::write(directory.path().join("nested/multipart.bin"), multipart)?;

    Ok(())
}

#[ignore]
#[tokio::test]
async fn upload_and_sync_round_trip() -> Result<()> {
    let config = TestConfig::load()?;
    let router = test_router().await;

    let (_, s3_store) = router.blobstore_for_url(&config.s3_uri)?;
    let (_, gs_store) = router.blobstore_for_url(&config.gs_uri)?;
    let s3_service = Ssds::new(s3_store);
    let gs_service = Ssds::new(gs_store);

    let mut rng = StdRng::seed_from_u64(42);
    let mut oneshot = vec![0; 7];
    rng.fill_bytes(&mut oneshot);
    // Large enough for three parts once the chunk law kicks in would be
    // over 128 MiB, keep the cheap size and only exercise the oneshot path
    // against real buckets.
    let mut small_multipart = vec![0; 1024 * 1024];
    rng.fill_bytes(&mut small_multipart);

    let tree = TempDir::new()?;
    write_tree(&tree, &oneshot, &small_multipart)?;

    let submission_id = Uuid::new_v4().to_string();
    let upload = s3_service.upload(
        &router,
        tree.path().to_str().unwrap(),
        &submission_id,
        Some("integration_submission"),
        None,
    );
    pin_mut!(upload);

    let mut uploaded = vec![];
    while let Some(key) = upload.next().await {
        uploaded.push(key?);
    }
    assert_eq!(uploaded.len(), 2);

    // The destination carries checksum tags that agree with the bytes.
    let oneshot_key = uploaded
        .iter()
        .find(|key| key.ends_with("oneshot.bin"))
        .unwrap();
    let blob = s3_service
        .blobstore()
        .blob(&s3_service.blobstore_key(oneshot_key));
    let tags = blob.get_tags().await?;

    assert_eq!(tags.get(SSDS_MD5).map(String::as_str), Some(md5_hex(&oneshot).as_str()));
    let mut crc32c = Crc32c::new();
    crc32c.update(&oneshot);
    assert_eq!(
        tags.get(SSDS_CRC32C).map(String::as_str),
        Some(crc32c.gcs_b64().as_str())
    );
    assert_eq!(blob.cloud_native_checksum().await?, md5_hex(&oneshot));

    // Sync into GCS, tags verbatim, then an idempotent second pass.
    let synced = sync(&submission_id, &s3_service, &gs_service);
    pin_mut!(synced);
    let mut synced_keys = vec![];
    while let Some(key) = synced.next().await {
        synced_keys.push(key?);
    }
    assert_eq!(synced_keys.len(), uploaded.len());

    let resynced = sync(&submission_id, &s3_service, &gs_service);
    pin_mut!(resynced);
    let mut resynced_keys = vec![];
    while let Some(key) = resynced.next().await {
        resynced_keys.push(key?);
    }
    assert!(resynced_keys.is_empty());

    Ok(())
}

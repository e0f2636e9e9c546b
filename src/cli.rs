//! Cli commands and code.
//!

use crate::blobstore::gs::GsClient;
use crate::blobstore::s3::default_s3_client;
use crate::error::Error::InvalidValue;
use crate::error::Result;
use crate::ssds::{aws_caller_identity, release, sync, ReleaseIdentity, Ssds};
use crate::storage::{transform_key, CopyClient, Router, COPY_CONCURRENCY};
use crate::{Command, Subcommands};
use futures_util::{pin_mut, StreamExt};
use serde::Deserialize;
use std::path::Path;
use tokio::fs;

/// One transfer in a release transfers file.
#[derive(Debug, Deserialize)]
struct TransferSpec {
    src_url: String,
    dst_url: String,
}

/// Execute the command from the args.
pub async fn execute_args(args: Command) -> Result<()> {
    let gs = GsClient::new();
    let router = Router::new(
        default_s3_client().await,
        gs.clone(),
        args.billing_project.clone(),
    );

    match args.commands {
        Subcommands::Upload {
            path,
            submission_id,
            name,
            subdir,
        } => {
            let service = staging_ssds(&router, args.staging_url.as_deref())?;
            upload(
                &service,
                &router,
                &path,
                &submission_id,
                name.as_deref(),
                subdir.as_deref(),
            )
            .await?;
        }
        Subcommands::Copy {
            src_url,
            submission_id,
            name,
            submission_path,
        } => {
            let service = staging_ssds(&router, args.staging_url.as_deref())?;
            let ssds_key = service
                .copy(
                    &router,
                    &src_url,
                    &submission_id,
                    name.as_deref(),
                    &submission_path,
                )
                .await?;
            println!("{}", service.compose_blobstore_url(&ssds_key));
        }
        Subcommands::List => {
            let service = staging_ssds(&router, args.staging_url.as_deref())?;
            let listing = service.list();
            pin_mut!(listing);
            while let Some(submission) = listing.next().await {
                let (submission_id, name) = submission?;
                println!("{} {}", submission_id, name);
            }
        }
        Subcommands::ListSubmission { submission_id } => {
            let service = staging_ssds(&router, args.staging_url.as_deref())?;
            let listing = service.list_submission(&submission_id);
            pin_mut!(listing);

            let mut submission_exists = false;
            while let Some(ssds_key) = listing.next().await {
                submission_exists = true;
                println!("{}", service.compose_blobstore_url(&ssds_key?));
            }
            if !submission_exists {
                println!("No submission found for {}", submission_id);
            }
        }
        Subcommands::Sync {
            submission_id,
            dst_url,
        } => {
            let source = staging_ssds(&router, args.staging_url.as_deref())?;
            let destination = staging_ssds(&router, Some(&dst_url))?;

            let synced = sync(&submission_id, &source, &destination);
            pin_mut!(synced);
            while let Some(ssds_key) = synced.next().await {
                println!("{}", destination.compose_blobstore_url(&ssds_key?));
            }
        }
        Subcommands::Bucket => {
            let service = staging_ssds(&router, args.staging_url.as_deref())?;
            println!("{}", service.bucket_url());
        }
        Subcommands::Release {
            submission_id,
            dst_url,
            transfers,
        } => {
            let source = staging_ssds(&router, args.staging_url.as_deref())?;
            let destination = staging_ssds(&router, Some(&dst_url))?;

            let transfers = read_transfers(&transfers).await?;
            let identity = ReleaseIdentity {
                aws: aws_caller_identity().await,
                gcp: gs.identity_email().await,
            };

            let manifest =
                release(&submission_id, &source, &destination, &transfers, identity).await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        Subcommands::Cp {
            src_url,
            dst_url,
            recursive,
            ignore_missing_checksums,
            compute_checksums,
        } => {
            cp(
                &router,
                &src_url,
                &dst_url,
                recursive,
                ignore_missing_checksums,
                compute_checksums,
            )
            .await?;
        }
    }

    Ok(())
}

/// The staging service for a bucket url.
fn staging_ssds(router: &Router, staging_url: Option<&str>) -> Result<Ssds> {
    let url = staging_url.ok_or_else(|| {
        InvalidValue("a staging bucket url is required, pass --staging-url".to_string())
    })?;

    let (_, blobstore) = router.blobstore_for_url(url)?;
    Ok(Ssds::new(blobstore))
}

/// Perform the upload subcommand, failing when the source names nothing.
pub async fn upload(
    service: &Ssds,
    router: &Router,
    path: &str,
    submission_id: &str,
    name: Option<&str>,
    subdir: Option<&str>,
) -> Result<()> {
    let uploaded = service.upload(router, path, submission_id, name, subdir);
    pin_mut!(uploaded);

    let mut count = 0;
    while let Some(ssds_key) = uploaded.next().await {
        println!("{}", service.compose_blobstore_url(&ssds_key?));
        count += 1;
    }

    if count == 0 {
        return Err(InvalidValue(format!("no objects found for '{}'", path)));
    }

    Ok(())
}

/// Perform the cp subcommand.
pub async fn cp(
    router: &Router,
    src_url: &str,
    dst_url: &str,
    recursive: bool,
    ignore_missing_checksums: bool,
    compute_checksums: bool,
) -> Result<()> {
    let mut client = CopyClient::new(ignore_missing_checksums, COPY_CONCURRENCY);

    if recursive {
        let (src_prefix, src_blobstore) = router.blobstore_for_url(src_url)?;
        let (dst_prefix, dst_blobstore) = router.blobstore_for_url(dst_url)?;

        let listing = src_blobstore.list(&src_prefix);
        pin_mut!(listing);
        while let Some(src_blob) = listing.next().await {
            let src_blob = src_blob?;
            let dst_key = transform_key(src_blob.key(), &src_prefix, &dst_prefix);
            let dst_blob = dst_blobstore.blob(&dst_key);

            if compute_checksums {
                client.copy_compute_checksums(src_blob, dst_blob).await?;
            } else {
                client.copy(src_blob, dst_blob).await?;
            }
        }
    } else {
        let src_blob = router.blob_for_url(src_url)?;
        let dst_blob = router.blob_for_url(dst_url)?;

        if compute_checksums {
            client.copy_compute_checksums(src_blob, dst_blob).await?;
        } else {
            client.copy(src_blob, dst_blob).await?;
        }
    }

    for event in client.close().await? {
        if let Some(err) = event.error {
            return Err(err);
        }
    }

    Ok(())
}

async fn read_transfers(path: &Path) -> Result<Vec<(String, String)>> {
    let contents = fs::read(path).await?;
    let specs: Vec<TransferSpec> = serde_json::from_slice(&contents)?;

    Ok(specs
        .into_iter()
        .map(|spec| (spec.src_url, spec.dst_url))
        .collect())
}

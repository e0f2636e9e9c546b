pub mod blobstore;
pub mod checksum;
pub mod cli;
pub mod concurrency;
pub mod error;
pub mod retry;
pub mod ssds;
pub mod storage;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Args for the ssds CLI.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Command {
    /// The staging bucket url, e.g. `s3://my-staging-bucket` or
    /// `gs://my-staging-bucket`.
    #[arg(global = true, long, env = "SSDS_STAGING_URL")]
    pub staging_url: Option<String>,

    /// The billing project charged for requester pays GCS buckets. Falls
    /// back to GOOGLE_PROJECT, GCLOUD_PROJECT or GCP_PROJECT.
    #[arg(global = true, long, env)]
    pub billing_project: Option<String>,

    /// The subcommands for ssds.
    #[command(subcommand)]
    pub commands: Subcommands,
}

/// The subcommands for ssds.
#[derive(Subcommand, Debug)]
pub enum Subcommands {
    /// Upload a directory tree to the staging bucket. Existing files in the
    /// submission will be overwritten.
    Upload {
        /// Directory or cloud prefix containing submission material.
        path: String,

        /// Submission id provided for the submission.
        #[arg(long, env = "SSDS_SUBMISSION_ID")]
        submission_id: String,

        /// Human readable name of the submission. Cannot contain spaces.
        #[arg(long)]
        name: Option<String>,

        /// Destination subdirectory within the submission.
        #[arg(long)]
        subdir: Option<String>,
    },

    /// Copy a single file from the local filesystem or a cloud location
    /// into a submission.
    Copy {
        /// Local path, gs://, or s3:// url.
        src_url: String,

        /// Submission id provided for the submission.
        #[arg(long)]
        submission_id: String,

        /// Human readable name of the submission. Cannot contain spaces.
        #[arg(long)]
        name: Option<String>,

        /// Path in the submission directory, e.g. `my/path/to/foo.bam`.
        #[arg(long)]
        submission_path: String,
    },

    /// List submissions in the staging bucket.
    List,

    /// List the contents of one submission.
    ListSubmission {
        /// The id of the submission.
        #[arg(long)]
        submission_id: String,
    },

    /// Copy all files for a submission into another staging bucket.
    Sync {
        /// The id of the submission.
        #[arg(long)]
        submission_id: String,

        /// The destination staging bucket url.
        #[arg(long)]
        dst_url: String,
    },

    /// Print the staging bucket url.
    Bucket,

    /// Release curated submission files into the working prefix of a
    /// destination bucket and record a transfer manifest.
    Release {
        /// The id of the submission.
        #[arg(long)]
        submission_id: String,

        /// The destination bucket url.
        #[arg(long)]
        dst_url: String,

        /// A JSON file listing transfers:
        /// [{"src_url": "...", "dst_url": "..."}].
        transfers: PathBuf,
    },

    /// Copy files between local paths and cloud locations.
    Cp {
        /// Local path, gs://, or s3:// url.
        src_url: String,

        /// Local path, gs://, or s3:// url.
        dst_url: String,

        /// Copy directories recursively.
        #[arg(short, long)]
        recursive: bool,

        /// Warn instead of failing when a destination is missing its
        /// canonical checksum tag.
        #[arg(long)]
        ignore_missing_checksums: bool,

        /// Stream data through this process and compute checksums even when
        /// a server-side copy is possible.
        #[arg(long)]
        compute_checksums: bool,
    },
}

//! The local filesystem blob adapter.
//!
//! Local blobs do not carry tags; callers must not depend on tags for local
//! destinations.

use crate::blobstore::{get_s3_multipart_chunk_size, number_of_parts, Part, PartStream};
use crate::error::Error::BlobNotFound;
use crate::error::Result;
use async_stream::stream;
use bytes::Bytes;
use futures_util::Stream;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

fn catch_not_found<T>(result: std::io::Result<T>, path: &Path) -> Result<T> {
    result.map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            BlobNotFound(path.to_string_lossy().to_string())
        } else {
            err.into()
        }
    })
}

/// A directory tree treated as a blob store. Keys are paths relative to the
/// base path.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    /// Create a new store rooted at a base path.
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// The base path of the store.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get a blob handle for a key.
    pub fn blob(&self, key: &str) -> LocalBlob {
        LocalBlob::new(self.base_path.clone(), key.to_string())
    }

    /// List files under a prefix in sorted order, with cloud string-prefix
    /// semantics: `submissions/abc` matches `submissions/abc--name/file`.
    /// A missing root lists nothing.
    pub fn list(&self, prefix: &str) -> impl Stream<Item = Result<LocalBlob>> + Send {
        let store = self.clone();
        let prefix = prefix.trim_end_matches('/').to_string();

        stream! {
            // When the prefix names a directory every file below it
            // matches. Otherwise walk the parent directory and filter by
            // string prefix.
            let root = store.base_path.join(&prefix);
            let is_directory = fs::metadata(&root)
                .await
                .map(|metadata| metadata.is_dir())
                .unwrap_or(false);
            let (walk_root, needs_filter) = if is_directory {
                (root, false)
            } else {
                let parent = prefix.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("");
                (store.base_path.join(parent), true)
            };

            let files = match walk_sorted(&walk_root).await {
                Ok(files) => files,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            for file in files {
                let key = file
                    .strip_prefix(&store.base_path)
                    .unwrap_or(&file)
                    .to_string_lossy()
                    .to_string();
                if !needs_filter || key.starts_with(&prefix) {
                    yield Ok(store.blob(&key));
                }
            }
        }
    }
}

/// Recursively collect the files under a root, sorted by path so listings
/// are deterministic like cloud listings.
async fn walk_sorted(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = vec![];
    let mut directories = vec![root.to_path_buf()];

    while let Some(directory) = directories.pop() {
        let mut entries = match fs::read_dir(&directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                directories.push(path);
            } else {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// A single local file.
#[derive(Debug, Clone)]
pub struct LocalBlob {
    base_path: PathBuf,
    key: String,
    path: PathBuf,
}

impl LocalBlob {
    /// Create a new blob handle for a key relative to a base path.
    pub fn new(base_path: PathBuf, key: String) -> Self {
        let path = base_path.join(&key);
        Self {
            base_path,
            key,
            path,
        }
    }

    /// Create a blob handle directly from an absolute path.
    pub fn from_path(path: PathBuf) -> Self {
        let key = path.to_string_lossy().trim_start_matches('/').to_string();
        Self {
            base_path: PathBuf::from("/"),
            key,
            path,
        }
    }

    /// The url of the blob, which is its path.
    pub fn url(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    /// The key of the blob.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The filesystem path of the blob.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The base path of the owning store.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Check whether the file exists.
    pub async fn exists(&self) -> Result<bool> {
        Ok(fs::try_exists(&self.path).await?)
    }

    /// Get the size of the file.
    pub async fn size(&self) -> Result<u64> {
        let metadata = catch_not_found(fs::metadata(&self.path).await, &self.path)?;
        Ok(metadata.len())
    }

    /// Read the whole file.
    pub async fn get(&self) -> Result<Bytes> {
        let data = catch_not_found(fs::read(&self.path).await, &self.path)?;
        Ok(Bytes::from(data))
    }

    /// Write the whole file, creating parent directories.
    pub async fn put(&self, data: Bytes) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, &data).await?;

        Ok(())
    }

    /// Copy another local file into this one.
    pub async fn copy_from(&self, source: &LocalBlob) -> Result<()> {
        if self.url() == source.url() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        catch_not_found(fs::copy(&source.path, &self.path).await, &source.path)?;

        Ok(())
    }

    /// Copy this file to another local path.
    pub async fn download(&self, path: &Path) -> Result<()> {
        if self.path == path {
            return Ok(());
        }
        catch_not_found(fs::copy(&self.path, path).await, &self.path)?;

        Ok(())
    }

    /// A lazy, ordered sequence of the file's parts under the shared
    /// chunk-size law.
    pub async fn parts(&self) -> Result<PartStream> {
        let size = self.size().await?;
        let chunk_size = get_s3_multipart_chunk_size(size);
        let part_count = number_of_parts(size);
        let path = self.path.clone();

        let stream = stream! {
            let mut file = match catch_not_found(fs::File::open(&path).await, &path) {
                Ok(file) => file,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };

            for part_number in 0..part_count {
                let part = read_part(&mut file, part_number, chunk_size, size).await;
                yield part;
            }
        };

        Ok(Box::pin(stream))
    }
}

async fn read_part(
    file: &mut fs::File,
    part_number: u64,
    chunk_size: u64,
    size: u64,
) -> Result<Part> {
    let start = part_number * chunk_size;
    let length = chunk_size.min(size - start) as usize;

    file.seek(SeekFrom::Start(start)).await?;
    let mut data = vec![0; length];
    file.read_exact(&mut data).await?;

    Ok(Part::new(part_number, Bytes::from(data)))
}

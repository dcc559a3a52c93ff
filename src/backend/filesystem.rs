//! Local filesystem backend
//!
//! Parts are appended to a staging file under `<root>/.incomplete/` and the
//! finished file is renamed to `<root>/<identifier>` on completion, so readers
//! of the destination never observe a partial object.
//!
//! # Flow
//!
//! 1. `initialize` validates the identifier and creates `<root>/.incomplete/<uuid>.part`
//! 2. `upload_part` appends the part and feeds it to a SHA-256 hasher
//! 3. `complete` syncs, renames into place and records the content hash
//! 4. `cleanup` removes the staging file of an abandoned upload

use super::{BackendError, ChunkBackend, UploadDescriptor};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Directory (relative to the root) holding staging files
pub const STAGING_DIR: &str = ".incomplete";

struct Session {
    destination: PathBuf,
    staging: PathBuf,
    file: File,
    hasher: Sha256,
    parts: u32,
    bytes: u64,
}

/// Backend writing uploads below a root directory
pub struct FilesystemBackend {
    root: PathBuf,
    session: Option<Session>,
    checksum: Option<String>,
}

impl FilesystemBackend {
    /// Create a backend rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            session: None,
            checksum: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the staging file while an upload is open
    pub fn staging_path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.staging.as_path())
    }

    /// Hex SHA-256 of the completed file
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    /// Map an identifier to a path below the root, rejecting anything that
    /// could escape it or collide with the staging directory.
    fn resolve_destination(&self, identifier: &str) -> Result<PathBuf, BackendError> {
        let invalid = || BackendError::InvalidIdentifier(identifier.to_string());

        if identifier.is_empty()
            || identifier
                .split('/')
                .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(invalid());
        }

        let relative = Path::new(identifier);
        if relative.is_absolute() {
            return Err(invalid());
        }
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(invalid());
        }
        if relative.starts_with(STAGING_DIR) {
            return Err(invalid());
        }

        Ok(self.root.join(relative))
    }
}

async fn truncate_to(file: &mut File, len: u64) -> std::io::Result<()> {
    file.set_len(len).await?;
    file.seek(SeekFrom::Start(len)).await?;
    Ok(())
}

#[async_trait]
impl ChunkBackend for FilesystemBackend {
    fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    #[tracing::instrument(
        name = "backend.fs.initialize",
        skip(self, upload),
        fields(identifier = %upload.identifier),
        err
    )]
    async fn initialize(&mut self, upload: &UploadDescriptor) -> Result<(), BackendError> {
        let destination = self.resolve_destination(&upload.identifier)?;

        let staging_dir = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging_dir).await?;

        let staging = staging_dir.join(format!("{}.part", uuid::Uuid::new_v4()));
        let file = File::create(&staging).await?;

        tracing::debug!(staging = %staging.display(), "Created staging file");

        self.checksum = None;
        self.session = Some(Session {
            destination,
            staging,
            file,
            hasher: Sha256::new(),
            parts: 0,
            bytes: 0,
        });
        Ok(())
    }

    #[tracing::instrument(
        name = "backend.fs.upload_part",
        skip(self, part),
        fields(part_number = part_number, upload.bytes = part.len()),
        err
    )]
    async fn upload_part(&mut self, part_number: u32, part: Bytes) -> Result<(), BackendError> {
        let session = self.session.as_mut().ok_or(BackendError::NotInitialized)?;
        if part_number != session.parts + 1 {
            return Err(BackendError::OutOfOrder {
                expected: session.parts + 1,
                actual: part_number,
            });
        }

        if let Err(e) = session.file.write_all(&part).await {
            // A retried part must start where the last acknowledged one ended
            if let Err(rollback) = truncate_to(&mut session.file, session.bytes).await {
                tracing::warn!(error = %rollback, "Failed to roll back partial part");
            }
            return Err(e.into());
        }
        session.hasher.update(&part);
        session.parts = part_number;
        session.bytes += part.len() as u64;
        Ok(())
    }

    #[tracing::instrument(name = "backend.fs.complete", skip(self), err)]
    async fn complete(&mut self) -> Result<(), BackendError> {
        let session = self.session.as_mut().ok_or(BackendError::NotInitialized)?;
        session.file.flush().await?;
        session.file.sync_all().await?;

        if let Some(parent) = session.destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&session.staging, &session.destination).await?;

        // The rename succeeded, so the staging file no longer exists.
        if let Some(session) = self.session.take() {
            let checksum = hex::encode(session.hasher.finalize());
            tracing::info!(
                destination = %session.destination.display(),
                parts = session.parts,
                bytes = session.bytes,
                sha256 = %checksum,
                "Completed file upload"
            );
            self.checksum = Some(checksum);
        }
        Ok(())
    }

    async fn cleanup(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        drop(session.file);

        if let Err(e) = fs::remove_file(&session.staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %session.staging.display(),
                    error = %e,
                    "Failed to clean up staging file"
                );
            }
        }
    }
}

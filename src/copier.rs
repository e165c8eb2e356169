//! Guarded, non-destructive copy of a single file into a destination directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Result of a copy that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The file was written to `target`
    Copied { target: PathBuf, bytes: u64 },
    /// A file already exists at `target` and was left untouched
    Skipped { target: PathBuf },
}

/// Reasons a copy was abandoned
#[derive(thiserror::Error, Debug)]
pub enum CopyError {
    /// Destination directory does not exist.
    #[error("Destination folder {0} does not exist")]
    DestinationMissing(PathBuf),

    /// Destination path exists but is not a directory.
    #[error("Destination {0} is not a directory")]
    DestinationNotDirectory(PathBuf),

    /// Source path has no file name to copy under.
    #[error("Source path {0} has no file name")]
    InvalidSource(PathBuf),

    /// Existence check itself failed.
    #[error("Cannot check existence of {path}: {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Source could not be opened for reading.
    #[error("Cannot open source file {path}: {source}")]
    OpenSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Destination file could not be created.
    #[error("Cannot create destination file {path}: {source}")]
    CreateDestination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading or writing failed part way through.
    #[error("Copy from {from} to {to} failed: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CopyOutcome {
    pub fn target(&self) -> &Path {
        match self {
            CopyOutcome::Copied { target, .. } | CopyOutcome::Skipped { target } => target,
        }
    }
}

/// Copy `source` into `destination_dir` under its base name.
///
/// The destination directory is never created, and an existing file at the
/// target path is never overwritten: both cases are logged as warnings. The
/// target is opened with `create_new`, so a file that appears between the
/// existence check and the open is also reported as a skip. If the copy
/// fails after the target was created, the partial file is removed.
pub async fn copy_into(source: &Path, destination_dir: &Path) -> Result<CopyOutcome, CopyError> {
    match fs::metadata(destination_dir).await {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            tracing::warn!(destination = %destination_dir.display(), "Destination is not a directory");
            return Err(CopyError::DestinationNotDirectory(destination_dir.to_path_buf()));
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::warn!(destination = %destination_dir.display(), "Destination folder does not exist");
            return Err(CopyError::DestinationMissing(destination_dir.to_path_buf()));
        }
        Err(err) => {
            tracing::error!(destination = %destination_dir.display(), %err, "Cannot check the destination folder existence");
            return Err(CopyError::Inspect {
                path: destination_dir.to_path_buf(),
                source: err,
            });
        }
    }

    let file_name = source
        .file_name()
        .ok_or_else(|| CopyError::InvalidSource(source.to_path_buf()))?;
    let target = destination_dir.join(file_name);

    match fs::try_exists(&target).await {
        Ok(true) => {
            tracing::warn!(file = %target.display(), "The destination file already exists");
            return Ok(CopyOutcome::Skipped { target });
        }
        Ok(false) => {}
        Err(err) => {
            tracing::error!(file = %target.display(), %err, "Cannot check the destination file existence");
            return Err(CopyError::Inspect { path: target, source: err });
        }
    }

    let mut reader = File::open(source).await.map_err(|err| {
        tracing::error!(source = %source.display(), %err, "Cannot open source file");
        CopyError::OpenSource {
            path: source.to_path_buf(),
            source: err,
        }
    })?;

    let mut writer = match OpenOptions::new().write(true).create_new(true).open(&target).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            tracing::warn!(file = %target.display(), "The destination file already exists");
            return Ok(CopyOutcome::Skipped { target });
        }
        Err(err) => {
            tracing::error!(file = %target.display(), %err, "Cannot create destination file");
            return Err(CopyError::CreateDestination { path: target, source: err });
        }
    };

    let copied = match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(bytes) => writer.flush().await.map(|()| bytes),
        Err(err) => Err(err),
    };
    drop(writer);

    match copied {
        Ok(bytes) => {
            tracing::info!(source = %source.display(), file = %target.display(), bytes, "Successfully copied file");
            Ok(CopyOutcome::Copied { target, bytes })
        }
        Err(err) => {
            tracing::error!(source = %source.display(), file = %target.display(), %err, "Copy file failed");
            if let Err(cleanup) = fs::remove_file(&target).await {
                tracing::warn!(file = %target.display(), err = %cleanup, "Cannot remove partial destination file");
            }
            Err(CopyError::Copy {
                from: source.to_path_buf(),
                to: target,
                source: err,
            })
        }
    }
}

// src/merger.rs

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("partial file {0} is missing")]
    MissingPart(PathBuf),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> MergeError + '_ {
    move |source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Path of the file the merge writes before it is renamed into place.
pub fn staging_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".merging");
    output.with_file_name(name)
}

/// Concatenates `parts` in order into `output`.
///
/// The bytes go to a staging file first, which is synced and renamed over
/// `output`. Partial files are deleted only after the rename, so a failed
/// merge leaves every part in place and no output behind.
pub async fn merge(output: &Path, parts: &[PathBuf]) -> Result<u64, MergeError> {
    let staging = staging_path(output);
    match concat(&staging, parts).await {
        Ok(size) => {
            if let Err(e) = fs::rename(&staging, output).await {
                let _ = fs::remove_file(&staging).await;
                return Err(io_err(output)(e));
            }
            for part in parts {
                if let Err(e) = fs::remove_file(part).await {
                    warn!(part = %part.display(), error = %e, "could not remove partial file");
                }
            }
            info!(output = %output.display(), size, parts = parts.len(), "merged partial files");
            Ok(size)
        }
        Err(e) => {
            let _ = fs::remove_file(&staging).await;
            Err(e)
        }
    }
}

async fn concat(staging: &Path, parts: &[PathBuf]) -> Result<u64, MergeError> {
    let mut destination = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(staging)
        .await
        .map_err(io_err(staging))?;

    let mut total = 0;
    for part in parts {
        let mut source = match File::open(part).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MergeError::MissingPart(part.clone()))
            }
            Err(e) => return Err(io_err(part)(e)),
        };
        let copied = tokio::io::copy(&mut source, &mut destination)
            .await
            .map_err(io_err(part))?;
        debug!(part = %part.display(), copied, "appended partial file");
        total += copied;
    }

    destination.flush().await.map_err(io_err(staging))?;
    destination.sync_all().await.map_err(io_err(staging))?;
    Ok(total)
}

//! Retention over raster series stored as dated files.

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, TimeZone, Utc};
use common::Catalog;
use common::model::{StatusLog, StorageDefinition};
use tracing::{debug, info};
use zip::CompressionMethod;
use zip::write::FileOptions;

use crate::cutoff::RetentionCutoff;
use crate::error::{RetentionError, Result};
use crate::mask::{MaskPattern, archive_name, split_mask};
use crate::runner::RunOutcome;

/// A matched file and the timestamp parsed from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatedFile {
    pub path: PathBuf,
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

/// Filesystem path of a provider uri, e.g. `file:///data/grid` -> `/data/grid`.
pub fn provider_path(uri: &str) -> PathBuf {
    let path = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    PathBuf::from(path)
}

/// List `dir` and keep the files matching `pattern` that carry a timestamp,
/// sorted by name.
pub async fn scan_directory(
    dir: &Path,
    pattern: &MaskPattern,
    reference_year: i32,
) -> Result<Vec<DatedFile>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| RetentionError::io(dir, e))?;

    let mut files = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| RetentionError::io(dir, e))?
    {
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| RetentionError::io(entry.path(), e))?;
        if !file_type.is_file() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !pattern.is_match(&name) {
            continue;
        }
        match pattern.timestamp(&name, reference_year) {
            Some(timestamp) => files.push(DatedFile {
                path: entry.path(),
                timestamp: Utc.from_utc_datetime(&timestamp),
                name,
            }),
            None => debug!(file = %name, mask = %pattern.mask(), "Matched file carries no date"),
        }
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// Remove, move or archive the files of a raster series older than the cutoff.
pub async fn run_file_retention(
    storage: &StorageDefinition,
    catalog: &dyn Catalog,
    cutoff: &RetentionCutoff,
    now: DateTime<Utc>,
) -> Result<RunOutcome> {
    let source = catalog
        .grid_source(storage.data_series_id)
        .await?
        .ok_or_else(|| {
            RetentionError::MissingMetadata(format!(
                "mask of data series {}",
                storage.data_series_id
            ))
        })?;

    let (mask_dir, file_mask) = split_mask(&source.mask);
    let source_dir = provider_path(&source.provider_uri).join(mask_dir);
    let pattern = MaskPattern::compile(file_mask)?;

    let files = scan_directory(&source_dir, &pattern, cutoff.cutoff_timestamp.year()).await?;
    let data_timestamp = files.iter().map(|f| f.timestamp).min();
    let expired: Vec<&DatedFile> = files
        .iter()
        .filter(|f| cutoff.is_expired(f.timestamp))
        .collect();

    debug!(
        storage_id = storage.id,
        dir = %source_dir.display(),
        matched = files.len(),
        expired = expired.len(),
        "Scanned raster directory"
    );

    if expired.is_empty() {
        return Ok(RunOutcome::no_data());
    }

    let description = if storage.backup {
        let destination_dir = backup_directory(storage, catalog, mask_dir).await?;
        tokio::fs::create_dir_all(&destination_dir)
            .await
            .map_err(|e| RetentionError::io(&destination_dir, e))?;

        if storage.zip {
            let archive_path = destination_dir.join(archive_name(file_mask, now));
            archive_files(&expired, &archive_path).await?;
            format!(
                "added files: {} from {} to {}",
                expired.len(),
                source_dir.display(),
                archive_path.display()
            )
        } else {
            for file in &expired {
                move_file(&file.path, &destination_dir.join(&file.name)).await?;
            }
            format!(
                "moved files: {} from {} to {}",
                expired.len(),
                source_dir.display(),
                destination_dir.display()
            )
        }
    } else {
        for file in &expired {
            tokio::fs::remove_file(&file.path)
                .await
                .map_err(|e| RetentionError::io(&file.path, e))?;
        }
        format!("removed files: {} from {}", expired.len(), source_dir.display())
    };

    info!(storage_id = storage.id, "{description}");

    Ok(RunOutcome {
        status: StatusLog::Done,
        data_timestamp,
        description,
    })
}

async fn backup_directory(
    storage: &StorageDefinition,
    catalog: &dyn Catalog,
    mask_dir: &str,
) -> Result<PathBuf> {
    let provider_id = storage.data_provider_id.ok_or_else(|| {
        RetentionError::MissingMetadata(format!("backup provider of storage {}", storage.id))
    })?;
    let uri = catalog.provider_uri(provider_id).await?.ok_or_else(|| {
        RetentionError::MissingMetadata(format!("data provider {provider_id}"))
    })?;

    Ok(provider_path(&uri)
        .join(storage.uri.trim_start_matches('/'))
        .join(mask_dir))
}

/// Pack files into one deflated archive, appending to an archive of the same
/// name left by an earlier run. Sources are deleted only once the archive is
/// on disk.
async fn archive_files(files: &[&DatedFile], archive_path: &Path) -> Result<()> {
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut archive = match tokio::fs::read(archive_path).await {
        Ok(existing) => {
            debug!(archive = %archive_path.display(), "Appending to existing archive");
            zip::ZipWriter::new_append(Cursor::new(existing))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            zip::ZipWriter::new(Cursor::new(Vec::new()))
        }
        Err(e) => return Err(RetentionError::io(archive_path, e)),
    };

    for file in files {
        let content = tokio::fs::read(&file.path)
            .await
            .map_err(|e| RetentionError::io(&file.path, e))?;
        archive.start_file(file.name.as_str(), options)?;
        archive
            .write_all(&content)
            .map_err(|e| RetentionError::io(&file.path, e))?;
    }

    let buffer = archive.finish()?.into_inner();
    let partial = archive_path.with_extension("zip.part");
    tokio::fs::write(&partial, buffer)
        .await
        .map_err(|e| RetentionError::io(&partial, e))?;
    tokio::fs::rename(&partial, archive_path)
        .await
        .map_err(|e| RetentionError::io(archive_path, e))?;

    for file in files {
        tokio::fs::remove_file(&file.path)
            .await
            .map_err(|e| RetentionError::io(&file.path, e))?;
    }
    Ok(())
}

/// Rename, falling back to copy and unlink across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            tokio::fs::copy(from, to)
                .await
                .map_err(|e| RetentionError::io(to, e))?;
            tokio::fs::remove_file(from)
                .await
                .map_err(|e| RetentionError::io(from, e))
        }
        Err(e) => Err(RetentionError::io(from, e)),
    }
}

//! Vacuum command implementation.

use crate::error::CliError;
use canopy_storage::{FileBackend, StorageBackend};
use std::path::Path;
use tracing::info;

/// Vacuum statistics.
#[derive(Debug)]
pub struct VacuumStats {
    /// Records before vacuuming.
    pub objects_before: usize,
    /// Records after vacuuming.
    pub objects_after: usize,
    /// Records directly under the trashed sentinel.
    pub trashed: usize,
    /// Bytes before vacuuming.
    pub bytes_before: u64,
    /// Bytes after vacuuming.
    pub bytes_after: u64,
}

impl VacuumStats {
    /// Records removed, descendants and annotations included.
    pub fn purged(&self) -> usize {
        self.objects_before - self.objects_after
    }
}

/// Runs the vacuum command.
pub async fn run(path: &Path, dry_run: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Vacuuming repository at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = vacuum(path, dry_run).await?;

    println!("Vacuum Analysis:");
    println!("  Objects before:  {}", stats.objects_before);
    println!("  Trashed:         {}", stats.trashed);
    if !dry_run {
        println!("  Purged:          {}", stats.purged());
        println!("  Objects after:   {}", stats.objects_after);
        println!();
        println!("  Size before: {} bytes", stats.bytes_before);
        println!("  Size after:  {} bytes", stats.bytes_after);
        if stats.trashed == 0 {
            println!();
            println!("Nothing to purge");
        } else {
            println!();
            println!("✓ Vacuum complete");
        }
    }

    Ok(())
}

/// Purges trashed records of the snapshot at `path` unless `dry_run`.
pub async fn vacuum(path: &Path, dry_run: bool) -> Result<VacuumStats, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(CliError::NoRepository(path.to_path_buf()).into());
    }

    let backend = FileBackend::open(path)?;
    let bytes_before = std::fs::metadata(path)?.len();
    let objects_before = backend.total_objects().await?;
    let trashed = backend.trashed_count();

    if dry_run || trashed == 0 {
        return Ok(VacuumStats {
            objects_before,
            objects_after: objects_before,
            trashed,
            bytes_before,
            bytes_after: bytes_before,
        });
    }

    let purged = backend.vacuum().await?;
    info!(purged, "vacuumed repository");

    Ok(VacuumStats {
        objects_before,
        objects_after: backend.total_objects().await?,
        trashed,
        bytes_before,
        bytes_after: std::fs::metadata(path)?.len(),
    })
}

//! Inspect command implementation.

use crate::error::CliError;
use canopy_storage::{FileBackend, Oid, StorageBackend};
use serde::Serialize;
use std::path::Path;

/// Repository inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Snapshot path.
    pub path: String,
    /// Snapshot size in bytes.
    pub file_size: u64,
    /// Last committed tid.
    pub current_tid: u64,
    /// Records in the store, trashed ones included.
    pub total_objects: usize,
    /// Records waiting for `vacuum`.
    pub trashed_objects: usize,
    /// Number of children of the root.
    pub root_children: usize,
    /// Child details (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<ChildSummary>>,
}

/// One child of the root.
#[derive(Debug, Serialize)]
pub struct ChildSummary {
    /// Name under the root.
    pub name: String,
    /// Object id.
    pub oid: String,
    /// Entity kind.
    pub type_tag: String,
    /// Tid of the current version.
    pub tid: u64,
    /// Codec of the stored state.
    pub codec: String,
    /// Size of the stored state in bytes.
    pub state_size: usize,
}

/// Runs the inspect command.
pub async fn run(
    path: &Path,
    show_children: bool,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = inspect(path, show_children).await?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects statistics about the snapshot at `path`.
pub async fn inspect(
    path: &Path,
    show_children: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(CliError::NoRepository(path.to_path_buf()).into());
    }

    let backend = FileBackend::open(path)?;
    let root = Oid::root();

    let children = if show_children {
        let mut records = backend.children(&root).await?;
        records.sort_by(|a, b| a.local_name.cmp(&b.local_name));
        Some(
            records
                .into_iter()
                .map(|record| ChildSummary {
                    name: record.local_name.clone().unwrap_or_default(),
                    oid: record.oid.to_string(),
                    type_tag: record.type_tag.clone(),
                    tid: record.tid.0,
                    codec: record.codec.clone(),
                    state_size: record.size(),
                })
                .collect(),
        )
    } else {
        None
    };

    Ok(InspectResult {
        path: path.display().to_string(),
        file_size: std::fs::metadata(path)?.len(),
        current_tid: backend.current_tid().await?.0,
        total_objects: backend.total_objects().await?,
        trashed_objects: backend.trashed_count(),
        root_children: backend.child_count(&root).await?,
        children,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("Canopy Repository: {}", result.path);
    println!();
    println!("Storage:");
    println!("  Snapshot size:  {} bytes", result.file_size);
    println!("  Current tid:    {}", result.current_tid);
    println!();
    println!("Objects:");
    println!("  Total:          {}", result.total_objects);
    println!("  Trashed:        {}", result.trashed_objects);
    println!("  Root children:  {}", result.root_children);

    if let Some(children) = &result.children {
        println!();
        println!("Children of the root:");
        for child in children {
            println!(
                "  {:<24} {} ({}, tid {}, {} {} bytes)",
                child.name, child.oid, child.type_tag, child.tid, child.codec, child.state_size
            );
        }
    }
}

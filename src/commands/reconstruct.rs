use std::path::PathBuf;

use crate::config::Config;
use crate::error::{Error, Result};

use super::open_core;

/// Rebuild a file by UUID or by original name and write it out.
pub async fn run(config: Config, target: &str, output: Option<PathBuf>) -> Result<()> {
    let core = open_core(config).await?;

    let metadata = match core.db.get_file_metadata(target)? {
        Some(metadata) => metadata,
        None => core
            .db
            .get_file_metadata_by_name(&core.peer_uuid, target)?
            .ok_or_else(|| Error::FileMetadataNotFound(target.to_string()))?,
    };

    let output = output.unwrap_or_else(|| PathBuf::from(format!("restored_{}", metadata.original_name)));
    let data = core
        .manager
        .reconstruct_file(&metadata.file_uuid, &metadata.owner_uuid, Some(&output))
        .await?;
    println!(
        "reconstructed {} ({} bytes) to {}",
        metadata.original_name,
        data.len(),
        output.display()
    );

    core.shutdown().await;
    Ok(())
}

use crate::config::Config;
use crate::error::Result;

use super::open_core;

/// Print node statistics, or one file's availability when a UUID is given.
pub async fn run(config: Config, file_uuid: Option<String>) -> Result<()> {
    let core = open_core(config).await?;

    match file_uuid {
        Some(file_uuid) => {
            let status = core.manager.get_file_status(&file_uuid)?;
            println!("file {file_uuid}");
            println!("  required shards:  {}", status.required);
            println!("  local chunks:     {}", status.available_local);
            println!("  remote chunks:    {}", status.available_remote);
            println!("  reachable chunks: {}", status.reachable);
            println!("  reconstructable:  {}", status.reconstructable);
            if status.degraded {
                println!("  DEGRADED: replication could not restore redundancy");
            }
        }
        None => {
            let stats = core.manager.get_stats()?;
            let peers = core.peers_rx.borrow().clone();
            println!("node {}", core.peer_uuid);
            println!("  files:          {}", stats.file_count);
            println!("  local chunks:   {}", stats.local_chunk_count);
            println!("  foreign chunks: {}", stats.foreign_chunk_count);
            println!("  known peers:    {}", peers.peers.len());
            for summary in core.manager.list_files(&core.peer_uuid)? {
                println!(
                    "  {} {} ({} bytes, {}/{} chunks local, {} confirmed remote{})",
                    summary.file_uuid,
                    summary.original_name,
                    summary.original_size,
                    summary.local_chunks,
                    summary.total_chunks,
                    summary.confirmed_locations,
                    if summary.degraded { ", degraded" } else { "" },
                );
            }
        }
    }

    core.shutdown().await;
    Ok(())
}

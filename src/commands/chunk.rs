use std::path::Path;

use log::info;

use crate::config::Config;
use crate::error::Result;

use super::open_core;

/// Chunk one file and push its chunks to the current peer set.
pub async fn run(config: Config, path: &Path, no_distribute: bool) -> Result<()> {
    let core = open_core(config).await?;

    let file_uuid = core.manager.chunk_file(path, &core.peer_uuid).await?;
    println!("chunked {} as {file_uuid}", path.display());

    if no_distribute {
        info!("distribution skipped, chunks stay local");
    } else {
        let report = core.manager.distribute_chunks(&file_uuid, &core.peer_uuid).await?;
        if report.no_peers {
            println!("no eligible peers; {} chunks kept local", report.total_chunks);
        } else {
            println!(
                "distributed {}/{} chunks ({} failed, {} local copies dropped)",
                report.distributed, report.total_chunks, report.failed, report.local_deleted
            );
        }
    }

    core.shutdown().await;
    Ok(())
}

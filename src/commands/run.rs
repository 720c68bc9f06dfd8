use std::sync::Arc;

use log::{info, warn};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::keystore::{self, PassphraseCache};
use crate::server::RpcServer;

use super::{open_core, prompt_passphrase};

/// Start the vault core and serve until interrupted.
///
/// Startup order: verify the passphrase against the retention record,
/// announce to the tracker, bring up the RPC server, recover the container
/// if only its metadata survived, then run the background sweeps.
pub async fn run(config: Config) -> Result<()> {
    let key_path = config.key_path();
    if !key_path.exists() {
        return Err(Error::Configuration(format!(
            "no retention record at {}; run `decentralis init-key` first",
            key_path.display()
        )));
    }

    let passphrase = prompt_passphrase("Vault passphrase")?;
    let key_hex = keystore::verify_passphrase(&key_path, &passphrase)?;
    // The derived key lives here for the process lifetime and is zeroed on
    // shutdown. The passphrase itself is dropped right away.
    let mut key_cache = PassphraseCache::new();
    key_cache.set(crate::cryptography::parse_key_hex(&key_hex)?);
    drop(passphrase);
    info!("passphrase verified");

    // If a container is present, make sure the derived key actually opens
    // it before serving anything.
    let algorithm = keystore::load_retention(&key_path)?.algorithm;
    let container_path = config.container_path();
    if container_path.exists() {
        if let Some(key) = key_cache.key() {
            let container = Container::load_encrypted(&container_path, key, algorithm)?;
            info!("container opened: {} entries", container.len());
        }
    }

    let mut core = open_core(config).await?;

    let listener = TcpListener::bind(("0.0.0.0", core.config.listen_port))
        .await
        .map_err(|e| {
            Error::Configuration(format!(
                "cannot listen on port {}: {e}",
                core.config.listen_port
            ))
        })?;
    let server = RpcServer::new(
        core.peer_uuid.clone(),
        Arc::clone(&core.store),
        Arc::clone(&core.db),
        Arc::clone(&core.clock),
        core.cancel.clone(),
    );
    core.handles.push(tokio::spawn(server.serve(listener)));

    // Container recovery runs in the background; the node is usable while
    // chunks stream back in.
    {
        let manager = Arc::clone(&core.manager);
        core.handles.push(tokio::spawn(async move {
            match manager.restore_container_on_start().await {
                Ok(Some(path)) => info!("container restored to {}", path.display()),
                Ok(None) => {}
                Err(e) => warn!("container restore failed: {e}"),
            }
        }));
    }

    let background = core.manager.start_background_tasks(Arc::clone(&core.replication));
    core.handles.extend(background);

    info!(
        "node {} running, rpc on port {}",
        core.peer_uuid, core.config.listen_port
    );
    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    core.shutdown().await;
    key_cache.clear();
    Ok(())
}

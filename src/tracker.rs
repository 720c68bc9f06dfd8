use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::models::{PeerAddr, PeerSet};

const TRACKER_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the central tracker.
///
/// The wire protocol is one JSON object per TCP connection in each
/// direction; the tracker closes the socket after responding. A background
/// worker re-announces every keepalive interval and publishes fresh
/// [`PeerSet`] snapshots through a watch channel, so readers always see
/// either the previous complete list or the new one.
pub struct TrackerClient {
    addr: String,
    announce_ip: String,
    announce_port: u16,
    keepalive_interval: Duration,
    uuid: Mutex<Option<String>>,
}

impl TrackerClient {
    pub fn new(
        addr: impl Into<String>,
        announce_ip: impl Into<String>,
        announce_port: u16,
        keepalive_interval: Duration,
    ) -> Self {
        TrackerClient {
            addr: addr.into(),
            announce_ip: announce_ip.into(),
            announce_port,
            keepalive_interval,
            uuid: Mutex::new(None),
        }
    }

    /// UUID the tracker assigned us, once the first announce succeeded.
    pub fn uuid(&self) -> Option<String> {
        self.uuid.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Seed a previously assigned UUID so re-announces keep our identity
    /// across restarts.
    pub fn set_uuid(&self, uuid: String) {
        let mut slot = self.uuid.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(uuid);
    }

    /// Announce ourselves. The first announce has no UUID and receives one;
    /// later announces repeat it as a keepalive.
    pub async fn announce(&self) -> Result<String> {
        let mut payload = json!({
            "action": "announce",
            "ip": self.announce_ip,
            "port": self.announce_port,
        });
        if let Some(uuid) = self.uuid() {
            payload["uuid"] = Value::String(uuid);
        }

        let response = self.request(payload).await?;
        let uuid = response
            .get("uuid")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::peer("tracker", "announce response missing uuid"))?
            .to_string();

        let mut slot = self.uuid.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_deref() != Some(&uuid) {
            info!("tracker assigned peer uuid {uuid}");
            *slot = Some(uuid.clone());
        }
        Ok(uuid)
    }

    pub async fn get_peers(&self) -> Result<Vec<PeerAddr>> {
        let mut payload = json!({ "action": "getpeers" });
        if let Some(uuid) = self.uuid() {
            payload["uuid"] = Value::String(uuid);
        }

        let response = self.request(payload).await?;
        let peers = response
            .get("peers")
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        serde_json::from_value(peers)
            .map_err(|e| Error::peer("tracker", format!("invalid peer list: {e}")))
    }

    /// One request, one response, one connection.
    async fn request(&self, payload: Value) -> Result<Value> {
        let exchange = async {
            let mut stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| Error::peer("tracker", format!("dial {}: {e}", self.addr)))?;

            let body = payload.to_string();
            stream
                .write_all(body.as_bytes())
                .await
                .map_err(|e| Error::peer("tracker", format!("send: {e}")))?;
            stream
                .flush()
                .await
                .map_err(|e| Error::peer("tracker", format!("send: {e}")))?;

            // The tracker closes the connection after its single response.
            let mut raw = Vec::new();
            stream
                .read_to_end(&mut raw)
                .await
                .map_err(|e| Error::peer("tracker", format!("receive: {e}")))?;
            let response: Value = serde_json::from_slice(&raw)
                .map_err(|e| Error::peer("tracker", format!("invalid response: {e}")))?;
            if let Some(err) = response.get("error").and_then(Value::as_str) {
                return Err(Error::peer("tracker", err));
            }
            Ok(response)
        };

        tokio::time::timeout(TRACKER_TIMEOUT, exchange)
            .await
            .map_err(|_| Error::peer("tracker", "request timed out"))?
    }

    /// Start the keepalive worker.
    ///
    /// Re-announces every keepalive interval, fetches the peer list, and
    /// publishes a snapshot. Announce failures back off exponentially
    /// (1 s, 2 s, 4 s, ...) capped at the keepalive interval; a success
    /// resets the backoff. Cancelling the token stops the worker within
    /// one interval.
    pub fn spawn_keepalive(
        self: Arc<Self>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> (watch::Receiver<Arc<PeerSet>>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(Arc::new(PeerSet::default()));

        let handle = tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                let wait = match self.announce().await {
                    Ok(_) => {
                        backoff = Duration::from_secs(1);
                        match self.get_peers().await {
                            Ok(peers) => {
                                debug!("tracker reports {} peer(s)", peers.len());
                                tx.send_replace(Arc::new(PeerSet {
                                    peers,
                                    fetched_at: Some(clock.now()),
                                }));
                            }
                            Err(e) => warn!("peer list fetch failed: {e}"),
                        }
                        self.keepalive_interval
                    }
                    Err(e) => {
                        warn!("announce failed: {e}, retrying in {backoff:?}");
                        let wait = backoff;
                        backoff = (backoff * 2).min(self.keepalive_interval);
                        wait
                    }
                };

                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("tracker keepalive stopped");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        });

        (rx, handle)
    }
}

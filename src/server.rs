use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::db::ChunkDb;
use crate::models::{sha256_hex, FileMetadata, StoredChunk};
use crate::rpc::{
    self, ChunkInfoResult, ChunkRefParams, FileRefParams, GetChunkResult, ListChunksResult,
    OkResult, PingResult, RpcRequest, RpcResponse, SearchFileParams, SearchFileResult,
    StoreChunkParams,
};
use crate::store::ChunkStore;

/// Length-framed JSON-RPC server for foreign chunk traffic.
///
/// Connections are single-shot: one request, one response, then the socket
/// closes. Handlers touching the same `(owner, file)` serialize through a
/// per-file mutex held only for the database write and the chunk rename.
pub struct RpcServer {
    peer_uuid: String,
    store: Arc<ChunkStore>,
    db: Arc<ChunkDb>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    file_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl RpcServer {
    pub fn new(
        peer_uuid: String,
        store: Arc<ChunkStore>,
        db: Arc<ChunkDb>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(RpcServer {
            peer_uuid,
            store,
            db,
            clock,
            cancel,
            file_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Accept loop. Runs until the cancellation token fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        info!(
            "rpc server listening on {:?}",
            listener.local_addr().map(|a| a.to_string())
        );
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("rpc server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("connection from {addr}");
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle_connection(stream).await;
                            });
                        }
                        Err(e) => warn!("accept failed: {e}"),
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) {
        let response = match rpc::read_frame(&mut stream).await {
            Ok(raw) => match serde_json::from_slice::<RpcRequest>(&raw) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => RpcResponse::failure(0, rpc::CODE_MALFORMED, format!("malformed request: {e}")),
            },
            Err(e) => {
                debug!("connection dropped before a full frame arrived: {e}");
                return;
            }
        };

        match serde_json::to_vec(&response) {
            Ok(body) => {
                if let Err(e) = rpc::write_frame(&mut stream, &body).await {
                    debug!("failed to write response: {e}");
                }
            }
            Err(e) => warn!("cannot serialize response: {e}"),
        }
        // Single-shot protocol: the server closes after responding.
    }

    async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest {
            id, method, params, ..
        } = request;
        let outcome = match method.as_str() {
            "ping" => self.handle_ping(),
            "store_chunk" => self.handle_store_chunk(id, params).await,
            "get_chunk" => self.handle_get_chunk(id, params),
            "delete_chunk" => self.handle_delete_chunk(id, params).await,
            "get_chunk_info" => self.handle_get_chunk_info(id, params),
            "list_chunks" => self.handle_list_chunks(id, params),
            "announce_file" => self.handle_announce_file(id, params),
            "search_file" => self.handle_search_file(id, params),
            other => Err(RpcResponse::failure(
                id,
                rpc::CODE_METHOD_NOT_FOUND,
                format!("unknown method: {other}"),
            )),
        };
        match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(response) => response,
        }
    }

    fn handle_ping(&self) -> std::result::Result<Value, RpcResponse> {
        Ok(serde_json::json!(PingResult {
            peer_uuid: self.peer_uuid.clone(),
        }))
    }

    /// Persist a foreign chunk. Rejects payloads whose SHA-256 does not
    /// match the declared hash; re-storing an identical chunk is a no-op so
    /// client retries stay idempotent.
    async fn handle_store_chunk(&self, id: u64, params: Value) -> std::result::Result<Value, RpcResponse> {
        let params: StoreChunkParams = parse_params(id, params)?;
        let data = rpc::b64_decode(&params.data_b64)
            .map_err(|_| RpcResponse::failure(id, rpc::CODE_INVALID_PARAMS, "invalid base64 data"))?;

        let actual = sha256_hex(&data);
        if actual != params.sha256 {
            return Err(RpcResponse::failure(
                id,
                rpc::CODE_SHA_MISMATCH,
                format!("sha256 mismatch: declared {}, got {actual}", params.sha256),
            ));
        }

        let lock = self.file_lock(&params.owner, &params.file_uuid).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self
            .db
            .get_chunk_row(&params.owner, &params.file_uuid, params.idx)
            .map_err(|e| storage_failure(id, &e))?
        {
            if existing.sha256 == params.sha256 {
                debug!(
                    "chunk {}/{}#{} already stored, ignoring duplicate",
                    params.owner, params.file_uuid, params.idx
                );
                return Ok(serde_json::json!(OkResult { ok: true }));
            }
        }

        self.store
            .store_chunk(&params.owner, &params.file_uuid, params.idx, &data)
            .map_err(|e| storage_failure(id, &e))?;
        self.db
            .insert_chunk(&StoredChunk {
                owner_uuid: params.owner.clone(),
                file_uuid: params.file_uuid.clone(),
                index: params.idx,
                role: params.role,
                size_bytes: data.len() as u64,
                sha256: params.sha256.clone(),
                stored_at: self.clock.now(),
            })
            .map_err(|e| storage_failure(id, &e))?;

        Ok(serde_json::json!(OkResult { ok: true }))
    }

    fn handle_get_chunk(&self, id: u64, params: Value) -> std::result::Result<Value, RpcResponse> {
        let params: ChunkRefParams = parse_params(id, params)?;
        // When the chunk is on record, re-check the disk bytes against the
        // stored hash before serving; a corrupt chunk must never leave
        // this node as if it were good.
        if let Some(row) = self
            .db
            .get_chunk_row(&params.owner, &params.file_uuid, params.idx)
            .map_err(|e| storage_failure(id, &e))?
        {
            if let Err(e) = self
                .store
                .validate_chunk(&params.owner, &params.file_uuid, params.idx, &row.sha256)
            {
                return Err(match e {
                    crate::Error::ChunkNotFound { .. } => chunk_not_found(id, &params),
                    other => RpcResponse::failure(id, rpc::CODE_SHA_MISMATCH, other.to_string()),
                });
            }
        }
        let data = self
            .store
            .get_chunk(&params.owner, &params.file_uuid, params.idx)
            .map_err(|e| storage_failure(id, &e))?
            .ok_or_else(|| chunk_not_found(id, &params))?;
        Ok(serde_json::json!(GetChunkResult {
            sha256: sha256_hex(&data),
            data_b64: rpc::b64_encode(&data),
        }))
    }

    async fn handle_delete_chunk(&self, id: u64, params: Value) -> std::result::Result<Value, RpcResponse> {
        let params: ChunkRefParams = parse_params(id, params)?;
        let lock = self.file_lock(&params.owner, &params.file_uuid).await;
        let _guard = lock.lock().await;

        // Deleting an absent chunk succeeds.
        self.store
            .delete_chunk(&params.owner, &params.file_uuid, params.idx)
            .map_err(|e| storage_failure(id, &e))?;
        self.db
            .delete_chunk_row(&params.owner, &params.file_uuid, params.idx)
            .map_err(|e| storage_failure(id, &e))?;
        Ok(serde_json::json!(OkResult { ok: true }))
    }

    fn handle_get_chunk_info(&self, id: u64, params: Value) -> std::result::Result<Value, RpcResponse> {
        let params: ChunkRefParams = parse_params(id, params)?;
        let row = self
            .db
            .get_chunk_row(&params.owner, &params.file_uuid, params.idx)
            .map_err(|e| storage_failure(id, &e))?
            .ok_or_else(|| chunk_not_found(id, &params))?;
        Ok(serde_json::json!(ChunkInfoResult {
            size: row.size_bytes,
            sha256: row.sha256,
            stored_at: row.stored_at,
        }))
    }

    fn handle_list_chunks(&self, id: u64, params: Value) -> std::result::Result<Value, RpcResponse> {
        let params: FileRefParams = parse_params(id, params)?;
        let indices = self
            .store
            .list_chunks(&params.owner, &params.file_uuid)
            .map_err(|e| storage_failure(id, &e))?;
        Ok(serde_json::json!(ListChunksResult { indices }))
    }

    /// Store file metadata only; the chunks follow via `store_chunk`.
    fn handle_announce_file(&self, id: u64, params: Value) -> std::result::Result<Value, RpcResponse> {
        let metadata: FileMetadata = parse_params(id, params)?;
        self.db
            .insert_file_metadata(&metadata)
            .map_err(|e| storage_failure(id, &e))?;
        Ok(serde_json::json!(OkResult { ok: true }))
    }

    fn handle_search_file(&self, id: u64, params: Value) -> std::result::Result<Value, RpcResponse> {
        let params: SearchFileParams = parse_params(id, params)?;
        let found = self
            .db
            .get_file_metadata_by_name(&params.owner, &params.name)
            .map_err(|e| storage_failure(id, &e))?;
        match found {
            Some(metadata) => Ok(serde_json::json!(SearchFileResult {
                file_uuid: metadata.file_uuid.clone(),
                metadata,
            })),
            None => Ok(Value::Null),
        }
    }

    async fn file_lock(&self, owner: &str, file_uuid: &str) -> Arc<Mutex<()>> {
        let mut locks = self.file_locks.lock().await;
        Arc::clone(
            locks
                .entry((owner.to_string(), file_uuid.to_string()))
                .or_default(),
        )
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(
    id: u64,
    params: Value,
) -> std::result::Result<T, RpcResponse> {
    serde_json::from_value(params)
        .map_err(|e| RpcResponse::failure(id, rpc::CODE_INVALID_PARAMS, format!("invalid params: {e}")))
}

fn storage_failure(id: u64, err: &crate::Error) -> RpcResponse {
    RpcResponse::failure(id, rpc::CODE_STORAGE, err.to_string())
}

fn chunk_not_found(id: u64, params: &ChunkRefParams) -> RpcResponse {
    RpcResponse::failure(
        id,
        rpc::CODE_CHUNK_NOT_FOUND,
        format!(
            "chunk {}/{}#{} not stored here",
            params.owner, params.file_uuid, params.idx
        ),
    )
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::clock::Clock;
use crate::db::ChunkDb;
use crate::error::{Error, Result};
use crate::models::{ChunkRole, FileMetadata, PeerAddr};

/// Upper bound on a single frame. Chunks are 10 MiB by default and travel
/// base64-encoded inside JSON, so this leaves ample headroom.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

pub const CODE_MALFORMED: i32 = -32600;
pub const CODE_METHOD_NOT_FOUND: i32 = -32601;
pub const CODE_INVALID_PARAMS: i32 = -32602;
pub const CODE_CHUNK_NOT_FOUND: i32 = -32000;
pub const CODE_SHA_MISMATCH: i32 = -32001;
pub const CODE_STORAGE: i32 = -32002;

/// Write one `[4-byte big-endian length][body]` frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> std::io::Result<()> {
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Read one length-prefixed frame, rejecting oversized lengths before
/// allocating.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        RpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i32, message: impl Into<String>) -> Self {
        RpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

// Method parameter and result shapes, shared by client and server.

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreChunkParams {
    pub owner: String,
    pub file_uuid: String,
    pub idx: usize,
    pub role: ChunkRole,
    pub sha256: String,
    pub data_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkRefParams {
    pub owner: String,
    pub file_uuid: String,
    pub idx: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileRefParams {
    pub owner: String,
    pub file_uuid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchFileParams {
    pub owner: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResult {
    pub peer_uuid: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OkResult {
    pub ok: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetChunkResult {
    pub data_b64: String,
    pub sha256: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkInfoResult {
    pub size: u64,
    pub sha256: String,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListChunksResult {
    pub indices: Vec<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchFileResult {
    pub file_uuid: String,
    pub metadata: FileMetadata,
}

pub fn b64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn b64_decode(encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded)
        .map_err(|e| Error::peer("?", format!("invalid base64 payload: {e}")))
}

/// Outgoing RPC client.
///
/// Every call opens a fresh connection, sends exactly one request, reads
/// exactly one response and closes. Transport failures (dial, timeout,
/// framing, JSON) increment the peer's failure counter; any well-formed
/// response increments its success counter.
pub struct PeerClient {
    db: Arc<ChunkDb>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl PeerClient {
    pub fn new(db: Arc<ChunkDb>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        PeerClient {
            db,
            clock,
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn call(&self, peer: &PeerAddr, method: &str, params: Value) -> Result<Value> {
        let outcome = tokio::time::timeout(self.timeout, self.exchange(peer, method, params)).await;
        match outcome {
            Ok(Ok(response)) => {
                self.db.record_peer_success(&peer.uuid, self.clock.now())?;
                self.unwrap_response(peer, method, response)
            }
            Ok(Err(err)) => {
                self.db.record_peer_failure(&peer.uuid)?;
                Err(err)
            }
            Err(_) => {
                self.db.record_peer_failure(&peer.uuid)?;
                Err(Error::peer(&peer.uuid, format!("{method} timed out")))
            }
        }
    }

    /// One connection, one request, one response.
    async fn exchange(&self, peer: &PeerAddr, method: &str, params: Value) -> Result<RpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        };
        let body = serde_json::to_vec(&request)
            .map_err(|e| Error::peer(&peer.uuid, format!("cannot encode request: {e}")))?;

        let mut stream = TcpStream::connect(peer.endpoint())
            .await
            .map_err(|e| Error::peer(&peer.uuid, format!("dial {}: {e}", peer.endpoint())))?;

        write_frame(&mut stream, &body)
            .await
            .map_err(|e| Error::peer(&peer.uuid, format!("send: {e}")))?;
        debug!("sent {method} to {} ({} bytes)", peer.uuid, body.len());

        let raw = read_frame(&mut stream)
            .await
            .map_err(|e| Error::peer(&peer.uuid, format!("receive: {e}")))?;
        let response: RpcResponse = serde_json::from_slice(&raw)
            .map_err(|e| Error::peer(&peer.uuid, format!("invalid response JSON: {e}")))?;
        if response.id != id {
            return Err(Error::peer(&peer.uuid, "response id mismatch"));
        }
        Ok(response)
    }

    fn unwrap_response(&self, peer: &PeerAddr, method: &str, response: RpcResponse) -> Result<Value> {
        if let Some(error) = response.error {
            return Err(match error.code {
                CODE_CHUNK_NOT_FOUND => Error::ChunkNotFound {
                    owner_uuid: String::new(),
                    file_uuid: String::new(),
                    index: 0,
                },
                _ => Error::peer(
                    &peer.uuid,
                    format!("{method} failed: {} (code {})", error.message, error.code),
                ),
            });
        }
        response
            .result
            .ok_or_else(|| Error::peer(&peer.uuid, format!("{method}: empty response")))
    }

    pub async fn ping(&self, peer: &PeerAddr) -> Result<String> {
        let result = self.call(peer, "ping", serde_json::json!({})).await?;
        let ping: PingResult = parse_result(peer, result)?;
        Ok(ping.peer_uuid)
    }

    pub async fn store_chunk(
        &self,
        peer: &PeerAddr,
        owner: &str,
        file_uuid: &str,
        index: usize,
        role: ChunkRole,
        sha256: &str,
        data: &[u8],
    ) -> Result<()> {
        let params = StoreChunkParams {
            owner: owner.to_string(),
            file_uuid: file_uuid.to_string(),
            idx: index,
            role,
            sha256: sha256.to_string(),
            data_b64: b64_encode(data),
        };
        self.call(peer, "store_chunk", to_value(peer, &params)?).await?;
        Ok(())
    }

    /// Fetch a chunk; the returned bytes are already checked against the
    /// sha the remote reported.
    pub async fn get_chunk(
        &self,
        peer: &PeerAddr,
        owner: &str,
        file_uuid: &str,
        index: usize,
    ) -> Result<(Vec<u8>, String)> {
        let params = ChunkRefParams {
            owner: owner.to_string(),
            file_uuid: file_uuid.to_string(),
            idx: index,
        };
        let result = self
            .call(peer, "get_chunk", to_value(peer, &params)?)
            .await
            .map_err(|e| fill_chunk_ref(e, owner, file_uuid, index))?;
        let reply: GetChunkResult = parse_result(peer, result)?;
        let data = b64_decode(&reply.data_b64)
            .map_err(|_| Error::peer(&peer.uuid, "get_chunk returned invalid base64"))?;
        Ok((data, reply.sha256))
    }

    pub async fn delete_chunk(
        &self,
        peer: &PeerAddr,
        owner: &str,
        file_uuid: &str,
        index: usize,
    ) -> Result<()> {
        let params = ChunkRefParams {
            owner: owner.to_string(),
            file_uuid: file_uuid.to_string(),
            idx: index,
        };
        self.call(peer, "delete_chunk", to_value(peer, &params)?).await?;
        Ok(())
    }

    pub async fn get_chunk_info(
        &self,
        peer: &PeerAddr,
        owner: &str,
        file_uuid: &str,
        index: usize,
    ) -> Result<ChunkInfoResult> {
        let params = ChunkRefParams {
            owner: owner.to_string(),
            file_uuid: file_uuid.to_string(),
            idx: index,
        };
        let result = self
            .call(peer, "get_chunk_info", to_value(peer, &params)?)
            .await
            .map_err(|e| fill_chunk_ref(e, owner, file_uuid, index))?;
        parse_result(peer, result)
    }

    pub async fn list_chunks(
        &self,
        peer: &PeerAddr,
        owner: &str,
        file_uuid: &str,
    ) -> Result<Vec<usize>> {
        let params = FileRefParams {
            owner: owner.to_string(),
            file_uuid: file_uuid.to_string(),
        };
        let result = self.call(peer, "list_chunks", to_value(peer, &params)?).await?;
        let reply: ListChunksResult = parse_result(peer, result)?;
        Ok(reply.indices)
    }

    pub async fn announce_file(&self, peer: &PeerAddr, metadata: &FileMetadata) -> Result<()> {
        self.call(peer, "announce_file", to_value(peer, metadata)?).await?;
        Ok(())
    }

    pub async fn search_file(
        &self,
        peer: &PeerAddr,
        owner: &str,
        name: &str,
    ) -> Result<Option<SearchFileResult>> {
        let params = SearchFileParams {
            owner: owner.to_string(),
            name: name.to_string(),
        };
        let result = self.call(peer, "search_file", to_value(peer, &params)?).await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(parse_result(peer, result)?))
    }
}

/// Attach the chunk reference to a remote not-found error, which arrives
/// from the wire without context.
fn fill_chunk_ref(err: Error, owner: &str, file_uuid: &str, index: usize) -> Error {
    match err {
        Error::ChunkNotFound { .. } => Error::ChunkNotFound {
            owner_uuid: owner.to_string(),
            file_uuid: file_uuid.to_string(),
            index,
        },
        other => other,
    }
}

fn to_value<T: Serialize>(peer: &PeerAddr, params: &T) -> Result<Value> {
    serde_json::to_value(params)
        .map_err(|e| Error::peer(&peer.uuid, format!("cannot encode params: {e}")))
}

fn parse_result<T: serde::de::DeserializeOwned>(peer: &PeerAddr, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| Error::peer(&peer.uuid, format!("unexpected result shape: {e}")))
}

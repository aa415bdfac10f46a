//! Multipart frame protocol
//!
//! A message is a sequence of frames, each `[flags: u8][len: u32 BE][payload]`.
//! Bit `0x01` of `flags` means another frame of the same message follows.
//!
//! Requests are `[reply-routing, metadata JSON, payload JSON]`; every request
//! gets exactly one single-frame JSON response. Malformed requests are
//! answered with `{"error": ...}`; only framing and I/O failures drop the
//! connection.

use crate::router::Router;
use mlserve_common::{MlServeError, Result, METRICS};
use mlserve_worker::Payload;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Flag bit: more frames follow in this message
pub const FLAG_MORE: u8 = 0x01;

/// Frames in a request message
pub const REQUEST_FRAMES: usize = 3;

/// Upper bound on frames per message, independent of their size
const MAX_FRAMES: usize = 16;

/// Read one message
///
/// Returns `Ok(None)` when the peer closes the connection between messages.
/// EOF inside a message, an oversized frame, too many frames or a message
/// larger than `REQUEST_FRAMES * max_frame_bytes` is a transport error.
/// Frame buffers grow with the bytes actually received.
pub async fn read_message<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Vec<Vec<u8>>>>
where
    R: AsyncRead + Unpin,
{
    let max_message_bytes = max_frame_bytes.saturating_mul(REQUEST_FRAMES);
    let mut message_bytes = 0usize;
    let mut frames = Vec::new();
    loop {
        let mut flags = [0u8; 1];
        let n = reader.read(&mut flags).await?;
        if n == 0 {
            if frames.is_empty() {
                return Ok(None);
            }
            return Err(MlServeError::transport(format!(
                "connection closed after {} frame(s) of a message",
                frames.len()
            )));
        }

        let len = reader.read_u32().await.map_err(short_read)? as usize;
        if len > max_frame_bytes {
            return Err(MlServeError::transport(format!(
                "frame of {} bytes exceeds limit of {}",
                len, max_frame_bytes
            )));
        }
        message_bytes += len;
        if message_bytes > max_message_bytes {
            return Err(MlServeError::transport(format!(
                "message exceeds limit of {} bytes",
                max_message_bytes
            )));
        }

        let mut frame = Vec::new();
        (&mut *reader).take(len as u64).read_to_end(&mut frame).await?;
        if frame.len() < len {
            return Err(MlServeError::transport("connection closed mid-frame"));
        }
        frames.push(frame);

        if flags[0] & FLAG_MORE == 0 {
            return Ok(Some(frames));
        }
        if frames.len() >= MAX_FRAMES {
            return Err(MlServeError::transport(format!(
                "message exceeds {} frames",
                MAX_FRAMES
            )));
        }
    }
}

fn short_read(err: std::io::Error) -> MlServeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        MlServeError::transport("connection closed mid-frame")
    } else {
        MlServeError::Io(err)
    }
}

/// Write one message and flush it
pub async fn write_message<W>(writer: &mut W, frames: &[&[u8]]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frames.is_empty() {
        return Err(MlServeError::transport("cannot send an empty message"));
    }
    for (i, frame) in frames.iter().enumerate() {
        let flags = if i + 1 < frames.len() { FLAG_MORE } else { 0 };
        let len = u32::try_from(frame.len())
            .map_err(|_| MlServeError::transport("frame larger than 4 GiB"))?;
        writer.write_u8(flags).await?;
        writer.write_u32(len).await?;
        writer.write_all(frame).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// What a request asks the server to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    #[default]
    Predict,
    Ping,
    CreateModelWorker,
    EvictModelWorker,
}

/// Version as sent by clients: `1` or `"1"`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionField {
    Number(u64),
    Text(String),
}

impl std::fmt::Display for VersionField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionField::Number(n) => write!(f, "{}", n),
            VersionField::Text(s) => f.write_str(s),
        }
    }
}

/// Fields of the metadata frame the server understands; others are ignored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default)]
    pub command: Command,

    #[serde(default)]
    pub model_name: Option<String>,

    #[serde(default)]
    pub model_version: Option<VersionField>,

    #[serde(default)]
    pub model_path: Option<String>,

    #[serde(default)]
    pub num_workers: Option<u32>,
}

impl RequestMetadata {
    fn model_name(&self) -> Result<&str> {
        self.model_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| MlServeError::invalid_input("metadata is missing model_name"))
    }

    fn model_version(&self) -> Result<String> {
        self.model_version
            .as_ref()
            .map(|v| v.to_string())
            .ok_or_else(|| MlServeError::invalid_input("metadata is missing model_version"))
    }
}

/// A payload value: a JSON array of bytes or a UTF-8 string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PayloadValue {
    Bytes(Vec<u8>),
    Text(String),
}

/// Decode a payload frame (`{}` or empty for control commands)
pub fn decode_payload(frame: &[u8]) -> Result<Payload> {
    if frame.iter().all(u8::is_ascii_whitespace) {
        return Ok(Payload::new());
    }
    let fields: HashMap<String, PayloadValue> = serde_json::from_slice(frame)?;
    Ok(fields
        .into_iter()
        .map(|(name, value)| {
            let bytes = match value {
                PayloadValue::Bytes(bytes) => bytes,
                PayloadValue::Text(text) => text.into_bytes(),
            };
            (name, bytes)
        })
        .collect())
}

/// Decode the `prediction` object of a success response
pub fn decode_prediction(response: &Value) -> Result<Payload> {
    let prediction = response
        .get("prediction")
        .ok_or_else(|| MlServeError::internal("response has no prediction"))?;
    decode_payload(&serde_json::to_vec(prediction)?)
}

fn error_response(err: &MlServeError) -> Value {
    json!({ "error": err.to_string() })
}

/// Multipart frame server
#[derive(Debug, Clone)]
pub struct MultipartServer {
    router: Arc<Router>,
    max_frame_bytes: usize,
}

impl MultipartServer {
    /// Create a server dispatching through `router`
    pub fn new(router: Arc<Router>, max_frame_bytes: usize) -> Self {
        Self {
            router,
            max_frame_bytes,
        }
    }

    /// Accept connections until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr()?;
        info!("Multipart server listening on {}", local);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Multipart server on {} shutting down", local);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            // Accept errors (e.g. fd exhaustion) are per-connection
                            error!("Failed to accept connection on {}: {}", local, e);
                        }
                    }
                }
            }
        }
    }

    /// Serve requests on one connection until it closes or breaks
    pub async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        debug!("Connection from {}", peer);
        loop {
            let frames = match read_message(&mut stream, self.max_frame_bytes).await {
                Ok(Some(frames)) => frames,
                Ok(None) => {
                    debug!("Connection from {} closed", peer);
                    return;
                }
                Err(e) => {
                    METRICS.requests.transport_errors.inc();
                    warn!("Dropping request from {}: {}", peer, e);
                    return;
                }
            };

            let response = self.handle_frames(frames).await;
            let body = match serde_json::to_vec(&response) {
                Ok(body) => body,
                Err(e) => {
                    error!("Failed to encode response for {}: {}", peer, e);
                    br#"{"error":"failed to encode response"}"#.to_vec()
                }
            };

            if let Err(e) = write_message(&mut stream, &[&body]).await {
                METRICS.requests.transport_errors.inc();
                warn!("Failed to send response to {}: {}", peer, e);
                return;
            }
        }
    }

    /// Turn one complete request into its response
    pub async fn handle_frames(&self, frames: Vec<Vec<u8>>) -> Value {
        if frames.len() != REQUEST_FRAMES {
            return error_response(&MlServeError::invalid_input(format!(
                "expected {} frames, got {}",
                REQUEST_FRAMES,
                frames.len()
            )));
        }

        let reply_to = if frames[0].is_empty() {
            Uuid::new_v4().to_string()
        } else {
            String::from_utf8_lossy(&frames[0]).into_owned()
        };

        match self.dispatch(&frames[1], &frames[2]).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Request {} failed: {}", reply_to, e);
                error_response(&e)
            }
        }
    }

    async fn dispatch(&self, metadata: &[u8], payload: &[u8]) -> Result<Value> {
        let metadata: RequestMetadata = serde_json::from_slice(metadata)
            .map_err(|e| MlServeError::invalid_input(format!("bad metadata frame: {}", e)))?;

        match metadata.command {
            Command::Ping => Ok(json!({ "status": self.router.ping() })),
            Command::Predict => {
                let input = decode_payload(payload)
                    .map_err(|e| MlServeError::invalid_input(format!("bad payload frame: {}", e)))?;
                let prediction = self
                    .router
                    .predict(metadata.model_name()?, &metadata.model_version()?, input)
                    .await?;
                Ok(json!({
                    "prediction": prediction.output,
                    "model_name": prediction.key.model_name,
                    "model_version": prediction.key.model_version,
                }))
            }
            Command::CreateModelWorker => {
                let model_path = metadata
                    .model_path
                    .as_deref()
                    .ok_or_else(|| MlServeError::invalid_input("metadata is missing model_path"))?;
                let created = self
                    .router
                    .create_model_worker(
                        metadata.model_name()?,
                        model_path,
                        metadata.num_workers.unwrap_or(0),
                    )
                    .await?;
                Ok(json!({
                    "status": "OK",
                    "model_name": created.key.model_name,
                    "model_version": created.key.model_version,
                    "num_workers": created.num_workers,
                }))
            }
            Command::EvictModelWorker => {
                let evicted = self
                    .router
                    .evict_model_worker(metadata.model_name()?, &metadata.model_version()?)
                    .await?;
                Ok(json!({ "status": "OK", "evicted": evicted }))
            }
        }
    }
}

/// Minimal client for the multipart protocol
#[derive(Debug)]
pub struct MultipartClient {
    stream: TcpStream,
    max_frame_bytes: usize,
}

impl MultipartClient {
    /// Connect to a multipart server
    pub async fn connect(addr: SocketAddr, max_frame_bytes: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MlServeError::transport(format!("failed to connect to {}: {}", addr, e)))?;
        Ok(Self {
            stream,
            max_frame_bytes,
        })
    }

    /// Send raw frames and wait for the single-frame JSON response
    pub async fn send_frames(&mut self, frames: &[&[u8]]) -> Result<Value> {
        write_message(&mut self.stream, frames).await?;
        let response = read_message(&mut self.stream, self.max_frame_bytes)
            .await?
            .ok_or_else(|| MlServeError::transport("server closed the connection"))?;
        if response.len() != 1 {
            return Err(MlServeError::transport(format!(
                "expected a single response frame, got {}",
                response.len()
            )));
        }
        Ok(serde_json::from_slice(&response[0])?)
    }

    /// Send a request built from metadata and an input payload
    pub async fn request(&mut self, metadata: &Value, input: &Payload) -> Result<Value> {
        let reply_to = Uuid::new_v4().to_string();
        let metadata = serde_json::to_vec(metadata)?;
        let payload = serde_json::to_vec(input)?;
        self.send_frames(&[reply_to.as_bytes(), &metadata, &payload])
            .await
    }

    /// Predict on `(model_name, model_version)`
    pub async fn predict(&mut self, model_name: &str, model_version: &str, input: &Payload) -> Result<Value> {
        self.request(
            &json!({ "model_name": model_name, "model_version": model_version }),
            input,
        )
        .await
    }
}

use bytes::Bytes;
use futures::{Future, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::codec::{Frame, FrameCodec};
use crate::config::ServerConfig;
use crate::errors::GenerationError;
use crate::model::{GenerativeModel, Tokenizer};
use crate::service::{EvaluateParams, GenerationService};

pub const GENERATE_METHOD: &str = "generate";

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, GenerationError>> + Send>>;

type StreamingHandlerFn =
    Box<dyn Fn(Vec<u8>) -> Pin<Box<dyn Future<Output = ByteStream> + Send>> + Send + Sync>;

/// First frame a client sends on a connection.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamRequest {
    id: u64,
    method: String,
    params: Vec<u8>,
}

impl StreamRequest {
    pub fn new(id: u64, method: String, params: Vec<u8>) -> Self {
        Self { id, method, params }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseFrame {
    Chunk(Vec<u8>),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Every response frame and the end marker were written.
    Completed { frames: usize },
    /// The client stopped listening before the response ended.
    ClientDisconnected { frames: usize },
    UnknownMethod,
    /// The connection closed before a request arrived.
    NoRequest,
}

#[derive(Clone)]
pub struct GenerationServer {
    handlers: Arc<RwLock<HashMap<String, StreamingHandlerFn>>>,

    config: ServerConfig,

    local_addr: Option<SocketAddr>,
}

impl GenerationServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            config,
            local_addr: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn register_streaming<F, Fut, S>(&self, method: &str, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = S> + Send + 'static,
        S: Stream<Item = Result<Vec<u8>, GenerationError>> + Send + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.insert(
            method.to_string(),
            Box::new(move |params: Vec<u8>| {
                let response = handler(params);
                Box::pin(async move { Box::pin(response.await) as ByteStream })
                    as Pin<Box<dyn Future<Output = ByteStream> + Send>>
            }),
        );
    }

    /// Builds a [`GenerationService`] from the server's service config and
    /// exposes it under [`GENERATE_METHOD`]. Params are bincode
    /// [`EvaluateParams`]; each chunk goes out as UTF-8 text.
    pub async fn register_service(
        &self,
        model: Arc<dyn GenerativeModel>,
        tokenizer: Arc<dyn Tokenizer>,
    ) -> Result<(), GenerationError> {
        self.config.service.validate()?;
        let service = GenerationService::new(model, tokenizer, self.config.service.clone());
        self.register_streaming(GENERATE_METHOD, move |params: Vec<u8>| {
            let service = service.clone();
            async move {
                async_stream::stream! {
                    let params: EvaluateParams = match bincode::deserialize(&params) {
                        Ok(params) => params,
                        Err(err) => {
                            yield Err(GenerationError::from(err));
                            return;
                        }
                    };

                    let mut chunks = service.evaluate(params);
                    while let Some(chunk) = chunks.next().await {
                        yield chunk.map(String::into_bytes);
                    }
                }
            }
        })
        .await;
        Ok(())
    }

    pub async fn bind(&mut self) -> Result<TcpListener, GenerationError> {
        self.config.validate()?;
        let listener = TcpListener::bind(self.config.bind_address.as_str()).await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        let model = &self.config.model;
        info!(
            %local_addr,
            model = model.model_name_or_path(),
            bits = model.bits(),
            quant_type = ?model.quant_type(),
            fp16 = model.fp16(),
            bf16 = model.bf16(),
            device = %self.config.service.device(),
            "generation server listening"
        );
        Ok(listener)
    }

    /// Accepts connections until the listener fails, serving each on its own
    /// task.
    pub async fn start(&self, listener: TcpListener) -> Result<(), GenerationError> {
        loop {
            let (socket, peer) = listener.accept().await?;
            if let Err(err) = socket.set_nodelay(true) {
                debug!(%peer, error = %err, "could not set TCP_NODELAY");
            }

            let server = self.clone();
            tokio::spawn(async move {
                match server.serve_connection(socket).await {
                    Ok(outcome) => debug!(%peer, ?outcome, "connection finished"),
                    Err(err) => warn!(%peer, error = %err, "connection failed"),
                }
            });
        }
    }

    /// Serves one request on `io`: reads the request frame, dispatches it and
    /// streams the response frames back, followed by the end marker.
    pub async fn serve_connection<IO>(&self, io: IO) -> Result<ServeOutcome, GenerationError>
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let mut reader = FramedRead::new(read_half, FrameCodec::new(self.config.max_frame_len));
        let mut writer = FramedWrite::new(write_half, FrameCodec::new(self.config.max_frame_len));

        let request: StreamRequest = match reader.next().await {
            Some(Ok(Frame::Data(payload))) => bincode::deserialize(&payload)?,
            Some(Ok(Frame::End)) | None => return Ok(ServeOutcome::NoRequest),
            Some(Err(err)) => return Err(err),
        };
        debug!(id = request.id(), method = request.method(), "dispatching stream request");

        let response = {
            let handlers = self.handlers.read().await;
            handlers
                .get(request.method())
                .map(|handler| handler(request.params().to_vec()))
        };

        let Some(response) = response else {
            warn!(method = request.method(), "unknown method");
            let frame = ResponseFrame::Error(
                GenerationError::UnknownMethod(request.method().to_string()).to_string(),
            );
            writer.send(Frame::Data(Bytes::from(bincode::serialize(&frame)?))).await?;
            writer.send(Frame::End).await?;
            return Ok(ServeOutcome::UnknownMethod);
        };

        let response_stream = response.await;
        Ok(Self::send_response_stream(&mut reader, &mut writer, response_stream).await)
    }

    async fn send_response_stream<R, W>(
        reader: &mut FramedRead<R, FrameCodec>,
        writer: &mut FramedWrite<W, FrameCodec>,
        mut response_stream: ByteStream,
    ) -> ServeOutcome
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut frames = 0usize;

        loop {
            tokio::select! {
                item = response_stream.next() => {
                    let frame = match item {
                        Some(Ok(payload)) => ResponseFrame::Chunk(payload),
                        Some(Err(err)) => ResponseFrame::Error(err.to_string()),
                        None => break,
                    };
                    let payload = match bincode::serialize(&frame) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(error = %err, "failed to encode response frame");
                            break;
                        }
                    };
                    // Dropping the response stream on a failed write stops the
                    // generation behind it.
                    if let Err(err) = writer.send(Frame::Data(Bytes::from(payload))).await {
                        debug!(error = %err, frames, "write failed, client gone");
                        return ServeOutcome::ClientDisconnected { frames };
                    }
                    frames += 1;
                }
                // Clients send nothing after the request, so any inbound
                // activity (end marker, EOF, error) means they stopped listening.
                inbound = reader.next() => {
                    debug!(frames, end_marker = matches!(inbound, Some(Ok(Frame::End))), "client closed the stream early");
                    return ServeOutcome::ClientDisconnected { frames };
                }
            }
        }

        if writer.send(Frame::End).await.is_err() {
            return ServeOutcome::ClientDisconnected { frames };
        }
        ServeOutcome::Completed { frames }
    }
}

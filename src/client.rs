use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{Frame, FrameCodec};
use crate::config::DEFAULT_MAX_FRAME_LEN;
use crate::errors::GenerationError;
use crate::server::{ByteStream, ResponseFrame, StreamRequest, GENERATE_METHOD};
use crate::service::EvaluateParams;
use crate::DEFAULT_TIMEOUT;

/// Opens one connection per call. Dropping a returned stream closes the
/// connection, which the server treats as cancellation.
#[derive(Debug, Clone)]
pub struct GenerationClient {
    addr: SocketAddr,
    response_timeout: Duration,
    max_frame_len: usize,
    next_id: Arc<AtomicU64>,
}

impl GenerationClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            response_timeout: DEFAULT_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Longest wait between two response frames.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub async fn call_streaming(
        &self,
        method: &str,
        params: Vec<u8>,
    ) -> Result<ByteStream, GenerationError> {
        let socket = TcpStream::connect(self.addr).await?;
        socket.set_nodelay(true)?;
        let (read_half, write_half) = socket.into_split();
        let mut writer = FramedWrite::new(write_half, FrameCodec::new(self.max_frame_len));
        let reader = FramedRead::new(read_half, FrameCodec::new(self.max_frame_len));

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = StreamRequest::new(id, method.to_string(), params);
        writer
            .send(Frame::Data(Bytes::from(bincode::serialize(&request)?)))
            .await?;

        let timeout = self.response_timeout;
        Ok(Box::pin(async_stream::stream! {
            // Held open until the stream is dropped; closing it early would
            // read as a disconnect on the server.
            let _writer = writer;
            let frames = tokio_stream::StreamExt::timeout(reader, timeout);
            tokio::pin!(frames);

            while let Some(next) = frames.next().await {
                match next {
                    Err(_elapsed) => {
                        yield Err(GenerationError::Timeout);
                        break;
                    }
                    Ok(Err(err)) => {
                        yield Err(err);
                        break;
                    }
                    Ok(Ok(Frame::End)) => break,
                    Ok(Ok(Frame::Data(payload))) => match bincode::deserialize::<ResponseFrame>(&payload) {
                        Ok(ResponseFrame::Chunk(bytes)) => yield Ok(bytes),
                        Ok(ResponseFrame::Error(message)) => yield Err(GenerationError::Remote(message)),
                        Err(err) => {
                            yield Err(GenerationError::from(err));
                            break;
                        }
                    },
                }
            }
        }))
    }

    pub async fn generate(
        &self,
        params: &EvaluateParams,
    ) -> Result<impl Stream<Item = Result<String, GenerationError>>, GenerationError> {
        let response = self
            .call_streaming(GENERATE_METHOD, bincode::serialize(params)?)
            .await?;
        Ok(response.map(|chunk| {
            chunk.and_then(|bytes| {
                String::from_utf8(bytes).map_err(|err| GenerationError::Remote(err.to_string()))
            })
        }))
    }
}

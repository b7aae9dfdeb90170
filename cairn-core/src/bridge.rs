//! One TCP connection to a remote node, speaking the frame protocol.
//!
//! A bridge carries at most one exchange at a time: a request head, an optional
//! request body, then a response head and its body. The response body must be
//! read to the last byte before the bridge can carry another exchange; a bridge
//! that lost track of the byte stream is marked broken and is never reused.

use crate::buffer::BufferPool;
use crate::member::ServerDescriptor;
use crate::protocol::{
    FrameHeader, OpCode, Status, ValidateRequest, ValidateResponse, decode_meta, read_frame_head,
    write_frame_head,
};
use crate::{CairnError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufStream, ReadBuf, Take};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep};

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub secret: String,
    /// Serialized descriptor presented during validation when this process is itself
    /// a registered node.
    pub instance: Option<String>,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            secret: String::new(),
            instance: None,
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Bridge {
    server: ServerDescriptor,
    options: Arc<BridgeOptions>,
    buffers: Arc<BufferPool>,
    stream: Option<BufStream<TcpStream>>,
    validated: bool,
    broken: bool,
    in_flight: Option<OpCode>,
    pending_request_body: u64,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("server", &self.server.uuid)
            .field("addr", &self.server.access_addr())
            .field("connected", &self.stream.is_some())
            .field("validated", &self.validated)
            .field("broken", &self.broken)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl Bridge {
    pub fn new(
        server: ServerDescriptor,
        options: Arc<BridgeOptions>,
        buffers: Arc<BufferPool>,
    ) -> Self {
        Self {
            server,
            options,
            buffers,
            stream: None,
            validated: false,
            broken: false,
            in_flight: None,
            pending_request_body: 0,
        }
    }

    pub fn server(&self) -> &ServerDescriptor {
        &self.server
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Whether the next caller can start a fresh exchange on this bridge.
    pub fn is_reusable(&self) -> bool {
        self.stream.is_some()
            && self.validated
            && !self.broken
            && self.in_flight.is_none()
            && self.pending_request_body == 0
    }

    /// Non-blocking check that the peer has not hung up on an idle connection.
    /// EOF, a socket error or unsolicited bytes all mean the connection cannot
    /// carry another exchange.
    pub fn is_peer_alive(&self) -> bool {
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };
        let mut scratch = [0u8; 1];
        match stream.get_ref().try_read(&mut scratch) {
            Err(error) => error.kind() == io::ErrorKind::WouldBlock,
            Ok(_) => false,
        }
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub async fn connect(&mut self) -> Result<()> {
        let addr = self.server.access_addr();
        let stream = tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| CairnError::Timeout(format!("connect to {}", addr)))??;
        stream.set_nodelay(true)?;

        tracing::debug!("connected to {} ({})", addr, self.server.uuid);
        self.stream = Some(BufStream::new(stream));
        self.validated = false;
        self.broken = false;
        self.in_flight = None;
        self.pending_request_body = 0;
        Ok(())
    }

    /// Present the shared secret (and our own descriptor, if any) to the peer.
    pub async fn validate(&mut self) -> Result<ValidateResponse> {
        let request = ValidateRequest {
            secret: self.options.secret.clone(),
            instance: self.options.instance.clone(),
        };
        self.send_request(OpCode::Validate, &request, 0).await?;

        let response: ValidateResponse = {
            let mut response = self.receive_response().await?;
            let meta = response.decode_meta::<ValidateResponse>()?;
            response.body.drain().await?;
            meta
        };

        if response.result != Status::Ok {
            return Err(CairnError::Unauthorized(response.message));
        }

        self.validated = true;
        Ok(response)
    }

    /// Write a request head. When `body_len` is non-zero the caller must follow
    /// up with [`Bridge::write_body`] before receiving the response.
    pub async fn send_request<M: Serialize>(
        &mut self,
        op: OpCode,
        meta: &M,
        body_len: u64,
    ) -> Result<()> {
        if self.in_flight.is_some() || self.pending_request_body > 0 {
            self.broken = true;
            return Err(CairnError::Protocol(
                "request sent while another exchange is in flight".to_string(),
            ));
        }

        let io_timeout = self.options.io_timeout;
        let stream = self.stream_mut()?;
        let result = with_deadline(io_timeout, "send request", async {
            write_frame_head(&mut *stream, op, Status::Ok, meta, body_len).await?;
            if body_len == 0 {
                stream.flush().await?;
            }
            Ok::<(), CairnError>(())
        })
        .await;

        if let Err(error) = result {
            self.broken = true;
            return Err(error);
        }

        self.in_flight = Some(op);
        self.pending_request_body = body_len;
        Ok(())
    }

    /// Stream exactly the declared request body from `source`, counting every
    /// written byte into `progress`.
    pub async fn write_body<R>(&mut self, source: &mut R, progress: Option<&AtomicU64>) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let result = self.write_body_inner(source, progress).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    async fn write_body_inner<R>(
        &mut self,
        source: &mut R,
        progress: Option<&AtomicU64>,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let io_timeout = self.options.io_timeout;
        let buffers = Arc::clone(&self.buffers);
        let mut buf = buffers.get();
        let mut written = 0u64;

        while self.pending_request_body > 0 {
            let want = usize::try_from(self.pending_request_body)
                .unwrap_or(usize::MAX)
                .min(buf.len());
            let read = source
                .read(&mut buf[..want])
                .await
                .map_err(CairnError::Source)?;
            if read == 0 {
                return Err(CairnError::Protocol(format!(
                    "request body ended {} bytes short",
                    self.pending_request_body
                )));
            }

            let stream = self.stream_mut()?;
            with_deadline(io_timeout, "write body", async {
                stream.write_all(&buf[..read]).await?;
                Ok::<(), CairnError>(())
            })
            .await?;

            self.pending_request_body -= read as u64;
            written += read as u64;
            if let Some(progress) = progress {
                progress.fetch_add(read as u64, Ordering::Relaxed);
            }
        }

        let stream = self.stream_mut()?;
        with_deadline(io_timeout, "flush body", async {
            stream.flush().await?;
            Ok::<(), CairnError>(())
        })
        .await?;

        Ok(written)
    }

    /// Send a request together with its body in one call.
    pub async fn send_request_with_body<M, R>(
        &mut self,
        op: OpCode,
        meta: &M,
        body_len: u64,
        source: &mut R,
        progress: Option<&AtomicU64>,
    ) -> Result<u64>
    where
        M: Serialize,
        R: AsyncRead + Unpin + ?Sized,
    {
        self.send_request(op, meta, body_len).await?;
        if body_len == 0 {
            return Ok(0);
        }
        self.write_body(source, progress).await
    }

    /// Read the response head of the in-flight exchange. The returned body reader
    /// is positioned at the first body byte and must be drained by the caller.
    pub async fn receive_response(&mut self) -> Result<Response<'_>> {
        let Some(expected) = self.in_flight else {
            self.broken = true;
            return Err(CairnError::Protocol("no request in flight".to_string()));
        };
        if self.pending_request_body > 0 {
            self.broken = true;
            return Err(CairnError::Protocol(format!(
                "response awaited with {} request body bytes unsent",
                self.pending_request_body
            )));
        }

        let io_timeout = self.options.io_timeout;
        let Bridge {
            stream,
            broken,
            in_flight,
            ..
        } = self;
        let Some(stream) = stream.as_mut() else {
            return Err(CairnError::Protocol("bridge is not connected".to_string()));
        };

        let head = with_deadline(io_timeout, "receive response", read_frame_head(&mut *stream)).await;
        let (header, meta) = match head {
            Ok(head) => head,
            Err(error) => {
                *broken = true;
                return Err(error);
            }
        };

        if header.op != expected {
            *broken = true;
            return Err(CairnError::Protocol(format!(
                "response op {:?} does not match request op {:?}",
                header.op, expected
            )));
        }
        *in_flight = None;

        Ok(Response {
            header,
            meta,
            body: BodyReader::new(stream.take(header.body_len), broken, io_timeout),
        })
    }

    /// Graceful shutdown of the underlying connection.
    pub async fn close(mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(error) = stream.shutdown().await {
                tracing::debug!("error closing bridge to {}: {}", self.server.uuid, error);
            }
        }
    }

    /// Abort the connection without any further I/O.
    pub fn destroy(mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(
                "destroyed bridge to {} ({})",
                self.server.access_addr(),
                self.server.uuid
            );
        }
    }

    fn stream_mut(&mut self) -> Result<&mut BufStream<TcpStream>> {
        self.stream
            .as_mut()
            .ok_or_else(|| CairnError::Protocol("bridge is not connected".to_string()))
    }
}

async fn with_deadline<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CairnError::Timeout(what.to_string())),
    }
}

/// One decoded response head plus the live body stream behind it.
pub struct Response<'a> {
    pub header: FrameHeader,
    meta: Vec<u8>,
    pub body: BodyReader<'a>,
}

impl Response<'_> {
    pub fn op(&self) -> OpCode {
        self.header.op
    }

    pub fn status(&self) -> Status {
        self.header.status
    }

    pub fn body_len(&self) -> u64 {
        self.header.body_len
    }

    pub fn raw_meta(&self) -> &[u8] {
        &self.meta
    }

    /// Decode the metadata block. A decode failure poisons the bridge.
    pub fn decode_meta<T: DeserializeOwned>(&mut self) -> Result<T> {
        let decoded = decode_meta(&self.meta);
        if decoded.is_err() {
            self.body.poison();
        }
        decoded
    }
}

/// Reader over exactly `body_len` response bytes. Dropping it before the last
/// byte has been read marks the owning bridge broken.
pub struct BodyReader<'a> {
    inner: Take<&'a mut BufStream<TcpStream>>,
    broken: &'a mut bool,
    io_timeout: Duration,
    idle: Pin<Box<Sleep>>,
}

impl<'a> BodyReader<'a> {
    fn new(
        inner: Take<&'a mut BufStream<TcpStream>>,
        broken: &'a mut bool,
        io_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            broken,
            io_timeout,
            idle: Box::pin(tokio::time::sleep(io_timeout)),
        }
    }

    /// Body bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }

    pub fn poison(&mut self) {
        *self.broken = true;
    }

    /// Discard whatever is left of the body.
    pub async fn drain(&mut self) -> Result<u64> {
        let expected = self.remaining();
        let drained = tokio::io::copy(self, &mut tokio::io::sink()).await?;
        if drained != expected {
            self.poison();
            return Err(CairnError::Protocol(format!(
                "body ended after {} of {} bytes",
                drained, expected
            )));
        }
        Ok(drained)
    }
}

impl AsyncRead for BodyReader<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                if result.is_err() {
                    *this.broken = true;
                }
                let deadline = Instant::now() + this.io_timeout;
                this.idle.as_mut().reset(deadline);
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.idle.as_mut().poll(cx).is_ready() {
                    *this.broken = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "timed out reading response body",
                    )));
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for BodyReader<'_> {
    fn drop(&mut self) {
        if self.inner.limit() > 0 {
            *self.broken = true;
        }
    }
}

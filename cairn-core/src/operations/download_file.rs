use crate::bridge::Bridge;
use crate::path::StoragePath;
use crate::pool::ConnectionPool;
use crate::protocol::{DownloadRequest, DownloadResponse, OpCode, Status};
use crate::selector::{ExclusionSet, SelectCriteria, StorageSelector};
use crate::{CairnError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// Destination of a download. `write_body` may be called once per attempt; each
/// call must start the destination over.
#[async_trait]
pub trait DownloadSink: Send {
    async fn write_body(
        &mut self,
        path: &str,
        len: u64,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64>;
}

#[async_trait]
impl DownloadSink for Vec<u8> {
    async fn write_body(
        &mut self,
        _path: &str,
        len: u64,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64> {
        self.clear();
        self.reserve(usize::try_from(len).unwrap_or(0));
        let read = body.read_to_end(self).await? as u64;
        check_len(read, len)
    }
}

/// Writes the body to a local file, truncating it on every attempt.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl DownloadSink for FileSink {
    async fn write_body(
        &mut self,
        path: &str,
        len: u64,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<u64> {
        let mut file = tokio::fs::File::create(&self.path).await?;
        let written = tokio::io::copy(body, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        tracing::debug!("wrote {} bytes of {} to {}", written, path, self.path.display());
        check_len(written, len)
    }
}

fn check_len(received: u64, expected: u64) -> Result<u64> {
    if received != expected {
        return Err(CairnError::Protocol(format!(
            "body ended after {} of {} bytes",
            received, expected
        )));
    }
    Ok(received)
}

#[derive(Clone)]
pub struct DownloadFileOperation {
    selector: StorageSelector,
    pool: Arc<ConnectionPool>,
}

#[derive(Debug, Clone)]
pub struct DownloadFileOperationRequest {
    pub path: String,
    pub start: u64,
    /// Zero reads to the end of the file.
    pub length: u64,
    /// Try the instance named in the path before any other replica.
    pub from_source: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadFileOperationOutcome {
    Downloaded {
        server_uuid: String,
        bytes: u64,
        tried: Vec<String>,
    },
    /// A replica answered that it does not hold the file.
    NotFound {
        server_uuid: String,
        tried: Vec<String>,
    },
}

enum Received {
    Body(u64),
    NotFound,
}

impl DownloadFileOperation {
    pub fn new(selector: StorageSelector, pool: Arc<ConnectionPool>) -> Self {
        Self { selector, pool }
    }

    pub async fn run<S>(
        &self,
        request: DownloadFileOperationRequest,
        sink: &mut S,
    ) -> Result<DownloadFileOperationOutcome>
    where
        S: DownloadSink + ?Sized,
    {
        let path = StoragePath::parse(&request.path)?;
        let wire_path = path.to_string();
        let meta = DownloadRequest {
            path: wire_path.clone(),
            start: request.start,
            length: request.length,
        };

        let mut excludes = ExclusionSet::new();
        let mut from_src = request.from_source;

        loop {
            let criteria = SelectCriteria {
                group: &path.group,
                instance_id: if from_src { path.instance.as_str() } else { "" },
                upload: false,
            };
            let Some(server) = self.selector.select(criteria, &excludes).await else {
                if from_src {
                    tracing::debug!("source instance {} unavailable, trying replicas", path.instance);
                    from_src = false;
                    continue;
                }
                tracing::error!(
                    "no storage left for {} after trying {} servers",
                    wire_path,
                    excludes.len()
                );
                return Err(CairnError::NoStorageAvailable);
            };
            from_src = false;
            excludes.insert(&server.uuid);

            let mut bridge = match self.pool.get(&server).await {
                Ok(bridge) => bridge,
                Err(error) => {
                    tracing::warn!(
                        "skipping storage {} ({}): {}",
                        server.access_addr(),
                        server.uuid,
                        error
                    );
                    continue;
                }
            };

            if let Err(error) = bridge.send_request(OpCode::Download, &meta, 0).await {
                tracing::warn!("download request to {} failed: {}", server.access_addr(), error);
                self.pool.return_broken(&server, bridge);
                continue;
            }

            let received = receive_download(&mut bridge, &wire_path, sink).await;
            if bridge.is_reusable() {
                self.pool.return_healthy(&server, bridge);
            } else {
                self.pool.return_broken(&server, bridge);
            }

            match received {
                Ok(Received::Body(bytes)) => {
                    tracing::info!("downloaded {} ({} bytes) from {}", wire_path, bytes, server.uuid);
                    return Ok(DownloadFileOperationOutcome::Downloaded {
                        server_uuid: server.uuid,
                        bytes,
                        tried: excludes.into_vec(),
                    });
                }
                Ok(Received::NotFound) => {
                    tracing::info!("{} not found on {}", wire_path, server.uuid);
                    return Ok(DownloadFileOperationOutcome::NotFound {
                        server_uuid: server.uuid,
                        tried: excludes.into_vec(),
                    });
                }
                Err(error) => {
                    tracing::warn!("download from {} failed: {}", server.access_addr(), error);
                }
            }
        }
    }
}

async fn receive_download<S>(bridge: &mut Bridge, path: &str, sink: &mut S) -> Result<Received>
where
    S: DownloadSink + ?Sized,
{
    let mut response = bridge.receive_response().await?;
    let meta: DownloadResponse = response.decode_meta()?;

    match meta.status {
        Status::Ok => {
            let len = response.body_len();
            if meta.body_length != len {
                response.body.poison();
                return Err(CairnError::Protocol(format!(
                    "declared body length {} but frame carries {}",
                    meta.body_length, len
                )));
            }

            let written = sink.write_body(path, len, &mut response.body).await;
            let left = response.body.remaining();
            match written {
                Ok(_) if left > 0 => {
                    response.body.poison();
                    Err(CairnError::Protocol(format!(
                        "sink stopped with {} of {} body bytes unread",
                        left, len
                    )))
                }
                Ok(bytes) => Ok(Received::Body(bytes)),
                Err(error) => {
                    // The exchange itself is intact once the rest of the body is read.
                    if left > 0 {
                        let _ = response.body.drain().await;
                    }
                    Err(error)
                }
            }
        }
        Status::NotFound => {
            response.body.drain().await?;
            Ok(Received::NotFound)
        }
        status => {
            response.body.poison();
            Err(CairnError::Status {
                op: OpCode::Download,
                status,
            })
        }
    }
}

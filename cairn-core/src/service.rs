//! Serving side of the frame protocol: one accept loop, one task per connection.
//!
//! A connection must present the shared secret (Validate) before anything else is
//! answered. Tracker nodes additionally record the descriptor a peer presents while
//! validating, which is how storage nodes join the member list, and fold file
//! reports into a [`FileIndex`] so their QueryFile answers cover every storage node.

use crate::bridge::{Bridge, BridgeOptions};
use crate::buffer::BufferPool;
use crate::index::{FileIndex, FileReportQueue};
use crate::member::{InMemoryMemberRegistry, MemberRegistry, ServerDescriptor};
use crate::path::StoragePath;
use crate::protocol::{
    DownloadRequest, DownloadResponse, FileDescriptor, FrameHeader, ListMembersRequest,
    ListMembersResponse, OpCode, QueryFileRequest, QueryFileResponse, ReportFilesRequest,
    ReportFilesResponse, Status, UploadRequest, UploadResponse, ValidateRequest, ValidateResponse,
    decode_meta, read_frame_head_or_eof, write_frame_head,
};
use crate::store::BlobStore;
use crate::{CairnError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Storage,
    Tracker,
}

#[derive(Debug, Clone)]
pub struct NodeServiceConfig {
    pub bind_addr: String,
    /// Identity announced to peers. The port is replaced by the bound port.
    pub descriptor: ServerDescriptor,
    pub role: NodeRole,
    pub secret: String,
    /// How often a tracker prunes members whose registration has expired.
    pub expiry_interval: Duration,
}

struct ServiceState {
    secret: String,
    role: NodeRole,
    store: Arc<dyn BlobStore>,
    registry: Arc<InMemoryMemberRegistry>,
    index: Arc<FileIndex>,
    reports: FileReportQueue,
}

pub struct NodeService {
    listener: TcpListener,
    descriptor: ServerDescriptor,
    expiry_interval: Duration,
    state: Arc<ServiceState>,
}

impl NodeService {
    pub async fn bind(
        config: NodeServiceConfig,
        store: Arc<dyn BlobStore>,
        registry: Arc<InMemoryMemberRegistry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let mut descriptor = config.descriptor;
        descriptor.port = local_addr.port();

        tracing::info!(
            "{:?} node {} listening on {} (group={} instance={})",
            config.role,
            descriptor.uuid,
            local_addr,
            descriptor.group,
            descriptor.instance_id
        );

        Ok(Self {
            listener,
            descriptor,
            expiry_interval: config.expiry_interval,
            state: Arc::new(ServiceState {
                secret: config.secret,
                role: config.role,
                store,
                registry,
                index: Arc::new(FileIndex::new()),
                reports: FileReportQueue::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn registry(&self) -> Arc<InMemoryMemberRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub fn file_index(&self) -> Arc<FileIndex> {
        Arc::clone(&self.state.index)
    }

    /// Files stored here that still have to reach the trackers.
    pub fn file_reports(&self) -> FileReportQueue {
        self.state.reports.clone()
    }

    pub async fn serve(self) -> Result<()> {
        let expiry = match self.state.role {
            NodeRole::Tracker => Some(spawn_expiry(
                Arc::clone(&self.state.registry),
                self.expiry_interval,
            )),
            NodeRole::Storage => None,
        };

        let result = self.accept_loop().await;
        if let Some(expiry) = expiry {
            expiry.abort();
        }
        result
    }

    async fn accept_loop(&self) -> Result<()> {
        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    tracing::warn!("accept failed: {}", error);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(error) = handle_connection(state, socket).await {
                    tracing::debug!("connection from {} closed: {}", peer, error);
                }
            });
        }
    }
}

fn spawn_expiry(registry: Arc<InMemoryMemberRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        loop {
            ticker.tick().await;
            registry.expire_stale(Utc::now()).await;
        }
    })
}

async fn handle_connection(state: Arc<ServiceState>, socket: TcpStream) -> Result<()> {
    socket.set_nodelay(true)?;
    let mut stream = BufStream::new(socket);
    let mut validated = false;

    while let Some((header, meta)) = read_frame_head_or_eof(&mut stream).await? {
        match header.op {
            OpCode::Validate => {
                discard_body(&mut stream, header.body_len).await?;
                validated = handle_validate(&state, &mut stream, &meta).await?;
            }
            op if !validated => {
                tracing::warn!("{:?} request on unauthenticated connection", op);
                discard_body(&mut stream, header.body_len).await?;
                respond_status(&mut stream, op, Status::Unauthorized).await?;
            }
            OpCode::Upload => handle_upload(&state, &mut stream, &header, &meta).await?,
            OpCode::Download => {
                discard_body(&mut stream, header.body_len).await?;
                handle_download(&state, &mut stream, &meta).await?;
            }
            OpCode::QueryFile => {
                discard_body(&mut stream, header.body_len).await?;
                handle_query_file(&state, &mut stream, &meta).await?;
            }
            OpCode::ListMembers => {
                discard_body(&mut stream, header.body_len).await?;
                handle_list_members(&state, &mut stream, &meta).await?;
            }
            OpCode::ReportFiles => {
                discard_body(&mut stream, header.body_len).await?;
                handle_report_files(&state, &mut stream, &meta).await?;
            }
        }
        stream.flush().await?;
    }
    Ok(())
}

async fn handle_validate(
    state: &ServiceState,
    stream: &mut BufStream<TcpStream>,
    meta: &[u8],
) -> Result<bool> {
    let request: ValidateRequest = match decode_meta(meta) {
        Ok(request) => request,
        Err(_) => {
            respond_validate(stream, Status::BadRequest, "malformed validate request").await?;
            return Ok(false);
        }
    };

    if request.secret != state.secret {
        respond_validate(stream, Status::Unauthorized, "authentication failed").await?;
        return Ok(false);
    }

    if state.role == NodeRole::Tracker {
        if let Some(instance) = request.instance.as_deref() {
            match serde_json::from_str::<ServerDescriptor>(instance) {
                Ok(descriptor) => state.registry.upsert(descriptor).await,
                Err(error) => {
                    tracing::error!("error parsing instance descriptor: {}", error);
                    respond_validate(stream, Status::InternalError, &error.to_string()).await?;
                    return Ok(false);
                }
            }
        }
    }

    respond_validate(stream, Status::Ok, "authentication success").await?;
    Ok(true)
}

async fn handle_upload(
    state: &ServiceState,
    stream: &mut BufStream<TcpStream>,
    header: &FrameHeader,
    meta: &[u8],
) -> Result<()> {
    let request = match decode_meta::<UploadRequest>(meta) {
        Ok(request) if request.file_size == header.body_len => request,
        _ => {
            discard_body(stream, header.body_len).await?;
            return respond_status(stream, OpCode::Upload, Status::BadRequest).await;
        }
    };

    let mut body = (&mut *stream).take(header.body_len);
    let stored = state
        .store
        .put(&mut body, header.body_len, &request.md5)
        .await;

    let status = match stored {
        Ok(outcome) => {
            let path = outcome.file.storage_path();
            if state.role == NodeRole::Storage && !outcome.reused {
                state.reports.push(outcome.file.clone());
            }
            tracing::info!(
                "stored {} ({} bytes, reused={})",
                path,
                header.body_len,
                outcome.reused
            );
            let response = UploadResponse {
                status: Status::Ok,
                path,
            };
            return write_frame_head(stream, OpCode::Upload, Status::Ok, &response, 0).await;
        }
        Err(CairnError::Protocol(message)) => return Err(CairnError::Protocol(message)),
        Err(CairnError::HashMismatch { expected, actual }) => {
            tracing::warn!("upload hash mismatch: declared {}, received {}", expected, actual);
            Status::BadRequest
        }
        Err(error) => {
            tracing::error!("error storing upload: {}", error);
            Status::InternalError
        }
    };

    let left = body.limit();
    if left > 0 {
        let drained = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        if drained != left {
            return Err(CairnError::Protocol("upload body truncated".to_string()));
        }
    }
    respond_status(stream, OpCode::Upload, status).await
}

async fn handle_download(
    state: &ServiceState,
    stream: &mut BufStream<TcpStream>,
    meta: &[u8],
) -> Result<()> {
    let Ok(request) = decode_meta::<DownloadRequest>(meta) else {
        return respond_status(stream, OpCode::Download, Status::BadRequest).await;
    };
    let Ok(path) = StoragePath::parse(&request.path) else {
        return respond_status(stream, OpCode::Download, Status::BadRequest).await;
    };

    let (mut file, len) = match state.store.open(&path.md5).await {
        Ok(Some(opened)) => opened,
        Ok(None) => {
            tracing::debug!("download of missing file {}", path);
            return respond_status(stream, OpCode::Download, Status::NotFound).await;
        }
        Err(error) => {
            tracing::error!("error opening {}: {}", path, error);
            return respond_status(stream, OpCode::Download, Status::InternalError).await;
        }
    };

    if request.start > len {
        return respond_status(stream, OpCode::Download, Status::BadRequest).await;
    }
    let available = len - request.start;
    let body_len = match request.length {
        0 => available,
        length => length.min(available),
    };

    if let Err(error) = file.seek(SeekFrom::Start(request.start)).await {
        tracing::error!("error seeking {}: {}", path, error);
        return respond_status(stream, OpCode::Download, Status::InternalError).await;
    }

    let response = DownloadResponse {
        status: Status::Ok,
        body_length: body_len,
    };
    write_frame_head(stream, OpCode::Download, Status::Ok, &response, body_len).await?;

    let sent = tokio::io::copy(&mut file.take(body_len), stream).await?;
    if sent != body_len {
        return Err(CairnError::Protocol(format!(
            "{} shrank while sending: {} of {} bytes",
            path, sent, body_len
        )));
    }
    tracing::debug!("sent {} bytes of {}", sent, path);
    Ok(())
}

async fn handle_query_file(
    state: &ServiceState,
    stream: &mut BufStream<TcpStream>,
    meta: &[u8],
) -> Result<()> {
    let Ok(request) = decode_meta::<QueryFileRequest>(meta) else {
        return respond_status(stream, OpCode::QueryFile, Status::BadRequest).await;
    };

    let local = match state.store.lookup(&request.path_or_md5).await {
        Ok(local) => local,
        Err(error) => {
            tracing::error!("error querying {}: {}", request.path_or_md5, error);
            return respond_status(stream, OpCode::QueryFile, Status::InternalError).await;
        }
    };
    let file = match local {
        Some(file) => Some(file),
        None => state.index.lookup(&request.path_or_md5).await,
    };

    let status = if file.is_some() {
        Status::Ok
    } else {
        Status::NotFound
    };
    let response = QueryFileResponse { status, file };
    write_frame_head(stream, OpCode::QueryFile, status, &response, 0).await
}

async fn handle_list_members(
    state: &ServiceState,
    stream: &mut BufStream<TcpStream>,
    meta: &[u8],
) -> Result<()> {
    if state.role != NodeRole::Tracker {
        return respond_status(stream, OpCode::ListMembers, Status::BadRequest).await;
    }
    let Ok(request) = decode_meta::<ListMembersRequest>(meta) else {
        return respond_status(stream, OpCode::ListMembers, Status::BadRequest).await;
    };

    let members: Vec<ServerDescriptor> = state
        .registry
        .list_live_members()
        .await
        .into_iter()
        .filter(|member| request.group.is_empty() || member.group == request.group)
        .collect();
    tracing::debug!("listing {} members (group={:?})", members.len(), request.group);

    let response = ListMembersResponse {
        status: Status::Ok,
        members,
    };
    write_frame_head(stream, OpCode::ListMembers, Status::Ok, &response, 0).await
}

async fn handle_report_files(
    state: &ServiceState,
    stream: &mut BufStream<TcpStream>,
    meta: &[u8],
) -> Result<()> {
    if state.role != NodeRole::Tracker {
        return respond_status(stream, OpCode::ReportFiles, Status::BadRequest).await;
    }
    let Ok(request) = decode_meta::<ReportFilesRequest>(meta) else {
        return respond_status(stream, OpCode::ReportFiles, Status::BadRequest).await;
    };

    let accepted = request.files.len() as u64;
    state.index.record(request.files).await;

    let response = ReportFilesResponse {
        status: Status::Ok,
        accepted,
    };
    write_frame_head(stream, OpCode::ReportFiles, Status::Ok, &response, 0).await
}

async fn respond_validate(
    stream: &mut BufStream<TcpStream>,
    result: Status,
    message: &str,
) -> Result<()> {
    let response = ValidateResponse {
        result,
        message: message.to_string(),
    };
    write_frame_head(stream, OpCode::Validate, result, &response, 0).await
}

/// Answer `op` with a bodiless response carrying only `status`.
async fn respond_status(
    stream: &mut BufStream<TcpStream>,
    op: OpCode,
    status: Status,
) -> Result<()> {
    match op {
        OpCode::Validate => respond_validate(stream, status, "").await,
        OpCode::Upload => {
            let response = UploadResponse {
                status,
                path: String::new(),
            };
            write_frame_head(stream, op, status, &response, 0).await
        }
        OpCode::Download => {
            let response = DownloadResponse {
                status,
                body_length: 0,
            };
            write_frame_head(stream, op, status, &response, 0).await
        }
        OpCode::QueryFile => {
            let response = QueryFileResponse { status, file: None };
            write_frame_head(stream, op, status, &response, 0).await
        }
        OpCode::ListMembers => {
            let response = ListMembersResponse {
                status,
                members: Vec::new(),
            };
            write_frame_head(stream, op, status, &response, 0).await
        }
        OpCode::ReportFiles => {
            let response = ReportFilesResponse {
                status,
                accepted: 0,
            };
            write_frame_head(stream, op, status, &response, 0).await
        }
    }
}

async fn discard_body(stream: &mut BufStream<TcpStream>, len: u64) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let drained = tokio::io::copy(&mut (&mut *stream).take(len), &mut tokio::io::sink()).await?;
    if drained != len {
        return Err(CairnError::Protocol("request body truncated".to_string()));
    }
    Ok(())
}

/// Present `descriptor` to `tracker` so it shows up in the tracker's member list,
/// then report `files` on the same connection.
pub async fn register_with_tracker(
    tracker: &ServerDescriptor,
    descriptor: &ServerDescriptor,
    files: &[FileDescriptor],
    secret: &str,
) -> Result<()> {
    let options = BridgeOptions {
        secret: secret.to_string(),
        instance: Some(serde_json::to_string(descriptor)?),
        ..BridgeOptions::default()
    };
    let mut bridge = Bridge::new(
        tracker.clone(),
        Arc::new(options),
        Arc::new(BufferPool::new(4 * 1024)),
    );
    bridge.connect().await?;
    let reported = async {
        bridge.validate().await?;
        if !files.is_empty() {
            report_files(&mut bridge, files).await?;
        }
        Ok::<(), CairnError>(())
    }
    .await;
    bridge.close().await;
    reported
}

async fn report_files(bridge: &mut Bridge, files: &[FileDescriptor]) -> Result<()> {
    let request = ReportFilesRequest {
        files: files.to_vec(),
    };
    bridge.send_request(OpCode::ReportFiles, &request, 0).await?;

    let mut response = bridge.receive_response().await?;
    let meta: ReportFilesResponse = response.decode_meta()?;
    response.body.drain().await?;
    if meta.status != Status::Ok {
        return Err(CairnError::Status {
            op: OpCode::ReportFiles,
            status: meta.status,
        });
    }
    tracing::debug!("tracker accepted {} file reports", meta.accepted);
    Ok(())
}

/// Re-register with every tracker each `interval`, shipping whatever `reports` has
/// queued since the last round. Each registration expires after three missed rounds.
/// A batch that did not reach every tracker is queued again.
pub fn spawn_heartbeat(
    descriptor: ServerDescriptor,
    trackers: Vec<ServerDescriptor>,
    secret: String,
    interval: Duration,
    reports: FileReportQueue,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ttl = chrono::Duration::from_std(interval * 3).unwrap_or(chrono::Duration::seconds(90));
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        loop {
            ticker.tick().await;
            let announced = descriptor.clone().expires_at(Utc::now() + ttl);
            let batch = reports.take();
            let mut delivered = true;
            for tracker in &trackers {
                if let Err(error) = register_with_tracker(tracker, &announced, &batch, &secret).await {
                    delivered = false;
                    tracing::warn!(
                        "failed to register with tracker {} ({}): {}",
                        tracker.access_addr(),
                        tracker.uuid,
                        error
                    );
                }
            }
            if !delivered && !batch.is_empty() {
                reports.extend(batch);
            }
        }
    })
}

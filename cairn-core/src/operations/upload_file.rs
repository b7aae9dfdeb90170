use crate::bridge::Bridge;
use crate::digest::{file_ext, file_md5};
use crate::operations::{QueryFileOperation, QueryFileOperationOutcome, QueryFileOperationRequest};
use crate::pool::ConnectionPool;
use crate::progress::ProgressReporter;
use crate::protocol::{OpCode, Status, UploadRequest, UploadResponse};
use crate::selector::{ExclusionSet, SelectCriteria, StorageSelector};
use crate::{CairnError, Result};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncSeekExt;

#[derive(Clone)]
pub struct UploadFileOperation {
    selector: StorageSelector,
    pool: Arc<ConnectionPool>,
    query: Option<QueryFileOperation>,
    progress_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct UploadFileOperationRequest {
    pub local_path: PathBuf,
    /// Restrict candidates to one group. Empty means any group.
    pub group: String,
    pub skip_dedup_check: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFileOperationOutcome {
    pub path: String,
    pub md5: String,
    /// The content was already known to a tracker and nothing was sent.
    pub deduplicated: bool,
    pub server_uuid: Option<String>,
    /// Storage servers attempted, in order.
    pub tried: Vec<String>,
}

impl UploadFileOperation {
    pub fn new(
        selector: StorageSelector,
        pool: Arc<ConnectionPool>,
        query: Option<QueryFileOperation>,
        progress_interval: Duration,
    ) -> Self {
        Self {
            selector,
            pool,
            query,
            progress_interval,
        }
    }

    pub async fn run(&self, request: UploadFileOperationRequest) -> Result<UploadFileOperationOutcome> {
        let UploadFileOperationRequest {
            local_path,
            group,
            skip_dedup_check,
        } = request;

        let file_size = tokio::fs::metadata(&local_path)
            .await
            .map_err(CairnError::Source)?
            .len();
        let md5 = file_md5(&local_path).await.map_err(CairnError::Source)?;

        if !skip_dedup_check {
            if let Some(path) = self.lookup_existing(&md5).await {
                tracing::info!("{} already stored as {}", local_path.display(), path);
                return Ok(UploadFileOperationOutcome {
                    path,
                    md5,
                    deduplicated: true,
                    server_uuid: None,
                    tried: Vec::new(),
                });
            }
        }

        let meta = UploadRequest {
            file_size,
            file_ext: file_ext(&local_path),
            md5: md5.clone(),
        };
        let mut file = tokio::fs::File::open(&local_path)
            .await
            .map_err(CairnError::Source)?;
        let progress = ProgressReporter::spawn(
            format!("upload {}", local_path.display()),
            file_size,
            self.progress_interval,
        );
        let criteria = SelectCriteria {
            group: &group,
            instance_id: "",
            upload: true,
        };
        let mut excludes = ExclusionSet::new();

        loop {
            let Some(server) = self.selector.select(criteria, &excludes).await else {
                tracing::error!(
                    "no storage left for {} after trying {} servers",
                    local_path.display(),
                    excludes.len()
                );
                return Err(CairnError::NoStorageAvailable);
            };
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

            file.seek(SeekFrom::Start(0))
                .await
                .map_err(CairnError::Source)?;
            progress.reset();

            let sent = bridge
                .send_request_with_body(
                    OpCode::Upload,
                    &meta,
                    file_size,
                    &mut file,
                    Some(progress.counter()),
                )
                .await;
            if let Err(error) = sent {
                self.pool.return_broken(&server, bridge);
                if matches!(error, CairnError::Source(_)) {
                    return Err(error);
                }
                tracing::warn!("upload to {} failed: {}", server.access_addr(), error);
                continue;
            }

            let received = receive_upload(&mut bridge).await;
            match received {
                Ok(response) if response.status == Status::Ok => {
                    self.pool.return_healthy(&server, bridge);
                    let last = progress.finish().await;
                    tracing::info!(
                        "uploaded {} ({} bytes) to {} as {}",
                        local_path.display(),
                        last.total,
                        server.uuid,
                        response.path
                    );
                    return Ok(UploadFileOperationOutcome {
                        path: response.path,
                        md5,
                        deduplicated: false,
                        server_uuid: Some(server.uuid),
                        tried: excludes.into_vec(),
                    });
                }
                Ok(response) => {
                    self.pool.return_healthy(&server, bridge);
                    return Err(CairnError::Status {
                        op: OpCode::Upload,
                        status: response.status,
                    });
                }
                Err(error) if error.is_connection_fatal() => {
                    self.pool.return_broken(&server, bridge);
                    tracing::warn!("upload to {} failed: {}", server.access_addr(), error);
                }
                Err(error) => {
                    self.pool.return_broken(&server, bridge);
                    return Err(error);
                }
            }
        }
    }

    /// Storage path a tracker already holds for this content, if any. Query
    /// failures only cost the shortcut.
    async fn lookup_existing(&self, md5: &str) -> Option<String> {
        let query = self.query.as_ref()?;
        if query.trackers().is_empty() {
            return None;
        }

        let request = QueryFileOperationRequest {
            path_or_md5: md5.to_string(),
        };
        match query.run(request).await {
            Ok(QueryFileOperationOutcome::Found { file, .. }) => Some(file.storage_path()),
            Ok(QueryFileOperationOutcome::NotFound) => None,
            Err(error) => {
                tracing::warn!("dedup check for {} failed, uploading anyway: {}", md5, error);
                None
            }
        }
    }
}

async fn receive_upload(bridge: &mut Bridge) -> Result<UploadResponse> {
    let mut response = bridge.receive_response().await?;
    let meta: UploadResponse = response.decode_meta()?;
    response.body.drain().await?;
    Ok(meta)
}

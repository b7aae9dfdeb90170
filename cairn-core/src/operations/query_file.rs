use crate::bridge::Bridge;
use crate::member::ServerDescriptor;
use crate::pool::ConnectionPool;
use crate::protocol::{FileDescriptor, OpCode, QueryFileRequest, QueryFileResponse, Status};
use crate::{CairnError, Result};
use std::sync::Arc;

/// Look a file up on the trackers, in configured order, until one knows it.
#[derive(Clone)]
pub struct QueryFileOperation {
    pool: Arc<ConnectionPool>,
    trackers: Vec<ServerDescriptor>,
}

#[derive(Debug, Clone)]
pub struct QueryFileOperationRequest {
    /// A storage path or a bare content hash.
    pub path_or_md5: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryFileOperationOutcome {
    Found {
        file: FileDescriptor,
        tracker_uuid: String,
    },
    NotFound,
}

impl QueryFileOperation {
    pub fn new(pool: Arc<ConnectionPool>, trackers: Vec<ServerDescriptor>) -> Self {
        Self { pool, trackers }
    }

    pub fn trackers(&self) -> &[ServerDescriptor] {
        &self.trackers
    }

    pub async fn run(&self, request: QueryFileOperationRequest) -> Result<QueryFileOperationOutcome> {
        let meta = QueryFileRequest {
            path_or_md5: request.path_or_md5,
        };
        let mut answered = false;

        for tracker in &self.trackers {
            let mut bridge = match self.pool.get(tracker).await {
                Ok(bridge) => bridge,
                Err(error) => {
                    tracing::warn!(
                        "tracker {} unavailable for query: {}",
                        tracker.access_addr(),
                        error
                    );
                    continue;
                }
            };

            if let Err(error) = bridge.send_request(OpCode::QueryFile, &meta, 0).await {
                tracing::warn!("error querying tracker {}: {}", tracker.access_addr(), error);
                self.pool.return_broken(tracker, bridge);
                continue;
            }

            let received = receive_query(&mut bridge).await;
            if bridge.is_reusable() {
                self.pool.return_healthy(tracker, bridge);
            } else {
                self.pool.return_broken(tracker, bridge);
            }

            match received {
                Ok(QueryFileResponse {
                    status: Status::Ok,
                    file: Some(file),
                }) => {
                    tracing::debug!(
                        "tracker {} knows {} as {}",
                        tracker.uuid,
                        meta.path_or_md5,
                        file.storage_path()
                    );
                    return Ok(QueryFileOperationOutcome::Found {
                        file,
                        tracker_uuid: tracker.uuid.clone(),
                    });
                }
                Ok(QueryFileResponse {
                    status: Status::NotFound,
                    ..
                }) => answered = true,
                Ok(response) => tracing::warn!(
                    "tracker {} answered query with {:?}",
                    tracker.access_addr(),
                    response.status
                ),
                Err(error) => {
                    tracing::warn!("error querying tracker {}: {}", tracker.access_addr(), error)
                }
            }
        }

        if answered {
            Ok(QueryFileOperationOutcome::NotFound)
        } else {
            Err(CairnError::NoTrackerAvailable)
        }
    }
}

async fn receive_query(bridge: &mut Bridge) -> Result<QueryFileResponse> {
    let mut response = bridge.receive_response().await?;
    let meta: QueryFileResponse = response.decode_meta()?;
    response.body.drain().await?;
    Ok(meta)
}

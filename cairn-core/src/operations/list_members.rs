use crate::bridge::Bridge;
use crate::member::ServerDescriptor;
use crate::pool::ConnectionPool;
use crate::protocol::{ListMembersRequest, ListMembersResponse, OpCode, Status};
use crate::{CairnError, Result};
use std::sync::Arc;

/// Fetch the live storage member list from the first tracker that answers.
#[derive(Clone)]
pub struct ListMembersOperation {
    pool: Arc<ConnectionPool>,
    trackers: Vec<ServerDescriptor>,
}

#[derive(Debug, Clone, Default)]
pub struct ListMembersOperationRequest {
    /// Empty lists every group.
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListMembersOperationOutcome {
    pub members: Vec<ServerDescriptor>,
    pub tracker_uuid: String,
}

impl ListMembersOperation {
    pub fn new(pool: Arc<ConnectionPool>, trackers: Vec<ServerDescriptor>) -> Self {
        Self { pool, trackers }
    }

    pub fn trackers(&self) -> &[ServerDescriptor] {
        &self.trackers
    }

    pub async fn run(
        &self,
        request: ListMembersOperationRequest,
    ) -> Result<ListMembersOperationOutcome> {
        let meta = ListMembersRequest {
            group: request.group,
        };

        for tracker in &self.trackers {
            let mut bridge = match self.pool.get(tracker).await {
                Ok(bridge) => bridge,
                Err(error) => {
                    tracing::warn!(
                        "tracker {} unavailable for member sync: {}",
                        tracker.access_addr(),
                        error
                    );
                    continue;
                }
            };

            if let Err(error) = bridge.send_request(OpCode::ListMembers, &meta, 0).await {
                tracing::warn!("error syncing members from {}: {}", tracker.access_addr(), error);
                self.pool.return_broken(tracker, bridge);
                continue;
            }

            let received = receive_members(&mut bridge).await;
            if bridge.is_reusable() {
                self.pool.return_healthy(tracker, bridge);
            } else {
                self.pool.return_broken(tracker, bridge);
            }

            match received {
                Ok(ListMembersResponse {
                    status: Status::Ok,
                    members,
                }) => {
                    tracing::debug!("tracker {} listed {} members", tracker.uuid, members.len());
                    return Ok(ListMembersOperationOutcome {
                        members,
                        tracker_uuid: tracker.uuid.clone(),
                    });
                }
                Ok(response) => tracing::warn!(
                    "tracker {} answered member sync with {:?}",
                    tracker.access_addr(),
                    response.status
                ),
                Err(error) => {
                    tracing::warn!("error syncing members from {}: {}", tracker.access_addr(), error)
                }
            }
        }

        Err(CairnError::NoTrackerAvailable)
    }
}

async fn receive_members(bridge: &mut Bridge) -> Result<ListMembersResponse> {
    let mut response = bridge.receive_response().await?;
    let meta: ListMembersResponse = response.decode_meta()?;
    response.body.drain().await?;
    Ok(meta)
}

//! Client-side member list kept in sync with the trackers.

use crate::member::{MemberRegistry, ServerDescriptor};
use crate::operations::{ListMembersOperation, ListMembersOperationRequest};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

#[derive(Default)]
struct Snapshot {
    members: Vec<ServerDescriptor>,
    refreshed_at: Option<Instant>,
}

/// [`MemberRegistry`] whose list is pulled from the trackers. A read that finds
/// the list older than `refresh_interval` syncs first; if no tracker answers, the
/// last list is served until its members expire.
pub struct TrackerMemberRegistry {
    list: ListMembersOperation,
    group: String,
    refresh_interval: Duration,
    snapshot: RwLock<Snapshot>,
    refreshing: Mutex<()>,
}

impl TrackerMemberRegistry {
    pub fn new(list: ListMembersOperation, refresh_interval: Duration) -> Self {
        Self {
            list,
            group: String::new(),
            refresh_interval,
            snapshot: RwLock::new(Snapshot::default()),
            refreshing: Mutex::new(()),
        }
    }

    /// Only track members of `group`.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Pull the member list now. Returns how many members the tracker listed.
    pub async fn refresh(&self) -> Result<usize> {
        let outcome = self
            .list
            .run(ListMembersOperationRequest {
                group: self.group.clone(),
            })
            .await?;

        let count = outcome.members.len();
        let mut snapshot = self.snapshot.write().await;
        if snapshot.members != outcome.members {
            tracing::info!(
                "member list from tracker {}: {} members",
                outcome.tracker_uuid,
                count
            );
        }
        snapshot.members = outcome.members;
        snapshot.refreshed_at = Some(Instant::now());
        Ok(count)
    }

    async fn is_stale(&self) -> bool {
        match self.snapshot.read().await.refreshed_at {
            Some(at) => at.elapsed() >= self.refresh_interval,
            None => true,
        }
    }
}

#[async_trait]
impl MemberRegistry for TrackerMemberRegistry {
    async fn list_live_members(&self) -> Vec<ServerDescriptor> {
        if self.is_stale().await {
            let _refreshing = self.refreshing.lock().await;
            // Another caller may have synced while we waited.
            if self.is_stale().await {
                if let Err(error) = self.refresh().await {
                    tracing::warn!("member sync failed, keeping previous list: {}", error);
                    self.snapshot.write().await.refreshed_at = Some(Instant::now());
                }
            }
        }

        let now = Utc::now();
        self.snapshot
            .read()
            .await
            .members
            .iter()
            .filter(|member| member.is_live(now))
            .cloned()
            .collect()
    }
}

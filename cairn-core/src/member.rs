use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A storage or tracker node as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Stable across reconnects; also the connection pool key.
    pub uuid: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub advertise_addr: Option<String>,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub read_only: bool,
    /// `None` never expires.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ServerDescriptor {
    pub fn new(uuid: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            uuid: uuid.into(),
            host: host.into(),
            port,
            advertise_addr: None,
            group: String::new(),
            instance_id: String::new(),
            read_only: false,
            expires_at: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Address clients should dial: the advertised host when set, otherwise the bind host.
    pub fn access_addr(&self) -> String {
        let host = self
            .advertise_addr
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(&self.host);
        format!("{}:{}", host, self.port)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// Source of the live storage member list. Maintained outside the client by
/// tracker heartbeats; read-only from the client's point of view.
#[async_trait]
pub trait MemberRegistry: Send + Sync {
    /// Live members in registry order.
    async fn list_live_members(&self) -> Vec<ServerDescriptor>;
}

pub type DynMemberRegistry = Arc<dyn MemberRegistry>;

#[derive(Debug, Default)]
pub struct InMemoryMemberRegistry {
    members: RwLock<Vec<ServerDescriptor>>,
}

impl InMemoryMemberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members(members: Vec<ServerDescriptor>) -> Self {
        Self {
            members: RwLock::new(members),
        }
    }

    /// Insert a member, or replace the existing entry with the same uuid in place.
    pub async fn upsert(&self, member: ServerDescriptor) {
        let mut members = self.members.write().await;
        match members.iter_mut().find(|existing| existing.uuid == member.uuid) {
            Some(existing) => *existing = member,
            None => {
                tracing::info!(
                    "registered member uuid={} group={} instance={} addr={}",
                    member.uuid,
                    member.group,
                    member.instance_id,
                    member.access_addr()
                );
                members.push(member);
            }
        }
    }

    pub async fn remove(&self, uuid: &str) -> Option<ServerDescriptor> {
        let mut members = self.members.write().await;
        let index = members.iter().position(|member| member.uuid == uuid)?;
        Some(members.remove(index))
    }

    /// Drop every member whose expiry has passed. Returns how many were removed.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> usize {
        let mut members = self.members.write().await;
        let before = members.len();
        members.retain(|member| member.is_live(now));
        let removed = before - members.len();
        if removed > 0 {
            tracing::info!("expired {} stale members", removed);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.members.read().await.is_empty()
    }
}

#[async_trait]
impl MemberRegistry for InMemoryMemberRegistry {
    async fn list_live_members(&self) -> Vec<ServerDescriptor> {
        let now = Utc::now();
        self.members
            .read()
            .await
            .iter()
            .filter(|member| member.is_live(now))
            .cloned()
            .collect()
    }
}

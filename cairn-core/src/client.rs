use crate::bridge::BridgeOptions;
use crate::buffer::BufferPool;
use crate::member::{DynMemberRegistry, ServerDescriptor};
use crate::operations::{
    DownloadFileOperation, DownloadFileOperationOutcome, DownloadFileOperationRequest,
    DownloadSink, ListMembersOperation, ListMembersOperationOutcome, ListMembersOperationRequest,
    QueryFileOperation, QueryFileOperationOutcome, QueryFileOperationRequest, UploadFileOperation,
    UploadFileOperationOutcome, UploadFileOperationRequest,
};
use crate::pool::ConnectionPool;
use crate::selector::StorageSelector;
use crate::tracker::TrackerMemberRegistry;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_max_conn_per_server")]
    pub max_conn_per_server: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default)]
    pub skip_dedup_check: bool,
    /// Trackers consulted by QueryFile and member sync, in order.
    #[serde(default)]
    pub trackers: Vec<ServerDescriptor>,
    /// How long a member list pulled from the trackers is used before syncing again.
    #[serde(default = "default_member_refresh_ms")]
    pub member_refresh_ms: u64,
}

fn default_max_conn_per_server() -> usize {
    100
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_io_timeout_ms() -> u64 {
    30_000
}

fn default_buffer_size() -> usize {
    64 * 1024
}

fn default_progress_interval_ms() -> u64 {
    1_000
}

fn default_member_refresh_ms() -> u64 {
    10_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            max_conn_per_server: default_max_conn_per_server(),
            connect_timeout_ms: default_connect_timeout_ms(),
            io_timeout_ms: default_io_timeout_ms(),
            buffer_size: default_buffer_size(),
            progress_interval_ms: default_progress_interval_ms(),
            skip_dedup_check: false,
            trackers: Vec::new(),
            member_refresh_ms: default_member_refresh_ms(),
        }
    }
}

impl ClientConfig {
    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            secret: self.secret.clone(),
            instance: None,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
        }
    }
}

/// Entry point for applications: one shared pool, one selector, and the three
/// transfer operations wired on top of them.
#[derive(Clone)]
pub struct Client {
    config: ClientConfig,
    pool: Arc<ConnectionPool>,
    upload: UploadFileOperation,
    download: DownloadFileOperation,
    query: QueryFileOperation,
    members: ListMembersOperation,
}

impl Client {
    /// Client over a member list maintained elsewhere.
    pub fn new(config: ClientConfig, registry: DynMemberRegistry) -> Self {
        let pool = new_pool(&config);
        Self::assemble(config, pool, registry)
    }

    /// Client whose storage members are synced from `config.trackers`.
    pub fn with_tracker_members(config: ClientConfig) -> Self {
        let pool = new_pool(&config);
        let registry = TrackerMemberRegistry::new(
            ListMembersOperation::new(Arc::clone(&pool), config.trackers.clone()),
            Duration::from_millis(config.member_refresh_ms),
        );
        Self::assemble(config, pool, Arc::new(registry))
    }

    fn assemble(config: ClientConfig, pool: Arc<ConnectionPool>, registry: DynMemberRegistry) -> Self {
        let selector = StorageSelector::new(registry);
        let query = QueryFileOperation::new(Arc::clone(&pool), config.trackers.clone());
        let members = ListMembersOperation::new(Arc::clone(&pool), config.trackers.clone());
        let upload = UploadFileOperation::new(
            selector.clone(),
            Arc::clone(&pool),
            Some(query.clone()),
            Duration::from_millis(config.progress_interval_ms),
        );
        let download = DownloadFileOperation::new(selector, Arc::clone(&pool));

        Self {
            config,
            pool,
            upload,
            download,
            query,
            members,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub async fn upload_file(
        &self,
        local_path: impl Into<PathBuf>,
        group: &str,
    ) -> Result<UploadFileOperationOutcome> {
        self.upload
            .run(UploadFileOperationRequest {
                local_path: local_path.into(),
                group: group.to_string(),
                skip_dedup_check: self.config.skip_dedup_check,
            })
            .await
    }

    pub async fn upload(
        &self,
        request: UploadFileOperationRequest,
    ) -> Result<UploadFileOperationOutcome> {
        self.upload.run(request).await
    }

    pub async fn download_file<S>(
        &self,
        path: &str,
        from_source: bool,
        sink: &mut S,
    ) -> Result<DownloadFileOperationOutcome>
    where
        S: DownloadSink + ?Sized,
    {
        self.download
            .run(
                DownloadFileOperationRequest {
                    path: path.to_string(),
                    start: 0,
                    length: 0,
                    from_source,
                },
                sink,
            )
            .await
    }

    pub async fn download<S>(
        &self,
        request: DownloadFileOperationRequest,
        sink: &mut S,
    ) -> Result<DownloadFileOperationOutcome>
    where
        S: DownloadSink + ?Sized,
    {
        self.download.run(request, sink).await
    }

    pub async fn query_file(&self, path_or_md5: &str) -> Result<QueryFileOperationOutcome> {
        self.query
            .run(QueryFileOperationRequest {
                path_or_md5: path_or_md5.to_string(),
            })
            .await
    }

    pub async fn list_members(&self, group: &str) -> Result<ListMembersOperationOutcome> {
        self.members
            .run(ListMembersOperationRequest {
                group: group.to_string(),
            })
            .await
    }
}

fn new_pool(config: &ClientConfig) -> Arc<ConnectionPool> {
    let buffers = Arc::new(BufferPool::new(config.buffer_size));
    Arc::new(ConnectionPool::new(
        config.max_conn_per_server,
        config.bridge_options(),
        buffers,
    ))
}

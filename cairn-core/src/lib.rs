//! Cairn Core - client transport for a tracker/storage distributed file store
//!
//! - framed request/response protocol over long-lived TCP bridges
//! - per-server bounded connection pool
//! - random storage selection with per-transfer exclusion and failover
//! - content-addressed node side (MD5 paths, reference-counted files)
//! - tracker-fed member lists and file index

pub mod bridge;
pub mod buffer;
pub mod client;
pub mod digest;
pub mod error;
pub mod index;
pub mod member;
pub mod operations;
pub mod path;
pub mod pool;
pub mod progress;
pub mod protocol;
pub mod selector;
pub mod service;
pub mod store;
pub mod tracker;

pub use bridge::{BodyReader, Bridge, BridgeOptions, Response};
pub use buffer::{BufferPool, PooledBuffer};
pub use client::{Client, ClientConfig};
pub use digest::{compute_md5, file_ext, file_md5};
pub use error::{CairnError, Result};
pub use index::{FileIndex, FileReportQueue};
pub use member::{DynMemberRegistry, InMemoryMemberRegistry, MemberRegistry, ServerDescriptor};
pub use operations::{
    DownloadFileOperation, DownloadFileOperationOutcome, DownloadFileOperationRequest,
    DownloadSink, FileSink, ListMembersOperation, ListMembersOperationOutcome,
    ListMembersOperationRequest, QueryFileOperation, QueryFileOperationOutcome,
    QueryFileOperationRequest, UploadFileOperation, UploadFileOperationOutcome,
    UploadFileOperationRequest,
};
pub use path::{StoragePath, content_key, format_storage_path};
pub use pool::{ConnectionPool, PoolStats};
pub use progress::{ProgressReporter, TransferProgress};
pub use protocol::{FileDescriptor, FrameHeader, OpCode, Status};
pub use selector::{ExclusionSet, SelectCriteria, StorageSelector};
pub use service::{NodeRole, NodeService, NodeServiceConfig, register_with_tracker, spawn_heartbeat};
pub use store::{BlobStore, FsBlobStore, PutOutcome};
pub use tracker::TrackerMemberRegistry;

use async_trait::async_trait;
use cairn_core::protocol::{
    DownloadResponse, UploadRequest, UploadResponse, ValidateResponse, decode_meta,
    read_frame_head, read_frame_head_or_eof, write_frame_head,
};
use cairn_core::{
    BlobStore, CairnError, Client, ClientConfig, DownloadFileOperationOutcome,
    DownloadFileOperationRequest, DownloadSink, FsBlobStore, InMemoryMemberRegistry, NodeRole,
    NodeService, NodeServiceConfig, OpCode, PoolStats, QueryFileOperationOutcome,
    ServerDescriptor, Status, UploadFileOperationRequest, compute_md5, spawn_heartbeat,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SECRET: &str = "transfer-secret";

struct TestNode {
    descriptor: ServerDescriptor,
    store: Arc<FsBlobStore>,
    handle: JoinHandle<cairn_core::Result<()>>,
    heartbeat: Option<JoinHandle<()>>,
    _dir: TempDir,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.handle.abort();
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.abort();
        }
    }
}

async fn start_node(uuid: &str, group: &str, instance: &str) -> TestNode {
    start_node_with(uuid, group, instance, NodeRole::Storage, Vec::new()).await
}

/// Start a node. A storage node given `trackers` heartbeats to them every 100ms.
async fn start_node_with(
    uuid: &str,
    group: &str,
    instance: &str,
    role: NodeRole,
    trackers: Vec<ServerDescriptor>,
) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsBlobStore::new(dir.path().to_path_buf(), group, instance).unwrap());
    let dyn_store: Arc<dyn BlobStore> = store.clone();

    let service = NodeService::bind(
        NodeServiceConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            descriptor: ServerDescriptor::new(uuid, "127.0.0.1", 0)
                .with_group(group)
                .with_instance(instance),
            role,
            secret: SECRET.to_string(),
            expiry_interval: Duration::from_secs(60),
        },
        dyn_store,
        Arc::new(InMemoryMemberRegistry::new()),
    )
    .await
    .unwrap();

    let descriptor = service.descriptor().clone();
    let heartbeat = (!trackers.is_empty()).then(|| {
        spawn_heartbeat(
            descriptor.clone(),
            trackers,
            SECRET.to_string(),
            Duration::from_millis(100),
            service.file_reports(),
        )
    });
    let handle = tokio::spawn(service.serve());
    TestNode {
        descriptor,
        store,
        handle,
        heartbeat,
        _dir: dir,
    }
}

/// Answer the Validate handshake that opens every pooled connection.
async fn accept_validate(socket: &mut TcpStream) {
    let (header, _) = read_frame_head(socket).await.unwrap();
    assert_eq!(header.op, OpCode::Validate);
    let response = ValidateResponse {
        result: Status::Ok,
        message: "authentication success".to_string(),
    };
    write_frame_head(socket, OpCode::Validate, Status::Ok, &response, 0)
        .await
        .unwrap();
}

/// A storage peer that takes a single upload per connection and then hangs up,
/// reporting each hang-up.
async fn spawn_one_upload_per_connection(
    uuid: &str,
    group: &str,
) -> (ServerDescriptor, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();
    let stored_group = group.to_string();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            accept_validate(&mut socket).await;

            let (header, meta) = read_frame_head(&mut socket).await.unwrap();
            assert_eq!(header.op, OpCode::Upload);
            let request: UploadRequest = decode_meta(&meta).unwrap();
            let mut body = vec![0u8; header.body_len as usize];
            socket.read_exact(&mut body).await.unwrap();
            assert_eq!(compute_md5(&body), request.md5);

            let response = UploadResponse {
                status: Status::Ok,
                path: format!("{}/solo/S/{}", stored_group, request.md5),
            };
            write_frame_head(&mut socket, OpCode::Upload, Status::Ok, &response, 0)
                .await
                .unwrap();
            drop(socket);
            let _ = closed_tx.send(());
        }
    });
    let descriptor = ServerDescriptor::new(uuid, "127.0.0.1", port)
        .with_group(group)
        .with_instance("solo");
    (descriptor, closed_rx)
}

/// A storage peer that answers every download with `status` and keeps the
/// connection open.
async fn spawn_download_status_peer(
    uuid: &str,
    group: &str,
    instance: &str,
    status: Status,
) -> ServerDescriptor {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                accept_validate(&mut socket).await;
                while let Ok(Some((header, _))) = read_frame_head_or_eof(&mut socket).await {
                    let response = DownloadResponse {
                        status,
                        body_length: 0,
                    };
                    if write_frame_head(&mut socket, header.op, status, &response, 0)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
        }
    });
    ServerDescriptor::new(uuid, "127.0.0.1", port)
        .with_group(group)
        .with_instance(instance)
}

enum FirstAttempt {
    /// Read part of the body, then fail.
    Fail,
    /// Read part of the body, then claim success.
    StopEarly,
}

/// Misbehaves on its first attempt, then collects the whole body.
struct FlakySink {
    first_attempt: FirstAttempt,
    attempts: usize,
    data: Vec<u8>,
}

impl FlakySink {
    fn new(first_attempt: FirstAttempt) -> Self {
        Self {
            first_attempt,
            attempts: 0,
            data: Vec::new(),
        }
    }
}

#[async_trait]
impl DownloadSink for FlakySink {
    async fn write_body(
        &mut self,
        _path: &str,
        _len: u64,
        body: &mut (dyn AsyncRead + Unpin + Send),
    ) -> cairn_core::Result<u64> {
        self.attempts += 1;
        if self.attempts == 1 {
            let mut head = [0u8; 16];
            body.read_exact(&mut head).await?;
            return match self.first_attempt {
                FirstAttempt::Fail => Err(CairnError::Internal("disk full".to_string())),
                FirstAttempt::StopEarly => Ok(head.len() as u64),
            };
        }
        self.data.clear();
        Ok(body.read_to_end(&mut self.data).await? as u64)
    }
}

/// Two storage nodes in `g1` (instances i1 and i2) that both hold `data`.
async fn two_replicas(data: &[u8]) -> (TestNode, TestNode) {
    let first = start_node("first", "g1", "i1").await;
    let second = start_node("second", "g1", "i2").await;
    for node in [&first, &second] {
        node.store
            .put(&mut &data[..], data.len() as u64, "")
            .await
            .unwrap();
    }
    (first, second)
}

/// A descriptor pointing at a port nothing listens on.
async fn dead_member(uuid: &str, group: &str, instance: &str) -> ServerDescriptor {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    ServerDescriptor::new(uuid, "127.0.0.1", port)
        .with_group(group)
        .with_instance(instance)
}

fn client(members: Vec<ServerDescriptor>, trackers: Vec<ServerDescriptor>) -> Client {
    let config = ClientConfig {
        secret: SECRET.to_string(),
        connect_timeout_ms: 1_000,
        io_timeout_ms: 5_000,
        progress_interval_ms: 50,
        trackers,
        ..ClientConfig::default()
    };
    Client::new(config, Arc::new(InMemoryMemberRegistry::with_members(members)))
}

async fn write_local(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    tokio::fs::write(&path, data).await.unwrap();
    path
}

#[tokio::test]
async fn test_upload_then_download() {
    let node = start_node("s1", "g1", "i1").await;
    let client = client(vec![node.descriptor.clone()], vec![]);
    let local = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
    let file = write_local(&local, "photo.jpg", &data).await;

    let uploaded = client.upload_file(&file, "g1").await.unwrap();
    assert_eq!(uploaded.path, format!("g1/i1/S/{}", compute_md5(&data)));
    assert!(!uploaded.deduplicated);
    assert_eq!(uploaded.server_uuid.as_deref(), Some("s1"));
    assert_eq!(uploaded.tried, vec!["s1".to_string()]);

    let mut body = Vec::new();
    let outcome = client
        .download_file(&uploaded.path, true, &mut body)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        DownloadFileOperationOutcome::Downloaded { bytes: 300_000, .. }
    ));
    assert_eq!(body, data);

    // Both exchanges ended cleanly, so one bridge sits idle for reuse.
    let stats = client.pool().stats("s1");
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.idle, 1);
}

#[tokio::test]
async fn test_second_identical_upload_is_deduplicated() {
    let node = start_node("s1", "g1", "i1").await;
    let client = client(vec![node.descriptor.clone()], vec![node.descriptor.clone()]);
    let local = tempfile::tempdir().unwrap();
    let data = b"the same bytes twice".to_vec();
    let first_file = write_local(&local, "a.txt", &data).await;
    let second_file = write_local(&local, "b.txt", &data).await;

    let first = client.upload_file(&first_file, "g1").await.unwrap();
    let second = client.upload_file(&second_file, "g1").await.unwrap();

    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(first.path, second.path);
    assert!(second.tried.is_empty());
    assert_eq!(node.store.reference_count(&first.md5).await.unwrap(), 1);

    let forced = client
        .upload(UploadFileOperationRequest {
            local_path: second_file,
            group: "g1".to_string(),
            skip_dedup_check: true,
        })
        .await
        .unwrap();
    assert!(!forced.deduplicated);
    assert_eq!(forced.path, first.path);
    assert_eq!(node.store.reference_count(&first.md5).await.unwrap(), 2);
}

#[tokio::test]
async fn test_zero_byte_upload() {
    let node = start_node("s1", "g1", "i1").await;
    let client = client(vec![node.descriptor.clone()], vec![]);
    let local = tempfile::tempdir().unwrap();
    let file = write_local(&local, "empty", b"").await;

    let uploaded = client.upload_file(&file, "").await.unwrap();
    assert_eq!(uploaded.path, "g1/i1/S/d41d8cd98f00b204e9800998ecf8427e");

    let mut body = vec![1, 2, 3];
    let outcome = client
        .download_file(&uploaded.path, false, &mut body)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        DownloadFileOperationOutcome::Downloaded { bytes: 0, .. }
    ));
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_upload_fails_over_and_skips_read_only() {
    let writable = start_node("w", "g1", "i2").await;
    let read_only = start_node("ro", "g1", "i3").await;
    let dead = dead_member("dead", "g1", "i1").await;

    let client = client(
        vec![
            dead,
            read_only.descriptor.clone().read_only(true),
            writable.descriptor.clone(),
        ],
        vec![],
    );
    let local = tempfile::tempdir().unwrap();
    let file = write_local(&local, "blob.bin", b"failover payload").await;

    for _ in 0..5 {
        let uploaded = client
            .upload(UploadFileOperationRequest {
                local_path: file.clone(),
                group: "g1".to_string(),
                skip_dedup_check: true,
            })
            .await
            .unwrap();
        assert_eq!(uploaded.server_uuid.as_deref(), Some("w"));
        assert!(!uploaded.tried.contains(&"ro".to_string()));
        assert_eq!(uploaded.tried.last().map(String::as_str), Some("w"));
    }
    assert!(
        read_only
            .store
            .lookup(&compute_md5(b"failover payload"))
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_upload_with_no_candidates() {
    let client = client(
        vec![
            dead_member("d1", "g1", "i1").await,
            dead_member("d2", "g1", "i2").await,
        ],
        vec![],
    );
    let local = tempfile::tempdir().unwrap();
    let file = write_local(&local, "x.bin", b"nowhere to go").await;

    let err = client.upload_file(&file, "g1").await.unwrap_err();
    assert!(matches!(err, CairnError::NoStorageAvailable));
    assert_eq!(client.pool().stats("d1").in_use, 0);
    assert_eq!(client.pool().stats("d2").in_use, 0);
}

#[tokio::test]
async fn test_wrong_secret_excludes_every_candidate() {
    let node = start_node("s1", "g1", "i1").await;
    let config = ClientConfig {
        secret: "not-the-secret".to_string(),
        ..ClientConfig::default()
    };
    let client = Client::new(
        config,
        Arc::new(InMemoryMemberRegistry::with_members(vec![
            node.descriptor.clone(),
        ])),
    );
    let local = tempfile::tempdir().unwrap();
    let file = write_local(&local, "x.bin", b"denied").await;

    let err = client.upload_file(&file, "").await.unwrap_err();
    assert!(matches!(err, CairnError::NoStorageAvailable));
}

#[tokio::test]
async fn test_download_falls_back_from_dead_source() {
    let replica = start_node("replica", "groupA", "inst2").await;
    let data = b"replicated content".to_vec();
    let md5 = compute_md5(&data);
    replica
        .store
        .put(&mut data.as_slice(), data.len() as u64, &md5)
        .await
        .unwrap();

    let source = dead_member("source", "groupA", "inst1").await;
    let other_group = dead_member("elsewhere", "groupB", "inst1").await;
    let client = client(
        vec![source, other_group, replica.descriptor.clone()],
        vec![],
    );

    let mut body = Vec::new();
    let outcome = client
        .download_file(&format!("/groupA/inst1/S/{}", md5), true, &mut body)
        .await
        .unwrap();

    match outcome {
        DownloadFileOperationOutcome::Downloaded {
            server_uuid, tried, ..
        } => {
            assert_eq!(server_uuid, "replica");
            assert_eq!(tried, vec!["source".to_string(), "replica".to_string()]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(body, data);
}

#[tokio::test]
async fn test_download_not_found_is_not_retried() {
    let first = start_node("n1", "g1", "i1").await;
    let second = start_node("n2", "g1", "i2").await;
    let client = client(
        vec![first.descriptor.clone(), second.descriptor.clone()],
        vec![],
    );

    let mut body = Vec::new();
    let outcome = client
        .download_file(
            "/g1/i1/S/0123456789abcdef0123456789abcdef",
            true,
            &mut body,
        )
        .await
        .unwrap();

    match outcome {
        DownloadFileOperationOutcome::NotFound { server_uuid, tried } => {
            assert_eq!(server_uuid, "n1");
            assert_eq!(tried, vec!["n1".to_string()]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(client.pool().stats("n1").idle, 1);
}

#[tokio::test]
async fn test_ranged_download() {
    let node = start_node("s1", "g1", "i1").await;
    let data = b"0123456789".to_vec();
    let md5 = compute_md5(&data);
    node.store
        .put(&mut data.as_slice(), data.len() as u64, "")
        .await
        .unwrap();

    let client = client(vec![node.descriptor.clone()], vec![]);
    let mut body = Vec::new();
    client
        .download(
            DownloadFileOperationRequest {
                path: format!("g1/i1/S/{}", md5),
                start: 2,
                length: 3,
                from_source: false,
            },
            &mut body,
        )
        .await
        .unwrap();
    assert_eq!(body, b"234");

    client
        .download(
            DownloadFileOperationRequest {
                path: format!("g1/i1/S/{}", md5),
                start: 7,
                length: 0,
                from_source: false,
            },
            &mut body,
        )
        .await
        .unwrap();
    assert_eq!(body, b"789");
}

#[tokio::test]
async fn test_download_to_file_sink() {
    let node = start_node("s1", "g1", "i1").await;
    let data = b"file sink payload".to_vec();
    let md5 = compute_md5(&data);
    node.store
        .put(&mut data.as_slice(), data.len() as u64, "")
        .await
        .unwrap();

    let client = client(vec![node.descriptor.clone()], vec![]);
    let out = tempfile::tempdir().unwrap();
    let target = out.path().join("restored.bin");
    tokio::fs::write(&target, b"stale content that is longer than the payload")
        .await
        .unwrap();

    let mut sink = cairn_core::FileSink::new(&target);
    client
        .download_file(&format!("/g1/i1/S/{}", md5), false, &mut sink)
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&target).await.unwrap(), data);
}

#[tokio::test]
async fn test_malformed_path_fails_without_network() {
    let client = client(vec![], vec![]);
    let mut body = Vec::new();

    let err = client
        .download_file("groupA/inst1/X/abc", true, &mut body)
        .await
        .unwrap_err();
    assert!(matches!(err, CairnError::InvalidPath(_)));
}

#[tokio::test]
async fn test_query_fails_over_to_next_tracker() {
    let tracker = start_node("t2", "g1", "i1").await;
    let data = b"indexed".to_vec();
    let md5 = compute_md5(&data);
    tracker
        .store
        .put(&mut data.as_slice(), data.len() as u64, "")
        .await
        .unwrap();

    let dead = dead_member("t1", "", "").await;
    let client = client(vec![], vec![dead.clone(), tracker.descriptor.clone()]);

    match client.query_file(&md5).await.unwrap() {
        QueryFileOperationOutcome::Found { file, tracker_uuid } => {
            assert_eq!(tracker_uuid, "t2");
            assert_eq!(file.md5, md5);
            assert_eq!(file.file_size, data.len() as u64);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    assert_eq!(
        client
            .query_file("ffffffffffffffffffffffffffffffff")
            .await
            .unwrap(),
        QueryFileOperationOutcome::NotFound
    );

    let only_dead = client_with_trackers(vec![dead]);
    let err = only_dead.query_file(&md5).await.unwrap_err();
    assert!(matches!(err, CairnError::NoTrackerAvailable));
}

fn client_with_trackers(trackers: Vec<ServerDescriptor>) -> Client {
    client(vec![], trackers)
}

#[tokio::test]
async fn test_upload_reconnects_after_peer_closed_idle_bridge() {
    let (peer, mut closed) = spawn_one_upload_per_connection("solo", "g1").await;
    let client = client(vec![peer], vec![]);
    let local = tempfile::tempdir().unwrap();
    let first_file = write_local(&local, "a.bin", b"first payload").await;
    let second_file = write_local(&local, "b.bin", b"second payload").await;

    client.upload_file(&first_file, "g1").await.unwrap();
    assert_eq!(client.pool().stats("solo"), PoolStats { in_use: 0, idle: 1 });
    closed.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = client.upload_file(&second_file, "g1").await.unwrap();
    assert_eq!(second.server_uuid.as_deref(), Some("solo"));
    assert_eq!(second.tried, vec!["solo".to_string()]);
    assert_eq!(
        second.path,
        format!("g1/solo/S/{}", compute_md5(b"second payload"))
    );
}

#[tokio::test]
async fn test_unreadable_local_file_is_source_error() {
    let node = start_node("s1", "g1", "i1").await;
    let client = client(vec![node.descriptor.clone()], vec![]);
    let local = tempfile::tempdir().unwrap();

    // A directory opens fine on Linux but cannot be read as a file.
    let err = client.upload_file(local.path(), "g1").await.unwrap_err();
    assert!(matches!(err, CairnError::Source(_)), "got {:?}", err);
    assert_eq!(client.pool().stats("s1"), PoolStats::default());
}

#[tokio::test]
async fn test_download_error_status_destroys_bridge_and_retries() {
    let data: Vec<u8> = (0..50_000u32).map(|i| (i % 199) as u8).collect();
    let md5 = compute_md5(&data);
    let good = start_node("good", "g1", "i1").await;
    good.store
        .put(&mut data.as_slice(), data.len() as u64, "")
        .await
        .unwrap();
    let bad = spawn_download_status_peer("bad", "g1", "ibad", Status::InternalError).await;

    let client = client(vec![bad, good.descriptor.clone()], vec![]);
    let mut body = Vec::new();
    let outcome = client
        .download_file(&format!("/g1/ibad/S/{}", md5), true, &mut body)
        .await
        .unwrap();

    match outcome {
        DownloadFileOperationOutcome::Downloaded {
            server_uuid, tried, ..
        } => {
            assert_eq!(server_uuid, "good");
            assert_eq!(tried, vec!["bad".to_string(), "good".to_string()]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(body, data);
    assert_eq!(client.pool().stats("bad"), PoolStats::default());
    assert_eq!(client.pool().stats("good"), PoolStats { in_use: 0, idle: 1 });
}

#[tokio::test]
async fn test_sink_failure_keeps_drained_bridge_and_retries() {
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 211) as u8).collect();
    let md5 = compute_md5(&data);
    let (first, second) = two_replicas(&data).await;
    let client = client(
        vec![first.descriptor.clone(), second.descriptor.clone()],
        vec![],
    );

    let mut sink = FlakySink::new(FirstAttempt::Fail);
    let outcome = client
        .download_file(&format!("/g1/i1/S/{}", md5), true, &mut sink)
        .await
        .unwrap();

    match outcome {
        DownloadFileOperationOutcome::Downloaded { tried, bytes, .. } => {
            assert_eq!(tried, vec!["first".to_string(), "second".to_string()]);
            assert_eq!(bytes, data.len() as u64);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(sink.attempts, 2);
    assert_eq!(sink.data, data);
    // The rest of the body was drained, so the first bridge stayed usable.
    assert_eq!(client.pool().stats("first"), PoolStats { in_use: 0, idle: 1 });
}

#[tokio::test]
async fn test_short_read_sink_destroys_bridge_and_retries() {
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 223) as u8).collect();
    let md5 = compute_md5(&data);
    let (first, second) = two_replicas(&data).await;
    let client = client(
        vec![first.descriptor.clone(), second.descriptor.clone()],
        vec![],
    );

    let mut sink = FlakySink::new(FirstAttempt::StopEarly);
    let outcome = client
        .download_file(&format!("/g1/i1/S/{}", md5), true, &mut sink)
        .await
        .unwrap();

    match outcome {
        DownloadFileOperationOutcome::Downloaded {
            server_uuid, tried, ..
        } => {
            assert_eq!(server_uuid, "second");
            assert_eq!(tried, vec!["first".to_string(), "second".to_string()]);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(sink.data, data);
    assert_eq!(client.pool().stats("first"), PoolStats::default());
}

#[tokio::test]
async fn test_split_tracker_syncs_members_and_dedups() {
    let tracker = start_node_with("tracker", "t", "t0", NodeRole::Tracker, Vec::new()).await;
    let storage = start_node_with(
        "s1",
        "g1",
        "i1",
        NodeRole::Storage,
        vec![tracker.descriptor.clone()],
    )
    .await;

    let client = Client::with_tracker_members(ClientConfig {
        secret: SECRET.to_string(),
        connect_timeout_ms: 1_000,
        io_timeout_ms: 5_000,
        progress_interval_ms: 50,
        member_refresh_ms: 50,
        trackers: vec![tracker.descriptor.clone()],
        ..ClientConfig::default()
    });

    let mut synced = Vec::new();
    for _ in 0..100 {
        synced = client.list_members("g1").await.unwrap().members;
        if !synced.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(synced.len(), 1);
    assert_eq!(synced[0].uuid, "s1");
    assert!(client.list_members("other").await.unwrap().members.is_empty());

    let local = tempfile::tempdir().unwrap();
    let data = b"reported through the tracker".to_vec();
    let first_file = write_local(&local, "a.txt", &data).await;
    let second_file = write_local(&local, "b.txt", &data).await;

    let first = client.upload_file(&first_file, "g1").await.unwrap();
    assert!(!first.deduplicated);
    assert_eq!(first.server_uuid.as_deref(), Some("s1"));

    let mut indexed = None;
    for _ in 0..100 {
        if let Ok(QueryFileOperationOutcome::Found { file, tracker_uuid }) =
            client.query_file(&first.md5).await
        {
            assert_eq!(tracker_uuid, "tracker");
            indexed = Some(file);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let indexed = indexed.expect("tracker never learned about the upload");
    assert_eq!(indexed.instance, "i1");
    assert!(tracker.store.lookup(&first.md5).await.unwrap().is_none());

    let second = client.upload_file(&second_file, "g1").await.unwrap();
    assert!(second.deduplicated);
    assert_eq!(second.path, first.path);
    assert_eq!(storage.store.reference_count(&first.md5).await.unwrap(), 1);
}

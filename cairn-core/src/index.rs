//! What trackers know about stored content.
//!
//! Storage nodes queue a [`FileDescriptor`] for every file they accept and ship
//! the queue to their trackers on each heartbeat. Trackers fold the reports into
//! a [`FileIndex`], which is what their QueryFile answers come from.

use crate::path::content_key;
use crate::protocol::FileDescriptor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct FileIndex {
    files: RwLock<HashMap<String, FileDescriptor>>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record reported files. A content hash already known keeps its first
    /// location. Returns how many hashes were new.
    pub async fn record(&self, files: Vec<FileDescriptor>) -> usize {
        let mut known = self.files.write().await;
        let mut added = 0;
        for file in files {
            if let Some(md5) = content_key(&file.md5) {
                known.entry(md5).or_insert_with(|| {
                    added += 1;
                    file
                });
            }
        }
        if added > 0 {
            tracing::debug!("indexed {} new files, {} known", added, known.len());
        }
        added
    }

    pub async fn lookup(&self, path_or_md5: &str) -> Option<FileDescriptor> {
        let md5 = content_key(path_or_md5)?;
        self.files.read().await.get(&md5).cloned()
    }

    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}

/// Files a storage node has accepted but not yet reported to every tracker.
#[derive(Debug, Clone, Default)]
pub struct FileReportQueue {
    pending: Arc<Mutex<Vec<FileDescriptor>>>,
}

impl FileReportQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, file: FileDescriptor) {
        self.lock().push(file);
    }

    pub fn extend(&self, files: impl IntoIterator<Item = FileDescriptor>) {
        self.lock().extend(files);
    }

    pub fn take(&self) -> Vec<FileDescriptor> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<FileDescriptor>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Content-addressed file storage on the serving side of the protocol.
//!
//! Files live at `{base}/data/{md5[..2]}/{md5}`. Each file is followed by a 4 byte
//! big-endian reference count trailer: storing identical content again bumps the
//! count instead of writing a second copy.

use crate::path::content_key;
use crate::protocol::FileDescriptor;
use crate::{CairnError, Result};
use async_trait::async_trait;
use md5::{Digest, Md5};
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use ulid::Ulid;

const TRAILER_LEN: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub file: FileDescriptor,
    /// True when the content was already present and only its reference count moved.
    pub reused: bool,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Consume exactly `len` bytes from `body` and store them. `declared_md5`, when
    /// non-empty, must match the received content.
    async fn put(
        &self,
        body: &mut (dyn AsyncRead + Unpin + Send),
        len: u64,
        declared_md5: &str,
    ) -> Result<PutOutcome>;

    /// Open stored content for reading. Returns the file positioned at the first
    /// content byte plus the content length (trailer excluded).
    async fn open(&self, md5: &str) -> Result<Option<(fs::File, u64)>>;

    /// Resolve a storage path or a bare content hash.
    async fn lookup(&self, path_or_md5: &str) -> Result<Option<FileDescriptor>>;

    /// Move the reference count by `delta`, returning the new count.
    async fn adjust_reference_count(&self, md5: &str, delta: i64) -> Result<u32>;

    /// Every stored file, in no particular order.
    async fn list(&self) -> Result<Vec<FileDescriptor>>;
}

pub struct FsBlobStore {
    base_path: PathBuf,
    group: String,
    instance: String,
    /// Held from "is this content already stored" until the rename or trailer
    /// update that follows, so identical content is only ever written once.
    index_lock: Mutex<()>,
}

impl FsBlobStore {
    pub fn new(
        base_path: PathBuf,
        group: impl Into<String>,
        instance: impl Into<String>,
    ) -> Result<Self> {
        std::fs::create_dir_all(base_path.join("data"))?;
        std::fs::create_dir_all(base_path.join("tmp"))?;
        Ok(Self {
            base_path,
            group: group.into(),
            instance: instance.into(),
            index_lock: Mutex::new(()),
        })
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn file_path(&self, md5: &str) -> PathBuf {
        let prefix = &md5[..2.min(md5.len())];
        self.base_path.join("data").join(prefix).join(md5)
    }

    fn descriptor(&self, md5: &str, file_size: u64) -> FileDescriptor {
        FileDescriptor {
            group: self.group.clone(),
            instance: self.instance.clone(),
            md5: md5.to_string(),
            part_num: 1,
            file_size,
        }
    }

    async fn content_len(&self, md5: &str) -> Result<Option<u64>> {
        match fs::metadata(self.file_path(md5)).await {
            Ok(meta) => Ok(Some(meta.len().saturating_sub(TRAILER_LEN))),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Caller must hold `index_lock`.
    async fn bump_reference_count(&self, md5: &str, delta: i64) -> Result<u32> {
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.file_path(md5))
            .await
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::NotFound => CairnError::NotFound(md5.to_string()),
                _ => CairnError::Io(error),
            })?;

        file.seek(SeekFrom::End(-(TRAILER_LEN as i64))).await?;
        let current = file.read_u32().await?;
        let updated = (i64::from(current) + delta).clamp(0, i64::from(u32::MAX)) as u32;

        file.seek(SeekFrom::End(-(TRAILER_LEN as i64))).await?;
        file.write_u32(updated).await?;
        file.sync_all().await?;

        tracing::debug!("file referenced count: {} -> {} ({})", current, updated, md5);
        Ok(updated)
    }

    pub async fn reference_count(&self, md5: &str) -> Result<u32> {
        let mut file = fs::File::open(self.file_path(md5)).await?;
        file.seek(SeekFrom::End(-(TRAILER_LEN as i64))).await?;
        Ok(file.read_u32().await?)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(
        &self,
        body: &mut (dyn AsyncRead + Unpin + Send),
        len: u64,
        declared_md5: &str,
    ) -> Result<PutOutcome> {
        let temp_path = self
            .base_path
            .join("tmp")
            .join(format!("{}.tmp", Ulid::new()));
        let mut file = fs::File::create(&temp_path).await?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut remaining = len;

        let received = async {
            while remaining > 0 {
                let want = usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len());
                let read = body.read(&mut buf[..want]).await?;
                if read == 0 {
                    return Err(CairnError::Protocol(format!(
                        "upload body ended {} bytes short",
                        remaining
                    )));
                }
                hasher.update(&buf[..read]);
                file.write_all(&buf[..read]).await?;
                remaining -= read as u64;
            }
            Ok(())
        }
        .await;

        if let Err(error) = received {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(error);
        }

        let md5 = hex::encode(hasher.finalize());
        if !declared_md5.is_empty() && !declared_md5.eq_ignore_ascii_case(&md5) {
            drop(file);
            let _ = fs::remove_file(&temp_path).await;
            return Err(CairnError::HashMismatch {
                expected: declared_md5.to_string(),
                actual: md5,
            });
        }

        file.write_u32(1).await?;
        file.sync_all().await?;
        drop(file);

        let final_path = self.file_path(&md5);
        let _guard = self.index_lock.lock().await;
        if fs::try_exists(&final_path).await? {
            fs::remove_file(&temp_path).await?;
            let count = self.bump_reference_count(&md5, 1).await?;
            tracing::debug!("content {} already stored, reference count now {}", md5, count);
            return Ok(PutOutcome {
                file: self.descriptor(&md5, len),
                reused: true,
            });
        }

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&temp_path, &final_path).await?;

        tracing::debug!("stored content {} ({} bytes)", md5, len);
        Ok(PutOutcome {
            file: self.descriptor(&md5, len),
            reused: false,
        })
    }

    async fn open(&self, md5: &str) -> Result<Option<(fs::File, u64)>> {
        let Some(content_len) = self.content_len(md5).await? else {
            return Ok(None);
        };
        let file = fs::File::open(self.file_path(md5)).await?;
        Ok(Some((file, content_len)))
    }

    async fn lookup(&self, path_or_md5: &str) -> Result<Option<FileDescriptor>> {
        let Some(md5) = content_key(path_or_md5) else {
            return Ok(None);
        };

        Ok(self
            .content_len(&md5)
            .await?
            .map(|len| self.descriptor(&md5, len)))
    }

    async fn adjust_reference_count(&self, md5: &str, delta: i64) -> Result<u32> {
        let _guard = self.index_lock.lock().await;
        self.bump_reference_count(md5, delta).await
    }

    async fn list(&self) -> Result<Vec<FileDescriptor>> {
        let mut files = Vec::new();
        let mut prefixes = fs::read_dir(self.base_path.join("data")).await?;
        while let Some(prefix) = prefixes.next_entry().await? {
            if !prefix.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(prefix.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let Some(md5) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let len = entry.metadata().await?.len().saturating_sub(TRAILER_LEN);
                files.push(self.descriptor(&md5, len));
            }
        }
        Ok(files)
    }
}

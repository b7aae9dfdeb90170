//! Frame codec for the bridge protocol.
//!
//! Every exchange is one request frame followed by one response frame:
//!
//! ```text
//! +--------+--------+----------+----------+----------------+------------------+
//! | op u16 | st u16 | meta u32 | body u64 | meta (json)    | body (raw bytes) |
//! +--------+--------+----------+----------+----------------+------------------+
//! ```
//!
//! The codec only ever touches the header and the metadata block. Body bytes are
//! streamed by the caller straight from/to the connection.

use crate::member::ServerDescriptor;
use crate::path::format_storage_path;
use crate::{CairnError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest metadata block accepted from a peer.
pub const MAX_META_LEN: u32 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Validate,
    Upload,
    Download,
    QueryFile,
    /// Tracker only: live storage members, optionally of one group.
    ListMembers,
    /// Storage to tracker: files the storage node now holds.
    ReportFiles,
}

impl OpCode {
    pub fn as_u16(self) -> u16 {
        match self {
            OpCode::Validate => 1,
            OpCode::Upload => 2,
            OpCode::Download => 3,
            OpCode::QueryFile => 4,
            OpCode::ListMembers => 5,
            OpCode::ReportFiles => 6,
        }
    }

    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            1 => Ok(OpCode::Validate),
            2 => Ok(OpCode::Upload),
            3 => Ok(OpCode::Download),
            4 => Ok(OpCode::QueryFile),
            5 => Ok(OpCode::ListMembers),
            6 => Ok(OpCode::ReportFiles),
            other => Err(CairnError::Protocol(format!("unknown operation code {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    NotFound,
    Unauthorized,
    InternalError,
    BadRequest,
}

impl Status {
    pub fn as_u16(self) -> u16 {
        match self {
            Status::Ok => 0,
            Status::NotFound => 1,
            Status::Unauthorized => 2,
            Status::InternalError => 3,
            Status::BadRequest => 4,
        }
    }

    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0 => Ok(Status::Ok),
            1 => Ok(Status::NotFound),
            2 => Ok(Status::Unauthorized),
            3 => Ok(Status::InternalError),
            4 => Ok(Status::BadRequest),
            other => Err(CairnError::Protocol(format!("unknown status code {}", other))),
        }
    }
}

/// Fixed 16 byte frame header, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub op: OpCode,
    /// Always [`Status::Ok`] on requests.
    pub status: Status,
    pub meta_len: u32,
    pub body_len: u64,
}

impl FrameHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.op.as_u16());
        buf.put_u16(self.status.as_u16());
        buf.put_u32(self.meta_len);
        buf.put_u64(self.body_len);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(CairnError::Protocol("incomplete frame header".to_string()));
        }

        let op = OpCode::from_u16(buf.get_u16())?;
        let status = Status::from_u16(buf.get_u16())?;
        let meta_len = buf.get_u32();
        let body_len = buf.get_u64();

        if meta_len > MAX_META_LEN {
            return Err(CairnError::Protocol(format!(
                "metadata length {} exceeds limit {}",
                meta_len, MAX_META_LEN
            )));
        }

        Ok(Self {
            op,
            status,
            meta_len,
            body_len,
        })
    }
}

/// Encode a header plus its JSON metadata block into one buffer.
pub fn encode_frame<M: Serialize>(
    op: OpCode,
    status: Status,
    meta: &M,
    body_len: u64,
) -> Result<BytesMut> {
    let meta_bytes = serde_json::to_vec(meta)?;
    let meta_len = u32::try_from(meta_bytes.len())
        .ok()
        .filter(|len| *len <= MAX_META_LEN)
        .ok_or_else(|| {
            CairnError::Protocol(format!("metadata too large: {} bytes", meta_bytes.len()))
        })?;

    let header = FrameHeader {
        op,
        status,
        meta_len,
        body_len,
    };

    let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + meta_bytes.len());
    header.encode(&mut buf);
    buf.put_slice(&meta_bytes);
    Ok(buf)
}

/// Write a frame head. The caller is responsible for the body that follows.
pub async fn write_frame_head<W, M>(
    writer: &mut W,
    op: OpCode,
    status: Status,
    meta: &M,
    body_len: u64,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let frame = encode_frame(op, status, meta, body_len)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read a frame head: the header and the raw metadata block. The reader is left
/// positioned at the first body byte.
pub async fn read_frame_head<R>(reader: &mut R) -> Result<(FrameHeader, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut raw).await.map_err(truncated)?;
    let header = FrameHeader::decode(&mut &raw[..])?;

    let mut meta = vec![0u8; header.meta_len as usize];
    reader.read_exact(&mut meta).await.map_err(truncated)?;
    Ok((header, meta))
}

/// Read the head of a frame only if the peer has not closed the connection.
pub async fn read_frame_head_or_eof<R>(reader: &mut R) -> Result<Option<(FrameHeader, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; FrameHeader::SIZE];
    let first = reader.read(&mut raw).await?;
    if first == 0 {
        return Ok(None);
    }
    reader
        .read_exact(&mut raw[first..])
        .await
        .map_err(truncated)?;
    let header = FrameHeader::decode(&mut &raw[..])?;

    let mut meta = vec![0u8; header.meta_len as usize];
    reader.read_exact(&mut meta).await.map_err(truncated)?;
    Ok(Some((header, meta)))
}

pub fn decode_meta<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw)
        .map_err(|error| CairnError::Protocol(format!("malformed metadata: {}", error)))
}

fn truncated(error: std::io::Error) -> CairnError {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        CairnError::Protocol("truncated frame".to_string())
    } else {
        CairnError::Io(error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub secret: String,
    /// Serialized [`crate::ServerDescriptor`] of the connecting node, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub result: Status,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub file_size: u64,
    pub file_ext: String,
    #[serde(default)]
    pub md5: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub status: Status,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub path: String,
    pub start: u64,
    /// Zero means "until the end of the file".
    pub length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub status: Status,
    pub body_length: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFileRequest {
    pub path_or_md5: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFileResponse {
    pub status: Status,
    #[serde(default)]
    pub file: Option<FileDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMembersRequest {
    /// Empty lists every group.
    #[serde(default)]
    pub group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMembersResponse {
    pub status: Status,
    #[serde(default)]
    pub members: Vec<ServerDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFilesRequest {
    pub files: Vec<FileDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFilesResponse {
    pub status: Status,
    #[serde(default)]
    pub accepted: u64,
}

/// What a tracker knows about one stored file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    pub group: String,
    pub instance: String,
    pub md5: String,
    pub part_num: u32,
    pub file_size: u64,
}

impl FileDescriptor {
    pub fn storage_path(&self) -> String {
        format_storage_path(&self.group, &self.instance, self.part_num > 1, &self.md5)
    }
}

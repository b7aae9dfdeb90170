mod download_file;
mod list_members;
mod query_file;
mod upload_file;

pub use download_file::{
    DownloadFileOperation, DownloadFileOperationOutcome, DownloadFileOperationRequest,
    DownloadSink, FileSink,
};
pub use list_members::{
    ListMembersOperation, ListMembersOperationOutcome, ListMembersOperationRequest,
};
pub use query_file::{QueryFileOperation, QueryFileOperationOutcome, QueryFileOperationRequest};
pub use upload_file::{UploadFileOperation, UploadFileOperationOutcome, UploadFileOperationRequest};

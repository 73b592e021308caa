//! Attachment sources
//!
//! An attachment is a potentially large binary stream that travels with an
//! operation. Only the count is sent up front; the bytes are pulled by the
//! peer on demand.

use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;

/// Something that can be opened as a fresh input stream
pub trait AttachmentSource: Send + Sync + fmt::Debug {
    /// Open a new reader positioned at the start of the attachment
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Total length in bytes, when known without reading
    fn len_hint(&self) -> Option<u64> {
        None
    }
}

/// Ordered attachment list of an envelope or response
pub type Attachments = Vec<Arc<dyn AttachmentSource>>;

/// In-memory attachment
#[derive(Clone)]
pub struct BytesAttachment {
    data: Arc<[u8]>,
}

impl BytesAttachment {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: Arc::from(data.into()),
        }
    }
}

impl fmt::Debug for BytesAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BytesAttachment")
            .field("len", &self.data.len())
            .finish()
    }
}

impl AttachmentSource for BytesAttachment {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }

    fn len_hint(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

/// Attachment backed by a file on local disk
#[derive(Debug, Clone)]
pub struct FileAttachment {
    path: PathBuf,
}

impl FileAttachment {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AttachmentSource for FileAttachment {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn len_hint(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|m| m.len())
    }
}

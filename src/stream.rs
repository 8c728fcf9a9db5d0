//! Open file handles over a store that only moves whole objects.
//!
//! A handle downloads the object into a scratch buffer when it is opened
//! (unless it starts empty), serves `Read`/`Write`/`Seek` from that buffer,
//! and uploads the buffer once when it is closed.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::{debug, error, warn};
use crate::error::{FsError, Result};
use crate::path::Location;
use crate::storage::{RawEntry, RemoteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Start empty; the object is created or replaced on close.
    Create,
    /// Same buffer behaviour as `Create`, for callers that mean to overwrite.
    Truncate,
    /// Start from the current object, or empty if there is none.
    Append,
    /// Like `Create`, but fail if the object already exists.
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Download the object, allow changes, upload on close.
    ReadWrite,
    Write(WriteMode),
}

impl OpenMode {
    pub fn is_writing(&self) -> bool {
        !matches!(self, OpenMode::Read)
    }

    pub fn is_appending(&self) -> bool {
        matches!(self, OpenMode::Write(WriteMode::Append))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    Populated,
    Closed,
}

pub struct RemoteFile {
    store: Arc<dyn RemoteStore>,
    library_id: String,
    path: String,
    virtual_path: String,
    mode: OpenMode,
    state: HandleState,
    buffer: Option<Cursor<Vec<u8>>>,
}

impl std::fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFile")
            .field("library_id", &self.library_id)
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("len", &self.len())
            .finish()
    }
}

impl RemoteFile {
    /// Opens `location` with at most one store call.
    pub async fn open(
        store: Arc<dyn RemoteStore>,
        location: &Location,
        virtual_path: &str,
        mode: OpenMode,
    ) -> Result<Self> {
        let (library, path) = match location {
            Location::InLibrary { library, path } => (library, path),
            Location::Root | Location::LibraryRoot(_) => {
                return Err(FsError::FileExpected(virtual_path.to_string()));
            }
        };

        let mut file = Self {
            store,
            library_id: library.id.clone(),
            path: path.clone(),
            virtual_path: virtual_path.to_string(),
            mode,
            state: HandleState::Created,
            buffer: None,
        };

        match mode {
            OpenMode::Write(WriteMode::Create) | OpenMode::Write(WriteMode::Truncate) => {
                match file.lookup().await? {
                    Some(entry) if !entry.is_file() => {
                        return Err(FsError::FileExpected(file.virtual_path.clone()));
                    }
                    _ => file.populate(Vec::new()),
                }
            }
            OpenMode::Write(WriteMode::Exclusive) => {
                match file.lookup().await? {
                    Some(entry) if entry.is_file() => {
                        return Err(FsError::AlreadyExists(file.virtual_path.clone()));
                    }
                    Some(_) => return Err(FsError::FileExpected(file.virtual_path.clone())),
                    None => file.populate(Vec::new()),
                }
            }
            OpenMode::Write(WriteMode::Append) => {
                match file.store.download_object(&file.library_id, &file.path).await {
                    Ok(data) => file.populate(data),
                    Err(FsError::NotFound(_)) => {
                        debug!("open: {} does not exist yet, appending to empty buffer", file.virtual_path);
                        file.populate(Vec::new());
                    }
                    Err(e) => return Err(e),
                }
                file.seek(SeekFrom::End(0))?;
            }
            OpenMode::Read | OpenMode::ReadWrite => {
                let data = file.store.download_object(&file.library_id, &file.path).await?;
                file.populate(data);
            }
        }

        debug!("open: {} mode={:?} len={}", file.virtual_path, file.mode, file.len());
        Ok(file)
    }

    /// Finds the target in its parent's listing. A missing parent, or a
    /// parent that is a file, fails here instead of at upload time.
    async fn lookup(&self) -> Result<Option<RawEntry>> {
        let (parent, name) = self.path.rsplit_once('/').unwrap_or(("", self.path.as_str()));
        let entries = self.store.list_directory(&self.library_id, parent).await?;
        Ok(entries.into_iter().find(|entry| entry.name == name))
    }

    fn populate(&mut self, data: Vec<u8>) {
        self.buffer = Some(Cursor::new(data));
        self.state = HandleState::Populated;
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn library_id(&self) -> &str {
        &self.library_id
    }

    /// Path inside the library.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn virtual_path(&self) -> &str {
        &self.virtual_path
    }

    /// Bytes currently held by the handle. Nobody else sees them before
    /// [`close`](Self::close).
    pub fn len(&self) -> u64 {
        self.buffer
            .as_ref()
            .map(|cursor| cursor.get_ref().len() as u64)
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn position(&self) -> u64 {
        self.buffer.as_ref().map(|cursor| cursor.position()).unwrap_or(0)
    }

    /// Uploads the buffer if the handle was opened for writing, then frees
    /// it. The buffer is released even when the upload fails. Closing a
    /// closed handle does nothing.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == HandleState::Closed {
            return Ok(());
        }
        let buffer = self.buffer.take();
        self.state = HandleState::Closed;

        let Some(cursor) = buffer else {
            return Ok(());
        };
        if !self.mode.is_writing() {
            debug!("close: {} opened for reading, nothing to upload", self.virtual_path);
            return Ok(());
        }

        let data = cursor.into_inner();
        debug!("close: uploading {} bytes to {}", data.len(), self.virtual_path);
        let result = self.store.upload_object(&self.library_id, &self.path, &data).await;
        drop(data);

        if let Err(e) = &result {
            error!("close: upload of {} failed: {}", self.virtual_path, e);
        }
        result
    }

    fn buffer_mut(&mut self) -> io::Result<&mut Cursor<Vec<u8>>> {
        match (self.state, self.buffer.as_mut()) {
            (HandleState::Populated, Some(cursor)) => Ok(cursor),
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not open", self.virtual_path),
            )),
        }
    }
}

impl Read for RemoteFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.buffer_mut()?.read(buf)
    }
}

impl Write for RemoteFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.mode.is_writing() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is not open for writing", self.virtual_path),
            ));
        }
        let append = self.mode.is_appending();
        let cursor = self.buffer_mut()?;
        if append {
            cursor.seek(SeekFrom::End(0))?;
        }
        cursor.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.buffer_mut().map(|_| ())
    }
}

impl Seek for RemoteFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.buffer_mut()?.seek(pos)
    }
}

impl Drop for RemoteFile {
    fn drop(&mut self) {
        if self.state == HandleState::Populated && self.mode.is_writing() {
            warn!(
                "{} dropped without close, {} buffered bytes discarded",
                self.virtual_path,
                self.len()
            );
        }
    }
}

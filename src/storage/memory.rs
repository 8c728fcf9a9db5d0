//! In-process [`RemoteStore`] keeping every library as a flat map of paths.
//!
//! Every call is recorded so callers can check how many round trips an
//! operation cost.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use crate::error::{FsError, Result};
use super::{Library, RawEntry, RemoteStore, ENTRY_TYPE_DIR, ENTRY_TYPE_FILE};

/// One recorded call against a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    ListLibraries,
    GetLibraryInfo { library_id: String },
    ListDirectory { library_id: String, path: String },
    CreateDirectory { library_id: String, path: String },
    DeleteFile { library_id: String, path: String },
    DeleteDirectory { library_id: String, path: String },
    GetFileInfo { library_id: String, path: String },
    DownloadObject { library_id: String, path: String },
    UploadObject { library_id: String, path: String, data: Vec<u8> },
}

impl StoreCall {
    pub fn is_download(&self) -> bool {
        matches!(self, StoreCall::DownloadObject { .. })
    }

    pub fn is_upload(&self) -> bool {
        matches!(self, StoreCall::UploadObject { .. })
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir { mtime: DateTime<Utc> },
    File { id: String, data: Vec<u8>, mtime: DateTime<Utc> },
}

#[derive(Debug)]
struct LibraryState {
    library: Library,
    nodes: BTreeMap<String, Node>,
}

impl LibraryState {
    fn is_dir(&self, path: &str) -> bool {
        path.is_empty() || matches!(self.nodes.get(path), Some(Node::Dir { .. }))
    }

    fn entry(&self, path: &str) -> Option<RawEntry> {
        let name = file_name(path).to_string();
        match self.nodes.get(path)? {
            Node::Dir { mtime } => Some(RawEntry {
                id: None,
                name,
                kind: ENTRY_TYPE_DIR.to_string(),
                size: 0,
                mtime: Some(*mtime),
            }),
            Node::File { id, data, mtime } => Some(RawEntry {
                id: Some(id.clone()),
                name,
                kind: ENTRY_TYPE_FILE.to_string(),
                size: data.len() as u64,
                mtime: Some(*mtime),
            }),
        }
    }

    fn touch(&mut self) {
        self.library.size = self
            .nodes
            .values()
            .map(|node| match node {
                Node::File { data, .. } => data.len() as u64,
                Node::Dir { .. } => 0,
            })
            .sum();
        self.library.mtime = Some(Utc::now());
    }
}

#[derive(Debug, Default)]
struct Inner {
    libraries: Vec<LibraryState>,
    calls: Vec<StoreCall>,
    next_object: u64,
    fail_uploads: bool,
}

impl Inner {
    fn library(&self, library_id: &str) -> Result<&LibraryState> {
        self.libraries
            .iter()
            .find(|state| state.library.id == library_id)
            .ok_or_else(|| FsError::NotFound(format!("library {}", library_id)))
    }

    fn library_mut(&mut self, library_id: &str) -> Result<&mut LibraryState> {
        self.libraries
            .iter_mut()
            .find(|state| state.library.id == library_id)
            .ok_or_else(|| FsError::NotFound(format!("library {}", library_id)))
    }

    fn object_id(&mut self) -> String {
        self.next_object += 1;
        format!("{:040x}", self.next_object)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_library(self, id: &str, name: &str) -> Self {
        self.add_library(Library::new(id, name));
        self
    }

    pub fn add_library(&self, library: Library) {
        let mut inner = self.lock();
        inner.libraries.retain(|state| state.library.id != library.id);
        inner.libraries.push(LibraryState {
            library,
            nodes: BTreeMap::new(),
        });
    }

    pub fn remove_library(&self, library_id: &str) {
        self.lock().libraries.retain(|state| state.library.id != library_id);
    }

    pub fn rename_library(&self, library_id: &str, name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.library_mut(library_id)?.library.name = name.to_string();
        Ok(())
    }

    /// Creates a directory and its missing parents without recording a call.
    pub fn insert_dir(&self, library_id: &str, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut inner = self.lock();
        let state = inner.library_mut(library_id)?;
        let now = Utc::now();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            if let Some(Node::File { .. }) = state.nodes.get(&current) {
                return Err(FsError::DirectoryExpected(format!("{}/{}", library_id, current)));
            }
            state.nodes.entry(current.clone()).or_insert(Node::Dir { mtime: now });
        }
        Ok(())
    }

    /// Stores a file, creating missing parents, without recording a call.
    pub fn insert_file(&self, library_id: &str, path: &str, data: &[u8]) -> Result<()> {
        let path = normalize(path);
        self.insert_dir(library_id, parent(&path))?;
        let mut inner = self.lock();
        let id = inner.object_id();
        let state = inner.library_mut(library_id)?;
        state.nodes.insert(path, Node::File {
            id,
            data: data.to_vec(),
            mtime: Utc::now(),
        });
        state.touch();
        Ok(())
    }

    pub fn file_contents(&self, library_id: &str, path: &str) -> Option<Vec<u8>> {
        let inner = self.lock();
        let state = inner.library(library_id).ok()?;
        match state.nodes.get(&normalize(path))? {
            Node::File { data, .. } => Some(data.clone()),
            Node::Dir { .. } => None,
        }
    }

    pub fn contains(&self, library_id: &str, path: &str) -> bool {
        let inner = self.lock();
        inner
            .library(library_id)
            .map(|state| state.nodes.contains_key(&normalize(path)))
            .unwrap_or(false)
    }

    /// Makes every following upload fail with a server error.
    pub fn fail_uploads(&self, fail: bool) {
        self.lock().fail_uploads = fail;
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: StoreCall) -> MutexGuard<'_, Inner> {
        debug!("memory store: {:?}", call);
        let mut inner = self.lock();
        inner.calls.push(call);
        inner
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn list_libraries(&self) -> Result<Vec<Library>> {
        let inner = self.record(StoreCall::ListLibraries);
        Ok(inner.libraries.iter().map(|state| state.library.clone()).collect())
    }

    async fn get_library_info(&self, library_id: &str) -> Result<Library> {
        let inner = self.record(StoreCall::GetLibraryInfo {
            library_id: library_id.to_string(),
        });
        Ok(inner.library(library_id)?.library.clone())
    }

    async fn list_directory(&self, library_id: &str, path: &str) -> Result<Vec<RawEntry>> {
        let path = normalize(path);
        let inner = self.record(StoreCall::ListDirectory {
            library_id: library_id.to_string(),
            path: path.clone(),
        });
        let state = inner.library(library_id)?;
        if !state.is_dir(&path) {
            return match state.nodes.get(&path) {
                Some(_) => Err(FsError::DirectoryExpected(format!("{}/{}", library_id, path))),
                None => Err(FsError::NotFound(format!("{}/{}", library_id, path))),
            };
        }
        Ok(state
            .nodes
            .keys()
            .filter(|key| parent(key) == path)
            .filter_map(|key| state.entry(key))
            .collect())
    }

    async fn create_directory(&self, library_id: &str, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut inner = self.record(StoreCall::CreateDirectory {
            library_id: library_id.to_string(),
            path: path.clone(),
        });
        let state = inner.library_mut(library_id)?;
        if path.is_empty() || state.nodes.contains_key(&path) {
            return Err(FsError::Conflict(format!("{}/{} already exists", library_id, path)));
        }
        if !state.is_dir(parent(&path)) {
            return Err(FsError::NotFound(format!("{}/{}", library_id, parent(&path))));
        }
        state.nodes.insert(path, Node::Dir { mtime: Utc::now() });
        Ok(())
    }

    async fn delete_file(&self, library_id: &str, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut inner = self.record(StoreCall::DeleteFile {
            library_id: library_id.to_string(),
            path: path.clone(),
        });
        let state = inner.library_mut(library_id)?;
        match state.nodes.get(&path) {
            Some(Node::File { .. }) => {
                state.nodes.remove(&path);
                state.touch();
                Ok(())
            }
            Some(Node::Dir { .. }) => Err(FsError::FileExpected(format!("{}/{}", library_id, path))),
            None if path.is_empty() => Err(FsError::FileExpected(library_id.to_string())),
            None => Err(FsError::NotFound(format!("{}/{}", library_id, path))),
        }
    }

    async fn delete_directory(&self, library_id: &str, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut inner = self.record(StoreCall::DeleteDirectory {
            library_id: library_id.to_string(),
            path: path.clone(),
        });
        let state = inner.library_mut(library_id)?;
        if path.is_empty() {
            return Err(FsError::InvalidOperation(format!(
                "cannot delete the root of library {}",
                library_id
            )));
        }
        match state.nodes.get(&path) {
            Some(Node::Dir { .. }) => {
                let prefix = format!("{}/", path);
                state.nodes.retain(|key, _| key != &path && !key.starts_with(&prefix));
                state.touch();
                Ok(())
            }
            Some(Node::File { .. }) => Err(FsError::DirectoryExpected(format!("{}/{}", library_id, path))),
            None => Err(FsError::NotFound(format!("{}/{}", library_id, path))),
        }
    }

    async fn get_file_info(&self, library_id: &str, path: &str) -> Result<RawEntry> {
        let path = normalize(path);
        let inner = self.record(StoreCall::GetFileInfo {
            library_id: library_id.to_string(),
            path: path.clone(),
        });
        let state = inner.library(library_id)?;
        if path.is_empty() {
            return Ok(RawEntry::dir(""));
        }
        state
            .entry(&path)
            .ok_or_else(|| FsError::NotFound(format!("{}/{}", library_id, path)))
    }

    async fn download_object(&self, library_id: &str, path: &str) -> Result<Vec<u8>> {
        let path = normalize(path);
        let inner = self.record(StoreCall::DownloadObject {
            library_id: library_id.to_string(),
            path: path.clone(),
        });
        let state = inner.library(library_id)?;
        match state.nodes.get(&path) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            Some(Node::Dir { .. }) => Err(FsError::FileExpected(format!("{}/{}", library_id, path))),
            None if path.is_empty() => Err(FsError::FileExpected(library_id.to_string())),
            None => Err(FsError::NotFound(format!("{}/{}", library_id, path))),
        }
    }

    async fn upload_object(&self, library_id: &str, path: &str, data: &[u8]) -> Result<()> {
        let path = normalize(path);
        let mut inner = self.record(StoreCall::UploadObject {
            library_id: library_id.to_string(),
            path: path.clone(),
            data: data.to_vec(),
        });
        if inner.fail_uploads {
            return Err(FsError::Remote {
                status: 500,
                message: format!("upload of {}/{} rejected", library_id, path),
            });
        }
        let id = inner.object_id();
        let state = inner.library_mut(library_id)?;
        if path.is_empty() || state.is_dir(&path) {
            return Err(FsError::FileExpected(format!("{}/{}", library_id, path)));
        }
        if !state.is_dir(parent(&path)) {
            return Err(FsError::NotFound(format!("{}/{}", library_id, parent(&path))));
        }
        let id = match state.nodes.get(&path) {
            Some(Node::File { id, .. }) => id.clone(),
            _ => id,
        };
        state.nodes.insert(path, Node::File {
            id,
            data: data.to_vec(),
            mtime: Utc::now(),
        });
        state.touch();
        Ok(())
    }
}

fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn parent(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

use std::io::{Read, Write};
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};
use crate::error::{FsError, Result};
use crate::path::{Location, PathResolver};
use crate::storage::{Library, RawEntry, RemoteStore};
use crate::stream::{OpenMode, RemoteFile, WriteMode};

/// Normalized metadata for a file or directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub remote_id: Option<String>,
}

impl ResourceInfo {
    /// The synthetic `/` directory.
    pub fn root() -> Self {
        Self {
            name: String::new(),
            is_dir: true,
            size: 0,
            modified: None,
            remote_id: None,
        }
    }

    fn library(library: &Library, name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_dir: true,
            size: library.size,
            modified: library.mtime,
            remote_id: Some(library.id.clone()),
        }
    }
}

impl From<RawEntry> for ResourceInfo {
    fn from(entry: RawEntry) -> Self {
        Self {
            is_dir: !entry.is_file(),
            name: entry.name,
            size: entry.size,
            modified: entry.mtime,
            remote_id: entry.id,
        }
    }
}

/// Filesystem verbs over `/`-delimited virtual paths.
#[async_trait]
pub trait FileSystem: Send + Sync + std::fmt::Debug {
    async fn stat(&self, path: &str) -> Result<ResourceInfo>;
    async fn list(&self, path: &str) -> Result<Vec<ResourceInfo>>;
    async fn make_directory(&self, path: &str) -> Result<()>;
    async fn remove_file(&self, path: &str) -> Result<()>;
    async fn remove_directory(&self, path: &str) -> Result<()>;
    async fn set_info(&self, path: &str, info: &ResourceInfo) -> Result<()>;
    async fn open(&self, path: &str, mode: OpenMode) -> Result<RemoteFile>;

    async fn open_read(&self, path: &str) -> Result<RemoteFile> {
        self.open(path, OpenMode::Read).await
    }

    async fn open_write(&self, path: &str, mode: WriteMode) -> Result<RemoteFile> {
        self.open(path, OpenMode::Write(mode)).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(FsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.open_read(path).await?;
        let mut data = Vec::with_capacity(file.len() as usize);
        file.read_to_end(&mut data)?;
        file.close().await?;
        Ok(data)
    }

    async fn write_bytes(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut file = self.open_write(path, WriteMode::Truncate).await?;
        file.write_all(data)?;
        file.close().await
    }
}

/// Seafile libraries presented as one directory tree: `/<library>/<path>`.
pub struct SeafileFs {
    store: Arc<dyn RemoteStore>,
    resolver: PathResolver,
}

impl std::fmt::Debug for SeafileFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeafileFs")
            .field("store", &self.store)
            .field("libraries", &self.resolver.directory().len())
            .finish()
    }
}

impl SeafileFs {
    /// Builds the filesystem and loads the library list once.
    pub async fn connect(store: Arc<dyn RemoteStore>) -> Result<Self> {
        let fs = Self::new(store, PathResolver::default());
        fs.refresh().await?;
        Ok(fs)
    }

    pub fn new(store: Arc<dyn RemoteStore>, resolver: PathResolver) -> Self {
        Self { store, resolver }
    }

    /// Re-reads the library list, e.g. after libraries were added or renamed
    /// elsewhere.
    pub async fn refresh(&self) -> Result<usize> {
        self.resolver.refresh(self.store.as_ref()).await
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    pub fn split(&self, path: &str) -> Result<Location> {
        self.resolver.split(path).map_err(failed("split", path))
    }

    /// Root entries: one per library, named by display name unless another
    /// library took that name, in which case by id.
    /// One entry per library, named so that the entry resolves back to it:
    /// by name, or by id when a later library took the name. A library whose
    /// name and id are both taken by others is left out.
    fn list_root(&self) -> Vec<ResourceInfo> {
        let directory = self.resolver.directory();
        let owns = |key: &str, id: &str| {
            directory.resolve(key).map(|owner| owner.id == id).unwrap_or(false)
        };
        directory
            .libraries()
            .iter()
            .filter_map(|library| {
                let name = [&library.name, &library.id]
                    .into_iter()
                    .find(|key| owns(key, &library.id));
                if name.is_none() {
                    warn!("list: library {} ({}) is unreachable by name or id", library.id, library.name);
                }
                name.map(|name| ResourceInfo::library(library, name))
            })
            .collect()
    }
}

fn failed<'a>(op: &'static str, path: &'a str) -> impl FnOnce(FsError) -> FsError + 'a {
    move |e| {
        if e.is_not_found() {
            debug!("{}: {:?} not found: {}", op, path, e);
        } else {
            error!("{} error for path={:?}: {}", op, path, e);
        }
        e
    }
}

#[async_trait]
impl FileSystem for SeafileFs {
    async fn stat(&self, path: &str) -> Result<ResourceInfo> {
        match self.split(path)? {
            Location::Root => Ok(ResourceInfo::root()),
            Location::LibraryRoot(library) => {
                let info = self
                    .store
                    .get_library_info(&library.id)
                    .await
                    .map_err(failed("stat", path))?;
                Ok(ResourceInfo::library(&info, &info.name))
            }
            Location::InLibrary { library, path: sub_path } => {
                let entry = self
                    .store
                    .get_file_info(&library.id, &sub_path)
                    .await
                    .map_err(failed("stat", path))?;
                Ok(entry.into())
            }
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<ResourceInfo>> {
        let location = self.split(path)?;
        let Some(library) = location.library() else {
            return Ok(self.list_root());
        };
        let entries = self
            .store
            .list_directory(&library.id, location.sub_path())
            .await
            .map_err(failed("list", path))?;
        debug!("list: {:?} has {} entries", path, entries.len());
        Ok(entries.into_iter().map(ResourceInfo::from).collect())
    }

    async fn make_directory(&self, path: &str) -> Result<()> {
        let location = self.split(path)?;
        let Some(library) = location.library() else {
            return Err(FsError::InvalidOperation("cannot create the root directory".to_string()));
        };
        self.store
            .create_directory(&library.id, location.sub_path())
            .await
            .map_err(failed("make_directory", path))?;
        debug!("make_directory: created {:?}", path);
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        match self.split(path)? {
            Location::InLibrary { library, path: sub_path } => {
                self.store
                    .delete_file(&library.id, &sub_path)
                    .await
                    .map_err(failed("remove_file", path))?;
                debug!("remove_file: removed {:?}", path);
                Ok(())
            }
            Location::Root | Location::LibraryRoot(_) => Err(FsError::FileExpected(path.to_string())),
        }
    }

    async fn remove_directory(&self, path: &str) -> Result<()> {
        match self.split(path)? {
            Location::InLibrary { library, path: sub_path } => {
                self.store
                    .delete_directory(&library.id, &sub_path)
                    .await
                    .map_err(failed("remove_directory", path))?;
                debug!("remove_directory: removed {:?}", path);
                Ok(())
            }
            Location::Root => Err(FsError::InvalidOperation("cannot remove the root directory".to_string())),
            Location::LibraryRoot(library) => Err(FsError::InvalidOperation(format!(
                "removing library {} is not supported",
                library.name
            ))),
        }
    }

    async fn set_info(&self, path: &str, _info: &ResourceInfo) -> Result<()> {
        // the service has no metadata updates beyond replacing content
        debug!("set_info: ignored for {:?}", path);
        Ok(())
    }

    async fn open(&self, path: &str, mode: OpenMode) -> Result<RemoteFile> {
        let location = self.split(path)?;
        RemoteFile::open(Arc::clone(&self.store), &location, path, mode)
            .await
            .map_err(failed("open", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StoreCall};
    use std::io::{Seek, SeekFrom};

    async fn setup() -> (Arc<MemoryStore>, SeafileFs) {
        let store = Arc::new(MemoryStore::new().with_library("abc", "Projects"));
        store.insert_file("abc", "notes/todo.txt", b"buy milk").unwrap();
        let fs = SeafileFs::connect(store.clone()).await.unwrap();
        store.clear_calls();
        (store, fs)
    }

    #[tokio::test]
    async fn test_stat_root_is_local() {
        let (store, fs) = setup().await;
        let info = fs.stat("/").await.unwrap();
        assert_eq!(info, ResourceInfo::root());
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stat_library_root() {
        let (store, fs) = setup().await;
        let info = fs.stat("/Projects").await.unwrap();
        assert!(info.is_dir);
        assert_eq!(info.name, "Projects");
        assert_eq!(info.size, 8);
        assert!(info.modified.is_some());
        assert_eq!(store.calls(), vec![StoreCall::GetLibraryInfo {
            library_id: "abc".to_string(),
        }]);
    }

    #[tokio::test]
    async fn test_stat_file_and_directory() {
        let (_store, fs) = setup().await;
        let file = fs.stat("/Projects/notes/todo.txt").await.unwrap();
        assert!(!file.is_dir);
        assert_eq!(file.name, "todo.txt");
        assert_eq!(file.size, 8);
        assert!(file.remote_id.is_some());

        let dir = fs.stat("/abc/notes/").await.unwrap();
        assert!(dir.is_dir);
        assert_eq!(dir.name, "notes");
    }

    #[tokio::test]
    async fn test_stat_unknown_library_makes_no_call() {
        let (store, fs) = setup().await;
        assert!(matches!(fs.stat("/Unknown/x").await, Err(FsError::NotFound(s)) if s == "Unknown"));
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_list_library_root_and_subdirectory() {
        let (store, fs) = setup().await;
        let root = fs.list("/Projects").await.unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "notes");
        assert!(root[0].is_dir);

        let notes = fs.list("/Projects/notes").await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].name, "todo.txt");
        assert!(!notes[0].is_dir);

        assert_eq!(store.calls()[0], StoreCall::ListDirectory {
            library_id: "abc".to_string(),
            path: String::new(),
        });
    }

    #[tokio::test]
    async fn test_list_root_shows_libraries() {
        let store = Arc::new(
            MemoryStore::new()
                .with_library("abc", "Projects")
                .with_library("s1", "Shared")
                .with_library("s2", "Shared"),
        );
        let fs = SeafileFs::connect(store.clone()).await.unwrap();
        store.clear_calls();

        let names: Vec<_> = fs.list("/").await.unwrap().into_iter().map(|i| i.name).collect();
        assert_eq!(names, vec!["Projects", "s1", "Shared"]);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_list_root_entries_resolve_to_their_library() {
        let store = Arc::new(
            MemoryStore::new()
                .with_library("s1", "Shared")
                .with_library("s2", "Shared")
                .with_library("x", "s1"),
        );
        let fs = SeafileFs::connect(store).await.unwrap();

        let entries = fs.list("/").await.unwrap();
        let names: Vec<_> = entries.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Shared", "s1"]);
        for entry in &entries {
            let owner = fs.resolver().directory().resolve(&entry.name).unwrap();
            assert_eq!(entry.remote_id.as_deref(), Some(owner.id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_make_directory() {
        let (store, fs) = setup().await;
        fs.make_directory("/Projects/reports").await.unwrap();
        assert!(fs.stat("/Projects/reports").await.unwrap().is_dir);

        assert!(matches!(fs.make_directory("/Projects/reports").await, Err(FsError::Conflict(_))));
        assert!(matches!(fs.make_directory("/Projects").await, Err(FsError::Conflict(_))));
        assert!(matches!(fs.make_directory("/").await, Err(FsError::InvalidOperation(_))));
        assert!(store.contains("abc", "reports"));
    }

    #[tokio::test]
    async fn test_remove_file_and_directory() {
        let (store, fs) = setup().await;
        assert!(matches!(fs.remove_file("/Projects/notes").await, Err(FsError::FileExpected(_))));
        assert!(matches!(fs.remove_file("/Projects").await, Err(FsError::FileExpected(_))));
        assert!(matches!(fs.remove_directory("/Projects").await, Err(FsError::InvalidOperation(_))));
        assert!(matches!(fs.remove_directory("/").await, Err(FsError::InvalidOperation(_))));

        fs.remove_file("/Projects/notes/todo.txt").await.unwrap();
        assert!(!store.contains("abc", "notes/todo.txt"));
        fs.remove_directory("/Projects/notes").await.unwrap();
        assert!(!fs.exists("/Projects/notes").await.unwrap());
        assert!(matches!(fs.remove_file("/Projects/gone.txt").await, Err(FsError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_set_info_is_noop() {
        let (store, fs) = setup().await;
        fs.set_info("/Projects/notes/todo.txt", &ResourceInfo::root()).await.unwrap();
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let (store, fs) = setup().await;
        let mut file = fs.open_write("/Projects/report.txt", WriteMode::Create).await.unwrap();
        file.write_all(b"hello").unwrap();
        file.close().await.unwrap();

        let uploads: Vec<_> = store.calls().into_iter().filter(|c| c.is_upload()).collect();
        assert_eq!(uploads, vec![StoreCall::UploadObject {
            library_id: "abc".to_string(),
            path: "report.txt".to_string(),
            data: b"hello".to_vec(),
        }]);
        assert!(!store.calls().iter().any(|c| c.is_download()));

        let mut file = fs.open_read("/Projects/report.txt").await.unwrap();
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        file.close().await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_append_missing_behaves_like_create() {
        let (store, fs) = setup().await;
        let file = fs.open_write("/Projects/report.txt", WriteMode::Append).await.unwrap();
        assert_eq!(file.len(), 0);
        assert_eq!(file.position(), 0);
        drop(file);
        assert!(!store.contains("abc", "report.txt"));
    }

    #[tokio::test]
    async fn test_open_directory_is_file_expected() {
        let (_store, fs) = setup().await;
        assert!(matches!(fs.open_read("/Projects/notes").await, Err(FsError::FileExpected(_))));
        assert!(matches!(fs.open_read("/Projects").await, Err(FsError::FileExpected(_))));
        assert!(matches!(fs.open_read("/").await, Err(FsError::FileExpected(_))));
    }

    #[tokio::test]
    async fn test_last_close_wins() {
        let (store, fs) = setup().await;
        let mut first = fs.open("/Projects/notes/todo.txt", OpenMode::ReadWrite).await.unwrap();
        let mut second = fs.open_write("/Projects/notes/todo.txt", WriteMode::Truncate).await.unwrap();

        first.seek(SeekFrom::End(0)).unwrap();
        first.write_all(b", eggs").unwrap();
        second.write_all(b"nothing").unwrap();

        second.close().await.unwrap();
        first.close().await.unwrap();
        assert_eq!(store.file_contents("abc", "notes/todo.txt").unwrap(), b"buy milk, eggs");
    }

    #[tokio::test]
    async fn test_read_and_write_bytes() {
        let (_store, fs) = setup().await;
        fs.write_bytes("/Projects/notes/todo.txt", b"call mom").await.unwrap();
        assert_eq!(fs.read_bytes("/Projects/notes/todo.txt").await.unwrap(), b"call mom");
        assert!(fs.exists("/Projects/notes/todo.txt").await.unwrap());
        assert!(!fs.exists("/Projects/notes/other.txt").await.unwrap());
        assert!(!fs.exists("/Nowhere").await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_sees_new_libraries() {
        let (store, fs) = setup().await;
        assert!(fs.stat("/Photos").await.is_err());

        store.add_library(Library::new("def", "Photos"));
        assert_eq!(fs.refresh().await.unwrap(), 2);
        assert!(fs.stat("/Photos").await.unwrap().is_dir);
        assert!(fs.list("/def").await.unwrap().is_empty());
    }
}

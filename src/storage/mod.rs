use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::error::Result;

pub mod memory;

pub use memory::{MemoryStore, StoreCall};

pub const ENTRY_TYPE_FILE: &str = "file";
pub const ENTRY_TYPE_DIR: &str = "dir";

/// A top-level namespace of the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Library {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub mtime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
}

impl Library {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            size: 0,
            mtime: None,
            owner: None,
            encrypted: false,
        }
    }
}

/// A directory entry or file detail as the remote service reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, with = "chrono::serde::ts_seconds_option")]
    pub mtime: Option<DateTime<Utc>>,
}

impl RawEntry {
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            id: None,
            name: name.into(),
            kind: ENTRY_TYPE_FILE.to_string(),
            size,
            mtime: None,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            kind: ENTRY_TYPE_DIR.to_string(),
            size: 0,
            mtime: None,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == ENTRY_TYPE_FILE
    }
}

/// Whole-object operations against the remote service.
///
/// Paths are relative to the library root, `/`-joined, and `""` names the
/// library root itself. An absent object is reported as
/// [`FsError::NotFound`](crate::error::FsError::NotFound); every other
/// failure is returned as the implementation sees it.
#[async_trait]
pub trait RemoteStore: Send + Sync + std::fmt::Debug {
    async fn list_libraries(&self) -> Result<Vec<Library>>;
    async fn get_library_info(&self, library_id: &str) -> Result<Library>;
    async fn list_directory(&self, library_id: &str, path: &str) -> Result<Vec<RawEntry>>;
    async fn create_directory(&self, library_id: &str, path: &str) -> Result<()>;
    async fn delete_file(&self, library_id: &str, path: &str) -> Result<()>;
    async fn delete_directory(&self, library_id: &str, path: &str) -> Result<()>;
    async fn get_file_info(&self, library_id: &str, path: &str) -> Result<RawEntry>;
    async fn download_object(&self, library_id: &str, path: &str) -> Result<Vec<u8>>;
    async fn upload_object(&self, library_id: &str, path: &str, data: &[u8]) -> Result<()>;
}

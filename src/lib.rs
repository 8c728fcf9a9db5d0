pub mod error;
pub mod config;
pub mod storage;
pub mod client;
pub mod library;
pub mod path;
pub mod fs;
pub mod stream;

pub use error::{FsError, Result};
pub use config::ServerConfig;
pub use storage::{Library, MemoryStore, RawEntry, RemoteStore};
pub use client::SeafileClient;
pub use library::LibraryDirectory;
pub use path::{Location, PathResolver};
pub use fs::{FileSystem, ResourceInfo, SeafileFs};
pub use stream::{HandleState, OpenMode, RemoteFile, WriteMode};

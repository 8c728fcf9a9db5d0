use tracing::debug;
use crate::error::{FsError, Result};
use crate::library::LibraryDirectory;
use crate::storage::{Library, RemoteStore};

/// Where a virtual path points, decided once per call.
#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    /// `/`, which has no backing library.
    Root,
    /// `/<library>`.
    LibraryRoot(Library),
    /// `/<library>/<path>`; `path` is non-empty and has no leading slash.
    InLibrary { library: Library, path: String },
}

impl Location {
    pub fn library(&self) -> Option<&Library> {
        match self {
            Location::Root => None,
            Location::LibraryRoot(library) | Location::InLibrary { library, .. } => Some(library),
        }
    }

    pub fn library_id(&self) -> Option<&str> {
        self.library().map(|library| library.id.as_str())
    }

    /// Path inside the library, `""` for the library root and for `/`.
    pub fn sub_path(&self) -> &str {
        match self {
            Location::InLibrary { path, .. } => path,
            _ => "",
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, Location::Root)
    }
}

/// Splits a `/`-delimited virtual path into its non-empty segments.
///
/// `.` segments are dropped; `..` is refused because it could leave the
/// library the path started in.
pub fn segments(path: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(FsError::InvalidPath(path.to_string())),
            _ => parts.push(segment),
        }
    }
    Ok(parts)
}

/// Maps virtual paths onto `(library, sub-path)` pairs.
#[derive(Debug, Default)]
pub struct PathResolver {
    directory: LibraryDirectory,
}

impl PathResolver {
    pub fn new(directory: LibraryDirectory) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &LibraryDirectory {
        &self.directory
    }

    pub async fn refresh<S>(&self, store: &S) -> Result<usize>
    where
        S: RemoteStore + ?Sized,
    {
        self.directory.refresh(store).await
    }

    pub fn split(&self, path: &str) -> Result<Location> {
        let parts = segments(path)?;
        let Some((selector, rest)) = parts.split_first() else {
            return Ok(Location::Root);
        };
        let library = self.directory.resolve(selector)?;
        let location = if rest.is_empty() {
            Location::LibraryRoot(library)
        } else {
            Location::InLibrary {
                library,
                path: rest.join("/"),
            }
        };
        debug!("split: {:?} -> {:?} {:?}", path, location.library_id(), location.sub_path());
        Ok(location)
    }
}

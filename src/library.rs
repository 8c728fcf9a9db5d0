use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};
use crate::error::{FsError, Result};
use crate::storage::{Library, RemoteStore};

/// Immutable snapshot of the libraries known after one refresh.
#[derive(Debug, Default)]
struct LibraryIndex {
    /// Libraries in the order the service returned them.
    libraries: Vec<Library>,
    /// Library id and library name -> position in `libraries`.
    keys: HashMap<String, usize>,
}

impl LibraryIndex {
    fn build(libraries: Vec<Library>) -> Self {
        let mut keys: HashMap<String, usize> = HashMap::with_capacity(libraries.len() * 2);
        for (pos, library) in libraries.iter().enumerate() {
            for key in [&library.id, &library.name] {
                // later registrations shadow earlier ones
                if let Some(prev) = keys.insert(key.clone(), pos) {
                    if prev != pos {
                        warn!(
                            "library key {:?} is shared by {} and {}, using {}",
                            key, libraries[prev].id, library.id, library.id
                        );
                    }
                }
            }
        }
        Self { libraries, keys }
    }

    fn get(&self, selector: &str) -> Option<&Library> {
        self.keys.get(selector).map(|&pos| &self.libraries[pos])
    }
}

/// Lookup of libraries by id or display name.
///
/// A refresh builds a new index and swaps it in whole, so a concurrent
/// [`resolve`](Self::resolve) sees either the old or the new set.
#[derive(Debug, Default)]
pub struct LibraryDirectory {
    index: RwLock<Arc<LibraryIndex>>,
}

impl LibraryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches the library list and replaces the index. Returns the number
    /// of libraries now known.
    pub async fn refresh<S>(&self, store: &S) -> Result<usize>
    where
        S: RemoteStore + ?Sized,
    {
        let libraries = store.list_libraries().await?;
        let count = libraries.len();
        self.replace(libraries);
        info!("library directory refreshed: {} libraries", count);
        Ok(count)
    }

    pub fn replace(&self, libraries: Vec<Library>) {
        let index = Arc::new(LibraryIndex::build(libraries));
        let mut slot = self.index.write().unwrap_or_else(PoisonError::into_inner);
        *slot = index;
    }

    pub fn resolve(&self, selector: &str) -> Result<Library> {
        let index = self.snapshot();
        match index.get(selector) {
            Some(library) => {
                debug!("resolve: {:?} -> {}", selector, library.id);
                Ok(library.clone())
            }
            None => Err(FsError::NotFound(selector.to_string())),
        }
    }

    pub fn libraries(&self) -> Vec<Library> {
        self.snapshot().libraries.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().libraries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Arc<LibraryIndex> {
        Arc::clone(&self.index.read().unwrap_or_else(PoisonError::into_inner))
    }
}

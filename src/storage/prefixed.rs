use std::sync::Arc;

use crate::error::Result;
use crate::storage::{Storage, StorageInput, StorageLock, StorageOutput};

/// Storage facade that transparently prefixes all file names.
///
/// Each leaf backend writes through its own prefix so two leaves sharing one
/// data directory never see each other's files.
#[derive(Debug, Clone)]
pub struct PrefixedStorage {
    prefix: String,
    inner: Arc<dyn Storage>,
}

impl PrefixedStorage {
    /// Create a new prefixed storage namespace.
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn Storage>) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim_matches('/').to_string();
        Self { prefix, inner }
    }

    /// The prefix applied to every name.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn map_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

impl Storage for PrefixedStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.inner.open_input(&self.map_name(name))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.inner.create_output(&self.map_name(name))
    }

    fn create_output_append(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.inner.create_output_append(&self.map_name(name))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(&self.map_name(name))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(&self.map_name(name))
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.inner.file_size(&self.map_name(name))
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.inner
            .rename_file(&self.map_name(old_name), &self.map_name(new_name))
    }

    fn acquire_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        self.inner.acquire_lock(&self.map_name(name))
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn isolates_file_names() {
        let base: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let structured = PrefixedStorage::new("structured", base.clone());
        let semantic = PrefixedStorage::new("/semantic/", base.clone());

        {
            let mut output = structured.create_output("structured.wal").unwrap();
            output.write_all(b"data").unwrap();
            output.close().unwrap();
        }

        assert_eq!(semantic.prefix(), "semantic");
        assert!(base.file_exists("structured/structured.wal"));
        assert!(!base.file_exists("structured.wal"));
        assert!(!semantic.file_exists("structured.wal"));
        assert!(structured.file_exists("structured.wal"));
        assert!(!base.file_exists("semantic/structured.wal"));
    }

    #[test]
    fn rename_stays_inside_prefix() {
        let base: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let leaf = PrefixedStorage::new("semantic", base.clone());

        {
            let mut output = leaf.create_output("semantic.graph.tmp").unwrap();
            output.write_all(b"graph").unwrap();
            output.close().unwrap();
        }
        leaf.rename_file("semantic.graph.tmp", "semantic.graph").unwrap();

        assert!(base.file_exists("semantic/semantic.graph"));
        assert_eq!(leaf.file_size("semantic.graph").unwrap(), 5);
    }
}

//! Storage abstraction layer.
//!
//! Both leaf backends persist their logs, snapshots and index files through the
//! [`Storage`] trait. [`FileStorage`] is directory backed; [`MemoryStorage`] keeps
//! everything in a shared map and is what an unconfigured `data_dir` resolves
//! to. [`PrefixedStorage`] gives each leaf a private namespace inside one root.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

pub mod file;
pub mod memory;
pub mod prefixed;
pub mod traits;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use prefixed::PrefixedStorage;
pub use traits::*;

/// Open the root storage for a data directory, or an in-memory root when none
/// is configured.
pub fn open_root(data_dir: Option<&Path>) -> Result<Arc<dyn Storage>> {
    match data_dir {
        Some(dir) => Ok(Arc::new(FileStorage::new(dir, StorageConfig::default())?)),
        None => Ok(Arc::new(MemoryStorage::new())),
    }
}

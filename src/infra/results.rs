//! Filesystem result store.

use std::fs::{create_dir_all, write};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::{HarvestError, ResultSink};

/// File name every payload is stored under.
pub const RESULT_FILE: &str = "result.tar.gz";

/// Stores payloads at `<root>/<namespace>/<instance_type>/result.tar.gz`.
///
/// The payload is written as received; unpacking it is left to whoever reads
/// the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsResultStore {
    base: PathBuf,
}

impl FsResultStore {
    /// Store rooted at `root/namespace`.
    pub fn new(root: impl AsRef<Path>, namespace: &str) -> Self {
        Self {
            base: root.as_ref().join(namespace),
        }
    }

    /// Directory holding the results of one namespace.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory for one instance type.
    #[must_use]
    pub fn dir_for(&self, instance_type: &str) -> PathBuf {
        self.base.join(instance_type)
    }

    /// True when a result directory already exists for `instance_type`.
    #[must_use]
    pub fn is_collected(&self, instance_type: &str) -> bool {
        valid_component(instance_type) && self.dir_for(instance_type).is_dir()
    }
}

fn valid_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

impl ResultSink for FsResultStore {
    fn persist(&self, instance_type: &str, payload: &[u8]) -> Result<PathBuf, HarvestError> {
        if !valid_component(instance_type) {
            return Err(HarvestError::Store(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("instance type `{instance_type}` is not a valid directory name"),
            )));
        }
        let dir = self.dir_for(instance_type);
        create_dir_all(&dir)?;
        let path = dir.join(RESULT_FILE);
        write(&path, payload)?;
        debug!(path = %path.display(), bytes = payload.len(), "payload written");
        Ok(path)
    }
}

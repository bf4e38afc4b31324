//! Line-oriented work item input and workload script loading.

use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::info;

use crate::core::{AppResult, WorkItem};
use crate::infra::results::FsResultStore;

/// Parse one instance type per line. Blank lines and `#` comments are skipped.
#[must_use]
pub fn parse_work_items(text: &str) -> Vec<WorkItem> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(WorkItem::new)
        .collect()
}

/// Read work items from a file.
///
/// # Errors
///
/// Fails if the file cannot be read.
pub fn load_work_items(path: impl AsRef<Path>) -> AppResult<Vec<WorkItem>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read instance list {}", path.display()))?;
    let items = parse_work_items(&text);
    info!(path = %path.display(), count = items.len(), "loaded work items");
    Ok(items)
}

/// Drop items whose result is already on disk, keeping input order.
#[must_use]
pub fn filter_uncollected(items: Vec<WorkItem>, store: &FsResultStore) -> Vec<WorkItem> {
    let total = items.len();
    let pending: Vec<WorkItem> = items
        .into_iter()
        .filter(|item| {
            let done = store.is_collected(item.instance_type());
            if done {
                info!(instance_type = %item, "skipping, already collected");
            }
            !done
        })
        .collect();
    info!(
        total,
        already_collected = total - pending.len(),
        to_process = pending.len(),
        "filtered work items"
    );
    pending
}

/// The workload shipped to every instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadScript {
    name: String,
    content: String,
}

impl WorkloadScript {
    /// Build a script from its name and body.
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Load a script; its name is the file stem (`bench.sh` becomes `bench`).
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or has no usable stem.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read script file {}", path.display()))?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .with_context(|| format!("script path {} has no file name", path.display()))?;
        Ok(Self::new(name, content))
    }

    /// Namespace results are stored under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Script body, handed to each instance at launch through
    /// [`Driver::with_user_data`](crate::core::Driver::with_user_data).
    #[must_use]
    pub fn content(&self) -> &str {
        &self.content
    }
}

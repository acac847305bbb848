use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// A single file system change reported by the external watcher.
///
/// Paths are absolute. Batches preserve the order the watcher observed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "path", rename_all = "camelCase")]
pub enum WatchEvent {
  Create(PathBuf),
  Update(PathBuf),
  Delete(PathBuf),
}

impl WatchEvent {
  pub fn path(&self) -> &Path {
    match self {
      WatchEvent::Create(path) | WatchEvent::Update(path) | WatchEvent::Delete(path) => path,
    }
  }
}

pub type WatchEvents = Vec<WatchEvent>;

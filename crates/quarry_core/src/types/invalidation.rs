use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// A dependency a request has declared on state outside the request graph.
///
/// Reported back to callers so they can explain why a request will re-run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Invalidation {
  FileChange { path: PathBuf },
  EnvChange { name: String },
}

/// The shapes a request may watch for newly created files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FileCreateInvalidation {
  /// Any created path matching a glob pattern.
  Glob { glob: String },

  /// A file with the given name appearing in `above_path` or any of its
  /// ancestor directories. Used for configuration file discovery.
  FileName {
    file_name: String,
    above_path: PathBuf,
  },

  /// Any of `path.ext` for `ext` in `extensions` appearing. Extensions
  /// include the leading dot (`".ts"`). Used for module resolution priority,
  /// where a newly created higher-priority extension must win over the
  /// currently resolved file.
  ExtensionlessFile {
    path: PathBuf,
    extensions: BTreeSet<String>,
  },
}

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use bitflags::bitflags;
use serde::Deserialize;
use serde::Serialize;

use quarry_core::graph::GraphNode;

use super::RequestId;

/// Stable content id of a node in the request graph.
///
/// Each node kind owns its id shape; the id uniquely encodes kind and key,
/// so two nodes with equal ids are the same node.
pub type NodeId = String;

bitflags! {
  /// Why a request node went invalid. Reasons accumulate until the request
  /// completes again.
  #[derive(Debug, Eq, PartialEq, Copy, Clone, Hash)]
  pub struct InvalidateReason: u8 {
    const FILE_CREATE = 1 << 0;
    const FILE_UPDATE = 1 << 1;
    const FILE_DELETE = 1 << 2;
    const ENV_CHANGE = 1 << 3;
    const OPTION_CHANGE = 1 << 4;
    const STARTUP = 1 << 5;
    const ERROR = 1 << 6;
  }
}

impl Default for InvalidateReason {
  fn default() -> Self {
    InvalidateReason::empty()
  }
}

impl Serialize for InvalidateReason {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    self.bits().serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for InvalidateReason {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let bits = u8::deserialize(deserializer)?;
    Ok(InvalidateReason::from_bits_truncate(bits))
  }
}

/// A memoized unit of build work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestNode<R> {
  pub id: RequestId,
  pub request_type: String,
  pub result: Option<R>,
  pub invalidate_reason: InvalidateReason,
}

impl<R> RequestNode<R> {
  pub fn new(id: impl Into<RequestId>, request_type: impl Into<String>) -> Self {
    RequestNode {
      id: id.into(),
      request_type: request_type.into(),
      result: None,
      invalidate_reason: InvalidateReason::empty(),
    }
  }
}

/// Content at a path. Also anchors "file named X above this path" chains.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
  pub id: NodeId,
  pub path: PathBuf,
}

impl FileNode {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    FileNode {
      id: Self::node_id(&path),
      path,
    }
  }

  pub fn node_id(path: &Path) -> NodeId {
    path.to_string_lossy().into_owned()
  }
}

/// The set of paths matching a glob pattern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobNode {
  pub id: NodeId,
  pub pattern: String,
}

impl GlobNode {
  pub fn new(pattern: impl Into<String>) -> Self {
    let pattern = pattern.into();
    GlobNode {
      id: pattern.clone(),
      pattern,
    }
  }
}

/// One path segment of a "file named X above path P" pattern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileNameNode {
  pub id: NodeId,
  pub file_name: String,
}

impl FileNameNode {
  pub fn new(file_name: impl Into<String>) -> Self {
    let file_name = file_name.into();
    FileNameNode {
      id: Self::node_id(&file_name),
      file_name,
    }
  }

  pub fn node_id(file_name: &str) -> NodeId {
    format!("file_name:{file_name}")
  }
}

/// Any of `path.ext` for `ext` in `extensions`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtensionlessFileNode {
  pub id: NodeId,
  pub path: PathBuf,
  pub extensions: BTreeSet<String>,
}

impl ExtensionlessFileNode {
  pub fn new(path: impl Into<PathBuf>, extensions: BTreeSet<String>) -> Self {
    let path = path.into();
    ExtensionlessFileNode {
      id: Self::node_id(&path),
      path,
      extensions,
    }
  }

  pub fn node_id(path: &Path) -> NodeId {
    format!("extensionless_file:{}", path.to_string_lossy())
  }
}

/// An environment variable and the value it had when a request declared a
/// dependency on it. An unset variable is captured as `None`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvNode {
  pub id: NodeId,
  pub key: String,
  pub value: Option<String>,
}

impl EnvNode {
  pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
    let key = key.into();
    EnvNode {
      id: Self::node_id(&key),
      key,
      value,
    }
  }

  pub fn node_id(key: &str) -> NodeId {
    format!("env:{key}")
  }
}

/// A named option and the stable hash of its value at declaration time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptionNode {
  pub id: NodeId,
  pub key: String,
  pub value_hash: String,
}

impl OptionNode {
  pub fn new(key: impl Into<String>, value_hash: impl Into<String>) -> Self {
    let key = key.into();
    OptionNode {
      id: Self::node_id(&key),
      key,
      value_hash: value_hash.into(),
    }
  }

  pub fn node_id(key: &str) -> NodeId {
    format!("option:{key}")
  }
}

/// A node in the request graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RequestGraphNode<R> {
  Request(RequestNode<R>),
  File(FileNode),
  Glob(GlobNode),
  FileName(FileNameNode),
  ExtensionlessFile(ExtensionlessFileNode),
  Env(EnvNode),
  Option(OptionNode),
}

impl<R> RequestGraphNode<R> {
  pub fn id(&self) -> &str {
    match self {
      RequestGraphNode::Request(node) => &node.id,
      RequestGraphNode::File(node) => &node.id,
      RequestGraphNode::Glob(node) => &node.id,
      RequestGraphNode::FileName(node) => &node.id,
      RequestGraphNode::ExtensionlessFile(node) => &node.id,
      RequestGraphNode::Env(node) => &node.id,
      RequestGraphNode::Option(node) => &node.id,
    }
  }

  pub fn as_request(&self) -> Option<&RequestNode<R>> {
    match self {
      RequestGraphNode::Request(node) => Some(node),
      _ => None,
    }
  }

  pub fn as_request_mut(&mut self) -> Option<&mut RequestNode<R>> {
    match self {
      RequestGraphNode::Request(node) => Some(node),
      _ => None,
    }
  }
}

impl<R> GraphNode for RequestGraphNode<R> {
  fn id(&self) -> &str {
    RequestGraphNode::id(self)
  }
}

impl<R> PartialEq for RequestGraphNode<R> {
  fn eq(&self, other: &Self) -> bool {
    self.id() == other.id()
  }
}

impl<R> Eq for RequestGraphNode<R> {}

impl<R> std::hash::Hash for RequestGraphNode<R> {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.id().hash(state);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ids_encode_kind_and_key() {
    assert_eq!(FileNode::new("/a/b.js").id, "/a/b.js");
    assert_eq!(GlobNode::new("/src/**/*.js").id, "/src/**/*.js");
    assert_eq!(
      FileNameNode::new("package.json").id,
      "file_name:package.json"
    );
    assert_eq!(
      ExtensionlessFileNode::new("/src/foo", BTreeSet::new()).id,
      "extensionless_file:/src/foo"
    );
    assert_eq!(EnvNode::new("NODE_ENV", None).id, "env:NODE_ENV");
    assert_eq!(OptionNode::new("mode", "abc").id, "option:mode");
  }

  #[test]
  fn equality_is_by_id() {
    let captured = RequestGraphNode::<()>::Env(EnvNode::new("NODE_ENV", Some("test".into())));
    let unset = RequestGraphNode::<()>::Env(EnvNode::new("NODE_ENV", None));

    assert_eq!(captured, unset);
  }

  #[test]
  fn invalidate_reason_round_trips_through_bits() {
    let reason = InvalidateReason::FILE_UPDATE | InvalidateReason::STARTUP;
    let bytes = bincode::serialize(&reason).unwrap();
    let restored: InvalidateReason = bincode::deserialize(&bytes).unwrap();

    assert_eq!(reason, restored);
  }
}

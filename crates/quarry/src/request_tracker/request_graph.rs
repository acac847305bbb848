use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;

use anyhow::anyhow;
use glob_match::glob_match;
use petgraph::stable_graph::NodeIndex;
use serde::Deserialize;
use serde::Serialize;

use quarry_core::graph::Graph;
use quarry_core::hash::hash_string;
use quarry_core::types::FileCreateInvalidation;
use quarry_core::types::Invalidation;

use crate::watch::WatchEvent;
use crate::watch::WatchEvents;

use super::node::EnvNode;
use super::node::ExtensionlessFileNode;
use super::node::FileNameNode;
use super::node::FileNode;
use super::node::GlobNode;
use super::node::InvalidateReason;
use super::node::NodeId;
use super::node::OptionNode;
use super::node::RequestGraphNode;
use super::node::RequestNode;
use super::request::RequestId;
use super::request::TrackerError;

/// Relations between request graph nodes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum RequestGraphEdge {
  /// Request -> Request: the parent is memoized through the child.
  Subrequest,
  /// Request -> File | Env | Option: re-run when the target changes.
  InvalidatedByUpdate,
  /// Request -> File: re-run when the target disappears.
  InvalidatedByDelete,
  /// Request -> File | Glob | ExtensionlessFile: re-run when something
  /// matching the target appears.
  InvalidatedByCreate,
  /// File -> FileName: anchors a "file named X above this path" chain.
  InvalidatedByCreateAbove,
  /// FileName -> FileName: path segments walking toward the root, used to
  /// match compound file name patterns upward from a created file.
  Dirname,
}

/// Snapshot of an invalid request, reported to build drivers.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidRequest {
  pub id: RequestId,
  pub request_type: String,
  pub reason: InvalidateReason,
}

/// The persistent request graph: requests, the state they depend on, and the
/// relations between them.
///
/// All mutation happens through the operations below so the auxiliary id
/// indices stay consistent with the node set.
pub struct RequestGraph<R> {
  pub(super) graph: Graph<RequestGraphNode<R>, RequestGraphEdge>,
  pub(super) invalid_request_ids: HashSet<NodeId>,
  pub(super) incomplete_request_ids: HashSet<NodeId>,
  pub(super) glob_node_ids: HashSet<NodeId>,
  pub(super) env_node_ids: HashSet<NodeId>,
  pub(super) option_node_ids: HashSet<NodeId>,
  pub(super) unpredictable_request_ids: HashSet<NodeId>,
}

impl<R: Clone> RequestGraph<R> {
  pub fn new() -> Self {
    RequestGraph {
      graph: Graph::new(),
      invalid_request_ids: HashSet::new(),
      incomplete_request_ids: HashSet::new(),
      glob_node_ids: HashSet::new(),
      env_node_ids: HashSet::new(),
      option_node_ids: HashSet::new(),
      unpredictable_request_ids: HashSet::new(),
    }
  }

  pub(super) fn add_node(&mut self, node: RequestGraphNode<R>) -> NodeIndex {
    if let Some(index) = self.graph.node_index(node.id()) {
      return index;
    }

    let id = node.id().to_string();
    match &node {
      RequestGraphNode::Glob(_) => {
        self.glob_node_ids.insert(id);
      }
      RequestGraphNode::Env(_) => {
        self.env_node_ids.insert(id);
      }
      RequestGraphNode::Option(_) => {
        self.option_node_ids.insert(id);
      }
      _ => {}
    }

    self.graph.add_node(node)
  }

  /// Remove a node, its incident edges, and its entries in every index.
  pub fn remove_node(&mut self, id: &str) {
    self.invalid_request_ids.remove(id);
    self.incomplete_request_ids.remove(id);
    self.unpredictable_request_ids.remove(id);
    self.glob_node_ids.remove(id);
    self.env_node_ids.remove(id);
    self.option_node_ids.remove(id);
    self.graph.remove_node(id);
  }

  pub fn has_node(&self, id: &str) -> bool {
    self.graph.has_node(id)
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  fn request_node_index(&self, request_id: &str) -> anyhow::Result<NodeIndex> {
    let index = self
      .graph
      .node_index(request_id)
      .ok_or_else(|| anyhow!("request {request_id} is not in the graph"))?;

    match self.graph.node_weight(index) {
      Some(RequestGraphNode::Request(_)) => Ok(index),
      _ => Err(anyhow!("node {request_id} is not a request")),
    }
  }

  /// Insert the request node if it is new, otherwise clear its previous
  /// invalidations so the re-run can declare a fresh set. Marks the request
  /// incomplete either way.
  pub fn start_request(&mut self, request_id: &str, request_type: &str) -> anyhow::Result<()> {
    if self.graph.has_node(request_id) {
      self.clear_invalidations(request_id)?;
    } else {
      self.add_node(RequestGraphNode::Request(RequestNode::new(
        request_id,
        request_type,
      )));
    }

    self.incomplete_request_ids.insert(request_id.to_string());
    self.invalid_request_ids.remove(request_id);
    Ok(())
  }

  pub fn store_result(&mut self, request_id: &str, result: R) -> anyhow::Result<()> {
    let index = self.request_node_index(request_id)?;
    if let Some(node) = self.graph.node_weight_mut(index).and_then(|n| n.as_request_mut()) {
      node.result = Some(result);
    }
    Ok(())
  }

  /// The result stored by the last successful run, if any.
  pub fn get_request_result(&self, request_id: &str) -> Option<R> {
    let index = self.graph.node_index(request_id)?;
    self
      .graph
      .node_weight(index)?
      .as_request()?
      .result
      .clone()
  }

  /// A request has a usable memoized result when its node exists and it is
  /// neither invalid nor still running.
  pub fn has_valid_result(&self, request_id: &str) -> bool {
    let is_request = self
      .graph
      .node_index(request_id)
      .and_then(|index| self.graph.node_weight(index))
      .is_some_and(|node| node.as_request().is_some());

    is_request
      && !self.invalid_request_ids.contains(request_id)
      && !self.incomplete_request_ids.contains(request_id)
  }

  pub fn complete_request(&mut self, request_id: &str) {
    self.invalid_request_ids.remove(request_id);
    self.incomplete_request_ids.remove(request_id);

    if let Some(node) = self
      .graph
      .node_index(request_id)
      .and_then(|index| self.graph.node_weight_mut(index))
      .and_then(|node| node.as_request_mut())
    {
      node.invalidate_reason = InvalidateReason::empty();
    }
  }

  pub fn reject_request(&mut self, request_id: &str) {
    self.incomplete_request_ids.remove(request_id);

    if let Some(index) = self.graph.node_index(request_id) {
      self.invalid_request_ids.insert(request_id.to_string());
      if let Some(node) = self
        .graph
        .node_weight_mut(index)
        .and_then(|node| node.as_request_mut())
      {
        node.invalidate_reason |= InvalidateReason::ERROR;
      }
    }
  }

  /// Replace the request's subrequest edges with exactly the recorded set.
  ///
  /// Runs on success and on failure alike, so a partially failed run leaves
  /// the subrequest relation describing what actually executed.
  pub fn replace_subrequests(&mut self, request_id: &str, subrequest_ids: &BTreeSet<RequestId>) {
    let Some(index) = self.graph.node_index(request_id) else {
      return;
    };

    let targets: Vec<NodeIndex> = subrequest_ids
      .iter()
      .filter_map(|id| {
        let target = self.graph.node_index(id);
        if target.is_none() {
          tracing::trace!(subrequest_id = %id, "subrequest is no longer in the graph");
        }
        target
      })
      .collect();

    self
      .graph
      .replace_nodes_connected_to(index, &targets, RequestGraphEdge::Subrequest);
  }

  /// Ids of the request's current subrequests.
  pub fn get_subrequests(&self, request_id: &str) -> Vec<RequestId> {
    let Some(index) = self.graph.node_index(request_id) else {
      return Vec::new();
    };

    let mut ids: Vec<RequestId> = self
      .graph
      .nodes_connected_from(index, RequestGraphEdge::Subrequest)
      .into_iter()
      .filter_map(|child| Some(self.graph.node_weight(child)?.id().to_string()))
      .collect();
    ids.sort();
    ids
  }

  pub fn invalidate_on_file_update(
    &mut self,
    request_id: &str,
    path: PathBuf,
  ) -> anyhow::Result<()> {
    let request_index = self.request_node_index(request_id)?;
    let file_index = self.add_node(RequestGraphNode::File(FileNode::new(path)));
    self
      .graph
      .add_edge(request_index, file_index, RequestGraphEdge::InvalidatedByUpdate);
    Ok(())
  }

  pub fn invalidate_on_file_delete(
    &mut self,
    request_id: &str,
    path: PathBuf,
  ) -> anyhow::Result<()> {
    let request_index = self.request_node_index(request_id)?;
    let file_index = self.add_node(RequestGraphNode::File(FileNode::new(path)));
    self
      .graph
      .add_edge(request_index, file_index, RequestGraphEdge::InvalidatedByDelete);
    Ok(())
  }

  pub fn invalidate_on_file_create(
    &mut self,
    request_id: &str,
    input: &FileCreateInvalidation,
  ) -> anyhow::Result<()> {
    let request_index = self.request_node_index(request_id)?;

    let target_index = match input {
      FileCreateInvalidation::Glob { glob } => {
        if glob.is_empty() {
          return Err(invalid_invalidation("glob pattern is empty"));
        }
        self.add_node(RequestGraphNode::Glob(GlobNode::new(glob.clone())))
      }

      FileCreateInvalidation::ExtensionlessFile { path, extensions } => {
        if extensions.is_empty() {
          return Err(invalid_invalidation("extension set is empty"));
        }

        match self.graph.node_index(&ExtensionlessFileNode::node_id(path)) {
          Some(index) => {
            // Union first, then ensure the edge below: bailing out on an
            // existing node would drop a second declarer's edge.
            if let Some(RequestGraphNode::ExtensionlessFile(existing)) =
              self.graph.node_weight_mut(index)
            {
              existing.extensions.extend(extensions.iter().cloned());
            }
            index
          }
          None => self.add_node(RequestGraphNode::ExtensionlessFile(
            ExtensionlessFileNode::new(path.clone(), extensions.clone()),
          )),
        }
      }

      FileCreateInvalidation::FileName {
        file_name,
        above_path,
      } => {
        if file_name.is_empty() {
          return Err(invalid_invalidation("file name is empty"));
        }
        if above_path.is_relative() {
          return Err(invalid_invalidation("above path must be absolute"));
        }

        // Build the chain leaf first; each dirname edge points one segment
        // closer to the root, mirroring the responder's upward walk.
        let mut last_index: Option<NodeIndex> = None;
        for part in file_name.split('/').rev() {
          let index = self.add_node(RequestGraphNode::FileName(FileNameNode::new(part)));
          if let Some(last) = last_index {
            self.graph.add_edge(last, index, RequestGraphEdge::Dirname);
          }
          last_index = Some(index);
        }

        let file_index = self.add_node(RequestGraphNode::File(FileNode::new(above_path.clone())));
        if let Some(last) = last_index {
          self
            .graph
            .add_edge(file_index, last, RequestGraphEdge::InvalidatedByCreateAbove);
        }
        file_index
      }
    };

    self
      .graph
      .add_edge(request_index, target_index, RequestGraphEdge::InvalidatedByCreate);
    Ok(())
  }

  /// Record that the request can only be proven fresh by running it, so it
  /// re-runs at least once per process start.
  pub fn invalidate_on_startup(&mut self, request_id: &str) -> anyhow::Result<()> {
    self.request_node_index(request_id)?;
    self.unpredictable_request_ids.insert(request_id.to_string());
    Ok(())
  }

  pub fn invalidate_on_env_change(
    &mut self,
    request_id: &str,
    key: String,
    value: Option<String>,
  ) -> anyhow::Result<()> {
    let request_index = self.request_node_index(request_id)?;

    let env_index = match self.graph.node_index(&EnvNode::node_id(&key)) {
      Some(index) => {
        // Re-declaration captures the value the variable has now.
        if let Some(RequestGraphNode::Env(existing)) = self.graph.node_weight_mut(index) {
          existing.value = value;
        }
        index
      }
      None => self.add_node(RequestGraphNode::Env(EnvNode::new(key, value))),
    };

    self
      .graph
      .add_edge(request_index, env_index, RequestGraphEdge::InvalidatedByUpdate);
    Ok(())
  }

  pub fn invalidate_on_option_change(
    &mut self,
    request_id: &str,
    key: String,
    value: &serde_json::Value,
  ) -> anyhow::Result<()> {
    let request_index = self.request_node_index(request_id)?;
    let value_hash = hash_option_value(value);

    let option_index = match self.graph.node_index(&OptionNode::node_id(&key)) {
      Some(index) => {
        if let Some(RequestGraphNode::Option(existing)) = self.graph.node_weight_mut(index) {
          existing.value_hash = value_hash;
        }
        index
      }
      None => self.add_node(RequestGraphNode::Option(OptionNode::new(key, value_hash))),
    };

    self
      .graph
      .add_edge(request_index, option_index, RequestGraphEdge::InvalidatedByUpdate);
    Ok(())
  }

  /// Drop everything the request declared so a re-run starts from a clean
  /// slate: its unpredictable flag and all update, delete and create edges.
  pub fn clear_invalidations(&mut self, request_id: &str) -> anyhow::Result<()> {
    let index = self.request_node_index(request_id)?;
    self.unpredictable_request_ids.remove(request_id);

    for kind in [
      RequestGraphEdge::InvalidatedByUpdate,
      RequestGraphEdge::InvalidatedByDelete,
      RequestGraphEdge::InvalidatedByCreate,
    ] {
      self.graph.replace_nodes_connected_to(index, &[], kind);
    }

    Ok(())
  }

  /// The file and env dependencies currently declared by the request.
  pub fn get_invalidations(&self, request_id: &str) -> Vec<Invalidation> {
    let Some(index) = self.graph.node_index(request_id) else {
      return Vec::new();
    };

    self
      .graph
      .nodes_connected_from(index, RequestGraphEdge::InvalidatedByUpdate)
      .into_iter()
      .filter_map(|target| match self.graph.node_weight(target) {
        Some(RequestGraphNode::File(file)) => Some(Invalidation::FileChange {
          path: file.path.clone(),
        }),
        Some(RequestGraphNode::Env(env)) => Some(Invalidation::EnvChange {
          name: env.key.clone(),
        }),
        _ => None,
      })
      .collect()
  }

  pub fn invalidate_reason(&self, request_id: &str) -> InvalidateReason {
    self
      .graph
      .node_index(request_id)
      .and_then(|index| self.graph.node_weight(index))
      .and_then(|node| node.as_request())
      .map(|node| node.invalidate_reason)
      .unwrap_or_default()
  }

  /// Mark the request invalid and propagate through subrequest parents.
  pub fn invalidate_node(&mut self, request_id: &str, reason: InvalidateReason) {
    if let Some(index) = self.graph.node_index(request_id) {
      self.invalidate_node_index(index, reason);
    }
  }

  /// Breadth-first walk up the subrequest relation. Subrequest chains are
  /// acyclic by contract, but a misused graph must not hang us, hence the
  /// visited set.
  fn invalidate_node_index(&mut self, start: NodeIndex, reason: InvalidateReason) {
    let mut queue = VecDeque::from([start]);
    let mut visited = HashSet::from([start]);

    while let Some(index) = queue.pop_front() {
      let Some(node) = self
        .graph
        .node_weight_mut(index)
        .and_then(|node| node.as_request_mut())
      else {
        continue;
      };

      node.invalidate_reason |= reason;
      let id = node.id.clone();
      tracing::trace!(request_id = %id, ?reason, "invalidate request");
      self.invalid_request_ids.insert(id);

      for parent in self
        .graph
        .nodes_connected_to(index, RequestGraphEdge::Subrequest)
      {
        if visited.insert(parent) {
          queue.push_back(parent);
        }
      }
    }
  }

  /// Invalidate every request that must re-run each process start.
  pub fn invalidate_unpredictable_nodes(&mut self) -> bool {
    let invalid_before = self.invalid_request_ids.len();

    let ids: Vec<NodeId> = self.unpredictable_request_ids.iter().cloned().collect();
    for id in ids {
      self.invalidate_node(&id, InvalidateReason::STARTUP);
    }

    self.invalid_request_ids.len() != invalid_before
  }

  /// Compare every captured env value against `env` and invalidate the
  /// requests watching variables that changed.
  pub fn invalidate_env_nodes(&mut self, env: &BTreeMap<String, String>) -> bool {
    let invalid_before = self.invalid_request_ids.len();

    let ids: Vec<NodeId> = self.env_node_ids.iter().cloned().collect();
    for id in ids {
      let Some(index) = self.graph.node_index(&id) else {
        continue;
      };
      let changed = match self.graph.node_weight(index) {
        Some(RequestGraphNode::Env(node)) => env.get(&node.key) != node.value.as_ref(),
        _ => false,
      };
      if changed {
        self.invalidate_incoming(
          index,
          RequestGraphEdge::InvalidatedByUpdate,
          InvalidateReason::ENV_CHANGE,
        );
      }
    }

    self.invalid_request_ids.len() != invalid_before
  }

  /// Compare every captured option hash against `options` and invalidate the
  /// requests watching options that changed.
  pub fn invalidate_option_nodes(&mut self, options: &BTreeMap<String, serde_json::Value>) -> bool {
    let invalid_before = self.invalid_request_ids.len();

    let ids: Vec<NodeId> = self.option_node_ids.iter().cloned().collect();
    for id in ids {
      let Some(index) = self.graph.node_index(&id) else {
        continue;
      };
      let changed = match self.graph.node_weight(index) {
        Some(RequestGraphNode::Option(node)) => {
          let current = options.get(&node.key).cloned().unwrap_or(serde_json::Value::Null);
          hash_option_value(&current) != node.value_hash
        }
        _ => false,
      };
      if changed {
        self.invalidate_incoming(
          index,
          RequestGraphEdge::InvalidatedByUpdate,
          InvalidateReason::OPTION_CHANGE,
        );
      }
    }

    self.invalid_request_ids.len() != invalid_before
  }

  /// Snapshot of the currently invalid requests, sorted by id.
  pub fn get_invalid_requests(&self) -> Vec<InvalidRequest> {
    let mut requests: Vec<InvalidRequest> = self
      .invalid_request_ids
      .iter()
      .filter_map(|id| {
        let index = self.graph.node_index(id)?;
        let node = self.graph.node_weight(index)?.as_request()?;
        Some(InvalidRequest {
          id: node.id.clone(),
          request_type: node.request_type.clone(),
          reason: node.invalidate_reason,
        })
      })
      .collect();
    requests.sort_by(|a, b| a.id.cmp(&b.id));
    requests
  }

  /// Forget the invalid set. Called by build drivers after a completed build
  /// to drop entries for requests that were reconstructed under new ids and
  /// will never be re-run, which would otherwise report a rebuild forever.
  pub fn clear_invalid_nodes(&mut self) {
    self.invalid_request_ids.clear();
  }

  /// Apply a batch of watcher events in order. Returns whether any request
  /// became invalid.
  #[tracing::instrument(level = "info", skip_all, fields(events = events.len()))]
  pub fn respond_to_fs_events(&mut self, events: &WatchEvents) -> bool {
    let invalid_before = self.invalid_request_ids.len();

    for event in events {
      match event {
        WatchEvent::Create(path) => {
          if self.graph.has_node(&FileNode::node_id(path)) {
            // Some platforms surface updates to tracked files as creates;
            // an existing file node means this is really an update.
            self.respond_to_file_change(path, RequestGraphEdge::InvalidatedByUpdate);
          } else {
            self.respond_to_file_create(path);
          }
        }
        WatchEvent::Update(path) => {
          self.respond_to_file_change(path, RequestGraphEdge::InvalidatedByUpdate);
        }
        WatchEvent::Delete(path) => {
          self.respond_to_file_change(path, RequestGraphEdge::InvalidatedByDelete);
        }
      }
    }

    let became_invalid = self.invalid_request_ids.len() != invalid_before;
    if became_invalid {
      tracing::info!(
        invalid_requests = self.invalid_request_ids.len(),
        "file system events invalidated requests"
      );
    }
    became_invalid
  }

  fn respond_to_file_change(&mut self, path: &Path, kind: RequestGraphEdge) {
    let reason = match kind {
      RequestGraphEdge::InvalidatedByDelete => InvalidateReason::FILE_DELETE,
      _ => InvalidateReason::FILE_UPDATE,
    };

    // Events for paths nothing subscribed to are ignored.
    if let Some(index) = self.graph.node_index(&FileNode::node_id(path)) {
      self.invalidate_incoming(index, kind, reason);
    }
  }

  fn respond_to_file_create(&mut self, path: &Path) {
    // A sibling with a watched extension appeared.
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
      let stem = path.with_extension("");
      if let Some(index) = self.graph.node_index(&ExtensionlessFileNode::node_id(&stem)) {
        let matches = matches!(
          self.graph.node_weight(index),
          Some(RequestGraphNode::ExtensionlessFile(node))
            if node.extensions.contains(&format!(".{extension}"))
        );
        if matches {
          self.invalidate_incoming(
            index,
            RequestGraphEdge::InvalidatedByCreate,
            InvalidateReason::FILE_CREATE,
          );
        }
      }
    }

    // The file's name may complete a "file named X above path P" pattern.
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
      if let Some(index) = self.graph.node_index(&FileNameNode::node_id(name)) {
        self.invalidate_file_name(index, path);
      }
    }

    // Globs watch the whole tree, so every pattern gets a chance.
    let path_str = path.to_string_lossy();
    let globs: Vec<NodeId> = self.glob_node_ids.iter().cloned().collect();
    for glob in globs {
      if glob_match(&glob, &path_str) {
        if let Some(index) = self.graph.node_index(&glob) {
          self.invalidate_incoming(
            index,
            RequestGraphEdge::InvalidatedByCreate,
            InvalidateReason::FILE_CREATE,
          );
        }
      }
    }
  }

  /// Walk a file name chain upward from the created file. At each segment,
  /// anchored files whose directory lies inside the created file's directory
  /// invalidate their watchers; the walk continues while the parent
  /// directory's basename matches the next chain segment.
  fn invalidate_file_name(&mut self, file_name_index: NodeIndex, path: &Path) {
    let Some(directory) = path.parent() else {
      return;
    };

    for file_index in self
      .graph
      .nodes_connected_to(file_name_index, RequestGraphEdge::InvalidatedByCreateAbove)
    {
      let is_above = match self.graph.node_weight(file_index) {
        Some(RequestGraphNode::File(file)) => file
          .path
          .parent()
          .is_some_and(|file_dir| is_directory_inside(file_dir, directory)),
        _ => false,
      };
      if is_above {
        self.invalidate_incoming(
          file_index,
          RequestGraphEdge::InvalidatedByCreate,
          InvalidateReason::FILE_CREATE,
        );
      }
    }

    if let Some(parent_name) = directory.file_name().and_then(|n| n.to_str()) {
      if let Some(parent_index) = self.graph.node_index(&FileNameNode::node_id(parent_name)) {
        if self
          .graph
          .has_edge(file_name_index, parent_index, RequestGraphEdge::Dirname)
        {
          self.invalidate_file_name(parent_index, directory);
        }
      }
    }
  }

  fn invalidate_incoming(
    &mut self,
    index: NodeIndex,
    kind: RequestGraphEdge,
    reason: InvalidateReason,
  ) {
    for requester in self.graph.nodes_connected_to(index, kind) {
      self.invalidate_node_index(requester, reason);
    }
  }
}

impl<R: Clone> Default for RequestGraph<R> {
  fn default() -> Self {
    Self::new()
  }
}

fn invalid_invalidation(reason: &str) -> anyhow::Error {
  TrackerError::InvalidInvalidation {
    reason: reason.to_string(),
  }
  .into()
}

/// Stable hash of an option value. serde_json keeps object keys sorted, so
/// structurally equal values print identically regardless of insertion order.
fn hash_option_value(value: &serde_json::Value) -> String {
  hash_string(value.to_string())
}

fn is_directory_inside(child: &Path, parent: &Path) -> bool {
  child.starts_with(parent)
}

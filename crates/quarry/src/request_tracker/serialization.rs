use std::collections::HashSet;

use anyhow::anyhow;
use serde::Deserialize;
use serde::Serialize;

use super::node::NodeId;
use super::node::RequestGraphNode;
use super::request::RequestResult;
use super::request_graph::RequestGraph;
use super::request_graph::RequestGraphEdge;

/// Layout independent encoding of a [`RequestGraph`].
///
/// Nodes are written in graph order and edges refer to nodes by id, so the
/// record does not depend on in-memory indices and can be restored by a
/// later process. Id sets are written sorted, which makes
/// serialize -> deserialize -> serialize byte stable.
#[derive(Debug, Serialize, Deserialize)]
pub(super) struct SerializedRequestGraph<R> {
  nodes: Vec<RequestGraphNode<R>>,
  edges: Vec<SerializedEdge>,
  invalid_request_ids: Vec<NodeId>,
  incomplete_request_ids: Vec<NodeId>,
  glob_node_ids: Vec<NodeId>,
  env_node_ids: Vec<NodeId>,
  option_node_ids: Vec<NodeId>,
  unpredictable_request_ids: Vec<NodeId>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SerializedEdge {
  from: NodeId,
  to: NodeId,
  kind: RequestGraphEdge,
}

fn sorted(ids: &HashSet<NodeId>) -> Vec<NodeId> {
  let mut ids: Vec<NodeId> = ids.iter().cloned().collect();
  ids.sort();
  ids
}

impl<R: RequestResult> RequestGraph<R> {
  pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
    Ok(bincode::serialize(&self.to_serialized())?)
  }

  pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
    Self::from_serialized(bincode::deserialize(bytes)?)
  }

  fn to_serialized(&self) -> SerializedRequestGraph<R> {
    let nodes: Vec<RequestGraphNode<R>> = self.graph.nodes().cloned().collect();

    let edges: Vec<SerializedEdge> = self
      .graph
      .edges()
      .filter_map(|(from, to, kind)| {
        Some(SerializedEdge {
          from: self.graph.node_weight(from)?.id().to_string(),
          to: self.graph.node_weight(to)?.id().to_string(),
          kind,
        })
      })
      .collect();

    SerializedRequestGraph {
      nodes,
      edges,
      invalid_request_ids: sorted(&self.invalid_request_ids),
      incomplete_request_ids: sorted(&self.incomplete_request_ids),
      glob_node_ids: sorted(&self.glob_node_ids),
      env_node_ids: sorted(&self.env_node_ids),
      option_node_ids: sorted(&self.option_node_ids),
      unpredictable_request_ids: sorted(&self.unpredictable_request_ids),
    }
  }

  fn from_serialized(serialized: SerializedRequestGraph<R>) -> anyhow::Result<Self> {
    let mut graph = RequestGraph::new();

    // Adding through the graph's own insertion path rebuilds the glob, env
    // and option indices from the nodes themselves.
    for node in serialized.nodes {
      graph.add_node(node);
    }

    for edge in serialized.edges {
      let from = graph
        .graph
        .node_index(&edge.from)
        .ok_or_else(|| anyhow!("graph record references unknown node {}", edge.from))?;
      let to = graph
        .graph
        .node_index(&edge.to)
        .ok_or_else(|| anyhow!("graph record references unknown node {}", edge.to))?;
      graph.graph.add_edge(from, to, edge.kind);
    }

    for ids in [
      &serialized.invalid_request_ids,
      &serialized.incomplete_request_ids,
      &serialized.unpredictable_request_ids,
    ] {
      for id in ids {
        if !graph.has_node(id) {
          return Err(anyhow!("graph record references unknown request {id}"));
        }
      }
    }

    graph.invalid_request_ids = serialized.invalid_request_ids.into_iter().collect();
    graph.incomplete_request_ids = serialized.incomplete_request_ids.into_iter().collect();
    graph.unpredictable_request_ids = serialized.unpredictable_request_ids.into_iter().collect();

    Ok(graph)
  }
}

use std::collections::HashMap;

use petgraph::stable_graph::EdgeIndex;
use petgraph::stable_graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;

/// Node weights stored in a [`Graph`] expose a stable content id.
///
/// Ids are derived from the node's payload and survive process restarts,
/// unlike [`NodeIndex`] values which are an artifact of insertion order.
pub trait GraphNode {
  fn id(&self) -> &str;
}

/// A directed multigraph with labeled edges and content addressed nodes.
///
/// Nodes are keyed by the id exposed through [`GraphNode`]; adding a node
/// whose id is already present is a no-op that returns the existing index.
/// Edges are keyed by `(from, to, kind)` and adding one twice leaves the
/// graph unchanged.
#[derive(Debug)]
pub struct Graph<N, E> {
  graph: StableDiGraph<N, E>,
  node_index: HashMap<String, NodeIndex>,
}

impl<N: GraphNode, E: Copy + PartialEq> Graph<N, E> {
  pub fn new() -> Self {
    Graph {
      graph: StableDiGraph::new(),
      node_index: HashMap::new(),
    }
  }

  pub fn add_node(&mut self, node: N) -> NodeIndex {
    if let Some(index) = self.node_index.get(node.id()) {
      return *index;
    }

    let id = node.id().to_string();
    let index = self.graph.add_node(node);
    self.node_index.insert(id, index);
    index
  }

  pub fn has_node(&self, id: &str) -> bool {
    self.node_index.contains_key(id)
  }

  pub fn node_index(&self, id: &str) -> Option<NodeIndex> {
    self.node_index.get(id).copied()
  }

  pub fn node_weight(&self, index: NodeIndex) -> Option<&N> {
    self.graph.node_weight(index)
  }

  pub fn node_weight_mut(&mut self, index: NodeIndex) -> Option<&mut N> {
    self.graph.node_weight_mut(index)
  }

  /// Remove a node and every edge incident to it.
  pub fn remove_node(&mut self, id: &str) -> Option<N> {
    let index = self.node_index.remove(id)?;
    self.graph.remove_node(index)
  }

  pub fn add_edge(&mut self, from: NodeIndex, to: NodeIndex, kind: E) {
    if !self.has_edge(from, to, kind) {
      self.graph.add_edge(from, to, kind);
    }
  }

  pub fn has_edge(&self, from: NodeIndex, to: NodeIndex, kind: E) -> bool {
    self
      .graph
      .edges_directed(from, Direction::Outgoing)
      .any(|edge| edge.target() == to && *edge.weight() == kind)
  }

  /// Outgoing neighbors reached through edges of the given kind.
  pub fn nodes_connected_from(&self, index: NodeIndex, kind: E) -> Vec<NodeIndex> {
    self
      .graph
      .edges_directed(index, Direction::Outgoing)
      .filter(|edge| *edge.weight() == kind)
      .map(|edge| edge.target())
      .collect()
  }

  /// Incoming neighbors that reach this node through edges of the given kind.
  pub fn nodes_connected_to(&self, index: NodeIndex, kind: E) -> Vec<NodeIndex> {
    self
      .graph
      .edges_directed(index, Direction::Incoming)
      .filter(|edge| *edge.weight() == kind)
      .map(|edge| edge.source())
      .collect()
  }

  /// Replace the out-edges of the given kind so they point at exactly
  /// `targets`: edges to nodes outside the set are removed and missing
  /// edges are added. Nodes orphaned by edge removal stay in the graph.
  pub fn replace_nodes_connected_to(&mut self, from: NodeIndex, targets: &[NodeIndex], kind: E) {
    let current: Vec<(EdgeIndex, NodeIndex)> = self
      .graph
      .edges_directed(from, Direction::Outgoing)
      .filter(|edge| *edge.weight() == kind)
      .map(|edge| (edge.id(), edge.target()))
      .collect();

    for (edge, target) in current.iter() {
      if !targets.contains(target) {
        self.graph.remove_edge(*edge);
      }
    }

    for target in targets {
      if !current.iter().any(|(_, existing)| existing == target) {
        self.add_edge(from, *target, kind);
      }
    }
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }

  pub fn edge_count(&self) -> usize {
    self.graph.edge_count()
  }

  /// Node weights in stable index order.
  pub fn nodes(&self) -> impl Iterator<Item = &N> {
    self.graph.node_weights()
  }

  /// Every edge as a `(from, to, kind)` triple in stable index order.
  pub fn edges(&self) -> impl Iterator<Item = (NodeIndex, NodeIndex, E)> + '_ {
    self.graph.edge_indices().filter_map(|index| {
      let (from, to) = self.graph.edge_endpoints(index)?;
      Some((from, to, *self.graph.edge_weight(index)?))
    })
  }
}

impl<N: GraphNode, E: Copy + PartialEq> Default for Graph<N, E> {
  fn default() -> Self {
    Self::new()
  }
}

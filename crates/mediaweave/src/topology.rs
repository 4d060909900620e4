//! Playback topology
//!
//! Graph of source-stream, transform, tee and output nodes using petgraph's
//! StableGraph. Edges connect an output stream index of one node to an input
//! stream index of the next. Cloning keeps the topology id, so a resolved
//! copy is recognisably the same topology.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use petgraph::algo::toposort;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::descriptor::{PresentationDescriptor, StreamDescriptor};
use crate::error::{MediaError, MediaResult};
use crate::sink::StreamSink;
use crate::source::MediaSource;
use crate::transform::Transform;

bitflags! {
    /// What the resolver may insert in front of an output node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ConnectMethod: u32 {
        const ALLOW_CONVERTER = 0x1;
        /// Decoders and converters.
        const ALLOW_DECODER = 0x3;
    }
}

impl ConnectMethod {
    /// Connect source and sink without inserting anything.
    pub const DIRECT: ConnectMethod = ConnectMethod::empty();
}

impl Default for ConnectMethod {
    fn default() -> Self {
        ConnectMethod::ALLOW_DECODER
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    SourceStream,
    Transform,
    Tee,
    Output,
}

/// The object a node stands for. Objects are optional so a topology can be
/// built up piecemeal; validation reports what is missing.
#[derive(Clone)]
pub enum NodeObject {
    SourceStream {
        source: Option<Arc<dyn MediaSource>>,
        presentation: Option<Arc<PresentationDescriptor>>,
        stream: Option<StreamDescriptor>,
    },
    Transform(Option<Arc<dyn Transform>>),
    Tee,
    Output(Option<Arc<dyn StreamSink>>),
}

impl NodeObject {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeObject::SourceStream { .. } => NodeKind::SourceStream,
            NodeObject::Transform(_) => NodeKind::Transform,
            NodeObject::Tee => NodeKind::Tee,
            NodeObject::Output(_) => NodeKind::Output,
        }
    }
}

#[derive(Clone)]
pub struct TopologyNode {
    pub id: Uuid,
    pub name: String,
    pub object: NodeObject,
    pub connect_method: ConnectMethod,
    /// Inserted by the resolver as a decoder.
    pub decoder: bool,
}

impl TopologyNode {
    fn with_object(name: &str, object: NodeObject) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            object,
            connect_method: ConnectMethod::default(),
            decoder: false,
        }
    }

    pub fn source_stream(name: &str) -> Self {
        Self::with_object(
            name,
            NodeObject::SourceStream {
                source: None,
                presentation: None,
                stream: None,
            },
        )
    }

    pub fn transform(name: &str, transform: Arc<dyn Transform>) -> Self {
        Self::with_object(name, NodeObject::Transform(Some(transform)))
    }

    pub fn tee(name: &str) -> Self {
        Self::with_object(name, NodeObject::Tee)
    }

    pub fn output(name: &str) -> Self {
        Self::with_object(name, NodeObject::Output(None))
    }

    pub fn kind(&self) -> NodeKind {
        self.object.kind()
    }

    /// Attach a source; ignored on non-source nodes.
    pub fn set_source(&mut self, new_source: Arc<dyn MediaSource>) {
        if let NodeObject::SourceStream { source, .. } = &mut self.object {
            *source = Some(new_source);
        }
    }

    pub fn set_descriptors(
        &mut self,
        new_presentation: Arc<PresentationDescriptor>,
        new_stream: StreamDescriptor,
    ) {
        if let NodeObject::SourceStream {
            presentation,
            stream,
            ..
        } = &mut self.object
        {
            *presentation = Some(new_presentation);
            *stream = Some(new_stream);
        }
    }

    pub fn set_sink(&mut self, stream_sink: Arc<dyn StreamSink>) {
        if let NodeObject::Output(sink) = &mut self.object {
            *sink = Some(stream_sink);
        }
    }

    pub fn with_source(mut self, source: Arc<dyn MediaSource>) -> Self {
        self.set_source(source);
        self
    }

    pub fn with_descriptors(
        mut self,
        presentation: Arc<PresentationDescriptor>,
        stream: StreamDescriptor,
    ) -> Self {
        self.set_descriptors(presentation, stream);
        self
    }

    pub fn with_sink(mut self, stream_sink: Arc<dyn StreamSink>) -> Self {
        self.set_sink(stream_sink);
        self
    }

    pub fn with_connect_method(mut self, method: ConnectMethod) -> Self {
        self.connect_method = method;
        self
    }

    pub fn source(&self) -> Option<&Arc<dyn MediaSource>> {
        match &self.object {
            NodeObject::SourceStream { source, .. } => source.as_ref(),
            _ => None,
        }
    }

    pub fn presentation(&self) -> Option<&Arc<PresentationDescriptor>> {
        match &self.object {
            NodeObject::SourceStream { presentation, .. } => presentation.as_ref(),
            _ => None,
        }
    }

    pub fn stream(&self) -> Option<&StreamDescriptor> {
        match &self.object {
            NodeObject::SourceStream { stream, .. } => stream.as_ref(),
            _ => None,
        }
    }

    pub fn sink(&self) -> Option<&Arc<dyn StreamSink>> {
        match &self.object {
            NodeObject::Output(sink) => sink.as_ref(),
            _ => None,
        }
    }

    pub fn transform_object(&self) -> Option<&Arc<dyn Transform>> {
        match &self.object {
            NodeObject::Transform(transform) => transform.as_ref(),
            _ => None,
        }
    }

    fn has_object(&self) -> bool {
        match &self.object {
            NodeObject::SourceStream { source, .. } => source.is_some(),
            NodeObject::Transform(transform) => transform.is_some(),
            NodeObject::Tee => true,
            NodeObject::Output(sink) => sink.is_some(),
        }
    }
}

impl fmt::Debug for TopologyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("connect_method", &self.connect_method)
            .finish()
    }
}

/// Stream-index connection between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub output_index: u32,
    pub input_index: u32,
}

impl Edge {
    pub fn new(output_index: u32, input_index: u32) -> Self {
        Self {
            output_index,
            input_index,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: Uuid,
    pub name: String,
    pub kind: NodeKind,
    pub connect_method: ConnectMethod,
    pub has_object: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub source_id: Uuid,
    pub output_index: u32,
    pub dest_id: Uuid,
    pub input_index: u32,
}

/// Serializable description of a topology's shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub id: Uuid,
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
}

// =============================================================================
// TOPOLOGY
// =============================================================================

#[derive(Clone)]
pub struct Topology {
    id: Uuid,
    inner: StableGraph<TopologyNode, Edge>,
    index_map: HashMap<Uuid, NodeIndex>,
}

impl Topology {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            inner: StableGraph::new(),
            index_map: HashMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.node_count() == 0
    }

    pub fn add_node(&mut self, node: TopologyNode) -> Uuid {
        let id = node.id;
        let index = self.inner.add_node(node);
        self.index_map.insert(id, index);
        id
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, id: Uuid) -> Option<TopologyNode> {
        let index = self.index_map.remove(&id)?;
        self.inner.remove_node(index)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
        self.index_map.clear();
    }

    pub fn node(&self, id: Uuid) -> Option<&TopologyNode> {
        let index = self.index_map.get(&id)?;
        self.inner.node_weight(*index)
    }

    pub fn node_mut(&mut self, id: Uuid) -> Option<&mut TopologyNode> {
        let index = self.index_map.get(&id)?;
        self.inner.node_weight_mut(*index)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TopologyNode> {
        self.inner.node_weights()
    }

    fn index(&self, id: Uuid) -> MediaResult<NodeIndex> {
        self.index_map
            .get(&id)
            .copied()
            .ok_or(MediaError::NodeNotFound(id))
    }

    fn id_at(&self, index: NodeIndex) -> Option<Uuid> {
        self.inner.node_weight(index).map(|n| n.id)
    }

    /// Connect `output_index` of `source_id` to `input_index` of `dest_id`.
    /// An existing connection on that output is replaced.
    pub fn connect(
        &mut self,
        source_id: Uuid,
        output_index: u32,
        dest_id: Uuid,
        input_index: u32,
    ) -> MediaResult<()> {
        let source_idx = self.index(source_id)?;
        let dest_idx = self.index(dest_id)?;

        let replaced: Vec<_> = self
            .inner
            .edges_directed(source_idx, Direction::Outgoing)
            .filter(|e| e.weight().output_index == output_index)
            .map(|e| (e.id(), e.target(), *e.weight()))
            .collect();
        for (edge, _, _) in &replaced {
            self.inner.remove_edge(*edge);
        }

        let edge_idx = self
            .inner
            .add_edge(source_idx, dest_idx, Edge::new(output_index, input_index));

        if toposort(&self.inner, None).is_err() {
            self.inner.remove_edge(edge_idx);
            for (_, target, weight) in replaced {
                self.inner.add_edge(source_idx, target, weight);
            }
            return Err(MediaError::CycleDetected);
        }
        Ok(())
    }

    pub fn disconnect(&mut self, source_id: Uuid, dest_id: Uuid) -> bool {
        let (Ok(source_idx), Ok(dest_idx)) = (self.index(source_id), self.index(dest_id)) else {
            return false;
        };
        match self.inner.find_edge(source_idx, dest_idx) {
            Some(edge) => {
                self.inner.remove_edge(edge);
                true
            }
            None => false,
        }
    }

    /// Nodes feeding `id`, ordered by input index.
    pub fn inputs(&self, id: Uuid) -> Vec<(Uuid, Edge)> {
        self.neighbours(id, Direction::Incoming, |e| e.input_index)
    }

    /// Nodes fed by `id`, ordered by output index.
    pub fn outputs(&self, id: Uuid) -> Vec<(Uuid, Edge)> {
        self.neighbours(id, Direction::Outgoing, |e| e.output_index)
    }

    fn neighbours(&self, id: Uuid, direction: Direction, key: fn(&Edge) -> u32) -> Vec<(Uuid, Edge)> {
        let Ok(index) = self.index(id) else {
            return vec![];
        };
        let mut result: Vec<_> = self
            .inner
            .edges_directed(index, direction)
            .filter_map(|e| {
                let other = match direction {
                    Direction::Incoming => e.source(),
                    Direction::Outgoing => e.target(),
                };
                Some((self.id_at(other)?, *e.weight()))
            })
            .collect();
        result.sort_by_key(|(_, edge)| key(edge));
        result
    }

    fn nodes_of_kind(&self, kind: NodeKind) -> Vec<Uuid> {
        self.inner
            .node_weights()
            .filter(|n| n.kind() == kind)
            .map(|n| n.id)
            .collect()
    }

    pub fn source_nodes(&self) -> Vec<Uuid> {
        self.nodes_of_kind(NodeKind::SourceStream)
    }

    pub fn output_nodes(&self) -> Vec<Uuid> {
        self.nodes_of_kind(NodeKind::Output)
    }

    /// Every node upstream of `id`.
    pub fn upstream(&self, id: Uuid) -> Vec<Uuid> {
        self.reachable(id, Direction::Incoming)
    }

    /// Every node downstream of `id`.
    pub fn downstream(&self, id: Uuid) -> Vec<Uuid> {
        self.reachable(id, Direction::Outgoing)
    }

    fn reachable(&self, id: Uuid, direction: Direction) -> Vec<Uuid> {
        let Ok(start) = self.index(id) else {
            return vec![];
        };

        let mut result = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = vec![start];

        while let Some(index) = stack.pop() {
            for neighbour in self.inner.neighbors_directed(index, direction) {
                if visited.insert(neighbour) {
                    if let Some(id) = self.id_at(neighbour) {
                        result.push(id);
                    }
                    stack.push(neighbour);
                }
            }
        }
        result
    }

    /// Node ids from `source` to `output` inclusive, if connected.
    pub fn branch_path(&self, source: Uuid, output: Uuid) -> Option<Vec<Uuid>> {
        let start = self.index(source).ok()?;
        let target = self.index(output).ok()?;
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        self.dfs_path(start, target, &mut path, &mut visited)
            .then_some(path)
    }

    fn dfs_path(
        &self,
        current: NodeIndex,
        target: NodeIndex,
        path: &mut Vec<Uuid>,
        visited: &mut HashSet<NodeIndex>,
    ) -> bool {
        if !visited.insert(current) {
            return false;
        }
        if let Some(id) = self.id_at(current) {
            path.push(id);
        }
        if current == target {
            return true;
        }
        for neighbour in self.inner.neighbors_directed(current, Direction::Outgoing) {
            if self.dfs_path(neighbour, target, path, visited) {
                return true;
            }
        }
        path.pop();
        false
    }

    /// Node ids with every node after all of its inputs.
    pub fn processing_order(&self) -> MediaResult<Vec<Uuid>> {
        let order = toposort(&self.inner, None).map_err(|_| MediaError::CycleDetected)?;
        Ok(order.into_iter().filter_map(|i| self.id_at(i)).collect())
    }

    /// Splice `node` into the edge from `before_id` to `after_id`. The old
    /// edge's output index stays on `before_id` and its input index on
    /// `after_id`; the new node uses stream 0 on both sides.
    pub fn insert_between(
        &mut self,
        node: TopologyNode,
        before_id: Uuid,
        after_id: Uuid,
    ) -> MediaResult<Uuid> {
        let before_idx = self.index(before_id)?;
        let after_idx = self.index(after_id)?;

        let edge_idx = self
            .inner
            .find_edge(before_idx, after_idx)
            .ok_or(MediaError::EdgeNotFound {
                from: before_id,
                to: after_id,
            })?;
        let old = self
            .inner
            .remove_edge(edge_idx)
            .ok_or(MediaError::EdgeNotFound {
                from: before_id,
                to: after_id,
            })?;

        let new_id = node.id;
        let new_idx = self.inner.add_node(node);
        self.index_map.insert(new_id, new_idx);

        self.inner
            .add_edge(before_idx, new_idx, Edge::new(old.output_index, 0));
        self.inner
            .add_edge(new_idx, after_idx, Edge::new(0, old.input_index));
        Ok(new_id)
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        let nodes = self
            .inner
            .node_weights()
            .map(|node| NodeSnapshot {
                id: node.id,
                name: node.name.clone(),
                kind: node.kind(),
                connect_method: node.connect_method,
                has_object: node.has_object(),
            })
            .collect();

        let edges = self
            .inner
            .edge_references()
            .filter_map(|e| {
                Some(EdgeSnapshot {
                    source_id: self.id_at(e.source())?,
                    output_index: e.weight().output_index,
                    dest_id: self.id_at(e.target())?,
                    input_index: e.weight().input_index,
                })
            })
            .collect();

        TopologySnapshot {
            id: self.id,
            nodes,
            edges,
        }
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topology")
            .field("id", &self.id)
            .field("nodes", &self.inner.node_count())
            .field("edges", &self.inner.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_type::{subtype, MediaType};
    use crate::transform::TableTransform;

    fn converter() -> Arc<dyn Transform> {
        Arc::new(TableTransform::new(
            vec![MediaType::audio(subtype::FLOAT)],
            vec![MediaType::audio(subtype::PCM)],
        ))
    }

    fn chain() -> (Topology, Uuid, Uuid) {
        let mut topology = Topology::new();
        let source = topology.add_node(TopologyNode::source_stream("src"));
        let output = topology.add_node(TopologyNode::output("out"));
        topology.connect(source, 0, output, 0).unwrap();
        (topology, source, output)
    }

    #[test]
    fn test_add_and_connect() {
        let (topology, source, output) = chain();

        assert_eq!(topology.node_count(), 2);
        assert_eq!(topology.edge_count(), 1);
        assert_eq!(topology.outputs(source), vec![(output, Edge::new(0, 0))]);
        assert_eq!(topology.inputs(output), vec![(source, Edge::new(0, 0))]);
        assert_eq!(topology.source_nodes(), vec![source]);
        assert_eq!(topology.output_nodes(), vec![output]);
    }

    #[test]
    fn test_connect_unknown_node() {
        let (mut topology, source, _) = chain();
        let stranger = Uuid::new_v4();
        assert_eq!(
            topology.connect(source, 1, stranger, 0).unwrap_err(),
            MediaError::NodeNotFound(stranger)
        );
    }

    #[test]
    fn test_reconnect_replaces_output() {
        let (mut topology, source, first) = chain();
        let second = topology.add_node(TopologyNode::output("out2"));

        topology.connect(source, 0, second, 0).unwrap();
        assert_eq!(topology.outputs(source), vec![(second, Edge::new(0, 0))]);
        assert!(topology.inputs(first).is_empty());
    }

    #[test]
    fn test_cycle_detection() {
        let mut topology = Topology::new();
        let a = topology.add_node(TopologyNode::tee("a"));
        let b = topology.add_node(TopologyNode::tee("b"));
        topology.connect(a, 0, b, 0).unwrap();

        assert_eq!(topology.connect(b, 0, a, 0).unwrap_err(), MediaError::CycleDetected);
        assert_eq!(topology.edge_count(), 1);
    }

    #[test]
    fn test_processing_order_and_traversal() {
        let mut topology = Topology::new();
        let source = topology.add_node(TopologyNode::source_stream("src"));
        let tee = topology.add_node(TopologyNode::tee("tee"));
        let left = topology.add_node(TopologyNode::output("left"));
        let right = topology.add_node(TopologyNode::output("right"));
        topology.connect(source, 0, tee, 0).unwrap();
        topology.connect(tee, 0, left, 0).unwrap();
        topology.connect(tee, 1, right, 0).unwrap();

        let order = topology.processing_order().unwrap();
        let position = |id| order.iter().position(|n| *n == id).unwrap();
        assert!(position(source) < position(tee));
        assert!(position(tee) < position(left));
        assert!(position(tee) < position(right));

        let mut downstream = topology.downstream(source);
        downstream.sort();
        let mut expected = vec![tee, left, right];
        expected.sort();
        assert_eq!(downstream, expected);
        assert_eq!(topology.upstream(right).len(), 2);

        assert_eq!(topology.branch_path(source, right), Some(vec![source, tee, right]));
        assert_eq!(topology.branch_path(left, right), None);
    }

    #[test]
    fn test_insert_between_keeps_indices() {
        let mut topology = Topology::new();
        let source = topology.add_node(TopologyNode::source_stream("src"));
        let output = topology.add_node(TopologyNode::output("out"));
        topology.connect(source, 2, output, 1).unwrap();

        let inserted = topology
            .insert_between(TopologyNode::transform("conv", converter()), source, output)
            .unwrap();

        assert_eq!(topology.outputs(source), vec![(inserted, Edge::new(2, 0))]);
        assert_eq!(topology.inputs(output), vec![(inserted, Edge::new(0, 1))]);
        assert_eq!(topology.branch_path(source, output), Some(vec![source, inserted, output]));

        assert!(matches!(
            topology.insert_between(TopologyNode::tee("t"), output, source),
            Err(MediaError::EdgeNotFound { .. })
        ));
    }

    #[test]
    fn test_remove_and_disconnect() {
        let (mut topology, source, output) = chain();

        assert!(topology.disconnect(source, output));
        assert!(!topology.disconnect(source, output));
        topology.connect(source, 0, output, 0).unwrap();

        let removed = topology.remove_node(output).unwrap();
        assert_eq!(removed.kind(), NodeKind::Output);
        assert_eq!(topology.edge_count(), 0);
        assert!(topology.node(output).is_none());
    }

    #[test]
    fn test_clone_keeps_id_and_shape() {
        let (topology, source, output) = chain();
        let mut copy = topology.clone();

        assert_eq!(copy.id(), topology.id());
        copy.remove_node(output);
        assert_eq!(topology.node_count(), 2);
        assert_eq!(copy.node_count(), 1);
        assert!(copy.node(source).is_some());
    }

    #[test]
    fn test_snapshot() {
        let (topology, source, _) = chain();
        let snapshot = topology.snapshot();

        assert_eq!(snapshot.id, topology.id());
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.edges.len(), 1);
        assert_eq!(snapshot.edges[0].source_id, source);
        assert!(snapshot.nodes.iter().all(|n| !n.has_object));

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["edges"][0]["output_index"], 0);
    }
}

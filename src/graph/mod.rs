// This module holds the operation graph the pass builder walks. Nodes live in a flat arena
// indexed by NodeId and reference their producers through input edges; consumers are found
// by scanning, which keeps the structure trivially clonable and free of reference cycles.
// Graph construction happens outside the scheduler (the network loader or a test); the
// scheduler only reads node attributes and, on commit, annotates the nodes of the new pass
// with the pass id, the tail's output location, SRAM offset and compression flag. The helper
// queries here mirror what fusion needs: the next node of a linear chain, the search for an
// SRAM-resident dependency, and the concatenation a node's output feeds into.

//! Operation graph.

pub mod fixup;
pub mod node;

pub use fixup::FixupRequest;
pub use node::{
    AlgorithmHint, CompilerDataFormat, CompressionHint, Edge, FuseOnlyPleData, LocationHint,
    MceOperationData, Node, NodeId, NodeKind, QuantizationInfo, Stride, WeightsFormat, WeightsInfo,
};

use crate::core::buffer_manager::BufferLocation;
use crate::core::utils::TensorShape;
use std::ops::{Index, IndexMut};

/// Arena of nodes addressed by [`NodeId`].
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node consuming output 0 of each of `inputs`, in order.
    ///
    /// The node starts with the blocked layout, default quantization and no
    /// location; callers adjust those through [`node_mut`](Self::node_mut).
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        shape: TensorShape,
        inputs: &[NodeId],
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        let inputs = inputs
            .iter()
            .map(|&source| Edge {
                source,
                output_index: 0,
            })
            .collect();
        self.nodes.push(Node {
            id,
            name: name.into(),
            kind,
            shape,
            format: CompilerDataFormat::Nhwcb,
            quantization: QuantizationInfo::default(),
            location: BufferLocation::None,
            compression_hint: CompressionHint::PreferCompressed,
            location_hint: LocationHint::PreferSram,
            compressed: false,
            output_sram_offset: 0,
            buffer_id: None,
            inputs,
            pass: None,
        });
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().find(|node| node.name == name).map(|node| node.id)
    }

    /// Producer of the given input of `id`.
    pub fn input_source(&self, id: NodeId, index: usize) -> Option<&Node> {
        self.node(id)
            .inputs
            .get(index)
            .map(|edge| self.node(edge.source))
    }

    /// Shape of the given input of `id`.
    pub fn input_shape(&self, id: NodeId, index: usize) -> Option<TensorShape> {
        self.input_source(id, index).map(|source| source.shape)
    }

    /// Nodes consuming any output of `id`, in id order.
    pub fn consumers(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.inputs.iter().any(|edge| edge.source == id))
            .map(|node| node.id)
            .collect()
    }

    /// The next node of a linear chain: the single consumer of `id`, provided
    /// that consumer has no other input.
    pub fn next_linear_node(&self, id: NodeId) -> Option<NodeId> {
        match self.consumers(id).as_slice() {
            [next] if self.node(*next).inputs.len() == 1 => Some(*next),
            _ => None,
        }
    }

    /// Depth-first search through the producers of `id` for a node matching
    /// `predicate`. `id` itself is not tested.
    pub fn search_dependencies<P>(&self, id: NodeId, predicate: P) -> Option<NodeId>
    where
        P: Fn(&Node) -> bool,
    {
        let mut stack: Vec<NodeId> = self.node(id).inputs.iter().rev().map(|e| e.source).collect();
        let mut visited = vec![false; self.nodes.len()];
        while let Some(current) = stack.pop() {
            if std::mem::replace(&mut visited[current.0], true) {
                continue;
            }
            let node = self.node(current);
            if predicate(node) {
                return Some(current);
            }
            stack.extend(node.inputs.iter().rev().map(|e| e.source));
        }
        None
    }

    /// The concatenation that `id` feeds directly into, if any.
    pub fn find_concat_consumer(&self, id: NodeId) -> Option<NodeId> {
        match self.consumers(id).as_slice() {
            [next] if matches!(self.node(*next).kind, NodeKind::Concat { .. }) => Some(*next),
            _ => None,
        }
    }

    /// Offset of `id` within the output of `concat`, and the concatenated shape.
    pub fn concat_supertensor_info(&self, id: NodeId, concat: NodeId) -> (TensorShape, TensorShape) {
        let concat_node = self.node(concat);
        let axis = match concat_node.kind {
            NodeKind::Concat { axis } => axis as usize,
            _ => panic!("{} is not a concatenation", concat),
        };

        let mut offset = [0u32; 4];
        for edge in &concat_node.inputs {
            if edge.source == id {
                break;
            }
            offset[axis] += self.node(edge.source).shape[axis];
        }
        (offset, concat_node.shape)
    }
}

impl Index<NodeId> for Graph {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        self.node(id)
    }
}

impl IndexMut<NodeId> for Graph {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        self.node_mut(id)
    }
}

//! A committed MCE+PLE pass.
//!
//! [`McePlePass`] is immutable once built. It refers to its nodes by id and
//! keeps one classified view per grammar position so the emitter and the cost
//! model never re-inspect node kinds.

use super::strategy::TensorConfig;
use crate::command_stream::{MceAlgorithm, PleOperation};
use crate::core::buffer_manager::BufferLocation;
use crate::core::capabilities::CompilerOptions;
use crate::graph::{Graph, MceOperationData, NodeId, NodeKind, QuantizationInfo, WeightsFormat};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub struct McePlePass {
    id: usize,
    nodes: Vec<NodeId>,
    pre_conversions: Vec<NodeId>,
    extract_subtensor: Option<NodeId>,
    mce: NodeId,
    post_processes: Vec<NodeId>,
    ple: Option<NodeId>,
    requantizes: Vec<NodeId>,
    post_conversions: Vec<NodeId>,
    tensor_config: TensorConfig,
    algorithm: MceAlgorithm,
    output_location: BufferLocation,
    output_sram_offset: u32,
    intermediate_compression: bool,
}

impl McePlePass {
    /// Classify `nodes` into the pass views.
    ///
    /// Panics if `nodes` is empty, holds no MCE operation, or contains a kind
    /// that cannot be fused.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        graph: &Graph,
        nodes: Vec<NodeId>,
        tensor_config: TensorConfig,
        algorithm: MceAlgorithm,
        output_location: BufferLocation,
        output_sram_offset: u32,
        intermediate_compression: bool,
    ) -> Self {
        let mut pre_conversions = Vec::new();
        let mut extract_subtensor = None;
        let mut mce = None;
        let mut post_processes = Vec::new();
        let mut ple = None;
        let mut requantizes = Vec::new();
        let mut post_conversions = Vec::new();

        for &node_id in &nodes {
            match graph[node_id].kind {
                NodeKind::FormatConversion if mce.is_none() => pre_conversions.push(node_id),
                NodeKind::FormatConversion => post_conversions.push(node_id),
                NodeKind::ExtractSubtensor { .. } if extract_subtensor.is_none() => {
                    extract_subtensor = Some(node_id)
                }
                NodeKind::MceOperation(_) if mce.is_none() => mce = Some(node_id),
                NodeKind::McePostProcess { .. } => post_processes.push(node_id),
                NodeKind::FuseOnlyPle(_) if ple.is_none() => ple = Some(node_id),
                NodeKind::Requantize => requantizes.push(node_id),
                ref other => panic!("unexpected {} node {} in an MCE+PLE pass", other.name(), node_id),
            }
        }

        let mce = match mce {
            Some(mce) => mce,
            None => panic!("MCE+PLE pass {} has no MCE operation", id),
        };

        Self {
            id,
            nodes,
            pre_conversions,
            extract_subtensor,
            mce,
            post_processes,
            ple,
            requantizes,
            post_conversions,
            tensor_config,
            algorithm,
            output_location,
            output_sram_offset,
            intermediate_compression,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn first(&self) -> NodeId {
        self.nodes[0]
    }

    /// The node whose output is the pass output.
    pub fn last(&self) -> NodeId {
        self.nodes[self.nodes.len() - 1]
    }

    pub fn pre_conversions(&self) -> &[NodeId] {
        &self.pre_conversions
    }

    pub fn extract_subtensor(&self) -> Option<NodeId> {
        self.extract_subtensor
    }

    pub fn mce(&self) -> NodeId {
        self.mce
    }

    pub fn post_processes(&self) -> &[NodeId] {
        &self.post_processes
    }

    pub fn ple(&self) -> Option<NodeId> {
        self.ple
    }

    pub fn requantizes(&self) -> &[NodeId] {
        &self.requantizes
    }

    pub fn post_conversions(&self) -> &[NodeId] {
        &self.post_conversions
    }

    pub fn tensor_config(&self) -> &TensorConfig {
        &self.tensor_config
    }

    pub fn algorithm(&self) -> MceAlgorithm {
        self.algorithm
    }

    pub fn output_location(&self) -> BufferLocation {
        self.output_location
    }

    pub fn output_sram_offset(&self) -> u32 {
        self.output_sram_offset
    }

    pub fn uses_intermediate_compression(&self) -> bool {
        self.intermediate_compression
    }

    pub(crate) fn mce_data<'g>(&self, graph: &'g Graph) -> &'g MceOperationData {
        match graph[self.mce].mce() {
            Some(data) => data,
            None => panic!("{} is not an MCE operation", self.mce),
        }
    }

    /// Output quantization of the pass: the last requantize's, else the MCE's.
    pub fn output_quantization(&self, graph: &Graph) -> QuantizationInfo {
        let node = self.requantizes.last().copied().unwrap_or(self.mce);
        graph[node].quantization
    }

    /// Kernel run by the PLE: passthrough unless a PLE node was fused, and
    /// always OFM scaling when the bypass is configured.
    pub fn ple_operation(&self, graph: &Graph, options: &CompilerOptions) -> PleOperation {
        if options.ple_ofm_scaling_bypass {
            return PleOperation::OfmScaling;
        }
        self.ple
            .and_then(|id| graph[id].ple())
            .map_or(PleOperation::Passthrough, |ple| ple.operation)
    }

    /// `(stripe size, stripe depth)` handed to the weight encoder.
    pub fn weight_stripe_size_and_depth(&self, graph: &Graph) -> (u32, u32) {
        let mce = self.mce_data(graph);
        let stripe = self.tensor_config.weights_allocation.stripe_shape;
        let stripe_size = stripe[2];
        let stripe_depth = match mce.weights_info.format {
            WeightsFormat::Hwio => stripe[3],
            WeightsFormat::Hwim => stripe[2] * stripe[3] / (mce.stride.x * mce.stride.y),
            WeightsFormat::Nhwc => panic!("weights of {} must be HWIO or HWIM", self.mce),
        };
        (stripe_size, stripe_depth)
    }
}

impl fmt::Display for McePlePass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes: Vec<String> = self.nodes.iter().map(ToString::to_string).collect();
        write!(
            f,
            "McePlePass {} [{}] {} block {} {:?}",
            self.id,
            nodes.join(", "),
            self.tensor_config.strategy,
            self.tensor_config.block_config,
            self.algorithm
        )
    }
}

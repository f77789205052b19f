// This module implements greedy construction of one MCE+PLE pass. Starting from a given node,
// the builder walks the linear chain of single-input consumers and appends nodes while they
// match the fusion grammar:
//
//     FormatConversion* ExtractSubtensor? MceOperation McePostProcess* FuseOnlyPle?
//     Requantize? FormatConversion*
//
// A requantize may only follow a PLE kernel that produces the same result under any input
// quantization, and trailing format conversions are only taken when they agree with the
// output format the current tiling requires. Every extension that includes the MCE runs a
// feasibility probe: choose the algorithm, filter the block configs, and run the strategy
// search against a clone of the caller's SRAM allocator. Extension stops at the first node
// outside the grammar, or when a probe fails after an earlier one succeeded, in which case
// the chain reverts to the last feasible prefix. The outcome is then decided in a fixed
// order: no MCE means the builder does not apply; otherwise the builder either returns a
// fix-up request for the caller to apply before retrying, reports that nothing can be done,
// or commits the plan to the allocator, annotates the graph and returns the new pass.

//! Greedy fusion of graph nodes into MCE+PLE passes.

use super::block_config::{choose_algorithm, filter_and_sort_block_configs, BlockConfig};
use super::mce_ple_pass::McePlePass;
use super::strategy::{select_strategy, StrategyContext, StrategyId, StrategyRegistry, TensorConfig};
use crate::command_stream::{MceAlgorithm, MceOperation, PleOperation};
use crate::core::buffer_manager::BufferLocation;
use crate::core::capabilities::{CompilerOptions, HardwareCapabilities};
use crate::core::error::{CompileError, CompileResult};
use crate::core::session::CompilationSession;
use crate::core::sram_allocator::SramAllocator;
use crate::core::utils::{round_up_to_multiple, ShapeMultiplier};
use crate::graph::{
    AlgorithmHint, CompilerDataFormat, CompressionHint, FixupRequest, Graph, LocationHint, NodeId, NodeKind, Stride,
};

/// Result of one attempt to build a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// The chain starting at the node holds no MCE operation.
    NotApplicable,
    /// The graph must change before a pass can be built here.
    Fixup(FixupRequest),
    /// No plan fits and no fix-up is known to help.
    Infeasible,
    Created(McePlePass),
}

/// Nodes accepted so far and the grammar position they reached.
#[derive(Debug, Default)]
struct Chain {
    nodes: Vec<NodeId>,
    extract_subtensor: Option<NodeId>,
    mce: Option<NodeId>,
    ple: Option<NodeId>,
    found_requantize: bool,
    found_post_conversions: bool,
}

/// A feasible plan for the chain probed.
#[derive(Debug, Clone)]
struct Selection {
    tensor_config: TensorConfig,
    allocator: SramAllocator,
    required_output_format: Option<CompilerDataFormat>,
    output_location: BufferLocation,
}

/// Outcome of probing one chain.
#[derive(Debug, Clone)]
struct Probe {
    nodes: Vec<NodeId>,
    mce: NodeId,
    algorithm: MceAlgorithm,
    block_configs_empty: bool,
    static_input: bool,
    selection: Option<Selection>,
}

/// Builds passes against fixed hardware, options and search lists.
pub struct PassBuilder<'a> {
    capabilities: &'a HardwareCapabilities,
    options: &'a CompilerOptions,
    strategies: &'a StrategyRegistry,
    block_configs: &'a [BlockConfig],
    session: &'a CompilationSession,
}

impl<'a> PassBuilder<'a> {
    pub fn new(
        capabilities: &'a HardwareCapabilities,
        options: &'a CompilerOptions,
        strategies: &'a StrategyRegistry,
        block_configs: &'a [BlockConfig],
        session: &'a CompilationSession,
    ) -> Self {
        Self {
            capabilities,
            options,
            strategies,
            block_configs,
            session,
        }
    }

    /// Build the largest feasible pass starting at `first`.
    ///
    /// `sram` is only modified when a pass is created: it then holds the
    /// output tile if the output stays in SRAM, and nothing else of the pass.
    pub fn create_greedily(
        &self,
        graph: &mut Graph,
        first: NodeId,
        id: usize,
        sram: &mut SramAllocator,
    ) -> CompileResult<PassOutcome> {
        let probe = match self.find_linear_working_nodes(graph, first, sram)? {
            Some(probe) => probe,
            None => return Ok(PassOutcome::NotApplicable),
        };
        let tail = probe.nodes[probe.nodes.len() - 1];

        if let Some(selection) = &probe.selection {
            if let Some(required) = selection.required_output_format {
                if graph[tail].format != required {
                    return Ok(self.fixup(FixupRequest::RequireOutputFormat {
                        node: tail,
                        format: required,
                    }));
                }
            }
        }

        if (probe.block_configs_empty || probe.selection.is_none()) && probe.algorithm == MceAlgorithm::Winograd {
            return Ok(self.fixup(FixupRequest::ForceAlgorithm {
                node: probe.mce,
                algorithm: MceAlgorithm::Direct,
            }));
        }

        let selection = match probe.selection {
            Some(selection) => selection,
            None => {
                // SRAM may be full of earlier outputs; evicting one might help.
                let resident = graph.search_dependencies(probe.mce, |node| node.location == BufferLocation::Sram);
                return Ok(match resident {
                    Some(node) => self.fixup(FixupRequest::ForceLocation {
                        node,
                        location: BufferLocation::Dram,
                    }),
                    None => {
                        log::debug!("no plan fits for {} and nothing can be evicted", probe.mce);
                        PassOutcome::Infeasible
                    }
                });
            }
        };
        let config = selection.tensor_config;

        let head = probe.nodes[0];
        let producer = graph
            .input_source(head, 0)
            .ok_or(CompileError::MissingInput { node: head.0 })?;
        let input_stripe = config.input_allocation.stripe_shape;

        if input_stripe[3] < producer.shape[3] && producer.format == CompilerDataFormat::Nhwc {
            // Depth-split input stripes are not contiguous in a plain layout.
            return Ok(self.fixup(FixupRequest::RequireOutputFormat {
                node: producer.id,
                format: CompilerDataFormat::Nhwcb,
            }));
        }

        if producer.compressed && (input_stripe[2] < producer.shape[2] || input_stripe[3] < producer.shape[3]) {
            return Ok(self.fixup(FixupRequest::RequireUncompressedOutput { node: producer.id }));
        }

        let output_location = selection.output_location;
        let output_stripe = config.output_allocation.stripe_shape;
        let tail_node = &graph[tail];
        let use_intermediate_compression = self.options.enable_intermediate_compression
            && tail_node.compression_hint == CompressionHint::PreferCompressed
            && tail_node.format == CompilerDataFormat::Nhwcb
            && output_location == BufferLocation::Dram
            && output_stripe[2] >= tail_node.shape[2]
            && output_stripe[3] >= tail_node.shape[3];

        // Adopt the probe's allocator, keeping only what outlives the pass.
        *sram = selection.allocator;
        sram.free(config.weights_allocation.offset)?;
        sram.free(config.ple_allocation.offset)?;
        if !probe.static_input {
            sram.free(config.input_allocation.offset)?;
        }
        if output_location == BufferLocation::Dram {
            sram.free(config.output_allocation.offset)?;
        }

        for &node in &probe.nodes {
            graph[node].pass = Some(id);
        }
        let tail_node = &mut graph[tail];
        tail_node.output_sram_offset = config.output_allocation.offset;
        tail_node.location = output_location;
        tail_node.compressed = use_intermediate_compression;
        if let Some(mce) = graph[probe.mce].mce_mut() {
            mce.algorithm = probe.algorithm;
        }

        let pass = McePlePass::new(
            id,
            graph,
            probe.nodes,
            config,
            probe.algorithm,
            output_location,
            config.output_allocation.offset,
            use_intermediate_compression,
        );
        self.session.record_pass_created(pass.nodes().len());
        log::debug!("created {}", pass);
        Ok(PassOutcome::Created(pass))
    }

    fn fixup(&self, request: FixupRequest) -> PassOutcome {
        self.session.record_fixup(request.kind());
        log::debug!("fix-up required: {}", request);
        PassOutcome::Fixup(request)
    }

    /// Whether `id` extends `chain` under the fusion grammar.
    fn accepts(
        &self,
        graph: &Graph,
        chain: &Chain,
        id: NodeId,
        required_output_format: Option<CompilerDataFormat>,
    ) -> bool {
        let node = &graph[id];
        let has_mce = chain.mce.is_some();
        match &node.kind {
            NodeKind::FormatConversion if !has_mce => true,
            NodeKind::ExtractSubtensor { .. } => !has_mce && chain.extract_subtensor.is_none(),
            NodeKind::MceOperation(_) => !has_mce,
            NodeKind::McePostProcess { .. } => {
                has_mce && chain.ple.is_none() && !chain.found_post_conversions && !chain.found_requantize
            }
            NodeKind::FuseOnlyPle(_) => has_mce && chain.ple.is_none() && !chain.found_post_conversions,
            NodeKind::Requantize => {
                let ple_allows = chain
                    .ple
                    .and_then(|ple| graph[ple].ple())
                    .map_or(true, |ple| ple.is_agnostic_to_requantisation());
                has_mce && !chain.found_requantize && !chain.found_post_conversions && ple_allows
            }
            NodeKind::FormatConversion => required_output_format.map_or(true, |format| node.format == format),
            _ => false,
        }
    }

    /// Grow the chain from `first` one node at a time, probing every prefix
    /// that contains the MCE.
    ///
    /// Once some prefix has fit, the first prefix that no longer fits ends
    /// the walk and the last fitting prefix is returned, so a pass that would
    /// fail as a whole is shortened instead. Before any prefix has fit the
    /// walk keeps extending; the result is then the last (failed) probe.
    fn find_linear_working_nodes(
        &self,
        graph: &Graph,
        first: NodeId,
        sram: &SramAllocator,
    ) -> CompileResult<Option<Probe>> {
        let mut chain = Chain::default();
        let mut required_output_format = None;
        let mut last_feasible: Option<Probe> = None;
        let mut last_probe: Option<Probe> = None;
        let mut current = Some(first);

        while let Some(id) = current {
            if !self.accepts(graph, &chain, id, required_output_format) {
                log::trace!("{} ({}) ends the chain", id, graph[id].kind.name());
                break;
            }

            match graph[id].kind {
                NodeKind::ExtractSubtensor { .. } => chain.extract_subtensor = Some(id),
                NodeKind::MceOperation(_) => chain.mce = Some(id),
                NodeKind::FuseOnlyPle(_) => chain.ple = Some(id),
                NodeKind::Requantize => chain.found_requantize = true,
                NodeKind::FormatConversion if chain.mce.is_some() => chain.found_post_conversions = true,
                _ => {}
            }
            chain.nodes.push(id);
            log::trace!("extended chain with {} ({})", id, graph[id].kind.name());

            if chain.mce.is_some() {
                let probe = self.probe(graph, &chain, sram)?;
                self.session.record_probe(probe.selection.is_some());
                match probe.selection.as_ref().map(|selection| selection.required_output_format) {
                    Some(required) => {
                        required_output_format = required;
                        last_feasible = Some(probe.clone());
                        last_probe = Some(probe);
                    }
                    None if last_feasible.is_some() => {
                        log::trace!("{} does not fit, keeping the previous chain", id);
                        break;
                    }
                    None => {
                        required_output_format = None;
                        last_probe = Some(probe);
                    }
                }
            }

            current = graph.next_linear_node(id);
        }

        Ok(last_feasible.or(last_probe))
    }

    fn probe(&self, graph: &Graph, chain: &Chain, sram: &SramAllocator) -> CompileResult<Probe> {
        let caps = self.capabilities;
        let mce_id = match chain.mce {
            Some(id) => id,
            None => panic!("probing a chain without an MCE operation"),
        };
        let mce = match graph[mce_id].mce() {
            Some(mce) => mce,
            None => panic!("{} is not an MCE operation", mce_id),
        };
        let ple = chain.ple.and_then(|id| graph[id].ple());
        let head = chain.nodes[0];
        let tail = &graph[chain.nodes[chain.nodes.len() - 1]];

        let static_input_offset = graph
            .input_source(head, 0)
            .filter(|producer| producer.location == BufferLocation::Sram)
            .map(|producer| producer.output_sram_offset);

        let shape_multiplier =
            mce.shape_multiplier * ple.map_or(ShapeMultiplier::IDENTITY, |ple| ple.shape_multiplier);

        let winograd_allowed = mce.algorithm_hint == AlgorithmHint::AllowWinograd
            && self.options.enable_winograd
            && mce.operation == MceOperation::Convolution
            && mce.stride == Stride::new(1, 1)
            && mce.upscale_factor == 1;
        let algorithm = if winograd_allowed {
            choose_algorithm(caps, mce.kernel_width(), mce.kernel_height())
        } else {
            MceAlgorithm::Direct
        };

        let mut weights_shape = mce.weights_info.dimensions;
        if algorithm == MceAlgorithm::Winograd {
            for dim in weights_shape.iter_mut().take(2) {
                if *dim != 1 {
                    *dim = round_up_to_multiple(*dim, 3);
                }
            }
        }

        // Max pool 3x3 buffers the neighbouring stripe, which caps the depth.
        let depth_max = match ple.map(|ple| ple.operation) {
            Some(PleOperation::MaxPool3x3) if mce.is_depthwise() => caps.num_srams,
            Some(PleOperation::MaxPool3x3) => caps.number_of_ofm(),
            _ => u32::MAX,
        };

        let block_configs = filter_and_sort_block_configs(
            self.block_configs,
            caps,
            algorithm,
            &mce.weights_info.dimensions,
            &tail.shape,
            ple.map(|ple| ple.operation),
            mce.is_fully_connected(),
        );

        let input_shape = graph
            .input_shape(mce_id, 0)
            .ok_or(CompileError::MissingInput { node: mce_id.0 })?;
        let ctx = StrategyContext {
            capabilities: caps,
            input_shape,
            output_shape: tail.shape,
            weights_format: mce.weights_info.format,
            weights_shape,
            shape_multiplier,
            static_input_offset,
            algorithm,
            depth_max,
        };

        let mut allocator = sram.clone();
        let strategies = self.strategies.valid_strategies(mce.operation);
        let selection = select_strategy(strategies, &block_configs, &ctx, &mut allocator, self.session).map(
            |tensor_config| {
                let output_stripe = tensor_config.output_allocation.stripe_shape;
                let mut required_output_format = if mce.is_fully_connected() {
                    Some(CompilerDataFormat::Nhwc)
                } else if output_stripe[3] < tail.shape[3] || output_stripe[2] < tail.shape[2] {
                    // Output stripes are not contiguous in a plain layout.
                    Some(CompilerDataFormat::Nhwcb)
                } else {
                    None
                };

                let output_location = if tensor_config.strategy == StrategyId::Strategy3
                    && tail.format == CompilerDataFormat::Nhwcb
                    && tail.location_hint != LocationHint::RequireDram
                {
                    required_output_format = Some(CompilerDataFormat::Nhwcb);
                    BufferLocation::Sram
                } else {
                    BufferLocation::Dram
                };

                Selection {
                    tensor_config,
                    allocator,
                    required_output_format,
                    output_location,
                }
            },
        );

        match &selection {
            Some(selection) => log::debug!(
                "probe {:?}: {} block {} {:?}, output in {:?}",
                chain.nodes,
                selection.tensor_config.strategy,
                selection.tensor_config.block_config,
                algorithm,
                selection.output_location
            ),
            None => log::debug!(
                "probe {:?}: nothing fits ({:?}, {} block configs)",
                chain.nodes,
                algorithm,
                block_configs.len()
            ),
        }

        Ok(Probe {
            nodes: chain.nodes.clone(),
            mce: mce_id,
            algorithm,
            block_configs_empty: block_configs.is_empty(),
            static_input: static_input_offset.is_some(),
            selection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FuseOnlyPleData, MceOperationData, QuantizationInfo, WeightsFormat, WeightsInfo};
    use crate::pass::block_config::default_block_configs;

    fn conv(dims: [u32; 4]) -> NodeKind {
        let info = WeightsInfo {
            dimensions: dims,
            format: WeightsFormat::Hwio,
            quantization: QuantizationInfo::default(),
        };
        NodeKind::MceOperation(MceOperationData::new(MceOperation::Convolution, info, vec![1; 16]))
    }

    struct Fixture {
        caps: HardwareCapabilities,
        options: CompilerOptions,
        strategies: StrategyRegistry,
        blocks: Vec<BlockConfig>,
        session: CompilationSession,
    }

    impl Fixture {
        fn new(total_sram_size: u32) -> Self {
            Self {
                caps: HardwareCapabilities {
                    total_sram_size,
                    max_ple_size: 1024,
                    ..HardwareCapabilities::default()
                },
                options: CompilerOptions::default(),
                strategies: StrategyRegistry::default(),
                blocks: default_block_configs(),
                session: CompilationSession::new(),
            }
        }

        fn builder(&self) -> PassBuilder<'_> {
            PassBuilder::new(&self.caps, &self.options, &self.strategies, &self.blocks, &self.session)
        }
    }

    fn input(graph: &mut Graph, shape: [u32; 4]) -> NodeId {
        let id = graph.add_node("in", NodeKind::Input { source_operation_id: 0 }, shape, &[]);
        graph[id].location = BufferLocation::Dram;
        id
    }

    #[test]
    fn test_chain_without_mce_is_not_applicable() {
        let fixture = Fixture::new(512 * 1024);
        let mut graph = Graph::new();
        let a = input(&mut graph, [1, 8, 8, 16]);
        let b = graph.add_node("conv", NodeKind::FormatConversion, [1, 8, 8, 16], &[a]);
        let mut sram = SramAllocator::new(fixture.caps.total_sram_size);

        let outcome = fixture.builder().create_greedily(&mut graph, b, 0, &mut sram).unwrap();
        assert_eq!(outcome, PassOutcome::NotApplicable);
    }

    #[test]
    fn test_small_output_stays_in_sram() {
        let fixture = Fixture::new(512 * 1024);
        let mut graph = Graph::new();
        let a = input(&mut graph, [1, 8, 8, 16]);
        let c = graph.add_node("conv", conv([1, 1, 16, 16]), [1, 8, 8, 16], &[a]);
        let mut sram = SramAllocator::new(fixture.caps.total_sram_size);

        let pass = match fixture.builder().create_greedily(&mut graph, c, 3, &mut sram).unwrap() {
            PassOutcome::Created(pass) => pass,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(pass.tensor_config().strategy, StrategyId::Strategy3);
        assert_eq!(pass.output_location(), BufferLocation::Sram);
        assert_eq!(graph[c].location, BufferLocation::Sram);
        assert_eq!(graph[c].pass, Some(3));
        // Only the output tile survives the commit.
        assert_eq!(sram.allocations().count(), 1);
        assert!(sram.is_allocated(pass.output_sram_offset()));
    }

    #[test]
    fn test_require_dram_hint_sends_output_to_dram() {
        let fixture = Fixture::new(512 * 1024);
        let mut graph = Graph::new();
        let a = input(&mut graph, [1, 8, 8, 16]);
        let c = graph.add_node("conv", conv([1, 1, 16, 16]), [1, 8, 8, 16], &[a]);
        graph[c].location_hint = LocationHint::RequireDram;
        let mut sram = SramAllocator::new(fixture.caps.total_sram_size);

        match fixture.builder().create_greedily(&mut graph, c, 0, &mut sram).unwrap() {
            PassOutcome::Created(pass) => assert_eq!(pass.output_location(), BufferLocation::Dram),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sram.allocations().count(), 0);
    }

    #[test]
    fn test_failed_extension_reverts_to_feasible_prefix() {
        // The conv alone fits with 8x8 blocks; the interleave kernel only
        // accepts 16x16, which does not.
        let fixture = Fixture::new(6000);
        let mut graph = Graph::new();
        let a = input(&mut graph, [1, 32, 32, 16]);
        let c = graph.add_node("conv", conv([1, 1, 16, 16]), [1, 32, 32, 16], &[a]);
        let p = graph.add_node(
            "interleave",
            NodeKind::FuseOnlyPle(FuseOnlyPleData::new(PleOperation::Interleave2x2)),
            [1, 16, 16, 64],
            &[c],
        );
        let mut sram = SramAllocator::new(fixture.caps.total_sram_size);

        let pass = match fixture.builder().create_greedily(&mut graph, c, 0, &mut sram).unwrap() {
            PassOutcome::Created(pass) => pass,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(pass.nodes(), &[c]);
        assert_eq!(pass.tensor_config().strategy, StrategyId::Strategy6);
        assert_eq!(pass.tensor_config().block_config, BlockConfig::new(8, 8));
        assert_eq!(graph[p].pass, None);
        assert_eq!(fixture.session.stats().failed_probes, 1);
    }

    #[test]
    fn test_conflicting_conversion_is_not_merged() {
        let fixture = Fixture::new(6000);
        let mut graph = Graph::new();
        let a = input(&mut graph, [1, 32, 32, 16]);
        let c = graph.add_node("conv", conv([1, 1, 16, 16]), [1, 32, 32, 16], &[a]);
        let f = graph.add_node("to_nhwc", NodeKind::FormatConversion, [1, 32, 32, 16], &[c]);
        graph[f].format = CompilerDataFormat::Nhwc;
        let mut sram = SramAllocator::new(fixture.caps.total_sram_size);

        match fixture.builder().create_greedily(&mut graph, c, 0, &mut sram).unwrap() {
            PassOutcome::Created(pass) => assert_eq!(pass.nodes(), &[c]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_requantize_not_fused_after_sigmoid() {
        let fixture = Fixture::new(512 * 1024);
        let mut graph = Graph::new();
        let a = input(&mut graph, [1, 8, 8, 16]);
        let c = graph.add_node("conv", conv([1, 1, 16, 16]), [1, 8, 8, 16], &[a]);
        let s = graph.add_node(
            "sigmoid",
            NodeKind::FuseOnlyPle(FuseOnlyPleData::new(PleOperation::Sigmoid)),
            [1, 8, 8, 16],
            &[c],
        );
        graph.add_node("rq", NodeKind::Requantize, [1, 8, 8, 16], &[s]);
        let mut sram = SramAllocator::new(fixture.caps.total_sram_size);

        match fixture.builder().create_greedily(&mut graph, c, 0, &mut sram).unwrap() {
            PassOutcome::Created(pass) => assert_eq!(pass.nodes(), &[c, s]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_winograd_failure_requests_direct() {
        let fixture = Fixture::new(2048);
        let mut graph = Graph::new();
        let a = input(&mut graph, [1, 64, 64, 64]);
        let c = graph.add_node("conv", conv([3, 3, 64, 64]), [1, 64, 64, 64], &[a]);
        let mut sram = SramAllocator::new(fixture.caps.total_sram_size);
        let before = sram.clone();

        let outcome = fixture.builder().create_greedily(&mut graph, c, 0, &mut sram).unwrap();
        assert_eq!(
            outcome,
            PassOutcome::Fixup(FixupRequest::ForceAlgorithm {
                node: c,
                algorithm: MceAlgorithm::Direct
            })
        );
        assert_eq!(sram, before);
        assert_eq!(graph[c].pass, None);
    }
}

//! Whole-network scheduling.
//!
//! Visits nodes in id order and builds a pass wherever one can start. The
//! first fix-up request ends the walk: applying it is left to the caller,
//! which reruns scheduling on the adjusted graph.

use crate::command_stream::CommandStream;
use crate::core::buffer_manager::BufferManager;
use crate::core::config::CompilerConfig;
use crate::core::error::CompileResult;
use crate::core::session::CompilationSession;
use crate::core::sram_allocator::SramAllocator;
use crate::graph::{FixupRequest, Graph, NodeId, NodeKind};
use crate::pass::{McePlePass, PassBuilder, PassEmitter, PassOutcome, WeightEncoder};

/// Result of scheduling a network.
#[derive(Debug, Default)]
pub struct Schedule {
    pub passes: Vec<McePlePass>,
    pub command_stream: CommandStream,
    /// Request that stopped the walk, if any.
    pub pending_fixup: Option<FixupRequest>,
    /// Nodes no pass could be built at.
    pub infeasible: Vec<NodeId>,
}

impl Schedule {
    pub fn is_complete(&self) -> bool {
        self.pending_fixup.is_none() && self.infeasible.is_empty()
    }
}

/// Build and emit every pass of `graph`, then mark network outputs in `buffers`.
pub fn schedule(
    graph: &mut Graph,
    config: &CompilerConfig,
    encoder: &dyn WeightEncoder,
    buffers: &mut BufferManager,
    session: &CompilationSession,
) -> CompileResult<Schedule> {
    let registry = config.strategy_registry();
    let builder = PassBuilder::new(
        &config.capabilities,
        &config.options,
        &registry,
        &config.block_configs,
        session,
    );
    let emitter = PassEmitter::new(&config.capabilities, &config.options, encoder, session);
    let mut sram = SramAllocator::new(config.capabilities.total_sram_size);
    let mut result = Schedule::default();

    for index in 0..graph.len() {
        let id = NodeId(index);
        if graph[id].pass.is_some() {
            continue;
        }
        match builder.create_greedily(graph, id, result.passes.len(), &mut sram)? {
            PassOutcome::Created(pass) => {
                emitter.generate(&pass, graph, &mut result.command_stream, buffers)?;
                result.passes.push(pass);
            }
            PassOutcome::Fixup(request) => {
                log::info!("scheduling stopped at {}: {}", id, request);
                result.pending_fixup = Some(request);
                break;
            }
            PassOutcome::NotApplicable => {}
            PassOutcome::Infeasible => {
                log::warn!("no pass fits at {}", id);
                result.infeasible.push(id);
            }
        }
    }

    for node in graph.iter() {
        if let NodeKind::Output {
            source_operation_id,
            output_index,
        } = node.kind
        {
            if let Some(buffer_id) = graph.input_source(node.id, 0).and_then(|producer| producer.buffer_id) {
                buffers.change_to_output(buffer_id, source_operation_id, output_index)?;
            }
        }
    }

    log::info!(
        "scheduled {} passes, {} command bytes",
        result.passes.len(),
        result.command_stream.size_bytes()
    );
    Ok(result)
}

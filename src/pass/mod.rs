// This module groups everything needed to turn a chain of graph nodes into one MCE+PLE
// instruction. block_config chooses the compute algorithm and filters block geometries,
// strategy and strategies define and implement the tiling strategies and the first-fit
// search over them, builder runs the greedy fusion and fix-up policy, mce_ple_pass holds the
// committed result, emitter turns a committed pass into a command record plus buffers,
// weight_encoder is the seam to weight compression, and cost estimates cycles and traffic.

//! MCE+PLE pass construction, emission and estimation.

pub mod block_config;
pub mod builder;
pub mod cost;
pub mod emitter;
pub mod mce_ple_pass;
pub mod strategies;
pub mod strategy;
pub mod weight_encoder;

pub use block_config::{choose_algorithm, default_block_configs, filter_and_sort_block_configs, BlockConfig};
pub use builder::{PassBuilder, PassOutcome};
pub use cost::PassStats;
pub use emitter::PassEmitter;
pub use mce_ple_pass::McePlePass;
pub use strategy::{
    select_strategy, Allocation, Strategy, StrategyContext, StrategyId, StrategyRegistry, TensorConfig,
    DEFAULT_STRATEGY_PRIORITY,
};
pub use weight_encoder::{EncodedWeights, MaskWeightEncoder, WeightEncoder, WeightsMetadata};

// This module defines the strategy search used by the pass builder. A strategy turns a
// block config and the shapes of one fused MCE+PLE operation into stripe and tile geometry
// for the input, output, weights and PLE code, and reserves SRAM for the resulting tiles.
// Strategies are trait objects held in a priority-ordered StrategyRegistry; fully connected
// operations always use the dedicated fully connected strategy instead of the registry's
// list. select_strategy is a first-fit search: strategies are tried in priority order and,
// for each, block configs in their already sorted order. The first pair whose setup
// succeeds wins, and no attempt is made to find a cheaper plan. A failed setup leaves the
// allocator untouched, so after a failed search the caller's allocator is unchanged.

//! Strategy search.

use super::block_config::BlockConfig;
use super::strategies;
use crate::command_stream::{MceAlgorithm, MceOperation};
use crate::core::capabilities::HardwareCapabilities;
use crate::core::session::CompilationSession;
use crate::core::sram_allocator::SramAllocator;
use crate::core::utils::{ShapeMultiplier, TensorShape};
use crate::graph::WeightsFormat;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a tiling strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StrategyId {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "strategy0")]
    Strategy0,
    #[serde(rename = "strategy1")]
    Strategy1,
    #[serde(rename = "strategy3")]
    Strategy3,
    #[serde(rename = "strategy4")]
    Strategy4,
    #[serde(rename = "strategy6")]
    Strategy6,
    #[serde(rename = "strategy7")]
    Strategy7,
    #[serde(rename = "strategy_fc")]
    StrategyFc,
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyId::None => "NONE",
            StrategyId::Strategy0 => "STRATEGY_0",
            StrategyId::Strategy1 => "STRATEGY_1",
            StrategyId::Strategy3 => "STRATEGY_3",
            StrategyId::Strategy4 => "STRATEGY_4",
            StrategyId::Strategy6 => "STRATEGY_6",
            StrategyId::Strategy7 => "STRATEGY_7",
            StrategyId::StrategyFc => "STRATEGY_FC",
        };
        f.write_str(name)
    }
}

/// Default priority order for general MCE operations.
pub const DEFAULT_STRATEGY_PRIORITY: &[StrategyId] = &[
    StrategyId::Strategy3,
    StrategyId::Strategy1,
    StrategyId::Strategy4,
    StrategyId::Strategy6,
    StrategyId::Strategy0,
    StrategyId::Strategy7,
];

/// Placement of one tensor's tile in SRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Allocation {
    pub stripe_shape: TensorShape,
    pub tile_size: u32,
    /// Only valid until the owning allocator frees it.
    pub offset: u32,
}

/// Finalized resource plan of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorConfig {
    pub input_allocation: Allocation,
    pub output_allocation: Allocation,
    pub weights_allocation: Allocation,
    pub ple_allocation: Allocation,
    pub strategy: StrategyId,
    pub block_config: BlockConfig,
}

/// Everything a strategy needs to know about the operation being tiled.
#[derive(Debug, Clone, Copy)]
pub struct StrategyContext<'a> {
    pub capabilities: &'a HardwareCapabilities,
    /// Input shape of the MCE (the sub-tensor when extracting).
    pub input_shape: TensorShape,
    /// Output shape of the last fused node.
    pub output_shape: TensorShape,
    pub weights_format: WeightsFormat,
    /// Weights dimensions, padded for Winograd when applicable.
    pub weights_shape: TensorShape,
    /// MCE multiplier composed with the fused PLE multiplier.
    pub shape_multiplier: ShapeMultiplier,
    /// SRAM offset of an input that is already resident and fixed.
    pub static_input_offset: Option<u32>,
    pub algorithm: MceAlgorithm,
    /// Upper bound on the output stripe depth.
    pub depth_max: u32,
}

/// A tiling strategy.
pub trait Strategy: fmt::Debug {
    fn id(&self) -> StrategyId;

    /// Computes stripes and tiles for `block_config` and reserves their SRAM in
    /// `allocator`. On failure `allocator` must be left unchanged.
    fn try_setup(
        &self,
        ctx: &StrategyContext<'_>,
        block_config: BlockConfig,
        allocator: &mut SramAllocator,
    ) -> Option<TensorConfig>;
}

/// Strategy implementations in priority order.
#[derive(Debug)]
pub struct StrategyRegistry {
    strategies: Vec<Box<dyn Strategy>>,
    fully_connected: Vec<Box<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new(strategies: Vec<Box<dyn Strategy>>) -> Self {
        Self {
            strategies,
            fully_connected: vec![Box::new(strategies::StrategyFc)],
        }
    }

    /// Registry holding the concrete strategies named by `ids`, in that order.
    /// [`StrategyId::None`] entries are skipped.
    pub fn from_ids(ids: &[StrategyId]) -> Self {
        Self::new(ids.iter().filter_map(|&id| strategies::create(id)).collect())
    }

    /// Strategies to try for an MCE operation, in priority order.
    pub fn valid_strategies(&self, operation: MceOperation) -> &[Box<dyn Strategy>] {
        if operation == MceOperation::FullyConnected {
            &self.fully_connected
        } else {
            &self.strategies
        }
    }

    pub fn ids(&self) -> Vec<StrategyId> {
        self.strategies.iter().map(|s| s.id()).collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::from_ids(DEFAULT_STRATEGY_PRIORITY)
    }
}

/// First-fit search over `(strategy, block config)` pairs.
///
/// On success `allocator` holds the chosen tiles. On failure it is unchanged.
pub fn select_strategy(
    strategies: &[Box<dyn Strategy>],
    block_configs: &[BlockConfig],
    ctx: &StrategyContext<'_>,
    allocator: &mut SramAllocator,
    session: &CompilationSession,
) -> Option<TensorConfig> {
    for strategy in strategies {
        for &block_config in block_configs {
            session.record_strategy_attempt();
            if let Some(config) = strategy.try_setup(ctx, block_config, allocator) {
                log::trace!("{} with block {} fits", strategy.id(), block_config);
                return Some(config);
            }
            log::trace!("{} with block {} does not fit", strategy.id(), block_config);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sram_allocator::AllocationPreference;

    #[derive(Debug)]
    struct AlwaysFails;

    impl Strategy for AlwaysFails {
        fn id(&self) -> StrategyId {
            StrategyId::Strategy0
        }

        fn try_setup(&self, _: &StrategyContext<'_>, _: BlockConfig, _: &mut SramAllocator) -> Option<TensorConfig> {
            None
        }
    }

    #[derive(Debug)]
    struct AlwaysFits;

    impl Strategy for AlwaysFits {
        fn id(&self) -> StrategyId {
            StrategyId::Strategy1
        }

        fn try_setup(
            &self,
            _: &StrategyContext<'_>,
            block_config: BlockConfig,
            allocator: &mut SramAllocator,
        ) -> Option<TensorConfig> {
            let offset = allocator.allocate(128, AllocationPreference::Start)?;
            let allocation = Allocation {
                stripe_shape: [1, 8, 8, 16],
                tile_size: 128,
                offset,
            };
            Some(TensorConfig {
                input_allocation: allocation,
                output_allocation: allocation,
                weights_allocation: allocation,
                ple_allocation: allocation,
                strategy: self.id(),
                block_config,
            })
        }
    }

    fn context(caps: &HardwareCapabilities) -> StrategyContext<'_> {
        StrategyContext {
            capabilities: caps,
            input_shape: [1, 8, 8, 16],
            output_shape: [1, 8, 8, 16],
            weights_format: WeightsFormat::Hwio,
            weights_shape: [1, 1, 16, 16],
            shape_multiplier: ShapeMultiplier::IDENTITY,
            static_input_offset: None,
            algorithm: MceAlgorithm::Direct,
            depth_max: u32::MAX,
        }
    }

    #[test]
    fn test_first_fit_skips_failing_strategy() {
        let caps = HardwareCapabilities::default();
        let session = CompilationSession::new();
        let strategies: Vec<Box<dyn Strategy>> = vec![Box::new(AlwaysFails), Box::new(AlwaysFits)];
        let blocks = [BlockConfig::new(16, 16), BlockConfig::new(8, 8)];
        let mut sram = SramAllocator::new(1024);

        let config = select_strategy(&strategies, &blocks, &context(&caps), &mut sram, &session).unwrap();
        assert_eq!(config.strategy, StrategyId::Strategy1);
        // The first block config is taken by the winning strategy.
        assert_eq!(config.block_config, BlockConfig::new(16, 16));
        // Only the winner's allocation is live.
        assert_eq!(sram.allocations().count(), 1);
        assert_eq!(sram.free_capacity(), 1024 - 128);
        // Both blocks were tried against the failing strategy first.
        assert_eq!(session.stats().strategy_attempts, 3);
    }

    #[test]
    fn test_total_failure_leaves_allocator_unchanged() {
        let caps = HardwareCapabilities::default();
        let session = CompilationSession::new();
        let strategies: Vec<Box<dyn Strategy>> = vec![Box::new(AlwaysFails)];
        let mut sram = SramAllocator::new(1024);
        let before = sram.clone();

        let res = select_strategy(&strategies, &[BlockConfig::new(8, 8)], &context(&caps), &mut sram, &session);
        assert!(res.is_none());
        assert_eq!(sram, before);
    }

    #[test]
    fn test_registry_uses_fc_strategy_for_fully_connected() {
        let registry = StrategyRegistry::default();
        assert_eq!(registry.ids(), DEFAULT_STRATEGY_PRIORITY.to_vec());

        let fc = registry.valid_strategies(MceOperation::FullyConnected);
        assert_eq!(fc.len(), 1);
        assert_eq!(fc[0].id(), StrategyId::StrategyFc);

        let conv = registry.valid_strategies(MceOperation::Convolution);
        assert_eq!(conv[0].id(), StrategyId::Strategy3);
    }

    #[test]
    fn test_registry_skips_none() {
        let registry = StrategyRegistry::from_ids(&[StrategyId::None, StrategyId::Strategy6]);
        assert_eq!(registry.ids(), vec![StrategyId::Strategy6]);
    }
}

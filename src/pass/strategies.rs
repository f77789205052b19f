//! Concrete tiling strategies.
//!
//! Every strategy decides which output dimensions to split, then shares one
//! planner: the output stripe comes from the block config and the depth cap,
//! the input and weight stripes are derived from it, tiles hold one stripe when
//! a single stripe covers the tensor and two otherwise, and SRAM is reserved in
//! the order input, weights, output, PLE code on a scratch copy of the
//! allocator. The copy replaces the caller's allocator only when every
//! reservation succeeds.

use super::block_config::BlockConfig;
use super::strategy::{Allocation, Strategy, StrategyContext, StrategyId, TensorConfig};
use crate::core::sram_allocator::{AllocationPreference, SramAllocator};
use crate::core::utils::{
    div_round_up, round_up_height_and_width, round_up_to_brick_group, round_up_to_multiple, total_size,
    TensorShape,
};
use crate::graph::WeightsFormat;

/// Construct the strategy for `id`; `None` for [`StrategyId::None`].
pub fn create(id: StrategyId) -> Option<Box<dyn Strategy>> {
    match id {
        StrategyId::None => None,
        StrategyId::Strategy0 => Some(Box::new(Strategy0)),
        StrategyId::Strategy1 => Some(Box::new(Strategy1)),
        StrategyId::Strategy3 => Some(Box::new(Strategy3)),
        StrategyId::Strategy4 => Some(Box::new(Strategy4)),
        StrategyId::Strategy6 => Some(Box::new(Strategy6)),
        StrategyId::Strategy7 => Some(Box::new(Strategy7)),
        StrategyId::StrategyFc => Some(Box::new(StrategyFc)),
    }
}

/// Output dimensions a strategy splits into stripes.
#[derive(Debug, Clone, Copy, Default)]
struct Split {
    height: bool,
    width: bool,
    depth: bool,
    /// Also split the input (and weights input channels) by IFM lanes.
    input_depth: bool,
}

/// Whole input, output and weights resident.
#[derive(Debug, Clone, Copy)]
pub struct Strategy3;

/// Output split in height by the block height.
#[derive(Debug, Clone, Copy)]
pub struct Strategy0;

/// Output split in depth by the OFM lanes; weights streamed.
#[derive(Debug, Clone, Copy)]
pub struct Strategy1;

/// Output split in width and depth.
#[derive(Debug, Clone, Copy)]
pub struct Strategy4;

/// Output split in height, width and depth.
#[derive(Debug, Clone, Copy)]
pub struct Strategy6;

/// As [`Strategy6`], with the input depth split by the IFM lanes.
#[derive(Debug, Clone, Copy)]
pub struct Strategy7;

/// Fully connected: whole input, output depth split by the OFM lanes.
#[derive(Debug, Clone, Copy)]
pub struct StrategyFc;

macro_rules! impl_strategy {
    ($ty:ident, $id:expr, $split:expr) => {
        impl Strategy for $ty {
            fn id(&self) -> StrategyId {
                $id
            }

            fn try_setup(
                &self,
                ctx: &StrategyContext<'_>,
                block_config: BlockConfig,
                allocator: &mut SramAllocator,
            ) -> Option<TensorConfig> {
                setup(ctx, block_config, allocator, $id, $split)
            }
        }
    };
}

impl_strategy!(Strategy3, StrategyId::Strategy3, Split::default());
impl_strategy!(
    Strategy0,
    StrategyId::Strategy0,
    Split {
        height: true,
        ..Split::default()
    }
);
impl_strategy!(
    Strategy1,
    StrategyId::Strategy1,
    Split {
        depth: true,
        ..Split::default()
    }
);
impl_strategy!(
    Strategy4,
    StrategyId::Strategy4,
    Split {
        width: true,
        depth: true,
        ..Split::default()
    }
);
impl_strategy!(
    Strategy6,
    StrategyId::Strategy6,
    Split {
        height: true,
        width: true,
        depth: true,
        input_depth: false,
    }
);
impl_strategy!(
    Strategy7,
    StrategyId::Strategy7,
    Split {
        height: true,
        width: true,
        depth: true,
        input_depth: true,
    }
);
impl_strategy!(
    StrategyFc,
    StrategyId::StrategyFc,
    Split {
        depth: true,
        ..Split::default()
    }
);

fn covers(stripe: &TensorShape, shape: &TensorShape) -> bool {
    stripe[1] >= shape[1] && stripe[2] >= shape[2] && stripe[3] >= shape[3]
}

/// Bytes of one blocked stripe.
fn stripe_bytes(stripe: &TensorShape, brick_group: &TensorShape) -> u32 {
    total_size(&round_up_to_brick_group(stripe, brick_group))
}

fn buffers_needed(stripe: &TensorShape, shape: &TensorShape) -> u32 {
    if covers(stripe, shape) {
        1
    } else {
        2
    }
}

fn setup(
    ctx: &StrategyContext<'_>,
    block_config: BlockConfig,
    allocator: &mut SramAllocator,
    id: StrategyId,
    split: Split,
) -> Option<TensorConfig> {
    let caps = ctx.capabilities;
    let brick = caps.brick_group_shape;
    let output = ctx.output_shape;
    let input = ctx.input_shape;
    let multiplier = ctx.shape_multiplier;

    // Output stripe, in units of the last fused node.
    let output_full = round_up_height_and_width(&output, &brick);
    let mce_output_depth = multiplier.channels.apply_inverse(output[3]);
    let mce_stripe_depth = if split.depth {
        caps.number_of_ofm().min(ctx.depth_max).min(mce_output_depth)
    } else if mce_output_depth > ctx.depth_max {
        return None;
    } else {
        mce_output_depth
    };

    let output_stripe: TensorShape = [
        1,
        if split.height {
            round_up_to_multiple(block_config.height, brick[1]).min(output_full[1])
        } else {
            output_full[1]
        },
        if split.width {
            round_up_to_multiple(block_config.width, brick[2]).min(output_full[2])
        } else {
            output_full[2]
        },
        multiplier.channels.apply(mce_stripe_depth).clamp(1, output[3]),
    ];

    // Input stripe covering the output stripe.
    let input_full = round_up_height_and_width(&input, &brick);
    let needed = multiplier.input_for_output(&output_stripe);
    let input_depth = match ctx.weights_format {
        WeightsFormat::Hwim if mce_stripe_depth < mce_output_depth => {
            div_round_up(mce_stripe_depth * input[3], mce_output_depth.max(1)).min(input[3])
        }
        WeightsFormat::Hwim => input[3],
        _ if split.input_depth => caps.number_of_ifm().min(input[3]),
        _ => input[3],
    };
    let input_stripe: TensorShape = [
        1,
        if output_stripe[1] >= output[1] {
            input_full[1]
        } else {
            round_up_to_multiple(needed[1], brick[1]).min(input_full[1])
        },
        if output_stripe[2] >= output[2] {
            input_full[2]
        } else {
            round_up_to_multiple(needed[2], brick[2]).min(input_full[2])
        },
        input_depth,
    ];

    if ctx.static_input_offset.is_some() && !covers(&input_stripe, &input) {
        return None;
    }

    // Weights stripe.
    let weights = ctx.weights_shape;
    let weights_stripe: TensorShape = match ctx.weights_format {
        WeightsFormat::Hwim => [
            weights[0],
            weights[1],
            div_round_up(mce_stripe_depth * weights[2], mce_output_depth.max(1)).clamp(1, weights[2]),
            weights[3],
        ],
        _ => [
            weights[0],
            weights[1],
            if split.input_depth {
                caps.number_of_ifm().min(weights[2])
            } else {
                weights[2]
            },
            mce_stripe_depth.min(weights[3]),
        ],
    };
    let weights_fully_resident = weights_stripe[2] >= weights[2] && weights_stripe[3] >= weights[3];
    let weights_tile = total_size(&weights_stripe) * if weights_fully_resident { 1 } else { 2 };

    let input_tile = stripe_bytes(&input_stripe, &brick) * buffers_needed(&input_stripe, &input);
    let output_tile = stripe_bytes(&output_stripe, &brick) * buffers_needed(&output_stripe, &output);
    let ple_tile = caps.max_ple_size;

    let mut scratch = allocator.clone();
    let input_offset = match ctx.static_input_offset {
        Some(offset) => offset,
        None => scratch.allocate(input_tile, AllocationPreference::Start)?,
    };
    let weights_offset = scratch.allocate(weights_tile, AllocationPreference::Start)?;
    let output_offset = scratch.allocate(output_tile, AllocationPreference::Start)?;
    let ple_offset = scratch.allocate(ple_tile, AllocationPreference::Start)?;
    *allocator = scratch;

    Some(TensorConfig {
        input_allocation: Allocation {
            stripe_shape: input_stripe,
            tile_size: input_tile,
            offset: input_offset,
        },
        output_allocation: Allocation {
            stripe_shape: output_stripe,
            tile_size: output_tile,
            offset: output_offset,
        },
        weights_allocation: Allocation {
            stripe_shape: weights_stripe,
            tile_size: weights_tile,
            offset: weights_offset,
        },
        ple_allocation: Allocation {
            stripe_shape: [0; 4],
            tile_size: ple_tile,
            offset: ple_offset,
        },
        strategy: id,
        block_config,
    })
}

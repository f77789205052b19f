//! Compute algorithm choice and block-config filtering.
//!
//! Both functions are pure. [`choose_algorithm`] compares the multiply counts of
//! direct convolution and the 2x2 Winograd transform; larger kernels are
//! decomposed into `wide_kernel_size` sub-kernels. [`filter_and_sort_block_configs`]
//! narrows the candidate block geometries for one fused MCE+PLE operation.

use crate::command_stream::{MceAlgorithm, PleOperation};
pub use crate::command_stream::BlockConfig;
use crate::core::capabilities::HardwareCapabilities;
use crate::core::utils::{div_round_up, TensorShape};
use std::cmp::Ordering;

// PLE kernels buffer whole blocks, which limits the geometries they accept.
const INTERLEAVE_2X2_BLOCKS: &[BlockConfig] = &[BlockConfig::new(16, 16)];
const MAXPOOL_2X2_BLOCKS: &[BlockConfig] = &[
    BlockConfig::new(16, 16),
    BlockConfig::new(32, 8),
    BlockConfig::new(8, 8),
];
const MEAN_XY_8X8_BLOCKS: &[BlockConfig] = &[BlockConfig::new(8, 8)];
const MAXPOOL_3X3_BLOCKS: &[BlockConfig] = &[BlockConfig::new(32, 8), BlockConfig::new(8, 8)];

/// Block configs supported by the hardware, in default preference order.
pub fn default_block_configs() -> Vec<BlockConfig> {
    vec![
        BlockConfig::new(16, 16),
        BlockConfig::new(32, 8),
        BlockConfig::new(8, 32),
        BlockConfig::new(16, 8),
        BlockConfig::new(8, 16),
        BlockConfig::new(8, 8),
    ]
}

/// Picks Winograd only when it needs strictly fewer multiplications.
pub fn choose_algorithm(caps: &HardwareCapabilities, kernel_width: u32, kernel_height: u32) -> MceAlgorithm {
    let (w, h) = (kernel_width, kernel_height);
    let wide = caps.wide_kernel_size;

    let (num_mults_direct, num_mults_winograd) = if w == 1 || h == 1 {
        // 1D kernel
        (
            w * h * caps.output_size_per_winograd_2d * caps.output_size_per_winograd_1d,
            caps.macs_per_winograd_1d * div_round_up(w * h, wide),
        )
    } else {
        (
            w * h * caps.output_size_per_winograd_2d * caps.output_size_per_winograd_2d,
            caps.macs_per_winograd_2d * div_round_up(w, wide) * div_round_up(h, wide),
        )
    };

    if num_mults_winograd < num_mults_direct {
        MceAlgorithm::Winograd
    } else {
        MceAlgorithm::Direct
    }
}

/// Filters and orders `candidates` for an MCE with the given kernel
/// (`[height, width, ..]` weights dimensions) producing `output_shape`.
///
/// Applied in order: the Winograd accumulator limit and preference sort, the
/// fully-connected 8x8 restriction, then the allow-list of the fused PLE kernel.
pub fn filter_and_sort_block_configs(
    candidates: &[BlockConfig],
    caps: &HardwareCapabilities,
    algorithm: MceAlgorithm,
    weights_shape: &TensorShape,
    output_shape: &TensorShape,
    ple_operation: Option<PleOperation>,
    is_fully_connected: bool,
) -> Vec<BlockConfig> {
    let weights_height = weights_shape[0];
    let weights_width = weights_shape[1];

    let mut res: Vec<BlockConfig> = candidates.to_vec();

    if algorithm == MceAlgorithm::Winograd {
        let is_winograd_2d = weights_height > 1 && weights_width > 1;
        // 1D Winograd produces twice as many outputs per accumulator set as 2D.
        let max_allowed_area = caps.total_accumulators_per_engine / if is_winograd_2d { 4 } else { 2 };
        res.retain(|block| block.area() <= max_allowed_area);

        let prefers = |a: &BlockConfig, b: &BlockConfig| -> bool {
            let fits_a = output_shape[1] <= a.height && output_shape[2] <= a.width;
            let fits_b = output_shape[1] <= b.height && output_shape[2] <= b.width;

            match (fits_a, fits_b) {
                (true, true) => a.area() < b.area(),
                (false, false) => {
                    // Maximise the partial blocks at the edge of the output plane.
                    let rem_a = output_shape[1] % a.height + output_shape[2] % a.width;
                    let rem_b = output_shape[1] % b.height + output_shape[2] % b.width;
                    if rem_a != rem_b {
                        return rem_a > rem_b;
                    }
                    if weights_width > weights_height {
                        a.width > b.width || (a.width == b.width && a.height > b.height)
                    } else {
                        a.height > b.height || (a.height == b.height && a.width > b.width)
                    }
                }
                (fits_a, _) => fits_a,
            }
        };

        res.sort_by(|a, b| {
            if prefers(a, b) {
                Ordering::Less
            } else if prefers(b, a) {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        });
    }

    if is_fully_connected {
        res.retain(|block| *block == BlockConfig::new(8, 8));
    }

    if let Some(operation) = ple_operation {
        let allowed: Option<&[BlockConfig]> = match operation {
            PleOperation::Interleave2x2 => Some(INTERLEAVE_2X2_BLOCKS),
            PleOperation::MaxPool2x2 => Some(MAXPOOL_2X2_BLOCKS),
            PleOperation::MeanXy8x8 => Some(MEAN_XY_8X8_BLOCKS),
            PleOperation::MaxPool3x3 => Some(MAXPOOL_3X3_BLOCKS),
            _ => None,
        };
        if let Some(allowed) = allowed {
            res.retain(|block| allowed.contains(block));
        }
    }

    log::trace!(
        "block configs for {:?} output {:?}: {}",
        algorithm,
        output_shape,
        res.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    );
    res
}

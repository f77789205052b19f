// This module estimates the cost of a committed MCE+PLE pass. The estimates are advisory:
// they are consumed by plan comparison outside the scheduler and never influence which
// strategy or block config is chosen. Traffic is reported per tensor (input, output,
// weights) as DRAM bytes split into a non-parallel part (the first stripe, which cannot
// overlap with compute) and a parallel remainder, or as SRAM bytes when the tensor never
// leaves SRAM. Streamed inputs are re-read once per output depth stripe and streamed
// weights once per spatial input stripe. Compute is estimated by two closed-form cycle
// models selected by the pass algorithm, and the PLE workload is counted in patches.
// Weight traffic uses the real encoder output, optionally on synthetic data with a
// configured proportion of zero-point elements so estimates can be made before the real
// weights are known.

//! Cycle and traffic estimates.

use super::mce_ple_pass::McePlePass;
use super::weight_encoder::{EncodedWeights, WeightEncoder};
use crate::command_stream::{MceAlgorithm, MceOperation};
use crate::core::buffer_manager::BufferLocation;
use crate::core::capabilities::{CompilerOptions, EstimationOptions, HardwareCapabilities};
use crate::core::utils::{
    div_round_up, round_up_height_and_width, round_up_to_multiple, total_size, TensorShape,
};
use crate::graph::{CompilerDataFormat, Graph, Stride, WeightsFormat};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;

/// Bytes moved for one tensor.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MemoryStats {
    /// DRAM traffic that cannot overlap with compute.
    pub dram_non_parallel: u32,
    /// DRAM traffic overlapping with compute.
    pub dram_parallel: u32,
    /// Bytes read or written only in SRAM.
    pub sram: u32,
}

impl MemoryStats {
    pub fn dram_total(&self) -> u32 {
        self.dram_non_parallel.saturating_add(self.dram_parallel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StripesStats {
    /// Stripes with the full stripe shape.
    pub num_central_stripes: u32,
    /// Partial stripes at the tensor edges.
    pub num_boundary_stripes: u32,
    /// Extra passes over the whole tensor.
    pub num_reloads: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TensorStats {
    pub memory: MemoryStats,
    pub stripes: StripesStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WeightsStats {
    pub memory: MemoryStats,
    pub stripes: StripesStats,
    /// Fraction of the raw weight bytes saved by encoding.
    pub weight_compression_saving: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MceStats {
    pub cycle_count: u32,
    pub operations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PleStats {
    pub num_of_patches: u32,
    /// Kernel code as written to the command stream.
    pub operation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PassStats {
    pub input: TensorStats,
    pub output: TensorStats,
    pub weights: WeightsStats,
    pub mce: MceStats,
    pub ple: PleStats,
}

impl fmt::Display for PassStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  input:   dram {} (+{} parallel), sram {}, reloads {}",
            self.input.memory.dram_non_parallel,
            self.input.memory.dram_parallel,
            self.input.memory.sram,
            self.input.stripes.num_reloads
        )?;
        writeln!(
            f,
            "  output:  dram {} (+{} parallel), sram {}",
            self.output.memory.dram_non_parallel, self.output.memory.dram_parallel, self.output.memory.sram
        )?;
        writeln!(
            f,
            "  weights: dram {} (+{} parallel), reloads {}, saving {:.2}",
            self.weights.memory.dram_non_parallel,
            self.weights.memory.dram_parallel,
            self.weights.stripes.num_reloads,
            self.weights.weight_compression_saving
        )?;
        writeln!(f, "  mce:     {} cycles, {} operations", self.mce.cycle_count, self.mce.operations)?;
        write!(f, "  ple:     {} patches, kernel {}", self.ple.num_of_patches, self.ple.operation)
    }
}

fn stripes_stats(shape: &TensorShape, stripe: &TensorShape, num_reloads: u32) -> StripesStats {
    let mut total = 1;
    let mut central = 1;
    for dim in 1..4 {
        let extent = stripe[dim].max(1);
        total *= div_round_up(shape[dim], extent);
        central *= shape[dim] / extent;
    }
    StripesStats {
        num_central_stripes: central,
        num_boundary_stripes: total - central,
        num_reloads,
    }
}

/// Split `total` DRAM bytes into the first stripe and the rest.
fn split_dram(total: u32, first_stripe: u32) -> MemoryStats {
    let non_parallel = first_stripe.min(total);
    MemoryStats {
        dram_non_parallel: non_parallel,
        dram_parallel: total - non_parallel,
        sram: 0,
    }
}

/// Input traffic. `shape` is already rounded for the input layout.
pub fn input_stats(
    shape: &TensorShape,
    stripe: &TensorShape,
    location: BufferLocation,
    tile_size: u32,
    weights_format: WeightsFormat,
    num_output_stripes_depth: u32,
) -> TensorStats {
    let bytes = total_size(shape);
    if location == BufferLocation::Sram {
        return TensorStats {
            memory: MemoryStats {
                sram: bytes,
                ..MemoryStats::default()
            },
            stripes: stripes_stats(shape, stripe, 0),
        };
    }

    // A streamed input is read again for every output depth stripe unless
    // each output channel only depends on its own input channel.
    let streamed = tile_size < bytes;
    let num_reloads = if streamed && weights_format == WeightsFormat::Hwio {
        num_output_stripes_depth.saturating_sub(1)
    } else {
        0
    };
    TensorStats {
        memory: split_dram(bytes.saturating_mul(num_reloads + 1), total_size(stripe)),
        stripes: stripes_stats(shape, stripe, num_reloads),
    }
}

/// Output traffic. `shape` is already rounded for the output layout.
pub fn output_stats(shape: &TensorShape, stripe: &TensorShape, location: BufferLocation) -> TensorStats {
    let bytes = total_size(shape);
    let memory = if location == BufferLocation::Sram {
        MemoryStats {
            sram: bytes,
            ..MemoryStats::default()
        }
    } else {
        split_dram(bytes, total_size(stripe))
    };
    TensorStats {
        memory,
        stripes: stripes_stats(shape, stripe, 0),
    }
}

/// Weight traffic from the encoded stripes.
pub fn weights_stats(
    encoded: &EncodedWeights,
    weights_shape: &TensorShape,
    weights_stripe: &TensorShape,
    tile_size: u32,
    input_shape: &TensorShape,
    input_stripe: &TensorShape,
) -> WeightsStats {
    let encoded_size = encoded.data.len() as u32;
    let resident = tile_size >= total_size(weights_shape)
        && weights_stripe[2] >= weights_shape[2]
        && weights_stripe[3] >= weights_shape[3];

    let num_reloads = if resident {
        0
    } else {
        let spatial_stripes = div_round_up(input_shape[1], input_stripe[1].max(1))
            * div_round_up(input_shape[2], input_stripe[2].max(1));
        spatial_stripes.saturating_sub(1)
    };

    let raw_size = total_size(weights_shape);
    let weight_compression_saving = if raw_size == 0 {
        0.0
    } else {
        1.0 - encoded_size as f32 / raw_size as f32
    };

    WeightsStats {
        memory: split_dram(encoded_size.saturating_mul(num_reloads + 1), encoded.first_stripe_size()),
        stripes: stripes_stats(weights_shape, weights_stripe, num_reloads),
        weight_compression_saving,
    }
}

/// Apply the activation compression saving to DRAM traffic.
pub fn account_for_activation_compression(stats: TensorStats, saving: f32) -> TensorStats {
    let scale = |bytes: u32| (bytes as f64 * (1.0 - saving as f64)) as u32;
    TensorStats {
        memory: MemoryStats {
            dram_non_parallel: scale(stats.memory.dram_non_parallel),
            dram_parallel: scale(stats.memory.dram_parallel),
            sram: stats.memory.sram,
        },
        stripes: stats.stripes,
    }
}

fn mce_cycle_count_winograd(
    caps: &HardwareCapabilities,
    input_shape: &TensorShape,
    output_shape: &TensorShape,
    weights_height: u32,
    weights_width: u32,
) -> u32 {
    let ifm_consumed = caps.number_of_ifm();
    let ofm_produced = caps.number_of_ofm();
    // 2x2 tiles for 2D, 1x2 or 2x1 for 1D.
    let output_h = if weights_height == 1 {
        caps.output_size_per_winograd_1d
    } else {
        caps.output_size_per_winograd_2d
    };
    let output_w = if weights_width == 1 {
        caps.output_size_per_winograd_1d
    } else {
        caps.output_size_per_winograd_2d
    };

    let num_tot_ifms = round_up_to_multiple(input_shape[3], ifm_consumed);
    let num_outputs = div_round_up(output_shape[2], output_w) * div_round_up(output_shape[1], output_h);

    let wide = caps.wide_kernel_size;
    let macs_per_element = if weights_height == 1 || weights_width == 1 {
        caps.macs_per_winograd_1d * div_round_up(weights_width * weights_height, wide)
    } else {
        caps.macs_per_winograd_2d * div_round_up(weights_width, wide) * div_round_up(weights_height, wide)
    };

    let num_mac_ops = num_outputs as u64 * macs_per_element as u64;
    let cycles_per_ofm = (num_tot_ifms as u64 * num_mac_ops) / (ifm_consumed as u64 * caps.mac_units_per_engine as u64);
    (cycles_per_ofm * div_round_up(output_shape[3], ofm_produced) as u64) as u32
}

fn mce_cycle_count_direct(
    caps: &HardwareCapabilities,
    operation: MceOperation,
    stride: Stride,
    input_shape: &TensorShape,
    output_shape: &TensorShape,
    weights_height: u32,
    weights_width: u32,
) -> u32 {
    let num_kernel_elements = weights_width * weights_height;
    let ifm_consumed = caps.number_of_ifm();
    let ofm_produced = caps.number_of_ofm();
    let half_patch_h = caps.patch_shape[1];
    let half_patch_w = div_round_up(caps.patch_shape[2], 2);
    let num_actual_ifms = input_shape[3] / (stride.x * stride.y);

    let (num_ifms, num_ofms) = if operation == MceOperation::DepthwiseConvolution {
        (ifm_consumed, num_actual_ifms)
    } else {
        (num_actual_ifms, output_shape[3])
    };

    let num_tot_ifms = round_up_to_multiple(num_ifms, ifm_consumed);
    // Output plane rounded up to half patches.
    let num_output_elements =
        round_up_to_multiple(output_shape[2], half_patch_w) * round_up_to_multiple(output_shape[1], half_patch_h);

    let num_mac_ops = num_output_elements as u64 * num_kernel_elements as u64;
    let cycles_per_ofm = (num_tot_ifms as u64 * num_mac_ops) / (ifm_consumed as u64 * caps.mac_units_per_engine as u64);
    (cycles_per_ofm * div_round_up(num_ofms, ofm_produced) as u64) as u32
}

/// MCE cycles for the given algorithm.
#[allow(clippy::too_many_arguments)]
pub fn mce_cycle_count(
    caps: &HardwareCapabilities,
    algorithm: MceAlgorithm,
    operation: MceOperation,
    stride: Stride,
    input_shape: &TensorShape,
    output_shape: &TensorShape,
    weights_height: u32,
    weights_width: u32,
) -> u32 {
    match algorithm {
        MceAlgorithm::Winograd => {
            mce_cycle_count_winograd(caps, input_shape, output_shape, weights_height, weights_width)
        }
        MceAlgorithm::Direct => mce_cycle_count_direct(
            caps,
            operation,
            stride,
            input_shape,
            output_shape,
            weights_height,
            weights_width,
        ),
    }
}

/// Multiply and add operations performed by the MCE.
pub fn num_operations(
    operation: MceOperation,
    stride: Stride,
    input_shape: &TensorShape,
    output_shape: &TensorShape,
    weights_height: u32,
    weights_width: u32,
) -> u64 {
    let num_kernel_elements = (weights_width * weights_height) as u64;
    let num_ops_per_element = 2 * num_kernel_elements;
    let num_actual_ifms = div_round_up(input_shape[3], stride.x * stride.y) as u64;
    let num_input_elements = (input_shape[1] * input_shape[2]) as u64;
    let num_ops_per_ifm = num_input_elements * num_ops_per_element;

    let (num_ifms, num_ofms) = if operation == MceOperation::DepthwiseConvolution {
        (1, num_actual_ifms)
    } else {
        (num_actual_ifms, output_shape[3] as u64)
    };
    num_ifms * num_ops_per_ifm * num_ofms
}

/// Synthetic weights: uniform bytes with roughly `saving` of them replaced by
/// the zero point. Deterministic for a given length.
pub fn generate_compressible_data(num_elements: usize, saving: f32, zero_point: i32) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(0);
    let keep = (1.0 - saving as f64).clamp(0.0, 1.0);
    (0..num_elements)
        .map(|_| {
            let value: u8 = rng.gen();
            if rng.gen_bool(keep) {
                value
            } else {
                zero_point as u8
            }
        })
        .collect()
}

impl McePlePass {
    /// Estimate the cost of this pass.
    pub fn stats(
        &self,
        graph: &Graph,
        caps: &HardwareCapabilities,
        options: &CompilerOptions,
        estimation: &EstimationOptions,
        encoder: &dyn WeightEncoder,
    ) -> PassStats {
        let mce = self.mce_data(graph);
        let config = self.tensor_config();
        let brick = caps.brick_group_shape;

        let first = &graph[self.first()];
        let producer = graph
            .input_source(self.first(), 0)
            .unwrap_or_else(|| panic!("{} has no input", first.id));
        let input_shape = graph
            .input_shape(self.mce(), 0)
            .unwrap_or_else(|| panic!("{} has no input", self.mce()));
        let rounded_input = if producer.format == CompilerDataFormat::Nhwc {
            input_shape
        } else {
            round_up_height_and_width(&input_shape, &brick)
        };

        let tail = &graph[self.last()];
        let output_shape = tail.shape;
        let rounded_output = if tail.format == CompilerDataFormat::Nhwc {
            output_shape
        } else {
            round_up_height_and_width(&output_shape, &brick)
        };
        let output_stripe = config.output_allocation.stripe_shape;
        let num_out_stripes_depth = div_round_up(output_shape[3], output_stripe[3].max(1));

        let input = input_stats(
            &rounded_input,
            &config.input_allocation.stripe_shape,
            producer.location,
            config.input_allocation.tile_size,
            mce.weights_info.format,
            num_out_stripes_depth,
        );
        let input = if producer.compressed {
            account_for_activation_compression(input, estimation.activation_compression_saving)
        } else {
            input
        };

        let output = output_stats(&rounded_output, &output_stripe, tail.location);
        let output = if tail.compressed {
            account_for_activation_compression(output, estimation.activation_compression_saving)
        } else {
            output
        };

        let quantization = self.output_quantization(graph);
        let (stripe_size, stripe_depth) = self.weight_stripe_size_and_depth(graph);
        let encoded = if estimation.use_weight_compression_override {
            let dummy = generate_compressible_data(
                mce.weights_data.len(),
                estimation.weight_compression_saving,
                mce.weights_info.quantization.zero_point,
            );
            encoder.encode(mce, &dummy, stripe_depth, stripe_size, &quantization)
        } else {
            encoder.encode(mce, &mce.weights_data, stripe_depth, stripe_size, &quantization)
        };
        let weights = weights_stats(
            &encoded,
            &mce.weights_info.dimensions,
            &config.weights_allocation.stripe_shape,
            config.weights_allocation.tile_size,
            &input_shape,
            &config.input_allocation.stripe_shape,
        );

        let mce_output = graph[self.mce()].shape;
        let [kh, kw, ..] = mce.weights_info.dimensions;
        let mce_stats = MceStats {
            cycle_count: mce_cycle_count(
                caps,
                self.algorithm(),
                mce.operation,
                mce.stride,
                &input_shape,
                &mce_output,
                kh,
                kw,
            ),
            operations: num_operations(mce.operation, mce.stride, &input_shape, &mce_output, kh, kw),
        };

        let patches = div_round_up(mce_output[1], caps.patch_shape[1])
            * div_round_up(mce_output[2], caps.patch_shape[2])
            * div_round_up(mce_output[3], caps.num_engines);
        let ple = PleStats {
            num_of_patches: patches,
            operation: self.ple_operation(graph, options).code(),
        };

        PassStats {
            input,
            output,
            weights,
            mce: mce_stats,
            ple,
        }
    }
}

// This module turns a committed McePlePass into one McePle command. Emission registers the
// buffers the command refers to: the encoded weights and their per-stripe metadata become
// constant DRAM buffers, and the pass output becomes either an SRAM buffer at the committed
// output tile offset or a DRAM intermediate. When the output feeds a concatenation, every
// producer writes into one shared buffer owned by the concat node, created by whichever
// producer is emitted first, and the record carries the producer's offset within the
// concatenated supertensor. The MCE section of the record is derived from the MCE node and
// then adjusted by the fused nodes in grammar order: post-processes set the activation
// clamp, requantizes re-express that clamp in their own quantization, and a sigmoid PLE
// narrows it to the range its fixed-point rescale can represent.

//! Command emission for MCE+PLE passes.

use super::mce_ple_pass::McePlePass;
use super::strategy::StrategyId;
use super::weight_encoder::WeightEncoder;
use crate::command_stream::{
    Command, CommandStream, DataFormat, DataLocation, DataType, MceAlgorithm, MceData, McePle, PleData,
    PleOperation, SramAllocationStrategy, SramConfig, TensorInfo, UpsampleType,
};
use crate::core::buffer_manager::{BufferLocation, BufferManager, BufferType};
use crate::core::capabilities::{CompilerOptions, HardwareCapabilities};
use crate::core::error::{CompileError, CompileResult};
use crate::core::session::CompilationSession;
use crate::core::utils::{round_up_to_brick_group, round_up_to_multiple, total_size, TensorShape};
use crate::graph::{Graph, NodeKind, QuantizationInfo, WeightsFormat};

const LOG2_E: f64 = 1.4426950408889634;

/// Wire label for a strategy. The firmware only looks at stripe and tile
/// geometry, so the fully connected strategy reuses the strategy 1 label.
pub fn wire_strategy(strategy: StrategyId) -> SramAllocationStrategy {
    match strategy {
        StrategyId::Strategy0 => SramAllocationStrategy::Strategy0,
        StrategyId::Strategy1 | StrategyId::StrategyFc => SramAllocationStrategy::Strategy1,
        StrategyId::Strategy3 => SramAllocationStrategy::Strategy3,
        StrategyId::Strategy4 => SramAllocationStrategy::Strategy4,
        StrategyId::Strategy6 => SramAllocationStrategy::Strategy6,
        StrategyId::Strategy7 => SramAllocationStrategy::Strategy7,
        StrategyId::None => panic!("pass reached emission without a strategy"),
    }
}

/// Fixed-point approximation `multiplier / 2^shift` of `rescale`.
pub fn calculate_rescale_multiplier_and_shift(rescale: f64) -> (u16, u16) {
    if rescale <= 0.0 || !rescale.is_finite() {
        return (0, 0);
    }

    // rescale = fraction * 2^exponent with fraction in [0.5, 1).
    let mut exponent = rescale.log2().floor() as i32 + 1;
    let mut fraction = rescale / 2f64.powi(exponent);
    if fraction >= 1.0 {
        fraction /= 2.0;
        exponent += 1;
    } else if fraction < 0.5 {
        fraction *= 2.0;
        exponent -= 1;
    }

    let mut multiplier = (fraction * 65536.0).round() as u32;
    if multiplier == 1 << 16 {
        multiplier >>= 1;
        exponent += 1;
    }
    let shift = 16 - exponent;
    if shift < 0 {
        return (u16::MAX, 0);
    }
    (multiplier as u16, shift as u16)
}

/// Rescale and activation bounds for the sigmoid PLE kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigmoidRescale {
    pub multiplier: u16,
    pub shift: u16,
    pub activation_min: u8,
    pub activation_max: u8,
}

/// Sigmoid input rescale for the given input quantization, narrowing the
/// current activation bounds to what the rescaled input can represent.
pub fn sigmoid_rescale(
    quantization: &QuantizationInfo,
    activation_min: u8,
    activation_max: u8,
) -> SigmoidRescale {
    let rescale = quantization.scale as f64 * (LOG2_E * 256.0);
    let (mut multiplier, mut shift) = calculate_rescale_multiplier_and_shift(rescale);

    let mut abs_max = if multiplier == 0 {
        0
    } else {
        // Anything wider than the u8 activation range clamps to it below.
        ((2f64.powi(15 + shift as i32) / multiplier as f64).ceil() - 1.0).min(255.0) as i32
    };
    if abs_max == 0 {
        abs_max = 1;
        multiplier = i16::MAX as u16;
        shift = 0;
    }

    let zero_point = quantization.zero_point;
    let lower = (activation_min as i32).max(zero_point - abs_max);
    let upper = lower.max((activation_max as i32).min(zero_point + abs_max));

    SigmoidRescale {
        multiplier,
        shift,
        activation_min: lower.clamp(0, 255) as u8,
        activation_max: upper.clamp(0, 255) as u8,
    }
}

/// Re-express a quantized activation bound in another quantization.
fn requantize_bound(value: u8, from: &QuantizationInfo, to: &QuantizationInfo) -> u8 {
    let real = (value as f64 - from.zero_point as f64) * from.scale as f64;
    let requantized = (real / to.scale as f64).round() + to.zero_point as f64;
    requantized.clamp(0.0, 255.0) as u8
}

/// Bytes needed to hold `shape` in the given layout.
fn buffer_size(shape: &TensorShape, format: DataFormat, brick_group: &TensorShape) -> u32 {
    match format {
        DataFormat::Nhwc => total_size(shape),
        _ => total_size(&round_up_to_brick_group(shape, brick_group)),
    }
}

fn data_location(location: BufferLocation) -> DataLocation {
    match location {
        BufferLocation::Sram => DataLocation::Sram,
        _ => DataLocation::Dram,
    }
}

/// Appends one command per committed pass.
pub struct PassEmitter<'a> {
    capabilities: &'a HardwareCapabilities,
    options: &'a CompilerOptions,
    encoder: &'a dyn WeightEncoder,
    session: &'a CompilationSession,
}

impl<'a> PassEmitter<'a> {
    pub fn new(
        capabilities: &'a HardwareCapabilities,
        options: &'a CompilerOptions,
        encoder: &'a dyn WeightEncoder,
        session: &'a CompilationSession,
    ) -> Self {
        Self {
            capabilities,
            options,
            encoder,
            session,
        }
    }

    /// Emit `pass`, registering its weights and output buffers.
    ///
    /// Sets the buffer id of the pass's last node (and of a concatenation it
    /// feeds, when that buffer is created here).
    pub fn generate(
        &self,
        pass: &McePlePass,
        graph: &mut Graph,
        stream: &mut CommandStream,
        buffers: &mut BufferManager,
    ) -> CompileResult<()> {
        let brick = self.capabilities.brick_group_shape;
        let config = *pass.tensor_config();
        let mce = pass.mce_data(graph);

        let first = pass.first();
        let producer = graph
            .input_source(first, 0)
            .ok_or(CompileError::MissingInput { node: first.0 })?;
        let input_buffer_id = producer.buffer_id.ok_or(CompileError::MissingBuffer { node: producer.id.0 })?;
        let input_location = producer.location;

        let mce_input_shape = graph
            .input_shape(pass.mce(), 0)
            .ok_or(CompileError::MissingInput { node: pass.mce().0 })?;
        let mce_output_shape = graph[pass.mce()].shape;
        let tail = &graph[pass.last()];
        let output_shape = tail.shape;
        let output_format = tail.buffer_format();
        let output_location = tail.location;
        let output_zero_point = tail.quantization.zero_point as u8;

        let quantization = pass.output_quantization(graph);
        let ple_operation = pass.ple_operation(graph, self.options);

        // Weights and their stripe metadata.
        let (stripe_size, stripe_depth) = pass.weight_stripe_size_and_depth(graph);
        let encoded = self
            .encoder
            .encode(mce, &mce.weights_data, stripe_depth, stripe_size, &quantization);
        let weights_buffer_id = buffers.add_dram_constant(BufferType::ConstantDma, &encoded.data);
        let metadata_buffer_id = buffers.add_dram_constant(BufferType::ConstantControlUnit, &encoded.metadata_bytes());

        let mut weights_shape = mce.weights_info.dimensions;
        if pass.algorithm() == MceAlgorithm::Winograd {
            assert!(
                mce.weights_info.format != WeightsFormat::Hwim,
                "depthwise convolution never uses Winograd"
            );
            // Kernel height and width are padded to a multiple of 3.
            for dim in weights_shape.iter_mut().take(2) {
                if *dim != 1 && *dim % 3 != 0 {
                    *dim = round_up_to_multiple(*dim, 3);
                }
            }
        }

        let input_info = TensorInfo {
            data_type: DataType::Qasymm8,
            data_format: producer.buffer_format(),
            tensor_shape: mce_input_shape,
            supertensor_shape: producer.shape,
            supertensor_offset: match pass.extract_subtensor().map(|id| &graph[id].kind) {
                Some(NodeKind::ExtractSubtensor { supertensor_offset }) => *supertensor_offset,
                _ => [0; 4],
            },
            stripe_shape: config.input_allocation.stripe_shape,
            tile_size: config.input_allocation.tile_size,
            dram_buffer_id: input_buffer_id,
            sram_offset: if input_location == BufferLocation::Sram {
                buffers.sram_offset(input_buffer_id)
            } else {
                config.input_allocation.offset
            },
            zero_point: producer.quantization.zero_point as u8,
            data_location: data_location(input_location),
        };

        let weight_info = TensorInfo {
            data_type: DataType::Qasymm8,
            data_format: DataFormat::WeightStream,
            tensor_shape: weights_shape,
            supertensor_shape: weights_shape,
            supertensor_offset: [0; 4],
            stripe_shape: config.weights_allocation.stripe_shape,
            tile_size: config.weights_allocation.tile_size,
            dram_buffer_id: weights_buffer_id,
            sram_offset: config.weights_allocation.offset,
            zero_point: mce.weights_info.quantization.zero_point as u8,
            data_location: DataLocation::Dram,
        };

        let mut output_info = TensorInfo {
            data_type: DataType::Qasymm8,
            data_format: output_format,
            tensor_shape: output_shape,
            supertensor_shape: output_shape,
            supertensor_offset: [0; 4],
            stripe_shape: config.output_allocation.stripe_shape,
            tile_size: config.output_allocation.tile_size,
            dram_buffer_id: 0,
            sram_offset: config.output_allocation.offset,
            zero_point: output_zero_point,
            data_location: data_location(output_location),
        };

        let mce_output_stripe = [
            config.input_allocation.stripe_shape[0],
            round_up_to_multiple(
                config.input_allocation.stripe_shape[1] * mce_output_shape[1] / mce_input_shape[1],
                brick[1],
            ),
            round_up_to_multiple(
                config.input_allocation.stripe_shape[2] * mce_output_shape[2] / mce_input_shape[2],
                brick[2],
            ),
            if ple_operation == PleOperation::Interleave2x2 {
                config.output_allocation.stripe_shape[3] / 4
            } else {
                config.output_allocation.stripe_shape[3]
            },
        ];

        let mut mce_data = MceData {
            stride: [mce.stride.x, mce.stride.y],
            pad_top: mce.pad_top,
            pad_left: mce.pad_left,
            uninterleaved_input_shape: mce.uninterleaved_input_shape.unwrap_or(mce_input_shape),
            output_shape: mce_output_shape,
            output_stripe_shape: mce_output_stripe,
            output_zero_point: quantization.zero_point as i16,
            upsample_mode: match mce.upscale_factor {
                1 => UpsampleType::Off,
                2 => UpsampleType::Transpose,
                other => panic!("unsupported upscale factor {}", other),
            },
            operation: mce.operation,
            algorithm: pass.algorithm(),
            ..MceData::default()
        };

        let mut pre_requantization = graph[pass.mce()].quantization;
        for &id in pass.post_processes() {
            if let NodeKind::McePostProcess {
                lower_bound,
                upper_bound,
            } = graph[id].kind
            {
                mce_data.activation_min = lower_bound;
                mce_data.activation_max = upper_bound;
            }
            pre_requantization = graph[id].quantization;
        }
        for &id in pass.requantizes() {
            let target = graph[id].quantization;
            mce_data.activation_min = requantize_bound(mce_data.activation_min, &pre_requantization, &target);
            mce_data.activation_max = requantize_bound(mce_data.activation_max, &pre_requantization, &target);
            pre_requantization = target;
        }

        if ple_operation == PleOperation::Sigmoid {
            let sigmoid = sigmoid_rescale(&quantization, mce_data.activation_min, mce_data.activation_max);
            mce_data.activation_min = sigmoid.activation_min;
            mce_data.activation_max = sigmoid.activation_max;
            mce_data.output_rescale_multiplier = sigmoid.multiplier;
            mce_data.output_rescale_shift = sigmoid.shift;
        }

        // Output buffer.
        let output_size = buffer_size(&output_shape, output_format, &brick);
        let output_buffer_id = if output_location == BufferLocation::Sram {
            buffers.add_sram(output_size, config.output_allocation.offset)
        } else if let Some(concat) = graph.find_concat_consumer(pass.last()) {
            let (offset, supertensor) = graph.concat_supertensor_info(pass.last(), concat);
            output_info.supertensor_offset = offset;
            output_info.supertensor_shape = supertensor;
            let shared = graph[concat].buffer_id;
            match shared {
                Some(id) => id,
                None => {
                    let concat_node = &graph[concat];
                    let size = buffer_size(&concat_node.shape, concat_node.buffer_format(), &brick);
                    let id = buffers.add_dram(BufferType::Intermediate, size);
                    graph[concat].buffer_id = Some(id);
                    id
                }
            }
        } else {
            buffers.add_dram(BufferType::Intermediate, output_size)
        };
        graph[pass.last()].buffer_id = Some(output_buffer_id);
        output_info.dram_buffer_id = output_buffer_id;

        let record = McePle {
            sram_config: SramConfig {
                allocation_strategy: Some(wire_strategy(config.strategy)),
            },
            input_info,
            weight_info,
            weight_metadata_buffer_id: metadata_buffer_id,
            output_info,
            block_config: config.block_config,
            mce_data,
            ple_data: PleData {
                ce_sram: config.ple_allocation.offset,
                ple_sram: 0,
                operation: ple_operation,
            },
        };
        stream.push(Command::McePle(record));
        self.session.record_command_emitted(stream.size_bytes());

        log::debug!(
            "emitted pass {}: {} block {} output buffer {} ({:?})",
            pass.id(),
            config.strategy,
            config.block_config,
            output_buffer_id,
            output_location
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_strategy_maps_fc_to_strategy1() {
        assert_eq!(wire_strategy(StrategyId::StrategyFc), SramAllocationStrategy::Strategy1);
        assert_eq!(wire_strategy(StrategyId::Strategy7), SramAllocationStrategy::Strategy7);
    }

    #[test]
    #[should_panic(expected = "without a strategy")]
    fn test_wire_strategy_none_panics() {
        wire_strategy(StrategyId::None);
    }

    #[test]
    fn test_rescale_multiplier_and_shift() {
        let rescale = 0.5 * LOG2_E * 256.0;
        let (multiplier, shift) = calculate_rescale_multiplier_and_shift(rescale);
        assert_eq!((multiplier, shift), (47274, 8));
        let approx = multiplier as f64 / (1u32 << shift) as f64;
        assert!((approx - rescale).abs() < 1.0 / 256.0);

        // Exact powers of two.
        assert_eq!(calculate_rescale_multiplier_and_shift(1.0), (32768, 15));
        assert_eq!(calculate_rescale_multiplier_and_shift(0.0), (0, 0));
    }

    #[test]
    fn test_sigmoid_bounds() {
        let sigmoid = sigmoid_rescale(&QuantizationInfo::new(128, 0.5), 0, 255);
        assert_eq!(sigmoid.multiplier, 47274);
        assert_eq!(sigmoid.shift, 8);
        // absMax = ceil(2^23 / 47274) - 1 = 177 covers the whole 8-bit range.
        assert_eq!((sigmoid.activation_min, sigmoid.activation_max), (0, 255));

        // A large scale narrows the range around the zero point.
        let sigmoid = sigmoid_rescale(&QuantizationInfo::new(128, 8.0), 0, 255);
        let abs_max = (2f64.powi(15 + sigmoid.shift as i32) / sigmoid.multiplier as f64).ceil() as i32 - 1;
        assert_eq!(sigmoid.activation_min as i32, 128 - abs_max);
        assert_eq!(sigmoid.activation_max as i32, 128 + abs_max);
    }

    #[test]
    fn test_sigmoid_tiny_scale_keeps_full_range() {
        let sigmoid = sigmoid_rescale(&QuantizationInfo::new(128, 1.0e-9), 0, 255);
        assert_eq!((sigmoid.activation_min, sigmoid.activation_max), (0, 255));

        let sigmoid = sigmoid_rescale(&QuantizationInfo::new(128, 1.0e-9), 10, 200);
        assert_eq!((sigmoid.activation_min, sigmoid.activation_max), (10, 200));
    }

    #[test]
    fn test_sigmoid_collapsed_range() {
        let sigmoid = sigmoid_rescale(&QuantizationInfo::new(100, 1.0e6), 0, 255);
        assert_eq!((sigmoid.multiplier, sigmoid.shift), (i16::MAX as u16, 0));
        assert_eq!((sigmoid.activation_min, sigmoid.activation_max), (99, 101));
    }

    #[test]
    fn test_requantize_bound() {
        let from = QuantizationInfo::new(0, 1.0);
        let to = QuantizationInfo::new(10, 0.5);
        assert_eq!(requantize_bound(20, &from, &to), 50);
        assert_eq!(requantize_bound(255, &from, &to), 255);
    }
}

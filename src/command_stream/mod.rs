// This module defines the command stream consumed by the NPU control unit. Every committed
// MCE+PLE pass becomes exactly one McePle record, appended in commit order. The record layout
// is fixed: every field is written little-endian, enums and narrow integers widen to 32 bits,
// and shapes are four consecutive u32 values in NHWC order. CommandStream serializes each
// command as it is appended, so the current size is always available to callers that need
// to lay out buffers relative to the stream (the stream itself becomes buffer zero).
// The enums here are the wire-level vocabulary shared by the graph, the pass builder and the
// emitter: MCE and PLE operations, the compute algorithm, block configs, data formats and
// the SRAM allocation strategy labels.

//! Fixed-layout command stream records.

use crate::core::utils::TensorShape;
use serde::{Deserialize, Serialize};

/// Multiply-compute engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MceOperation {
    Convolution,
    DepthwiseConvolution,
    FullyConnected,
}

/// Compute algorithm used by the MCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MceAlgorithm {
    #[default]
    Direct,
    Winograd,
}

/// Kernel run by the programmable post-processing engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PleOperation {
    #[default]
    #[serde(rename = "passthrough")]
    Passthrough,
    #[serde(rename = "interleave_2x2_2_2")]
    Interleave2x2,
    #[serde(rename = "maxpool_2x2_2_2")]
    MaxPool2x2,
    #[serde(rename = "maxpool_3x3_2_2")]
    MaxPool3x3,
    #[serde(rename = "mean_xy_8x8")]
    MeanXy8x8,
    #[serde(rename = "sigmoid")]
    Sigmoid,
    #[serde(rename = "ofm_scaling")]
    OfmScaling,
}

impl PleOperation {
    /// Numeric kernel id as written to the command stream.
    pub fn code(self) -> u32 {
        match self {
            PleOperation::Passthrough => 0,
            PleOperation::Interleave2x2 => 1,
            PleOperation::MaxPool2x2 => 2,
            PleOperation::MaxPool3x3 => 3,
            PleOperation::MeanXy8x8 => 4,
            PleOperation::Sigmoid => 5,
            PleOperation::OfmScaling => 6,
        }
    }
}

/// Spatial granularity processed by the MCE per cycle group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockConfig {
    pub width: u32,
    pub height: u32,
}

impl BlockConfig {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn area(&self) -> u32 {
        self.width * self.height
    }
}

impl std::fmt::Display for BlockConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// SRAM allocation strategy label understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SramAllocationStrategy {
    Strategy0,
    Strategy1,
    Strategy3,
    Strategy4,
    Strategy5,
    Strategy6,
    Strategy7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataType {
    #[default]
    Qasymm8,
}

/// Memory layout of a tensor as seen by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFormat {
    Nhwc,
    #[default]
    Nhwcb,
    NhwcbCompressed,
    WeightStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataLocation {
    #[default]
    Dram,
    Sram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpsampleType {
    #[default]
    Off,
    Transpose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SramConfig {
    pub allocation_strategy: Option<SramAllocationStrategy>,
}

/// Per-tensor description within an [`McePle`] record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TensorInfo {
    pub data_type: DataType,
    pub data_format: DataFormat,
    pub tensor_shape: TensorShape,
    pub supertensor_shape: TensorShape,
    pub supertensor_offset: TensorShape,
    pub stripe_shape: TensorShape,
    pub tile_size: u32,
    pub dram_buffer_id: u32,
    pub sram_offset: u32,
    pub zero_point: u8,
    pub data_location: DataLocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MceData {
    pub stride: [u32; 2],
    pub pad_top: u32,
    pub pad_left: u32,
    pub uninterleaved_input_shape: TensorShape,
    pub output_shape: TensorShape,
    pub output_stripe_shape: TensorShape,
    pub output_zero_point: i16,
    pub upsample_mode: UpsampleType,
    pub operation: MceOperation,
    pub algorithm: MceAlgorithm,
    pub activation_min: u8,
    pub activation_max: u8,
    pub output_rescale_multiplier: u16,
    pub output_rescale_shift: u16,
}

impl Default for MceData {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            pad_top: 0,
            pad_left: 0,
            uninterleaved_input_shape: [0; 4],
            output_shape: [0; 4],
            output_stripe_shape: [0; 4],
            output_zero_point: 0,
            upsample_mode: UpsampleType::Off,
            operation: MceOperation::Convolution,
            algorithm: MceAlgorithm::Direct,
            activation_min: 0,
            activation_max: 255,
            output_rescale_multiplier: 0,
            output_rescale_shift: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PleData {
    pub ce_sram: u32,
    pub ple_sram: u32,
    pub operation: PleOperation,
}

/// One fused MCE+PLE instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McePle {
    pub sram_config: SramConfig,
    pub input_info: TensorInfo,
    pub weight_info: TensorInfo,
    pub weight_metadata_buffer_id: u32,
    pub output_info: TensorInfo,
    pub block_config: BlockConfig,
    pub mce_data: MceData,
    pub ple_data: PleData,
}

impl Default for McePle {
    fn default() -> Self {
        Self {
            sram_config: SramConfig::default(),
            input_info: TensorInfo::default(),
            weight_info: TensorInfo::default(),
            weight_metadata_buffer_id: 0,
            output_info: TensorInfo::default(),
            block_config: BlockConfig::new(8, 8),
            mce_data: MceData::default(),
            ple_data: PleData::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    McePle(McePle),
}

impl Command {
    fn opcode(&self) -> u32 {
        match self {
            Command::McePle(_) => 0,
        }
    }
}

/// Append-only sequence of commands.
#[derive(Debug, Clone, Default)]
pub struct CommandStream {
    commands: Vec<Command>,
    bytes: Vec<u8>,
}

impl CommandStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command; it is serialized immediately.
    pub fn push(&mut self, command: Command) {
        let mut writer = Writer(&mut self.bytes);
        writer.u32(command.opcode());
        match &command {
            Command::McePle(record) => encode_mce_ple(&mut writer, record),
        }
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Serialized size in bytes of everything appended so far.
    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

struct Writer<'a>(&'a mut Vec<u8>);

impl Writer<'_> {
    fn u32(&mut self, value: u32) {
        self.0.extend_from_slice(&value.to_le_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.0.extend_from_slice(&value.to_le_bytes());
    }

    fn shape(&mut self, shape: &TensorShape) {
        for dim in shape {
            self.u32(*dim);
        }
    }
}

fn strategy_code(strategy: Option<SramAllocationStrategy>) -> u32 {
    match strategy {
        Some(SramAllocationStrategy::Strategy0) => 0,
        Some(SramAllocationStrategy::Strategy1) => 1,
        Some(SramAllocationStrategy::Strategy3) => 3,
        Some(SramAllocationStrategy::Strategy4) => 4,
        Some(SramAllocationStrategy::Strategy5) => 5,
        Some(SramAllocationStrategy::Strategy6) => 6,
        Some(SramAllocationStrategy::Strategy7) => 7,
        None => u32::MAX,
    }
}

fn data_format_code(format: DataFormat) -> u32 {
    match format {
        DataFormat::Nhwc => 0,
        DataFormat::Nhwcb => 1,
        DataFormat::NhwcbCompressed => 2,
        DataFormat::WeightStream => 3,
    }
}

fn mce_operation_code(operation: MceOperation) -> u32 {
    match operation {
        MceOperation::Convolution => 0,
        MceOperation::DepthwiseConvolution => 1,
        MceOperation::FullyConnected => 2,
    }
}

fn encode_tensor_info(writer: &mut Writer<'_>, info: &TensorInfo) {
    writer.u32(match info.data_type {
        DataType::Qasymm8 => 0,
    });
    writer.u32(data_format_code(info.data_format));
    writer.shape(&info.tensor_shape);
    writer.shape(&info.supertensor_shape);
    writer.shape(&info.supertensor_offset);
    writer.shape(&info.stripe_shape);
    writer.u32(info.tile_size);
    writer.u32(info.dram_buffer_id);
    writer.u32(info.sram_offset);
    writer.u32(info.zero_point as u32);
    writer.u32(match info.data_location {
        DataLocation::Dram => 0,
        DataLocation::Sram => 1,
    });
}

fn encode_mce_ple(writer: &mut Writer<'_>, record: &McePle) {
    writer.u32(strategy_code(record.sram_config.allocation_strategy));
    encode_tensor_info(writer, &record.input_info);
    encode_tensor_info(writer, &record.weight_info);
    writer.u32(record.weight_metadata_buffer_id);
    encode_tensor_info(writer, &record.output_info);
    writer.u32(record.block_config.width);
    writer.u32(record.block_config.height);

    let mce = &record.mce_data;
    writer.u32(mce.stride[0]);
    writer.u32(mce.stride[1]);
    writer.u32(mce.pad_top);
    writer.u32(mce.pad_left);
    writer.shape(&mce.uninterleaved_input_shape);
    writer.shape(&mce.output_shape);
    writer.shape(&mce.output_stripe_shape);
    writer.i32(mce.output_zero_point as i32);
    writer.u32(match mce.upsample_mode {
        UpsampleType::Off => 0,
        UpsampleType::Transpose => 1,
    });
    writer.u32(mce_operation_code(mce.operation));
    writer.u32(match mce.algorithm {
        MceAlgorithm::Direct => 0,
        MceAlgorithm::Winograd => 1,
    });
    writer.u32(mce.activation_min as u32);
    writer.u32(mce.activation_max as u32);
    writer.u32(mce.output_rescale_multiplier as u32);
    writer.u32(mce.output_rescale_shift as u32);

    writer.u32(record.ple_data.ce_sram);
    writer.u32(record.ple_data.ple_sram);
    writer.u32(record.ple_data.operation.code());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_size_tracks_appends() {
        let mut stream = CommandStream::new();
        assert_eq!(stream.size_bytes(), 0);

        stream.push(Command::McePle(McePle::default()));
        let one = stream.size_bytes();
        assert!(one > 0);

        stream.push(Command::McePle(McePle::default()));
        assert_eq!(stream.size_bytes(), 2 * one);
        assert_eq!(stream.len(), 2);
        assert_eq!(stream.to_bytes().len(), stream.size_bytes());
    }

    #[test]
    fn test_record_is_little_endian() {
        let mut record = McePle::default();
        record.sram_config.allocation_strategy = Some(SramAllocationStrategy::Strategy3);
        record.input_info.tile_size = 0x0102_0304;

        let mut stream = CommandStream::new();
        stream.push(Command::McePle(record));
        let bytes = stream.to_bytes();

        // opcode, strategy
        assert_eq!(&bytes[0..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[3, 0, 0, 0]);
        // input info: data type, format, 4 shapes, then tile size
        let tile_offset = 8 + 4 + 4 + 4 * 16;
        assert_eq!(&bytes[tile_offset..tile_offset + 4], &[4, 3, 2, 1]);
    }
}

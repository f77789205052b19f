//! Graph vertices.
//!
//! A [`Node`] carries the attributes shared by every kind (shape, layout,
//! location, quantization, hints) plus a closed [`NodeKind`] with the
//! per-kind data the pass builder reads.

use crate::command_stream::{MceAlgorithm, MceOperation, PleOperation};
use crate::core::buffer_manager::BufferLocation;
use crate::core::utils::{Fraction, ShapeMultiplier, TensorShape};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a node in its [`Graph`](super::Graph).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Activation layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilerDataFormat {
    /// Plain channel-interleaved layout.
    Nhwc,
    /// Blocked layout in brick groups.
    #[default]
    Nhwcb,
}

/// Weight storage layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightsFormat {
    /// Height, width, input channels, output channels.
    Hwio,
    /// Height, width, input channels, channel multiplier (depthwise).
    Hwim,
    /// Any activation layout; never valid for weights reaching a pass.
    Nhwc,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantizationInfo {
    pub zero_point: i32,
    pub scale: f32,
}

impl QuantizationInfo {
    pub const fn new(zero_point: i32, scale: f32) -> Self {
        Self { zero_point, scale }
    }
}

impl Default for QuantizationInfo {
    fn default() -> Self {
        Self::new(0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionHint {
    #[default]
    PreferCompressed,
    RequiredUncompressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationHint {
    #[default]
    PreferSram,
    RequireDram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmHint {
    #[default]
    AllowWinograd,
    RequireDirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stride {
    pub x: u32,
    pub y: u32,
}

impl Stride {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl Default for Stride {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightsInfo {
    pub dimensions: TensorShape,
    pub format: WeightsFormat,
    pub quantization: QuantizationInfo,
}

/// Data of a multiply-compute engine node.
#[derive(Debug, Clone, PartialEq)]
pub struct MceOperationData {
    pub operation: MceOperation,
    pub weights_info: WeightsInfo,
    pub weights_data: Vec<u8>,
    pub stride: Stride,
    pub pad_top: u32,
    pub pad_left: u32,
    pub upscale_factor: u32,
    pub algorithm_hint: AlgorithmHint,
    /// Input shape before any interleaving; equals the input shape otherwise.
    pub uninterleaved_input_shape: Option<TensorShape>,
    pub shape_multiplier: ShapeMultiplier,
    /// Chosen when the owning pass commits.
    pub algorithm: MceAlgorithm,
}

impl MceOperationData {
    pub fn new(operation: MceOperation, weights_info: WeightsInfo, weights_data: Vec<u8>) -> Self {
        Self {
            operation,
            weights_info,
            weights_data,
            stride: Stride::default(),
            pad_top: 0,
            pad_left: 0,
            upscale_factor: 1,
            algorithm_hint: AlgorithmHint::AllowWinograd,
            uninterleaved_input_shape: None,
            shape_multiplier: ShapeMultiplier::IDENTITY,
            algorithm: MceAlgorithm::Direct,
        }
    }

    pub fn with_stride(mut self, stride: Stride) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, pad_top: u32, pad_left: u32) -> Self {
        self.pad_top = pad_top;
        self.pad_left = pad_left;
        self
    }

    /// Sets the upscale factor and the matching spatial shape multiplier.
    pub fn with_upscale_factor(mut self, upscale_factor: u32) -> Self {
        self.upscale_factor = upscale_factor;
        self.shape_multiplier = ShapeMultiplier::new(
            Fraction::new(upscale_factor, 1),
            Fraction::new(upscale_factor, 1),
            Fraction::ONE,
        );
        self
    }

    pub fn with_algorithm_hint(mut self, hint: AlgorithmHint) -> Self {
        self.algorithm_hint = hint;
        self
    }

    pub fn is_fully_connected(&self) -> bool {
        self.operation == MceOperation::FullyConnected
    }

    pub fn is_depthwise(&self) -> bool {
        self.operation == MceOperation::DepthwiseConvolution
    }

    pub fn kernel_height(&self) -> u32 {
        self.weights_info.dimensions[0]
    }

    pub fn kernel_width(&self) -> u32 {
        self.weights_info.dimensions[1]
    }
}

/// Data of a PLE kernel that can only run fused behind an MCE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuseOnlyPleData {
    pub operation: PleOperation,
    pub shape_multiplier: ShapeMultiplier,
}

impl FuseOnlyPleData {
    pub fn new(operation: PleOperation) -> Self {
        let half = Fraction::new(1, 2);
        let shape_multiplier = match operation {
            PleOperation::Interleave2x2 => ShapeMultiplier::new(half, half, Fraction::new(4, 1)),
            PleOperation::MaxPool2x2 | PleOperation::MaxPool3x3 => {
                ShapeMultiplier::new(half, half, Fraction::ONE)
            }
            PleOperation::MeanXy8x8 => {
                let eighth = Fraction::new(1, 8);
                ShapeMultiplier::new(eighth, eighth, Fraction::ONE)
            }
            PleOperation::Passthrough | PleOperation::Sigmoid | PleOperation::OfmScaling => {
                ShapeMultiplier::IDENTITY
            }
        };
        Self {
            operation,
            shape_multiplier,
        }
    }

    /// Whether the kernel produces the same result regardless of the
    /// quantization of its input, so a requantize may move in front of it.
    pub fn is_agnostic_to_requantisation(&self) -> bool {
        matches!(
            self.operation,
            PleOperation::Interleave2x2 | PleOperation::MaxPool2x2 | PleOperation::MaxPool3x3
        )
    }
}

/// Closed set of node kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Network input fed by an external operation.
    Input { source_operation_id: u32 },
    /// Network output.
    Output { source_operation_id: u32, output_index: u32 },
    /// Changes the layout of its input to the node's format.
    FormatConversion,
    /// Reads a sub-tensor of its input starting at the given offset.
    ExtractSubtensor { supertensor_offset: TensorShape },
    MceOperation(MceOperationData),
    /// Clamp applied by the MCE after accumulation, e.g. ReLU.
    McePostProcess { lower_bound: u8, upper_bound: u8 },
    FuseOnlyPle(FuseOnlyPleData),
    /// Changes the quantization to the node's own.
    Requantize,
    /// Joins its inputs along `axis`; the only multi-input kind.
    Concat { axis: u32 },
    /// Any other operation; never fused into an MCE pass.
    Passthrough { label: String },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Input { .. } => "Input",
            NodeKind::Output { .. } => "Output",
            NodeKind::FormatConversion => "FormatConversion",
            NodeKind::ExtractSubtensor { .. } => "ExtractSubtensor",
            NodeKind::MceOperation(_) => "MceOperation",
            NodeKind::McePostProcess { .. } => "McePostProcess",
            NodeKind::FuseOnlyPle(_) => "FuseOnlyPle",
            NodeKind::Requantize => "Requantize",
            NodeKind::Concat { .. } => "Concat",
            NodeKind::Passthrough { .. } => "Passthrough",
        }
    }
}

/// Input edge: the producing node and which of its outputs is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub source: NodeId,
    pub output_index: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub shape: TensorShape,
    pub format: CompilerDataFormat,
    pub quantization: QuantizationInfo,
    pub location: BufferLocation,
    pub compression_hint: CompressionHint,
    pub location_hint: LocationHint,
    /// Whether the node's output is stored compressed.
    pub compressed: bool,
    /// Valid when `location` is SRAM.
    pub output_sram_offset: u32,
    pub buffer_id: Option<u32>,
    pub inputs: Vec<Edge>,
    /// Set once, when the owning pass commits.
    pub pass: Option<usize>,
}

impl Node {
    pub fn mce(&self) -> Option<&MceOperationData> {
        match &self.kind {
            NodeKind::MceOperation(data) => Some(data),
            _ => None,
        }
    }

    pub fn mce_mut(&mut self) -> Option<&mut MceOperationData> {
        match &mut self.kind {
            NodeKind::MceOperation(data) => Some(data),
            _ => None,
        }
    }

    pub fn ple(&self) -> Option<&FuseOnlyPleData> {
        match &self.kind {
            NodeKind::FuseOnlyPle(data) => Some(data),
            _ => None,
        }
    }

    /// Hardware layout of the node's output buffer.
    pub fn buffer_format(&self) -> crate::command_stream::DataFormat {
        use crate::command_stream::DataFormat;
        match self.format {
            CompilerDataFormat::Nhwc => DataFormat::Nhwc,
            CompilerDataFormat::Nhwcb if self.compressed => DataFormat::NhwcbCompressed,
            CompilerDataFormat::Nhwcb => DataFormat::Nhwcb,
        }
    }
}

//! Hardware capabilities and compiler options.
//!
//! [`HardwareCapabilities`] is immutable for the lifetime of a compilation and
//! supplies every constant the scheduler consults: engine geometry, SRAM size
//! and lane count, Winograd transform constants and brick/patch shapes.
//! [`CompilerOptions`] carries the switches resolved at configuration time and
//! [`EstimationOptions`] tunes the cost model.

use super::utils::TensorShape;
use serde::{Deserialize, Serialize};

/// Constants describing one NPU variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareCapabilities {
    /// Number of compute engines.
    pub num_engines: u32,
    /// Output feature maps produced per engine per pass over the input.
    pub ofm_per_engine: u32,
    /// Input feature maps consumed per engine per cycle group.
    pub ifm_per_engine: u32,
    /// Multiply-accumulate units per engine.
    pub mac_units_per_engine: u32,
    /// Accumulators available per engine.
    pub total_accumulators_per_engine: u32,
    /// Total on-chip SRAM in bytes.
    pub total_sram_size: u32,
    /// Number of SRAM lanes (one per engine bank).
    pub num_srams: u32,
    /// Bytes reserved for one PLE kernel's code.
    pub max_ple_size: u32,
    /// Shape of one brick group (NHWC).
    pub brick_group_shape: TensorShape,
    /// Shape of one patch (NHWC).
    pub patch_shape: TensorShape,
    pub macs_per_winograd_1d: u32,
    pub macs_per_winograd_2d: u32,
    pub output_size_per_winograd_1d: u32,
    pub output_size_per_winograd_2d: u32,
    /// Kernels larger than this are decomposed into sub-kernels for Winograd.
    pub wide_kernel_size: u32,
}

impl HardwareCapabilities {
    /// Output feature map lanes across all engines.
    pub fn number_of_ofm(&self) -> u32 {
        self.num_engines * self.ofm_per_engine
    }

    /// Input feature map lanes across all engines.
    pub fn number_of_ifm(&self) -> u32 {
        self.num_engines * self.ifm_per_engine
    }
}

impl Default for HardwareCapabilities {
    fn default() -> Self {
        Self {
            num_engines: 8,
            ofm_per_engine: 2,
            ifm_per_engine: 16,
            mac_units_per_engine: 8,
            total_accumulators_per_engine: 512,
            total_sram_size: 512 * 1024,
            num_srams: 16,
            max_ple_size: 4096,
            brick_group_shape: [1, 8, 8, 16],
            patch_shape: [1, 4, 4, 1],
            macs_per_winograd_1d: 4,
            macs_per_winograd_2d: 16,
            output_size_per_winograd_1d: 2,
            output_size_per_winograd_2d: 2,
            wide_kernel_size: 3,
        }
    }
}

/// Switches resolved when the compiler is configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    /// Allow the Winograd algorithm for eligible convolutions.
    pub enable_winograd: bool,
    /// Allow compressed NHWCB intermediates in DRAM.
    pub enable_intermediate_compression: bool,
    /// Emit every pass with the OFM-scaling PLE kernel instead of its own.
    pub ple_ofm_scaling_bypass: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            enable_winograd: true,
            enable_intermediate_compression: false,
            ple_ofm_scaling_bypass: false,
        }
    }
}

/// Cost model tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationOptions {
    /// Fraction of activation traffic saved by compression (0.0 - 1.0).
    pub activation_compression_saving: f32,
    /// Encode synthetic weights with the given sparsity instead of the real ones.
    pub use_weight_compression_override: bool,
    /// Fraction of weight elements equal to the zero point in synthetic weights.
    pub weight_compression_saving: f32,
}

impl Default for EstimationOptions {
    fn default() -> Self {
        Self {
            activation_compression_saving: 0.5,
            use_weight_compression_override: false,
            weight_compression_saving: 0.5,
        }
    }
}

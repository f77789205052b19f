// This module holds the infrastructure shared by pass construction and emission: the
// hardware capability and option records, the configuration file loader, the on-chip SRAM
// allocator, the buffer registry that lays out every DRAM and SRAM buffer of the compiled
// network, the per-compilation statistics session, error types and small shape helpers.
// Nothing here knows about MCE or PLE semantics; the pass module builds on top of it.

//! Core npupass infrastructure.

pub mod buffer_manager;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod session;
pub mod sram_allocator;
pub mod utils;

pub use buffer_manager::{BufferLocation, BufferManager, BufferType, CompilerBufferInfo};
pub use capabilities::{CompilerOptions, EstimationOptions, HardwareCapabilities};
pub use config::{load_config_file, CompilerConfig};
pub use error::{CompileError, CompileResult, ConfigError, SramError};
pub use session::{CompilationSession, SessionStats};
pub use sram_allocator::{AllocationPreference, Span, SramAllocator};

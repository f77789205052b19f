//! npupass - MCE+PLE pass construction for a fixed-function NPU.
//!
//! The scheduler greedily fuses chains of graph nodes into single MCE+PLE
//! instructions, searches tiling strategies and block configs against the
//! on-chip SRAM, emits fixed-layout command records and estimates the cost
//! of each pass.
//!
//! # Primary Usage
//!
//! ```ignore
//! use npupass::core::{BufferManager, CompilationSession, CompilerConfig};
//! use npupass::network::load_network_file;
//! use npupass::pass::MaskWeightEncoder;
//!
//! let network = load_network_file(path)?;
//! let mut buffers = BufferManager::new();
//! let mut graph = network.build_graph(&mut buffers)?;
//! let session = CompilationSession::new();
//! let result = npupass::driver::schedule(
//!     &mut graph,
//!     &CompilerConfig::default(),
//!     &MaskWeightEncoder::new(),
//!     &mut buffers,
//!     &session,
//! )?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Capabilities, configuration, SRAM allocator, buffer registry, errors
//! - [`graph`] - Operation graph and fix-up requests
//! - [`pass`] - Builder, strategies, emitter and cost model
//! - [`command_stream`] - Wire-level records
//! - [`network`] - Network description files
//! - [`driver`] - Whole-network scheduling

pub mod command_stream;
pub mod core;
pub mod driver;
pub mod graph;
pub mod network;
pub mod pass;

// This module defines the error types for the npupass scheduler using the thiserror crate.
// Infeasible schedules are not errors: the pass builder reports them as data through
// PassOutcome and FixupRequest. The enums here cover the remaining recoverable failures:
// misuse of the SRAM allocator (freeing an unknown span), buffer registry access before
// layout, a pass whose input has no registered buffer, and configuration loading problems
// (I/O, TOML syntax, inconsistent network descriptions). CompileResult<T> is the usual
// convenience alias.

//! Error types for the npupass scheduler.
//!
//! Using thiserror for idiomatic error handling.

use thiserror::Error;

/// Main error type for pass construction and emission.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("SRAM allocator error: {0}")]
    Sram(#[from] SramError),

    #[error("Buffer table has not been laid out yet; call allocate() first")]
    BuffersNotAllocated,

    #[error("Buffer table has already been laid out")]
    BuffersAlreadyAllocated,

    #[error("Unknown buffer id {id}")]
    UnknownBuffer {
        id: u32,
    },

    #[error("Node {node} has no registered buffer")]
    MissingBuffer {
        node: usize,
    },

    #[error("Node {node} has no input")]
    MissingInput {
        node: usize,
    },
}

/// Errors from the on-chip SRAM allocator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SramError {
    #[error("No allocation starts at offset {offset:#x}")]
    UnknownOffset {
        offset: u32,
    },
}

/// Errors raised while loading configuration or network description files.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid network description: {reason}")]
    InvalidNetwork {
        reason: String,
    },
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;

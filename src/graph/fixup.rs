//! Structured requests returned when a pass cannot be built as the graph stands.
//!
//! The builder never writes these into the graph. The caller decides whether to
//! apply one and retry.

use super::node::{CompilerDataFormat, NodeId};
use crate::command_stream::MceAlgorithm;
use crate::core::buffer_manager::BufferLocation;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupRequest {
    /// The node's output must be converted to `format`.
    RequireOutputFormat { node: NodeId, format: CompilerDataFormat },
    /// The MCE must use `algorithm` (always direct).
    ForceAlgorithm { node: NodeId, algorithm: MceAlgorithm },
    /// The node's output must live in `location` (always DRAM).
    ForceLocation { node: NodeId, location: BufferLocation },
    /// The node's output must not be compressed.
    RequireUncompressedOutput { node: NodeId },
}

impl FixupRequest {
    /// The node the request applies to.
    pub fn node(&self) -> NodeId {
        match *self {
            FixupRequest::RequireOutputFormat { node, .. }
            | FixupRequest::ForceAlgorithm { node, .. }
            | FixupRequest::ForceLocation { node, .. }
            | FixupRequest::RequireUncompressedOutput { node } => node,
        }
    }

    /// Short name used in statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            FixupRequest::RequireOutputFormat { .. } => "RequireOutputFormat",
            FixupRequest::ForceAlgorithm { .. } => "ForceAlgorithm",
            FixupRequest::ForceLocation { .. } => "ForceLocation",
            FixupRequest::RequireUncompressedOutput { .. } => "RequireUncompressedOutput",
        }
    }
}

impl fmt::Display for FixupRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixupRequest::RequireOutputFormat { node, format } => {
                write!(f, "convert output of {} to {:?}", node, format)
            }
            FixupRequest::ForceAlgorithm { node, algorithm } => {
                write!(f, "force {} to use the {:?} algorithm", node, algorithm)
            }
            FixupRequest::ForceLocation { node, location } => {
                write!(f, "move output of {} to {:?}", node, location)
            }
            FixupRequest::RequireUncompressedOutput { node } => {
                write!(f, "store output of {} uncompressed", node)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixup_node_and_kind() {
        let fixup = FixupRequest::ForceLocation {
            node: NodeId(4),
            location: BufferLocation::Dram,
        };
        assert_eq!(fixup.node(), NodeId(4));
        assert_eq!(fixup.kind(), "ForceLocation");
        assert_eq!(fixup.to_string(), "move output of %4 to Dram");
    }
}

// This module provides the CompilationSession, the statistics hub shared by the pass
// builder, the strategy search and the command emitter while a network is scheduled.
// The session is borrowed immutably by every component and records its counters through
// interior mutability, so recording a probe from deep inside the strategy search does not
// require threading a mutable reference through the whole call chain. SessionStats tracks
// feasibility probes, (strategy, block config) attempts, passes created, fix-up requests by
// kind, commands emitted and the final command stream size. The Display implementation
// prints a summary for the command line tool.

//! Compilation session statistics.
//!
//! The session is single-threaded; counters live in a `RefCell` so that every
//! component can record against a shared `&CompilationSession`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;

/// Shared state for one scheduling run.
#[derive(Debug, Default)]
pub struct CompilationSession {
    /// Session statistics for debugging and tuning.
    stats: RefCell<SessionStats>,

    /// Name of the network being scheduled, if known.
    network_name: RefCell<Option<String>>,
}

impl CompilationSession {
    /// Create a new, empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the name of the network being scheduled.
    pub fn set_network_name(&self, name: &str) {
        *self.network_name.borrow_mut() = Some(name.to_string());
    }

    pub fn network_name(&self) -> Option<String> {
        self.network_name.borrow().clone()
    }

    /// Record one feasibility probe of a candidate node chain.
    pub fn record_probe(&self, succeeded: bool) {
        let mut stats = self.stats.borrow_mut();
        stats.probes += 1;
        if !succeeded {
            stats.failed_probes += 1;
        }
    }

    /// Record a single `(strategy, block config)` setup attempt.
    pub fn record_strategy_attempt(&self) {
        self.stats.borrow_mut().strategy_attempts += 1;
    }

    /// Record a committed pass.
    pub fn record_pass_created(&self, num_nodes: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.passes_created += 1;
        stats.nodes_fused += num_nodes;
    }

    /// Record a fix-up request returned to the caller.
    pub fn record_fixup(&self, kind: &str) {
        *self
            .stats
            .borrow_mut()
            .fixups
            .entry(kind.to_string())
            .or_insert(0) += 1;
    }

    /// Record a command appended to the command stream.
    pub fn record_command_emitted(&self, stream_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.commands_emitted += 1;
        stats.command_stream_size = stream_size;
    }

    /// Get a snapshot of the statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Scheduling statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Feasibility probes run while extending node chains.
    pub probes: usize,

    /// Probes for which no strategy fit.
    pub failed_probes: usize,

    /// `(strategy, block config)` pairs tried.
    pub strategy_attempts: usize,

    /// Passes committed.
    pub passes_created: usize,

    /// Nodes fused into committed passes.
    pub nodes_fused: usize,

    /// Fix-up requests by kind.
    pub fixups: BTreeMap<String, usize>,

    /// Commands appended to the command stream.
    pub commands_emitted: usize,

    /// Serialized command stream size after the last append (bytes).
    pub command_stream_size: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Scheduling Session Statistics:")?;
        writeln!(f, "  Probes: {} ({} failed)", self.probes, self.failed_probes)?;
        writeln!(f, "  Strategy attempts: {}", self.strategy_attempts)?;
        writeln!(f, "  Passes created: {}", self.passes_created)?;
        writeln!(f, "  Nodes fused: {}", self.nodes_fused)?;
        writeln!(f, "  Commands emitted: {}", self.commands_emitted)?;
        writeln!(f, "  Command stream size: {} bytes", self.command_stream_size)?;

        if !self.fixups.is_empty() {
            writeln!(f, "  Fix-up requests:")?;
            for (kind, count) in &self.fixups {
                writeln!(f, "    {}: {}", kind, count)?;
            }
        }

        Ok(())
    }
}

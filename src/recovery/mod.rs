//! Cleanup, consistency, and recovery.
//!
//! Guards the cross-store invariants between the entity store, the
//! lifecycle metadata, and the render bridge: a priority-queued cleanup
//! pipeline, a periodic consistency cross-pass, an escalating recovery
//! engine, and memory-pressure monitoring.

pub mod cleanup;
pub mod consistency;
pub mod engine;
pub mod health;

pub use cleanup::{CleanupKind, CleanupOp, CleanupQueue, CleanupTarget};
pub use consistency::{ConsistencyChecker, Inconsistency};
pub use engine::{ErrorComponent, ErrorReport, ErrorSeverity, RecoveryEngine, RecoveryStrategy};
pub use health::{score as health_score, HealthBand, HealthInputs, HealthReport};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::warn;

/// Pressure classification from the process footprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
}

/// Samples this process's memory use against the configured thresholds.
pub struct MemoryMonitor {
    system: System,
    pid: Pid,
    warn_bytes: u64,
    critical_bytes: u64,
    last_usage: u64,
}

impl MemoryMonitor {
    pub fn new(warn_bytes: u64, critical_bytes: u64) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
            warn_bytes,
            critical_bytes,
            last_usage: 0,
        }
    }

    /// Refresh and classify. Returns the level and current usage.
    pub fn probe(&mut self) -> (MemoryLevel, u64) {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]));
        let usage = self
            .system
            .process(self.pid)
            .map(|p| p.memory())
            .unwrap_or(self.last_usage);
        self.last_usage = usage;

        let level = if usage >= self.critical_bytes {
            warn!(usage, "memory above critical threshold");
            MemoryLevel::Critical
        } else if usage >= self.warn_bytes {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        };
        (level, usage)
    }

    /// Usage as a fraction of the critical threshold, for health scoring.
    pub fn pressure(&self) -> f32 {
        if self.critical_bytes == 0 {
            return 0.0;
        }
        (self.last_usage as f32 / self.critical_bytes as f32).clamp(0.0, 1.0)
    }
}

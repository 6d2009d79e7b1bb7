//! Per-opcode operation counters.
//!
//! A cloneable handle wraps the counters so external pollers (the node's
//! stats exporter) can snapshot them without touching the engine.

use parking_lot::Mutex;
use std::sync::Arc;

/// Counters for one opcode.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpStats {
    pub count: u64,
    pub errors: u64,
    pub total_usec: u64,
}

/// All engine counters.
#[derive(Clone, Debug, Default)]
pub struct EngineStats {
    pub read: OpStats,
    pub write: OpStats,
    pub delete: OpStats,
    pub sync: OpStats,
    pub stable: OpStats,
    pub rollback: OpStats,
    pub list: OpStats,
}

impl EngineStats {
    fn slot(&mut self, name: &str) -> Option<&mut OpStats> {
        match name {
            "read" => Some(&mut self.read),
            "write" | "write_stable" => Some(&mut self.write),
            "delete" => Some(&mut self.delete),
            "sync" | "sync_stab_all" => Some(&mut self.sync),
            "stable" => Some(&mut self.stable),
            "rollback" => Some(&mut self.rollback),
            "list" => Some(&mut self.list),
            _ => None,
        }
    }
}

/// Shared handle to the engine's counters.
#[derive(Clone, Default)]
pub struct StatsHandle {
    inner: Arc<Mutex<EngineStats>>,
}

impl StatsHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, opcode: &str, usec: u64, ok: bool) {
        let mut stats = self.inner.lock();
        if let Some(slot) = stats.slot(opcode) {
            slot.count += 1;
            slot.total_usec += usec;
            if !ok {
                slot.errors += 1;
            }
        }
    }

    /// Snapshot of the current counters.
    pub fn snapshot(&self) -> EngineStats {
        self.inner.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let handle = StatsHandle::new();
        handle.record("write", 120, true);
        handle.record("write_stable", 80, true);
        handle.record("read", 40, false);

        let snap = handle.snapshot();
        assert_eq!(snap.write.count, 2);
        assert_eq!(snap.write.total_usec, 200);
        assert_eq!(snap.read.errors, 1);
        assert_eq!(snap.sync.count, 0);
    }
}

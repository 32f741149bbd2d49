use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tessera_routing::{ChunkRange, Namespace, ShardKey};
use tracing::info;

/// What a critical section blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SectionScope {
    /// Writes whose shard key falls in the range (migration commit).
    Range(ChunkRange),
    /// Every write to the namespace (resharding cutover).
    Namespace,
}

#[derive(Debug, Clone)]
struct Section {
    id: u64,
    scope: SectionScope,
    reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// No section applied.
    Clear,
    /// A section applied and was released while waiting.
    Released,
    /// Still blocked after the timeout.
    TimedOut,
}

/// Write barriers held by migrations and resharding while they switch
/// ownership. Readers are never blocked.
#[derive(Debug, Default)]
pub struct CriticalSections {
    sections: Mutex<(u64, HashMap<Namespace, Vec<Section>>)>,
    released: Condvar,
}

impl CriticalSections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, ns: &Namespace, scope: SectionScope, reason: &str) -> u64 {
        let mut guard = self.sections.lock().unwrap_or_else(|e| e.into_inner());
        guard.0 += 1;
        let id = guard.0;
        info!(ns = %ns, id, reason, scope = ?scope, "entering critical section");
        guard.1.entry(ns.clone()).or_default().push(Section {
            id,
            scope,
            reason: reason.to_string(),
        });
        id
    }

    pub fn exit(&self, ns: &Namespace, id: u64) {
        let mut guard = self.sections.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = guard.1.get_mut(ns) {
            list.retain(|s| s.id != id);
            if list.is_empty() {
                guard.1.remove(ns);
            }
        }
        info!(ns = %ns, id, "exited critical section");
        self.released.notify_all();
    }

    /// Release every section on `ns` entered with `reason`. Used when the
    /// owner of a section restarts and no longer knows its id.
    pub fn exit_reason(&self, ns: &Namespace, reason: &str) -> usize {
        let mut guard = self.sections.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = guard.1.get_mut(ns) else {
            return 0;
        };
        let before = list.len();
        list.retain(|s| s.reason != reason);
        let released = before - list.len();
        if list.is_empty() {
            guard.1.remove(ns);
        }
        if released > 0 {
            info!(ns = %ns, reason, released, "released critical sections");
            self.released.notify_all();
        }
        released
    }

    /// Reasons of the sections currently held on `ns`.
    pub fn active(&self, ns: &Namespace) -> Vec<String> {
        let guard = self.sections.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .1
            .get(ns)
            .map(|l| l.iter().map(|s| s.reason.clone()).collect())
            .unwrap_or_default()
    }

    /// Block while a section covers a write to `key` (or any write, when the
    /// key is unknown).
    pub fn wait(&self, ns: &Namespace, key: Option<&ShardKey>, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut guard = self.sections.lock().unwrap_or_else(|e| e.into_inner());
        let mut waited = false;
        loop {
            let blocked = guard.1.get(ns).is_some_and(|list| {
                list.iter().any(|s| match (&s.scope, key) {
                    (SectionScope::Namespace, _) => true,
                    (SectionScope::Range(r), Some(k)) => r.contains(k),
                    (SectionScope::Range(_), None) => true,
                })
            });
            if !blocked {
                return if waited {
                    WaitOutcome::Released
                } else {
                    WaitOutcome::Clear
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            waited = true;
            guard = self
                .released
                .wait_timeout(guard, deadline - now)
                .map(|(g, _)| g)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

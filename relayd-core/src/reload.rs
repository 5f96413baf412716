//! The proxy's half of hot reload (spec.md §4.2, §9: "implement as an
//! explicit three-state machine, not ad-hoc flags").

use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStatus {
    Stopped,
    Preparing,
    WorkersDone,
}

/// Gates the shadow worker pool off the active idle pool until every
/// configured group has registered its full complement of shadow
/// workers.
#[derive(Debug, Clone)]
pub struct ReloadHelper {
    status: ReloadStatus,
    workers_by_group: BTreeMap<u32, HashSet<u64>>,
}

impl Default for ReloadHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl ReloadHelper {
    pub fn new() -> Self {
        ReloadHelper {
            status: ReloadStatus::Stopped,
            workers_by_group: BTreeMap::new(),
        }
    }

    pub fn status(&self) -> ReloadStatus {
        self.status
    }

    pub fn running(&self) -> bool {
        !matches!(self.status, ReloadStatus::Stopped)
    }

    /// SIGHUP handling: arm the helper for a fresh reload.
    pub fn start(&mut self) {
        self.workers_by_group.clear();
        self.status = ReloadStatus::Preparing;
    }

    /// Swap completed; rearm for the next reload.
    pub fn stop(&mut self) {
        self.workers_by_group.clear();
        self.status = ReloadStatus::Stopped;
    }

    /// Register a newly-connected shadow worker. Returns `true` iff
    /// every configured group now has exactly `count` registered shadow
    /// workers, in which case the helper transitions to `WorkersDone`.
    pub fn add_worker(
        &mut self,
        worker_id: u64,
        group_id: u32,
        expected_counts: &BTreeMap<u32, usize>,
    ) -> bool {
        self.workers_by_group
            .entry(group_id)
            .or_default()
            .insert(worker_id);

        let all_satisfied = expected_counts.iter().all(|(gid, count)| {
            self.workers_by_group
                .get(gid)
                .map(|s| s.len())
                .unwrap_or(0)
                == *count
        });

        if all_satisfied {
            self.status = ReloadStatus::WorkersDone;
        }

        all_satisfied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(pairs: &[(u32, usize)]) -> BTreeMap<u32, usize> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn starts_stopped() {
        let h = ReloadHelper::new();
        assert_eq!(h.status(), ReloadStatus::Stopped);
        assert!(!h.running());
    }

    #[test]
    fn transitions_to_workers_done_only_when_every_group_full() {
        let mut h = ReloadHelper::new();
        h.start();
        assert_eq!(h.status(), ReloadStatus::Preparing);

        let expected = expected(&[(1, 2), (2, 1)]);

        assert!(!h.add_worker(100, 1, &expected));
        assert_eq!(h.status(), ReloadStatus::Preparing);

        assert!(!h.add_worker(101, 1, &expected));
        assert_eq!(h.status(), ReloadStatus::Preparing);

        assert!(h.add_worker(200, 2, &expected));
        assert_eq!(h.status(), ReloadStatus::WorkersDone);
    }

    #[test]
    fn stop_rearms_for_next_reload() {
        let mut h = ReloadHelper::new();
        h.start();
        let expected = expected(&[(1, 1)]);
        assert!(h.add_worker(1, 1, &expected));

        h.stop();
        assert_eq!(h.status(), ReloadStatus::Stopped);
        assert!(!h.add_worker(1, 1, &expected)); // cleared; needs re-registering
    }
}

use crate::core::job::JobStatus;
use crate::core::store::JobStore;
use std::collections::VecDeque;

/// One entry in the priority queue: `(-priority, submit_time, job_id)`
/// ordered lexicographically, per spec §4.C — higher priority wins, earlier
/// submission wins within a priority.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueEntry {
    priority: i64,
    submit_time: i64,
    job_id: String,
}

fn sort_key(e: &QueueEntry) -> (std::cmp::Reverse<i64>, i64) {
    (std::cmp::Reverse(e.priority), e.submit_time)
}

/// Ordered view of queued jobs. Supports non-destructive iteration with
/// reinsertion: the placement engine drains the queue in order, tries each
/// entry once, and reinserts the ones it could not place (deferred) while
/// preserving their relative order.
#[derive(Default)]
pub struct PriorityQueue {
    entries: VecDeque<QueueEntry>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Insert in sorted position. Ties break by insertion order (new entries
    /// with an equal key are appended after existing ones), which is what
    /// keeps deferred reinsertion order-preserving.
    pub fn push(&mut self, job_id: String, priority: i64, submit_time: i64) {
        let entry = QueueEntry {
            priority,
            submit_time,
            job_id,
        };
        let key = sort_key(&entry);
        let pos = self
            .entries
            .iter()
            .position(|e| sort_key(e) > key)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn remove(&mut self, job_id: &str) {
        self.entries.retain(|e| e.job_id != job_id);
    }

    /// Drains the whole queue in priority order. A dequeued entry whose
    /// Job Store status is no longer `queued` (e.g. it was cancelled) is
    /// silently dropped, per spec §4.C.
    pub fn drain_ordered(&mut self, store: &JobStore) -> Vec<String> {
        self.entries
            .drain(..)
            .filter_map(|e| match store.get(&e.job_id) {
                Some(job) if job.status == JobStatus::Queued => Some(e.job_id),
                _ => None,
            })
            .collect()
    }

    /// Reinsert a job that was examined this pass and found infeasible.
    /// Callers pass jobs back in the order they were deferred so that
    /// relative ordering among deferred entries is preserved.
    pub fn reinsert(&mut self, job_id: String, priority: i64, submit_time: i64) {
        self.push(job_id, priority, submit_time);
    }
}

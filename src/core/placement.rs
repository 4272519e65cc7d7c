use crate::core::queue::PriorityQueue;
use crate::core::store::JobStore;

/// One instruction handed to the Process Supervisor: launch `job_id` on
/// exactly `gpu_ids`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementInstruction {
    pub job_id: String,
    pub gpu_ids: Vec<u32>,
}

/// Runs one placement pass, per spec §4.D.
///
/// Single pass per tick: dequeue the whole ordered queue, try each entry
/// exactly once against the shrinking free-GPU set, and reinsert everything
/// that could not be placed (deferred) at the end, preserving relative
/// order. This bounds each tick to dequeuing/reinserting each queued job at
/// most once (testable property §8.5) while letting a later, smaller
/// request run even if an earlier, pinned request can't be satisfied this
/// tick (testable property §8.4 and scenario §8.4).
pub fn run_pass(
    store: &JobStore,
    queue: &mut PriorityQueue,
    mut free: Vec<u32>,
) -> Vec<PlacementInstruction> {
    let mut instructions = Vec::new();

    if free.is_empty() || queue.is_empty() {
        return instructions;
    }

    let ordered = queue.drain_ordered(store);
    let mut deferred = Vec::new();

    for job_id in ordered {
        if free.is_empty() {
            deferred.push(job_id);
            continue;
        }

        let job = match store.get(&job_id) {
            Some(j) => j,
            None => continue,
        };

        let assigned = if let Some(pinned) = &job.gpu_ids {
            if pinned.iter().all(|id| free.contains(id)) {
                Some(pinned.clone())
            } else {
                None
            }
        } else if free.len() >= job.num_gpus as usize {
            let mut sorted_free = free.clone();
            sorted_free.sort_unstable();
            Some(sorted_free.into_iter().take(job.num_gpus as usize).collect())
        } else {
            None
        };

        match assigned {
            Some(gpu_ids) => {
                free.retain(|id| !gpu_ids.contains(id));
                instructions.push(PlacementInstruction { job_id, gpu_ids });
            }
            None => deferred.push(job_id),
        }
    }

    for job_id in deferred {
        if let Some(job) = store.get(&job_id) {
            queue.reinsert(job_id, job.priority, job.submit_time);
        }
    }

    instructions
}

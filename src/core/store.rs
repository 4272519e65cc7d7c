use crate::core::job::{Job, JobConfig};
use std::collections::HashMap;

/// In-memory mapping from job id to job record. Source of truth for job
/// state (spec §4.B). Assigns monotonic ids that are never reused within a
/// process lifetime (invariant 4).
#[derive(Default)]
pub struct JobStore {
    jobs: HashMap<String, Job>,
    next_id: u64,
}

impl JobStore {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            next_id: 1,
        }
    }

    /// Assigns the id, stamps `submit_time`, defaults `name`, inserts with
    /// `status = queued`, and returns the new job's id.
    pub fn create(&mut self, config: JobConfig, now: i64) -> String {
        let job_id = format!("job{}", self.next_id);
        self.next_id += 1;
        let job = Job::from_config(job_id.clone(), config, now);
        self.jobs.insert(job_id.clone(), job);
        job_id
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Job> {
        self.jobs.get_mut(id)
    }

    pub fn list(&self) -> &HashMap<String, Job> {
        &self.jobs
    }

    /// Applies `mutator` to the job if it exists, returning whether it ran.
    pub fn update(&mut self, id: &str, mutator: impl FnOnce(&mut Job)) -> bool {
        match self.jobs.get_mut(id) {
            Some(job) => {
                mutator(job);
                true
            }
            None => false,
        }
    }
}

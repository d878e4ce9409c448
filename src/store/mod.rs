pub mod mem;

pub use mem::MemStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::job::Job;

/// The durable record layer underneath the broker.
///
/// Live jobs (anything not complete) and complete jobs live in separate
/// buckets; a key is in exactly one of them at a time. Environments are
/// content-addressed and shared between jobs. Implementations must make
/// `store_new_jobs` atomic per batch and the update methods idempotent by
/// key, because the server calls them before acknowledging clients and may
/// repeat them after a crash.
#[async_trait]
pub trait Store: Send + Sync {
    /// Store an environment blob, returning its stable content key.
    /// Storing the same blob twice yields the same key.
    async fn store_env(&self, env: Vec<u8>) -> Result<String>;

    async fn retrieve_env(&self, key: &str) -> Option<Vec<u8>>;

    /// Persist a batch of new live jobs. All or nothing.
    async fn store_new_jobs(&self, jobs: &[Job]) -> Result<()>;

    /// Move a job from the live bucket to the complete bucket.
    async fn archive_job(&self, key: &str, job: &Job) -> Result<()>;

    /// Overwrite a live job's record after a state change.
    async fn update_job_after_change(&self, job: &Job) -> Result<()>;

    /// Overwrite a live job's record after its command exited, retaining
    /// the std streams of failed runs.
    async fn update_job_after_exit(&self, job: &Job, stdout: &[u8], stderr: &[u8]) -> Result<()>;

    /// Record the std streams of a job's latest run.
    async fn update_job_std(&self, key: &str, exitcode: i32, stdout: &[u8], stderr: &[u8])
        -> Result<()>;

    async fn delete_live_job(&self, key: &str) -> Result<()>;

    /// Replace the live records under `old_keys` with `jobs` (whose keys
    /// may differ after modification).
    async fn modify_live_jobs(&self, old_keys: &[String], jobs: &[Job]) -> Result<()>;

    async fn retrieve_complete_jobs_by_keys(
        &self,
        keys: &[String],
        get_std: bool,
        get_env: bool,
    ) -> Result<Vec<Job>>;

    async fn retrieve_complete_jobs_by_rep_group(&self, rep_group: &str) -> Result<Vec<Job>>;

    /// The stored std streams for a job, empty when none were kept.
    async fn retrieve_job_std(&self, key: &str) -> (Vec<u8>, Vec<u8>);

    async fn already_complete(&self, key: &str) -> bool;

    /// A serialized snapshot of everything, restorable later.
    async fn backup(&self) -> Result<Vec<u8>>;

    async fn close(&self);
}

pub mod coordinator;

pub use coordinator::Coordinator;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Resources a job needs to run. Immutable once the job has been placed in
/// a scheduler group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Requirements {
    /// Memory in megabytes.
    pub memory_mb: u64,
    /// Expected run time in seconds.
    pub time_secs: u64,
    pub cpus: u32,
    /// Disk in gigabytes.
    pub disk_gb: u64,
    /// Scheduler-specific extras, passed through opaquely.
    pub other: String,
}

impl Requirements {
    pub fn new(memory_mb: u64, time_secs: u64, cpus: u32) -> Self {
        Self {
            memory_mb,
            time_secs,
            cpus,
            ..Default::default()
        }
    }
}

/// Adapter over an external cluster scheduler.
///
/// The coordinator is the only caller; `schedule` is invoked while the
/// coordinator lock is held, so implementations must not call back into the
/// server. `schedule(cmd, req, count)` sets the target total number of
/// runners for that command; the adapter absorbs churn between calls.
pub trait Scheduler: Send + Sync {
    /// Map requirements to an opaque group tag. Equal requirements must
    /// yield the same tag.
    fn place(&self, req: &Requirements) -> String;

    /// Ask for `count` runners in total executing `cmd` under `req`.
    fn schedule(&self, cmd: &str, req: &Requirements, count: usize);

    /// Whether any runners are currently pending or running.
    fn busy(&self) -> bool;

    /// Resolve a hostname to the scheduler's identifier for that host.
    fn host_to_id(&self, host: &str) -> String;

    /// Destroy a (cloud) host previously flagged bad. Non-cloud schedulers
    /// fail this.
    fn destroy_host(&self, host_id: &str) -> Result<()>;
}

/// A scheduler for single-host use: groups jobs by requirement signature
/// and tracks demand, but spawns nothing. Runners are started manually.
#[derive(Debug, Default)]
pub struct LocalScheduler {
    demand: std::sync::Mutex<std::collections::HashMap<String, usize>>,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Scheduler for LocalScheduler {
    fn place(&self, req: &Requirements) -> String {
        format!(
            "mem{}:t{}:cpu{}:disk{}",
            req.memory_mb, req.time_secs, req.cpus, req.disk_gb
        )
    }

    fn schedule(&self, cmd: &str, _req: &Requirements, count: usize) {
        let mut demand = self.demand.lock().unwrap();
        if count == 0 {
            demand.remove(cmd);
        } else {
            demand.insert(cmd.to_string(), count);
        }
        tracing::debug!(cmd, count, "local scheduler demand updated");
    }

    fn busy(&self) -> bool {
        !self.demand.lock().unwrap().is_empty()
    }

    fn host_to_id(&self, host: &str) -> String {
        host.to_string()
    }

    fn destroy_host(&self, host_id: &str) -> Result<()> {
        Err(crate::error::BrokerError::Internal(format!(
            "local scheduler cannot destroy host {host_id}"
        )))
    }
}

pub mod modifier;

pub use modifier::JobModifier;

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::sched::Requirements;

/// Separates the placement tag from the limit-group suffix in a scheduler
/// group, and limit groups from each other within the suffix.
pub const SCHED_LIMIT_SEP: &str = ";lg;";
pub const LIMIT_GROUP_SEP: &str = ",";

/// A live job as the server holds it: shared between the queue item and
/// every handler, mutated only under its own lock. Lock it after any queue
/// or index lock, never before, and never across an await.
pub type SharedJob = Arc<std::sync::RwLock<Job>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Delayed,
    Dependent,
    Ready,
    Reserved,
    Running,
    Lost,
    Buried,
    Complete,
    Unknown,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Delayed => "delayed",
            JobState::Dependent => "dependent",
            JobState::Ready => "ready",
            JobState::Reserved => "reserved",
            JobState::Running => "running",
            JobState::Lost => "lost",
            JobState::Buried => "buried",
            JobState::Complete => "complete",
            JobState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// A dependency of a job: either an explicit job key, or a dep-group name
/// resolved to member job keys when the dependent job is added or modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dependency {
    Job(String),
    Group(String),
}

/// Exit observations a runner reports when a job's command finishes,
/// merged into the server's job on jarchive/jrelease/jbury.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobEndState {
    pub exited: bool,
    pub exitcode: i32,
    pub peak_ram_mb: i64,
    pub peak_disk_mb: i64,
    pub cpu_time_secs: f64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A unit of executable work.
///
/// The server holds each live job behind its own `RwLock`; everything it
/// hands to clients is a snapshot copy produced by `snapshot_with_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub cmd: String,
    pub cwd: String,
    /// When set, the working directory is part of the job's identity: the
    /// same command in two directories is two jobs.
    pub cwd_matters: bool,
    pub rep_group: String,
    pub req_group: String,
    pub limit_groups: Vec<String>,
    /// Dep-group names this job belongs to, for other jobs to depend on.
    pub dep_groups: Vec<String>,
    pub dependencies: Vec<Dependency>,
    pub requirements: Requirements,
    pub priority: u8,
    /// How many times a failed job is retried before burial.
    pub retries: u8,
    /// Failures left before the job is buried; starts at retries + 1.
    pub until_buried: u8,
    pub state: JobState,
    /// Client id of the reserving runner; nil unless reserved.
    pub reserved_by: Uuid,
    pub pid: i32,
    pub host: String,
    pub host_id: String,
    pub host_ip: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exited: bool,
    pub exitcode: i32,
    pub peak_ram_mb: i64,
    pub peak_disk_mb: i64,
    pub cpu_time_secs: f64,
    /// Set on snapshots and archived jobs; elapsed-so-far for running jobs.
    pub wall_time: Duration,
    pub fail_reason: String,
    pub attempts: u32,
    pub env_key: String,
    pub scheduler_group: String,
    pub kill_called: bool,
    pub lost: bool,
    /// Populated from storage on request only.
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
    pub env: Option<Vec<u8>>,
    /// Limit groups incremented at reserve time, to decrement on exit.
    pub limit_groups_incremented: Vec<String>,
}

impl Default for Job {
    fn default() -> Self {
        Self {
            cmd: String::new(),
            cwd: String::new(),
            cwd_matters: false,
            rep_group: String::new(),
            req_group: String::new(),
            limit_groups: Vec::new(),
            dep_groups: Vec::new(),
            dependencies: Vec::new(),
            requirements: Requirements::default(),
            priority: 0,
            retries: 0,
            until_buried: 1,
            state: JobState::Unknown,
            reserved_by: Uuid::nil(),
            pid: 0,
            host: String::new(),
            host_id: String::new(),
            host_ip: String::new(),
            start_time: None,
            end_time: None,
            exited: false,
            exitcode: -1,
            peak_ram_mb: 0,
            peak_disk_mb: 0,
            cpu_time_secs: 0.0,
            wall_time: Duration::ZERO,
            fail_reason: String::new(),
            attempts: 0,
            env_key: String::new(),
            scheduler_group: String::new(),
            kill_called: false,
            lost: false,
            stdout: None,
            stderr: None,
            env: None,
            limit_groups_incremented: Vec::new(),
        }
    }
}

impl Job {
    pub fn new(cmd: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            cwd: cwd.into(),
            ..Default::default()
        }
    }

    /// The job's identity, derived from its command and (when it matters)
    /// working directory. Two adds of the same identity are one job.
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        if self.cwd_matters {
            hasher.update(self.cwd.as_bytes());
            hasher.update(b"\x00");
        }
        hasher.update(self.cmd.as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for b in digest.as_slice() {
            let _ = write!(&mut out, "{b:02x}");
        }
        out
    }

    /// Merge runner-reported exit observations into this job and clear the
    /// kill flag. Limit-group decrements are the server's follow-up, via
    /// the groups noted at reserve time.
    pub fn merge_exit(&mut self, end: &JobEndState) {
        self.exited = end.exited;
        self.exitcode = end.exitcode;
        self.peak_ram_mb = end.peak_ram_mb;
        self.peak_disk_mb = end.peak_disk_mb;
        self.cpu_time_secs = end.cpu_time_secs;
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
        self.kill_called = false;
    }

    /// Record the limit groups incremented for this job's reservation so
    /// they can be decremented exactly once when it exits.
    pub fn note_incremented_limit_groups(&mut self, groups: Vec<String>) {
        self.limit_groups_incremented = groups;
    }

    pub fn take_incremented_limit_groups(&mut self) -> Vec<String> {
        std::mem::take(&mut self.limit_groups_incremented)
    }

    /// A copy of this job for a client, with `state` overridden to running
    /// (start time set while reserved) or lost (flagged), wall time
    /// computed, and the storage-backed blobs left unpopulated.
    pub fn snapshot_with_state(&self, base: JobState) -> Job {
        let mut job = self.clone();
        job.state = base;
        if base == JobState::Reserved {
            if self.lost {
                job.state = JobState::Lost;
            } else if self.start_time.is_some() {
                job.state = JobState::Running;
            }
        }
        if let Some(start) = self.start_time {
            let end = match self.end_time {
                Some(end) if job.state != JobState::Running => end,
                _ => Utc::now(),
            };
            job.wall_time = (end - start).to_std().unwrap_or(Duration::ZERO);
        }
        job.stdout = None;
        job.stderr = None;
        job.env = None;
        job.limit_groups_incremented = Vec::new();
        job
    }

    /// The full scheduler group for this job: the placement tag plus, when
    /// the job carries limit groups, a suffix encoding them so reservation
    /// can find and increment the right semaphores.
    pub fn scheduler_group_for(&self, tag: &str) -> String {
        if self.limit_groups.is_empty() {
            tag.to_string()
        } else {
            let mut groups = self.limit_groups.clone();
            groups.sort();
            format!("{tag}{SCHED_LIMIT_SEP}{}", groups.join(LIMIT_GROUP_SEP))
        }
    }
}

/// Extract the limit groups encoded in a scheduler group's suffix, if any.
pub fn limit_groups_in_scheduler_group(group: &str) -> Vec<String> {
    match group.split_once(SCHED_LIMIT_SEP) {
        Some((_, suffix)) if !suffix.is_empty() => suffix
            .split(LIMIT_GROUP_SEP)
            .map(|s| s.to_string())
            .collect(),
        _ => Vec::new(),
    }
}

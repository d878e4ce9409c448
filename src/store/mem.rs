use std::collections::HashMap;
use std::fmt::Write as _;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{BrokerError, Result};
use crate::job::Job;
use crate::store::Store;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StdRecord {
    exitcode: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

#[derive(Default, Serialize, Deserialize)]
struct Buckets {
    live: HashMap<String, Job>,
    complete: HashMap<String, Job>,
    envs: HashMap<String, Vec<u8>>,
    std: HashMap<String, StdRecord>,
}

/// In-memory implementation of the store, also used to restore from the
/// serialized form `backup` produces. Suitable wherever durability across
/// process restarts is handled elsewhere (or not needed, as in tests).
#[derive(Default)]
pub struct MemStore {
    buckets: RwLock<Buckets>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from bytes previously produced by `backup`.
    pub fn from_backup(bytes: &[u8]) -> Result<Self> {
        let (buckets, _) =
            bincode::serde::decode_from_slice::<Buckets, _>(bytes, bincode::config::standard())
                .map_err(|e| BrokerError::Db(format!("backup restore: {e}")))?;
        Ok(Self {
            buckets: RwLock::new(buckets),
        })
    }

    /// Keys of all live jobs, for recovery after a restart.
    pub async fn live_jobs(&self) -> Vec<Job> {
        let buckets = self.buckets.read().await;
        buckets.live.values().cloned().collect()
    }

    fn env_key(env: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(env);
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for b in digest.as_slice() {
            let _ = write!(&mut out, "{b:02x}");
        }
        out
    }

    fn populate(buckets: &Buckets, job: &mut Job, get_std: bool, get_env: bool) {
        if get_std {
            if let Some(record) = buckets.std.get(&job.key()) {
                job.stdout = Some(record.stdout.clone());
                job.stderr = Some(record.stderr.clone());
            }
        }
        if get_env {
            job.env = buckets.envs.get(&job.env_key).cloned();
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn store_env(&self, env: Vec<u8>) -> Result<String> {
        let key = Self::env_key(&env);
        let mut buckets = self.buckets.write().await;
        buckets.envs.entry(key.clone()).or_insert(env);
        Ok(key)
    }

    async fn retrieve_env(&self, key: &str) -> Option<Vec<u8>> {
        let buckets = self.buckets.read().await;
        buckets.envs.get(key).cloned()
    }

    async fn store_new_jobs(&self, jobs: &[Job]) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        for job in jobs {
            let key = job.key();
            buckets.complete.remove(&key);
            buckets.live.insert(key, job.clone());
        }
        Ok(())
    }

    async fn archive_job(&self, key: &str, job: &Job) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        buckets.live.remove(key);
        buckets.complete.insert(key.to_string(), job.clone());
        Ok(())
    }

    async fn update_job_after_change(&self, job: &Job) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        buckets.live.insert(job.key(), job.clone());
        Ok(())
    }

    async fn update_job_after_exit(&self, job: &Job, stdout: &[u8], stderr: &[u8]) -> Result<()> {
        let key = job.key();
        let mut buckets = self.buckets.write().await;
        buckets.live.insert(key.clone(), job.clone());
        if job.exitcode != 0 {
            buckets.std.insert(
                key,
                StdRecord {
                    exitcode: job.exitcode,
                    stdout: stdout.to_vec(),
                    stderr: stderr.to_vec(),
                },
            );
        } else {
            buckets.std.remove(&key);
        }
        Ok(())
    }

    async fn update_job_std(
        &self,
        key: &str,
        exitcode: i32,
        stdout: &[u8],
        stderr: &[u8],
    ) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        if exitcode != 0 {
            buckets.std.insert(
                key.to_string(),
                StdRecord {
                    exitcode,
                    stdout: stdout.to_vec(),
                    stderr: stderr.to_vec(),
                },
            );
        } else {
            buckets.std.remove(key);
        }
        Ok(())
    }

    async fn delete_live_job(&self, key: &str) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        buckets.live.remove(key);
        buckets.std.remove(key);
        Ok(())
    }

    async fn modify_live_jobs(&self, old_keys: &[String], jobs: &[Job]) -> Result<()> {
        let mut buckets = self.buckets.write().await;
        for key in old_keys {
            buckets.live.remove(key);
        }
        for job in jobs {
            buckets.live.insert(job.key(), job.clone());
        }
        Ok(())
    }

    async fn retrieve_complete_jobs_by_keys(
        &self,
        keys: &[String],
        get_std: bool,
        get_env: bool,
    ) -> Result<Vec<Job>> {
        let buckets = self.buckets.read().await;
        let mut jobs = Vec::new();
        for key in keys {
            if let Some(job) = buckets.complete.get(key) {
                let mut job = job.clone();
                Self::populate(&buckets, &mut job, get_std, get_env);
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn retrieve_complete_jobs_by_rep_group(&self, rep_group: &str) -> Result<Vec<Job>> {
        let buckets = self.buckets.read().await;
        Ok(buckets
            .complete
            .values()
            .filter(|j| j.rep_group == rep_group)
            .cloned()
            .collect())
    }

    async fn retrieve_job_std(&self, key: &str) -> (Vec<u8>, Vec<u8>) {
        let buckets = self.buckets.read().await;
        match buckets.std.get(key) {
            Some(record) => (record.stdout.clone(), record.stderr.clone()),
            None => (Vec::new(), Vec::new()),
        }
    }

    async fn already_complete(&self, key: &str) -> bool {
        let buckets = self.buckets.read().await;
        buckets.complete.contains_key(key)
    }

    async fn backup(&self) -> Result<Vec<u8>> {
        let buckets = self.buckets.read().await;
        bincode::serde::encode_to_vec(&*buckets, bincode::config::standard())
            .map_err(|e| BrokerError::Db(format!("backup: {e}")))
    }

    async fn close(&self) {}
}

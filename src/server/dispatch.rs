//! Request dispatch: decode, authenticate, gate, fan out to per-method
//! handlers, encode the reply.

use std::collections::{HashMap, HashSet};
use std::io::Read as _;
use std::path::PathBuf;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use flate2::read::GzDecoder;
use uuid::Uuid;

use crate::error::{
    RequestError, ERR_BAD_JOB, ERR_BAD_REQUEST, ERR_CLOSED_STOP, ERR_DB_ERROR,
    ERR_INTERNAL_ERROR, ERR_MUST_RESERVE, ERR_PERMISSION_DENIED, ERR_QUEUE_CLOSED,
    ERR_UNKNOWN_COMMAND,
};
use crate::job::{Dependency, Job, JobState, SharedJob};
use crate::queue::{ItemDef, ItemSnapshot, ItemState, QueueError};
use crate::server::{GateState, Server};
use crate::wire::{
    decode, encode, token_matches, Request, Response, ServerStats, M_ADD, M_BACKUP, M_DRAIN,
    M_GETBC, M_GETBCS, M_GETBR, M_GETIN, M_GETSETLG, M_JARCHIVE, M_JBURY, M_JDEL, M_JKICK,
    M_JKILL, M_JMOD, M_JRELEASE, M_JSTART, M_JTOUCH, M_PAUSE, M_PING, M_RESERVE, M_RESUME,
    M_SHUTDOWN, M_SSTATS, M_UPLOAD,
};

/// A handler failure: the wire code the client sees plus the detail that
/// goes to the log.
pub(crate) struct Herr {
    code: &'static str,
    detail: String,
}

impl Herr {
    fn new(code: &'static str) -> Self {
        Self {
            code,
            detail: code.to_string(),
        }
    }

    fn with(code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

fn db_herr(e: crate::error::BrokerError) -> Herr {
    Herr::with(ERR_DB_ERROR, e.to_string())
}

fn internal(e: impl std::fmt::Display) -> Herr {
    Herr::with(ERR_INTERNAL_ERROR, e.to_string())
}

fn queue_herr(e: QueueError) -> Herr {
    match e {
        QueueError::Closed => Herr::new(ERR_QUEUE_CLOSED),
        other => internal(other),
    }
}

type HResult = std::result::Result<Response, Herr>;

fn filter_and_limit(jobs: &mut Vec<Job>, state: Option<JobState>, limit: usize) {
    if let Some(state) = state {
        jobs.retain(|j| j.state == state);
    }
    if limit > 0 && jobs.len() > limit {
        jobs.truncate(limit);
    }
}

impl Server {
    /// Handle one decoded-from-the-wire request payload. Returns the
    /// encoded reply and, on failure, the richer error for logging; the
    /// client only ever sees the bare code.
    pub(crate) async fn dispatch(
        self: &Arc<Self>,
        payload: &[u8],
    ) -> (Vec<u8>, Option<RequestError>) {
        let started = Instant::now();
        let req: Request = match decode(payload) {
            Ok(req) => req,
            Err(e) => {
                let reply = encode(&Response::error(ERR_BAD_REQUEST)).unwrap_or_default();
                let err = RequestError {
                    method: "?".to_string(),
                    key: String::new(),
                    cause: e.to_string(),
                };
                return (reply, Some(err));
            }
        };

        let result = self.handle(&req).await;
        self.log_timing(&req.method, started.elapsed());

        match result {
            Ok(resp) => (encode(&resp).unwrap_or_default(), None),
            Err(herr) => {
                let reply = encode(&Response::error(herr.code)).unwrap_or_default();
                let err = RequestError {
                    method: req.method.clone(),
                    key: req.job.as_ref().map(|j| j.key()).unwrap_or_default(),
                    cause: herr.detail,
                };
                (reply, Some(err))
            }
        }
    }

    async fn handle(self: &Arc<Self>, req: &Request) -> HResult {
        let gate = self.gate();

        if req.method != M_PING && !token_matches(&req.token, self.token()) {
            return Err(Herr::with(
                ERR_PERMISSION_DENIED,
                "client presented the wrong token",
            ));
        }
        if !gate.up && !gate.drain {
            return Err(Herr::with(ERR_CLOSED_STOP, "the server has been stopped"));
        }

        match req.method.as_str() {
            M_PING => Ok(Response {
                sinfo: Some(self.server_info()),
                ..Default::default()
            }),
            M_SSTATS => Ok(Response {
                sstats: Some(self.stats_snapshot().await),
                ..Default::default()
            }),
            M_ADD => self.handle_add(req).await,
            M_RESERVE => self.handle_reserve(req, gate).await,
            M_JSTART => self.handle_jstart(req).await,
            M_JTOUCH => self.handle_jtouch(req).await,
            M_JARCHIVE => self.handle_jarchive(req).await,
            M_JRELEASE => self.handle_jrelease(req).await,
            M_JBURY => self.handle_jbury(req).await,
            M_JKICK => self.handle_jkick(req).await,
            M_JDEL => self.handle_jdel(req).await,
            M_JMOD => self.handle_jmod(req).await,
            M_JKILL => self.handle_jkill(req).await,
            M_GETBC => self.handle_getbc(req).await,
            M_GETBR => self.handle_getbr(req).await,
            M_GETIN => self.handle_getin(req).await,
            M_GETBCS => self.handle_getbcs(req).await,
            M_GETSETLG => self.handle_getsetlg(req).await,
            M_PAUSE => {
                self.pause()
                    .map_err(|e| Herr::with(e.wire_code(), e.to_string()))?;
                Ok(Response {
                    sstats: Some(self.stats_snapshot().await),
                    ..Default::default()
                })
            }
            M_RESUME => {
                self.resume()
                    .map_err(|e| Herr::with(e.wire_code(), e.to_string()))?;
                Ok(Response::default())
            }
            M_DRAIN => {
                self.drain()
                    .map_err(|e| Herr::with(e.wire_code(), e.to_string()))?;
                Ok(Response {
                    sstats: Some(self.stats_snapshot().await),
                    ..Default::default()
                })
            }
            M_SHUTDOWN => {
                let server = Arc::clone(self);
                tokio::spawn(async move {
                    // let the reply reach the socket first
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    server.shutdown(ERR_CLOSED_STOP).await;
                });
                Ok(Response::default())
            }
            M_BACKUP => {
                let db = self.store.backup().await.map_err(db_herr)?;
                Ok(Response {
                    db,
                    ..Default::default()
                })
            }
            M_UPLOAD => self.handle_upload(req).await,
            _ => Err(Herr::new(ERR_UNKNOWN_COMMAND)),
        }
    }

    pub(crate) async fn stats_snapshot(&self) -> ServerStats {
        let stats = self.q.stats().await;
        ServerStats {
            server_info: self.server_info(),
            delayed: stats.delayed,
            dependent: stats.dependent,
            ready: stats.ready,
            running: stats.running,
            buried: stats.buried,
            uptime: self.uptime(),
        }
    }

    // ---- add ----

    async fn handle_add(self: &Arc<Self>, req: &Request) -> HResult {
        let Some(env) = &req.env else {
            return Err(Herr::new(ERR_BAD_REQUEST));
        };
        if req.jobs.is_empty() {
            return Err(Herr::new(ERR_BAD_REQUEST));
        }
        let env_key = self.store.store_env(env.clone()).await.map_err(db_herr)?;

        let mut to_add: Vec<Job> = Vec::new();
        let mut already_complete = 0;
        for job in &req.jobs {
            if self.store.already_complete(&job.key()).await && !req.ignore_complete {
                already_complete += 1;
                continue;
            }
            let mut job = job.clone();
            job.env_key = env_key.clone();
            job.until_buried = job.retries.saturating_add(1);
            job.reserved_by = Uuid::nil();
            job.scheduler_group.clear();
            job.state = if job.dependencies.is_empty() {
                JobState::Ready
            } else {
                JobState::Dependent
            };
            to_add.push(job);
        }

        // jobs must never be lost: the disk write happens before the
        // client hears that its jobs were accepted
        self.store.store_new_jobs(&to_add).await.map_err(db_herr)?;

        let mut itemdefs = Vec::with_capacity(to_add.len());
        for job in &to_add {
            let dependencies = self.resolve_dependencies(job, &to_add).await;
            itemdefs.push(ItemDef {
                key: job.key(),
                data: Arc::new(StdRwLock::new(job.clone())),
                priority: job.priority,
                delay: Duration::ZERO,
                ttr: self.config().item_ttr,
                reserve_group: String::new(),
                dependencies,
            });
        }
        let (added, dups) = self.q.add_many(itemdefs).await.map_err(queue_herr)?;

        {
            let mut rpl = self.rpl.write().unwrap();
            for job in &to_add {
                rpl.entry(job.rep_group.clone())
                    .or_default()
                    .insert(job.key());
            }
        }

        tracing::debug!(added, dups, complete = already_complete, "added jobs");
        Ok(Response {
            added,
            existed: dups + already_complete,
            ..Default::default()
        })
    }

    /// Turn a job's dependency specs into the queue keys that are still
    /// incomplete. Dep-group names resolve to the live members of that
    /// group, in the queue or elsewhere in the same add batch.
    async fn resolve_dependencies(&self, job: &Job, batch: &[Job]) -> Vec<String> {
        let own_key = job.key();
        let mut deps = Vec::new();
        let mut group_names: Vec<&String> = Vec::new();
        for dep in &job.dependencies {
            match dep {
                Dependency::Job(key) => {
                    if !self.store.already_complete(key).await {
                        deps.push(key.clone());
                    }
                }
                Dependency::Group(name) => group_names.push(name),
            }
        }
        if !group_names.is_empty() {
            for item in self.q.all_items().await {
                let member = {
                    let j = item.data.read().unwrap();
                    group_names.iter().any(|g| j.dep_groups.contains(g))
                };
                if member {
                    deps.push(item.key.clone());
                }
            }
            for other in batch {
                if group_names.iter().any(|g| other.dep_groups.contains(g)) {
                    deps.push(other.key());
                }
            }
        }
        deps.retain(|d| d != &own_key);
        deps.sort();
        deps.dedup();
        deps
    }

    // ---- reserve ----

    async fn handle_reserve(self: &Arc<Self>, req: &Request, gate: GateState) -> HResult {
        if req.client_id.is_nil() {
            return Err(Herr::new(ERR_BAD_REQUEST));
        }
        // draining or paused: act as if nothing were ready
        if gate.drain || gate.paused > 0 {
            return Ok(Response::default());
        }
        let group = (!req.scheduler_group.is_empty()).then(|| req.scheduler_group.clone());

        // a runner's first reservation for a group we no longer want
        // anything from is told "nothing ready" without consulting the
        // queue, so stale runners exit fast; later attempts check normally
        if let Some(group) = &group {
            if req.first_reserve
                && self.coord.spawns_runners()
                && self.coord.count(group).await.unwrap_or(0) == 0
            {
                return Ok(Response::default());
            }
        }

        let deadline = (!req.timeout.is_zero()).then(|| Instant::now() + req.timeout);
        let snap = loop {
            match self.reserve_with_limits(group.as_deref()).await {
                Ok(snap) => break snap,
                Err(QueueError::NothingReady) => {
                    let ticker = self.config().reserve_ticker;
                    match deadline {
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Ok(Response::default());
                            }
                            tokio::time::sleep(ticker.min(deadline - now)).await;
                        }
                        None => tokio::time::sleep(ticker).await,
                    }
                }
                Err(QueueError::Closed) => return Err(Herr::new(ERR_QUEUE_CLOSED)),
                Err(e) => return Err(internal(e)),
            }
        };

        // reset past execution state so the runner starts fresh
        let rep_group = {
            let mut job = snap.data.write().unwrap();
            job.reserved_by = req.client_id;
            job.exited = false;
            job.pid = 0;
            job.host.clear();
            job.host_id.clear();
            job.host_ip.clear();
            job.start_time = None;
            job.end_time = None;
            job.peak_ram_mb = 0;
            job.peak_disk_mb = 0;
            job.exitcode = -1;
            job.lost = false;
            job.state = JobState::Reserved;
            job.rep_group.clone()
        };
        if let Err(e) = self
            .q
            .set_delay(&snap.key, self.config().release_delay)
            .await
        {
            tracing::warn!(key = %snap.key, err = %e, "set_delay after reserve failed");
        }
        let job = self.item_to_job(&snap, false, true).await;
        self.broadcast(&rep_group, JobState::Ready, JobState::Reserved);
        tracing::debug!(cmd = %job.cmd, group = %snap.reserve_group, "reserved job");
        Ok(Response {
            job: Some(job),
            ..Default::default()
        })
    }

    /// Reserve, claiming any limit groups encoded in the scheduler group
    /// first. A reservation that cannot claim them behaves exactly like an
    /// empty ready sub-queue.
    async fn reserve_with_limits(
        &self,
        group: Option<&str>,
    ) -> std::result::Result<ItemSnapshot<SharedJob>, QueueError> {
        let limit_groups = group
            .map(crate::job::limit_groups_in_scheduler_group)
            .unwrap_or_default();
        if !limit_groups.is_empty() && !self.limiter.increment(&limit_groups).await {
            return Err(QueueError::NothingReady);
        }
        let result = self.q.reserve(group).await;
        if !limit_groups.is_empty() {
            match &result {
                Ok(snap) => {
                    snap.data
                        .write()
                        .unwrap()
                        .note_incremented_limit_groups(limit_groups);
                }
                Err(_) => self.limiter.decrement(&limit_groups).await,
            }
        }
        result
    }

    // ---- the j* methods ----

    /// The common precondition of the j* methods: the request names a job,
    /// that job is in the run sub-queue, and the caller is its reserver.
    async fn reserved_job(
        &self,
        req: &Request,
    ) -> std::result::Result<ItemSnapshot<SharedJob>, Herr> {
        let Some(job) = &req.job else {
            return Err(Herr::new(ERR_BAD_REQUEST));
        };
        let Some(item) = self.q.get(&job.key()).await else {
            return Err(Herr::new(ERR_BAD_JOB));
        };
        if item.state != ItemState::Run {
            return Err(Herr::new(ERR_BAD_JOB));
        }
        let reserved_by = item.data.read().unwrap().reserved_by;
        if reserved_by != req.client_id {
            return Err(Herr::new(ERR_MUST_RESERVE));
        }
        Ok(item)
    }

    async fn handle_jstart(self: &Arc<Self>, req: &Request) -> HResult {
        let item = self.reserved_job(req).await?;
        let given = req.job.as_ref().ok_or_else(|| Herr::new(ERR_BAD_REQUEST))?;
        if given.pid <= 0 || given.host.is_empty() {
            return Err(Herr::new(ERR_BAD_REQUEST));
        }

        // build the started job, persist it, then commit it in memory, so
        // a failed write leaves the job unstarted
        let updated = {
            let job = item.data.read().unwrap();
            let mut updated = job.clone();
            updated.host = given.host.clone();
            updated.host_id = self.scheduler().host_to_id(&given.host);
            updated.host_ip = given.host_ip.clone();
            updated.pid = given.pid;
            updated.start_time = Some(Utc::now());
            updated.end_time = None;
            updated.attempts += 1;
            updated.kill_called = false;
            updated.lost = false;
            updated.state = JobState::Running;
            updated
        };
        self.store
            .update_job_after_change(&updated)
            .await
            .map_err(db_herr)?;
        let rep_group = updated.rep_group.clone();
        *item.data.write().unwrap() = updated;
        self.broadcast(&rep_group, JobState::Reserved, JobState::Running);
        Ok(Response::default())
    }

    async fn handle_jtouch(self: &Arc<Self>, req: &Request) -> HResult {
        let item = self.reserved_job(req).await?;
        let (kill_called, lost, rep_group) = {
            let job = item.data.read().unwrap();
            (job.kill_called, job.lost, job.rep_group.clone())
        };
        let kill = kill_called || *self.kill_runners.read().unwrap();
        if kill {
            return Ok(Response {
                kill_called: true,
                ..Default::default()
            });
        }
        self.q.touch(&item.key).await.map_err(queue_herr)?;
        if lost {
            {
                let mut job = item.data.write().unwrap();
                job.lost = false;
                job.end_time = None;
                job.state = JobState::Running;
            }
            // the queue saw no transition, so announce the revival here
            self.broadcast(&rep_group, JobState::Lost, JobState::Running);
        }
        Ok(Response::default())
    }

    async fn handle_jarchive(self: &Arc<Self>, req: &Request) -> HResult {
        let item = self.reserved_job(req).await?;
        let end = req.end_state.clone().unwrap_or_default();
        let noted = {
            let mut job = item.data.write().unwrap();
            job.merge_exit(&end);
            job.take_incremented_limit_groups()
        };
        self.limiter.decrement(&noted).await;

        let archived = {
            let job = item.data.read().unwrap();
            if !job.exited
                || job.exitcode != 0
                || job.start_time.is_none()
                || job.end_time.is_none()
            {
                return Err(Herr::new(ERR_BAD_REQUEST));
            }
            let mut archived = job.clone();
            archived.state = JobState::Complete;
            archived.fail_reason.clear();
            if let (Some(start), Some(end)) = (archived.start_time, archived.end_time) {
                archived.wall_time = (end - start).to_std().unwrap_or_default();
            }
            archived
        };
        let key = archived.key();

        self.store
            .archive_job(&key, &archived)
            .await
            .map_err(db_herr)?;
        self.q.remove(&key).await.map_err(queue_herr)?;
        self.rpl_remove(&archived.rep_group, &key);

        // demand drops in the background; the scheduler tolerates the
        // momentary over-count
        let server = Arc::clone(self);
        let shared = item.data.clone();
        tokio::spawn(async move {
            server.decrement_scheduler_group(&shared).await;
        });

        self.broadcast(&archived.rep_group, JobState::Running, JobState::Complete);
        tracing::debug!(cmd = %archived.cmd, "completed job");
        Ok(Response::default())
    }

    async fn handle_jrelease(self: &Arc<Self>, req: &Request) -> HResult {
        let item = self.reserved_job(req).await?;
        let given = req.job.as_ref().ok_or_else(|| Herr::new(ERR_BAD_REQUEST))?;
        let end = req.end_state.clone().unwrap_or_default();
        let noted = {
            let mut job = item.data.write().unwrap();
            job.merge_exit(&end);
            job.fail_reason = given.fail_reason.clone();
            if job.exited && job.exitcode != 0 {
                job.until_buried = job.until_buried.saturating_sub(1);
            }
            job.take_incremented_limit_groups()
        };
        self.limiter.decrement(&noted).await;

        let (until_buried, rep_group) = {
            let job = item.data.read().unwrap();
            (job.until_buried, job.rep_group.clone())
        };

        if until_buried == 0 {
            {
                let mut job = item.data.write().unwrap();
                job.state = JobState::Buried;
                job.reserved_by = Uuid::nil();
            }
            self.q.bury(&item.key).await.map_err(queue_herr)?;
            self.decrement_scheduler_group(&item.data).await;
            let snapshot = item.data.read().unwrap().clone();
            self.store
                .update_job_after_exit(&snapshot, &end.stdout, &end.stderr)
                .await
                .map_err(db_herr)?;
            self.broadcast(&rep_group, JobState::Running, JobState::Buried);
            tracing::debug!(cmd = %snapshot.cmd, "buried job after repeated failure");
        } else {
            self.q
                .set_delay(&item.key, req.timeout)
                .await
                .map_err(queue_herr)?;
            {
                let mut job = item.data.write().unwrap();
                job.state = JobState::Delayed;
                job.reserved_by = Uuid::nil();
            }
            self.q.release(&item.key).await.map_err(queue_herr)?;
            let snapshot = item.data.read().unwrap().clone();
            self.store
                .update_job_after_exit(&snapshot, &end.stdout, &end.stderr)
                .await
                .map_err(db_herr)?;
            self.broadcast(&rep_group, JobState::Running, JobState::Delayed);
        }
        Ok(Response::default())
    }

    async fn handle_jbury(self: &Arc<Self>, req: &Request) -> HResult {
        let item = self.reserved_job(req).await?;
        let given = req.job.as_ref().ok_or_else(|| Herr::new(ERR_BAD_REQUEST))?;
        let end = req.end_state.clone().unwrap_or_default();
        let noted = {
            let mut job = item.data.write().unwrap();
            job.merge_exit(&end);
            job.fail_reason = given.fail_reason.clone();
            job.take_incremented_limit_groups()
        };
        self.limiter.decrement(&noted).await;

        let snapshot = {
            let mut job = item.data.write().unwrap();
            job.state = JobState::Buried;
            job.reserved_by = Uuid::nil();
            job.clone()
        };
        self.q.bury(&item.key).await.map_err(queue_herr)?;
        self.decrement_scheduler_group(&item.data).await;
        self.store
            .update_job_after_exit(&snapshot, &end.stdout, &end.stderr)
            .await
            .map_err(db_herr)?;
        self.broadcast(&snapshot.rep_group, JobState::Running, JobState::Buried);
        tracing::debug!(cmd = %snapshot.cmd, "buried job");
        Ok(Response::default())
    }

    async fn handle_jkick(self: &Arc<Self>, req: &Request) -> HResult {
        if req.keys.is_empty() {
            return Err(Herr::new(ERR_BAD_REQUEST));
        }
        let mut kicked = 0;
        for key in &req.keys {
            let Some(item) = self.q.get(key).await else {
                continue;
            };
            if item.state != ItemState::Bury {
                continue;
            }
            if self.q.kick(key).await.is_err() {
                continue;
            }
            let snapshot = {
                let mut job = item.data.write().unwrap();
                job.until_buried = job.retries.saturating_add(1);
                job.state = JobState::Ready;
                job.clone()
            };
            if let Err(e) = self.store.update_job_after_change(&snapshot).await {
                tracing::error!(key = %key, err = %e, "failed to persist kicked job");
            }
            self.broadcast(&snapshot.rep_group, JobState::Buried, JobState::Ready);
            kicked += 1;
        }
        Ok(Response {
            existed: kicked,
            ..Default::default()
        })
    }

    async fn handle_jdel(self: &Arc<Self>, req: &Request) -> HResult {
        if req.keys.is_empty() {
            return Err(Herr::new(ERR_BAD_REQUEST));
        }
        let mut deleted = 0;
        for key in &req.keys {
            let Some(item) = self.q.get(key).await else {
                continue;
            };
            if item.state == ItemState::Run {
                continue;
            }
            if self.q.remove(key).await.is_err() {
                continue;
            }
            deleted += 1;
            if let Err(e) = self.store.delete_live_job(key).await {
                tracing::error!(key = %key, err = %e, "failed to delete live job record");
            }
            let rep_group = item.data.read().unwrap().rep_group.clone();
            self.rpl_remove(&rep_group, key);
            self.decrement_scheduler_group(&item.data).await;
        }
        tracing::debug!(count = deleted, "deleted jobs");
        Ok(Response {
            existed: deleted,
            ..Default::default()
        })
    }

    async fn handle_jmod(self: &Arc<Self>, req: &Request) -> HResult {
        if req.keys.is_empty() || req.modifier.is_none() {
            return Err(Herr::new(ERR_BAD_REQUEST));
        }
        // pause so nothing we are modifying starts running under us
        self.pause()
            .map_err(|e| Herr::with(e.wire_code(), e.to_string()))?;
        let result = self.jmod_paused(req).await;
        if let Err(e) = self.resume() {
            tracing::error!(err = %e, "resume after modify failed");
        }
        result
    }

    async fn jmod_paused(self: &Arc<Self>, req: &Request) -> HResult {
        let modifier = req.modifier.as_ref().ok_or_else(|| Herr::new(ERR_BAD_REQUEST))?;

        let mut targets = Vec::new();
        for key in &req.keys {
            let Some(item) = self.q.get(key).await else {
                continue;
            };
            if item.state == ItemState::Run {
                continue;
            }
            targets.push(item);
        }

        let mut modified = HashMap::new();
        let mut records: Vec<(String, String, Job)> = Vec::new();
        let mut limit_updates: Vec<(String, Option<u64>)> = Vec::new();
        for item in &targets {
            let (old_key, old_rep_group, snapshot) = {
                let mut job = item.data.write().unwrap();
                let old_rep_group = job.rep_group.clone();
                let (old_key, _) = modifier.modify(&mut job);
                if modifier.sets_limit_groups() {
                    // "name:limit" entries configure that limit as a side
                    // effect and are stored as the bare name
                    let mut names = Vec::new();
                    for entry in job.limit_groups.clone() {
                        match entry.split_once(':') {
                            Some((name, value)) => {
                                if let Ok(parsed) = value.parse::<i64>() {
                                    limit_updates.push((
                                        name.to_string(),
                                        (parsed >= 0).then_some(parsed as u64),
                                    ));
                                }
                                names.push(name.to_string());
                            }
                            None => names.push(entry),
                        }
                    }
                    names.sort();
                    names.dedup();
                    job.limit_groups = names;
                }
                (old_key, old_rep_group, job.clone())
            };
            modified.insert(old_key.clone(), snapshot.key());
            records.push((old_key, old_rep_group, snapshot));
        }

        for (name, limit) in limit_updates {
            self.limiter.set_limit(&name, limit).await;
        }

        for (old_key, _, snapshot) in &records {
            let new_key = snapshot.key();
            if *old_key != new_key {
                if let Err(e) = self.q.change_key(old_key, &new_key).await {
                    tracing::error!(old = %old_key, new = %new_key, err = %e, "queue re-key failed");
                }
            }
        }

        // one write lock across the whole batch so concurrent getbr sees
        // either the old index or the new one, not a mixture
        {
            let mut rpl = self.rpl.write().unwrap();
            for (old_key, old_rep_group, snapshot) in &records {
                if let Some(set) = rpl.get_mut(old_rep_group) {
                    set.remove(old_key);
                }
                rpl.entry(snapshot.rep_group.clone())
                    .or_default()
                    .insert(snapshot.key());
            }
            rpl.retain(|_, set| !set.is_empty());
        }

        let old_keys: Vec<String> = records.iter().map(|(old, _, _)| old.clone()).collect();
        let snapshots: Vec<Job> = records.iter().map(|(_, _, s)| s.clone()).collect();
        if let Err(e) = self.store.modify_live_jobs(&old_keys, &snapshots).await {
            tracing::error!(err = %e, "job modification in database failed");
        }

        if modifier.sets_dependencies() || modifier.sets_priority() {
            for (_, _, snapshot) in &records {
                let new_key = snapshot.key();
                let dependencies = self.resolve_dependencies(snapshot, &[]).await;
                if let Some(item) = self.q.get(&new_key).await {
                    if let Err(e) = self
                        .q
                        .update(
                            &new_key,
                            &snapshot.scheduler_group,
                            item.data.clone(),
                            snapshot.priority,
                            Duration::ZERO,
                            self.config().item_ttr,
                            dependencies,
                        )
                        .await
                    {
                        tracing::error!(key = %new_key, err = %e, "queue update failed");
                    }
                }
            }
        }

        tracing::debug!(count = modified.len(), "modified jobs");
        Ok(Response {
            modified,
            ..Default::default()
        })
    }

    async fn handle_jkill(self: &Arc<Self>, req: &Request) -> HResult {
        if req.keys.is_empty() {
            return Err(Herr::new(ERR_BAD_REQUEST));
        }
        let mut killable = 0;
        for key in &req.keys {
            if self.kill_job(key).await {
                killable += 1;
            }
        }
        tracing::debug!(count = killable, "flagged jobs for killing");
        Ok(Response {
            existed: killable,
            ..Default::default()
        })
    }

    // ---- the get* methods ----

    async fn handle_getbc(self: &Arc<Self>, req: &Request) -> HResult {
        if req.keys.is_empty() {
            return Err(Herr::new(ERR_BAD_REQUEST));
        }
        let mut jobs = Vec::new();
        let mut missing = Vec::new();
        for key in &req.keys {
            match self.q.get(key).await {
                Some(item) => jobs.push(self.item_to_job(&item, req.get_std, req.get_env).await),
                None => missing.push(key.clone()),
            }
        }
        if !missing.is_empty() {
            let found = self
                .store
                .retrieve_complete_jobs_by_keys(&missing, req.get_std, req.get_env)
                .await
                .map_err(db_herr)?;
            jobs.extend(found);
        }
        Ok(Response {
            jobs,
            ..Default::default()
        })
    }

    async fn handle_getbr(self: &Arc<Self>, req: &Request) -> HResult {
        if req.rep_group.is_empty() {
            return Err(Herr::new(ERR_BAD_REQUEST));
        }
        let rep_groups: Vec<String> = if req.search {
            let rpl = self.rpl.read().unwrap();
            rpl.keys()
                .filter(|rg| rg.contains(&req.rep_group))
                .cloned()
                .collect()
        } else {
            vec![req.rep_group.clone()]
        };

        let keys: HashSet<String> = {
            let rpl = self.rpl.read().unwrap();
            rep_groups
                .iter()
                .flat_map(|rg| rpl.get(rg).into_iter().flatten().cloned())
                .collect()
        };
        let mut jobs = Vec::new();
        for key in keys {
            if let Some(item) = self.q.get(&key).await {
                jobs.push(self.item_to_job(&item, req.get_std, req.get_env).await);
            }
        }

        let mut db_groups = rep_groups;
        if !db_groups.contains(&req.rep_group) {
            db_groups.push(req.rep_group.clone());
        }
        for rg in db_groups {
            let mut found = self
                .store
                .retrieve_complete_jobs_by_rep_group(&rg)
                .await
                .map_err(db_herr)?;
            for job in &mut found {
                self.populate_std_env(job, req.get_std, req.get_env).await;
            }
            jobs.append(&mut found);
        }

        filter_and_limit(&mut jobs, req.state, req.limit);
        Ok(Response {
            jobs,
            ..Default::default()
        })
    }

    async fn handle_getin(self: &Arc<Self>, req: &Request) -> HResult {
        let mut jobs = Vec::new();
        for item in self.q.all_items().await {
            jobs.push(self.item_to_job(&item, req.get_std, req.get_env).await);
        }
        filter_and_limit(&mut jobs, req.state, req.limit);
        Ok(Response {
            jobs,
            ..Default::default()
        })
    }

    async fn handle_getbcs(self: &Arc<Self>, req: &Request) -> HResult {
        if !req.confirm_dead_cloud_servers {
            return Ok(Response {
                bad_servers: self.bad_servers_snapshot(),
                ..Default::default()
            });
        }

        let confirmed = self.confirm_bad_servers(&req.cloud_server_id);
        let ids: HashSet<&str> = confirmed.iter().map(|s| s.id.as_str()).collect();
        tracing::debug!(count = confirmed.len(), "confirmed bad servers as dead");

        let mut affected = Vec::new();
        if !ids.is_empty() {
            for item in self.q.all_items().await {
                if item.state != ItemState::Run {
                    continue;
                }
                let host_id = item.data.read().unwrap().host_id.clone();
                if !ids.contains(host_id.as_str()) {
                    continue;
                }
                if self.kill_job(&item.key).await {
                    // killing a lost job buries it; re-read for the state
                    // the client should see
                    let fresh = self.q.get(&item.key).await.unwrap_or(item);
                    affected.push(self.item_to_job(&fresh, false, false).await);
                }
            }
            tracing::debug!(count = affected.len(), "killed jobs on bad servers");
        }

        Ok(Response {
            bad_servers: confirmed,
            jobs: affected,
            ..Default::default()
        })
    }

    async fn handle_getsetlg(self: &Arc<Self>, req: &Request) -> HResult {
        if req.limit_group.is_empty() {
            return Err(Herr::new(ERR_BAD_REQUEST));
        }
        let limit = match req.limit_group.split_once(':') {
            Some((name, value)) => {
                let parsed: i64 = value
                    .parse()
                    .map_err(|_| Herr::new(ERR_BAD_REQUEST))?;
                let limit = (parsed >= 0).then_some(parsed as u64);
                self.limiter.set_limit(name, limit).await;
                limit
            }
            None => self.limiter.limit(&req.limit_group).await,
        };
        Ok(Response {
            limit: limit.map(|l| l as i64).unwrap_or(-1),
            ..Default::default()
        })
    }

    // ---- upload ----

    async fn handle_upload(self: &Arc<Self>, req: &Request) -> HResult {
        let Some(file) = &req.file else {
            return Err(Herr::new(ERR_BAD_REQUEST));
        };
        let mut decoder = GzDecoder::new(&file[..]);
        let mut data = Vec::new();
        decoder.read_to_end(&mut data).map_err(internal)?;

        let path = if req.path.is_empty() {
            use sha2::Digest as _;
            let digest = sha2::Sha256::digest(&data);
            let mut name = String::with_capacity(64);
            for b in digest.iter() {
                use std::fmt::Write as _;
                let _ = write!(&mut name, "{b:02x}");
            }
            self.config().upload_dir.join(name)
        } else {
            let path = PathBuf::from(&req.path);
            if !path.is_absolute() {
                return Err(Herr::new(ERR_BAD_REQUEST));
            }
            path
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(internal)?;
        }
        tokio::fs::write(&path, &data).await.map_err(internal)?;
        Ok(Response {
            path: path.display().to_string(),
            ..Default::default()
        })
    }

    // ---- small shared bits ----

    pub(crate) fn rpl_remove(&self, rep_group: &str, key: &str) {
        let mut rpl = self.rpl.write().unwrap();
        let emptied = rpl
            .get_mut(rep_group)
            .map(|set| {
                set.remove(key);
                set.is_empty()
            })
            .unwrap_or(false);
        if emptied {
            rpl.remove(rep_group);
        }
    }

    pub(crate) async fn populate_std_env(&self, job: &mut Job, get_std: bool, get_env: bool) {
        if get_std && ((job.exited && job.exitcode != 0) || job.state == JobState::Buried) {
            let (stdout, stderr) = self.store.retrieve_job_std(&job.key()).await;
            job.stdout = Some(stdout);
            job.stderr = Some(stderr);
        }
        if get_env {
            job.env = self.store.retrieve_env(&job.env_key).await;
        }
    }
}

//! The broker server: owns the queue, the scheduler-group coordinator, the
//! limiter, the rep-group index and the store, and serves clients over the
//! framed wire protocol.

pub mod dispatch;
pub mod status;
pub mod timing;

pub use status::{JobStateCount, ALL_REP_GROUPS};

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Instant;

use rand::RngCore;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ServerConfig, TOKEN_LENGTH};
use crate::error::{BrokerError, Result, ERR_CLOSED_INT, ERR_CLOSED_STOP, ERR_CLOSED_TERM};
use crate::job::{Job, JobState, SharedJob};
use crate::limiter::Limiter;
use crate::queue::{ItemSnapshot, ItemState, Queue, TtrAction};
use crate::sched::{Coordinator, Requirements, Scheduler};
use crate::store::Store;
use crate::wire::frame::{read_frame, write_frame};
use crate::wire::{BadServer, ServerInfo};
use timing::TimingAvg;

/// up/drain/pause flags, read as one snapshot at request entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GateState {
    pub up: bool,
    pub drain: bool,
    /// Pause nesting depth; jmod pauses around its own work.
    pub paused: u32,
}

pub struct Server {
    config: ServerConfig,
    sinfo: ServerInfo,
    started_at: Instant,
    pub(crate) q: Queue<SharedJob>,
    pub(crate) store: Arc<dyn Store>,
    sched: Arc<dyn Scheduler>,
    pub(crate) coord: Coordinator,
    pub(crate) limiter: Limiter,
    /// rep group -> keys of live jobs in it.
    pub(crate) rpl: StdRwLock<HashMap<String, HashSet<String>>>,
    token: Vec<u8>,
    state: StdRwLock<GateState>,
    /// Server-wide kill switch: makes every jtouch report kill-called.
    kill_runners: StdRwLock<bool>,
    bad_servers: StdMutex<HashMap<String, BadServer>>,
    timings: StdMutex<HashMap<String, TimingAvg>>,
    status_tx: broadcast::Sender<JobStateCount>,
    shutdown_token: CancellationToken,
    closing: AtomicBool,
    close_tx: watch::Sender<Option<&'static str>>,
    close_rx: watch::Receiver<Option<&'static str>>,
}

impl Server {
    /// Start listening and serving clients. The returned server is already
    /// live; call `block` to wait for it to stop.
    pub async fn serve(
        config: ServerConfig,
        store: Arc<dyn Store>,
        sched: Arc<dyn Scheduler>,
    ) -> Result<Arc<Server>> {
        let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
        let port = listener.local_addr()?.port();

        // runners spawned on other machines need a reachable address; on a
        // loopback-only host we still come up, for manual local runners
        let ip = non_loopback_ipv4().unwrap_or_else(|| {
            tracing::warn!("no non-loopback ipv4 address found, advertising loopback");
            "127.0.0.1".to_string()
        });
        let host = hostname();

        let token = match &config.token {
            Some(token) => token.clone(),
            None => {
                let mut token = vec![0u8; TOKEN_LENGTH];
                rand::thread_rng().fill_bytes(&mut token);
                token
            }
        };

        let coord = Coordinator::new(
            sched.clone(),
            config.queue_name.clone(),
            config.runner_cmd.clone(),
        );
        let (status_tx, _) = broadcast::channel(config.status_capacity);
        let (close_tx, close_rx) = watch::channel(None);

        let server = Arc::new(Server {
            sinfo: ServerInfo {
                addr: format!("{ip}:{port}"),
                host,
                port,
                pid: std::process::id(),
            },
            started_at: Instant::now(),
            q: Queue::new(config.queue_name.clone()),
            store,
            sched,
            coord,
            limiter: Limiter::new(),
            rpl: StdRwLock::new(HashMap::new()),
            token,
            state: StdRwLock::new(GateState {
                up: true,
                drain: false,
                paused: 0,
            }),
            kill_runners: StdRwLock::new(false),
            bad_servers: StdMutex::new(HashMap::new()),
            timings: StdMutex::new(HashMap::new()),
            status_tx,
            shutdown_token: CancellationToken::new(),
            closing: AtomicBool::new(false),
            close_tx,
            close_rx,
            config,
        });

        server.install_queue_callbacks();
        server.spawn_signal_handler();
        server.spawn_accept_loop(listener);

        tracing::info!(addr = %server.sinfo.addr, pid = server.sinfo.pid, "server up");
        Ok(server)
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn addr(&self) -> &str {
        &self.sinfo.addr
    }

    pub fn port(&self) -> u16 {
        self.sinfo.port
    }

    pub(crate) fn server_info(&self) -> ServerInfo {
        self.sinfo.clone()
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    /// Subscribe to job state transitions. The bus is lossy: a slow
    /// subscriber skips events instead of backpressuring the server.
    pub fn subscribe_status(&self) -> broadcast::Receiver<JobStateCount> {
        self.status_tx.subscribe()
    }

    /// Whether the external scheduler has runners pending or running.
    pub fn has_runners(&self) -> bool {
        self.coord.busy()
    }

    /// Record a cluster host as unreachable, making it visible to getbcs.
    pub fn register_bad_server(&self, server: BadServer) {
        let mut bad = self.bad_servers.lock().unwrap();
        bad.insert(server.id.clone(), server);
    }

    /// Make every subsequent jtouch tell its runner to kill the job.
    pub fn set_kill_runners(&self, kill: bool) {
        *self.kill_runners.write().unwrap() = kill;
    }

    // ---- lifecycle ----

    /// Wait until the server stops, returning why it did.
    pub async fn block(&self) -> BrokerError {
        let mut rx = self.close_rx.clone();
        loop {
            if let Some(cause) = *rx.borrow() {
                return BrokerError::Closed(cause);
            }
            if rx.changed().await.is_err() {
                return BrokerError::Closed(ERR_CLOSED_STOP);
            }
        }
    }

    /// Gracefully stop the server. With `wait`, returns only after
    /// shutdown has completed.
    pub async fn stop(self: &Arc<Self>, wait: bool) {
        self.shutdown(ERR_CLOSED_STOP).await;
        if wait {
            self.block().await;
        }
    }

    /// Stop handing out jobs; everything else keeps working. Pauses nest.
    pub fn pause(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if !state.up {
            return Err(BrokerError::Closed(ERR_CLOSED_STOP));
        }
        state.paused += 1;
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.paused = state.paused.saturating_sub(1);
        Ok(())
    }

    /// Stop accepting new reservations and shut down once nothing is
    /// running and the scheduler has no runners left.
    pub fn drain(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().unwrap();
            if !state.up {
                return Err(BrokerError::Closed(ERR_CLOSED_STOP));
            }
            state.up = false;
            state.drain = true;
        }
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(server.config.reserve_ticker);
            loop {
                ticker.tick().await;
                if server.closing.load(Ordering::SeqCst) {
                    return;
                }
                let stats = server.q.stats().await;
                if stats.running == 0 && !server.coord.busy() {
                    tracing::info!("drain complete, shutting down");
                    server.shutdown(ERR_CLOSED_STOP).await;
                    return;
                }
            }
        });
        Ok(())
    }

    pub(crate) fn gate(&self) -> GateState {
        *self.state.read().unwrap()
    }

    /// Tear everything down: stop the listener, close the store, destroy
    /// the queue, and release anyone in `block`.
    pub(crate) async fn shutdown(&self, cause: &'static str) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.write().unwrap();
            state.up = false;
            state.drain = false;
        }
        self.shutdown_token.cancel();
        self.store.close().await;
        self.q.destroy().await;
        let _ = self.close_tx.send(Some(cause));
        tracing::info!(cause, "server shut down");
    }

    // ---- startup plumbing ----

    fn install_queue_callbacks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.q.set_ready_added_callback(Arc::new(move |batch| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(server) = weak.upgrade() {
                    server.on_ready_batch(batch).await;
                }
            })
        }));

        let weak = Arc::downgrade(self);
        self.q.set_ttr_callback(Arc::new(move |data: &SharedJob| {
            let mut job = data.write().unwrap();
            if job.start_time.is_some() {
                // the command is (or was) running somewhere we lost contact
                // with; keep the reservation so a late jtouch can revive it
                if !job.lost {
                    job.lost = true;
                    job.end_time = Some(chrono::Utc::now());
                    let rep_group = job.rep_group.clone();
                    drop(job);
                    if let Some(server) = weak.upgrade() {
                        tracing::warn!(rep_group = %rep_group, "job lost contact");
                        server.broadcast(&rep_group, JobState::Running, JobState::Lost);
                    }
                }
                TtrAction::KeepRunning
            } else {
                // reserved but never started: the runner died or bailed
                job.reserved_by = Uuid::nil();
                job.state = JobState::Ready;
                TtrAction::MoveToReady
            }
        }));
    }

    /// Assign scheduler groups to newly ready jobs and raise runner demand.
    /// Jobs that already carry a group re-entered ready and are already
    /// counted.
    async fn on_ready_batch(self: &Arc<Self>, batch: Vec<ItemSnapshot<SharedJob>>) {
        let mut groups: HashMap<String, (Requirements, usize)> = HashMap::new();
        for snap in &batch {
            let (existing, req) = {
                let job = snap.data.read().unwrap();
                (job.scheduler_group.clone(), requirements_of(&job))
            };
            if !existing.is_empty() {
                continue;
            }
            let tag = self.coord.place(&req);
            let group = {
                let mut job = snap.data.write().unwrap();
                let group = job.scheduler_group_for(&tag);
                job.scheduler_group = group.clone();
                group
            };
            if let Err(e) = self.q.set_reserve_group(&snap.key, &group).await {
                tracing::debug!(key = %snap.key, err = %e, "reserve group not set");
                continue;
            }
            let entry = groups.entry(group).or_insert((req, 0));
            entry.1 += 1;
        }
        for (group, (req, count)) in groups {
            self.coord.increment(&group, &req, count).await;
        }
    }

    fn spawn_signal_handler(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let token = self.shutdown_token.clone();
        tokio::spawn(async move {
            let mut sigint = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::interrupt(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(err = %e, "failed to install SIGINT handler");
                    return;
                }
            };
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(err = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            let cause = tokio::select! {
                _ = sigint.recv() => ERR_CLOSED_INT,
                _ = sigterm.recv() => ERR_CLOSED_TERM,
                _ = token.cancelled() => return,
            };
            if let Some(server) = weak.upgrade() {
                tracing::info!(cause, "signal received, shutting down");
                server.shutdown(cause).await;
            }
        });
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: TcpListener) {
        let server = Arc::clone(self);
        let token = self.shutdown_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "client connected");
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                server.handle_connection(stream).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(err = %e, "accept failed");
                        }
                    }
                }
            }
        });
    }

    /// One task per connection reads frames; each frame is handled in its
    /// own task, and replies are funneled back through a writer task in
    /// whatever order the handlers finish.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let (mut reader, mut writer) = stream.into_split();
        let (reply_tx, mut reply_rx) = mpsc::channel::<(u64, Vec<u8>)>(64);

        tokio::spawn(async move {
            while let Some((id, payload)) = reply_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, id, &payload).await {
                    // the client will retry or time out
                    tracing::debug!(err = %e, "reply send failed, dropping");
                    return;
                }
            }
        });

        let token = self.shutdown_token.clone();
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                frame = read_frame(&mut reader) => {
                    let (id, payload) = match frame {
                        Ok(frame) => frame,
                        Err(e) => {
                            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                                tracing::debug!(err = %e, "receive failed");
                            }
                            return;
                        }
                    };
                    let server = Arc::clone(&self);
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        let (reply, err) = server.dispatch(&payload).await;
                        if let Some(err) = err {
                            tracing::warn!(client_err = %err, "request failed");
                        }
                        let _ = reply_tx.send((id, reply)).await;
                    });
                }
            }
        }
    }

    // ---- shared helpers for the dispatcher ----

    pub(crate) fn broadcast(&self, rep_group: &str, from: JobState, to: JobState) {
        let _ = self.status_tx.send(JobStateCount {
            rep_group: ALL_REP_GROUPS.to_string(),
            from,
            to,
            count: 1,
        });
        let _ = self.status_tx.send(JobStateCount {
            rep_group: rep_group.to_string(),
            from,
            to,
            count: 1,
        });
    }

    /// Take the job's scheduler group and lower that group's runner demand.
    /// Clearing the group means a later kick re-places and re-counts it.
    pub(crate) async fn decrement_scheduler_group(&self, shared: &SharedJob) {
        let group = {
            let mut job = shared.write().unwrap();
            std::mem::take(&mut job.scheduler_group)
        };
        if !group.is_empty() {
            self.coord.decrement(&group).await;
        }
    }

    /// A client-facing snapshot of a queued job, with state derived from
    /// its sub-queue and blobs pulled from the store on request.
    pub(crate) async fn item_to_job(
        &self,
        snap: &ItemSnapshot<SharedJob>,
        get_std: bool,
        get_env: bool,
    ) -> Job {
        let base = base_job_state(snap.state);
        let mut job = snap.data.read().unwrap().snapshot_with_state(base);
        self.populate_std_env(&mut job, get_std, get_env).await;
        job
    }

    pub(crate) fn log_timing(&self, method: &str, took: std::time::Duration) {
        if method.is_empty() {
            return;
        }
        let avg = {
            let mut timings = self.timings.lock().unwrap();
            timings
                .entry(method.to_string())
                .or_default()
                .store(took.as_secs_f64())
        };
        if let Some(avg) = avg {
            tracing::info!(method, avg_secs = avg, "request timing");
        }
    }

    pub(crate) fn bad_servers_snapshot(&self) -> Vec<BadServer> {
        let bad = self.bad_servers.lock().unwrap();
        let mut servers: Vec<BadServer> = bad.values().cloned().collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    /// Remove confirmed-dead servers from the bad list and destroy them via
    /// the scheduler adapter, returning the ones actually destroyed.
    pub(crate) fn confirm_bad_servers(&self, only_id: &str) -> Vec<BadServer> {
        let candidates: Vec<BadServer> = {
            let mut bad = self.bad_servers.lock().unwrap();
            let ids: Vec<String> = bad
                .values()
                .filter(|s| s.is_bad && (only_id.is_empty() || only_id == s.id))
                .map(|s| s.id.clone())
                .collect();
            ids.into_iter().filter_map(|id| bad.remove(&id)).collect()
        };
        let mut confirmed = Vec::new();
        for server in candidates {
            if let Err(e) = self.sched.destroy_host(&server.id) {
                tracing::warn!(server = %server.id, err = %e, "bad server could not be destroyed");
                continue;
            }
            confirmed.push(server);
        }
        confirmed
    }

    /// Flag a running job so its runner's next jtouch kills it. A lost job
    /// has no runner to do that, so it is buried on the spot.
    pub(crate) async fn kill_job(self: &Arc<Self>, key: &str) -> bool {
        let Some(item) = self.q.get(key).await else {
            return false;
        };
        if item.state != ItemState::Run {
            return false;
        }
        let (lost, rep_group) = {
            let mut job = item.data.write().unwrap();
            job.kill_called = true;
            (job.lost, job.rep_group.clone())
        };
        if lost {
            let snapshot = {
                let mut job = item.data.write().unwrap();
                job.state = JobState::Buried;
                job.reserved_by = Uuid::nil();
                if job.fail_reason.is_empty() {
                    job.fail_reason = "lost contact with runner".to_string();
                }
                job.clone()
            };
            if self.q.bury(key).await.is_ok() {
                self.decrement_scheduler_group(&item.data).await;
                if let Err(e) = self.store.update_job_after_change(&snapshot).await {
                    tracing::error!(key, err = %e, "failed to persist killed job");
                }
                self.broadcast(&rep_group, JobState::Lost, JobState::Buried);
            }
        }
        true
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.sched
    }
}

pub(crate) fn base_job_state(state: ItemState) -> JobState {
    match state {
        ItemState::Delay => JobState::Delayed,
        ItemState::Dependent => JobState::Dependent,
        ItemState::Ready => JobState::Ready,
        ItemState::Run => JobState::Reserved,
        ItemState::Bury => JobState::Buried,
    }
}

pub(crate) fn requirements_of(job: &Job) -> Requirements {
    job.requirements.clone()
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// The address runners elsewhere would use to reach us: what a routing
/// lookup towards a public address binds locally. No packets are sent.
fn non_loopback_ipv4() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("198.51.100.1:53").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip.to_string()),
        _ => None,
    }
}

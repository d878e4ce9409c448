use std::collections::HashMap;
use std::time::Duration;

use tokio::net::TcpStream;
use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::job::{Job, JobEndState, JobModifier, JobState};
use crate::wire::frame::{read_frame, write_frame};
use crate::wire::{
    decode, encode, BadServer, Request, Response, ServerInfo, ServerStats, M_ADD, M_BACKUP,
    M_DRAIN, M_GETBC, M_GETBCS, M_GETBR, M_GETIN, M_GETSETLG, M_JARCHIVE, M_JBURY, M_JDEL,
    M_JKICK, M_JKILL, M_JMOD, M_JRELEASE, M_JSTART, M_JTOUCH, M_PAUSE, M_PING, M_RESERVE,
    M_RESUME, M_SHUTDOWN, M_SSTATS, M_UPLOAD,
};

/// A connection to the broker. Used by runners, the CLI, and tests.
///
/// Each request carries a fresh correlation id; the reply stream is read
/// until the matching id arrives, so a reply to an earlier, slower request
/// arriving late is simply skipped past.
pub struct Client {
    stream: TcpStream,
    next_id: u64,
    token: Vec<u8>,
    queue: String,
    client_id: Uuid,
}

impl Client {
    pub async fn connect(addr: &str, queue: &str, token: Vec<u8>) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| BrokerError::NoServer(e.to_string()))?;
        Ok(Self {
            stream,
            next_id: 1,
            token,
            queue: queue.to_string(),
            client_id: Uuid::new_v4(),
        })
    }

    /// The id this client reserves jobs under.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// A request pre-filled with this client's token, queue and id.
    pub fn new_request(&self, method: &str) -> Request {
        Request {
            method: method.to_string(),
            token: self.token.clone(),
            queue: self.queue.clone(),
            client_id: self.client_id,
            ..Default::default()
        }
    }

    /// Send a raw request and wait for its reply. The reply's `err` field
    /// is returned as-is; use the typed helpers to have it converted.
    pub async fn call(&mut self, req: &Request) -> Result<Response> {
        let id = self.next_id;
        self.next_id += 1;
        let payload = encode(req)?;
        write_frame(&mut self.stream, id, &payload).await?;
        loop {
            let (reply_id, bytes) = read_frame(&mut self.stream).await?;
            if reply_id == id {
                return decode(&bytes);
            }
        }
    }

    async fn checked(&mut self, req: &Request) -> Result<Response> {
        let resp = self.call(req).await?;
        if resp.err.is_empty() {
            Ok(resp)
        } else {
            Err(BrokerError::Remote(resp.err))
        }
    }

    pub async fn ping(&mut self) -> Result<ServerInfo> {
        let req = self.new_request(M_PING);
        let resp = self.checked(&req).await?;
        resp.sinfo
            .ok_or_else(|| BrokerError::Wire("ping reply without server info".to_string()))
    }

    pub async fn server_stats(&mut self) -> Result<ServerStats> {
        let req = self.new_request(M_SSTATS);
        let resp = self.checked(&req).await?;
        resp.sstats
            .ok_or_else(|| BrokerError::Wire("sstats reply without stats".to_string()))
    }

    /// Add jobs with their environment. Returns `(added, existed)`.
    pub async fn add(
        &mut self,
        jobs: Vec<Job>,
        env: Vec<u8>,
        ignore_complete: bool,
    ) -> Result<(usize, usize)> {
        let mut req = self.new_request(M_ADD);
        req.jobs = jobs;
        req.env = Some(env);
        req.ignore_complete = ignore_complete;
        let resp = self.checked(&req).await?;
        Ok((resp.added, resp.existed))
    }

    /// Reserve the next ready job, waiting up to `timeout`. `Ok(None)`
    /// means nothing became ready in time.
    pub async fn reserve(&mut self, timeout: Duration) -> Result<Option<Job>> {
        let mut req = self.new_request(M_RESERVE);
        req.timeout = timeout;
        let resp = self.checked(&req).await?;
        Ok(resp.job)
    }

    /// Reserve restricted to a scheduler group, as spawned runners do.
    pub async fn reserve_group(
        &mut self,
        group: &str,
        timeout: Duration,
        first_reserve: bool,
    ) -> Result<Option<Job>> {
        let mut req = self.new_request(M_RESERVE);
        req.scheduler_group = group.to_string();
        req.timeout = timeout;
        req.first_reserve = first_reserve;
        let resp = self.checked(&req).await?;
        Ok(resp.job)
    }

    /// Report that the reserved job's command has started.
    pub async fn started(
        &mut self,
        job: &Job,
        pid: i32,
        host: &str,
        host_ip: &str,
    ) -> Result<()> {
        let mut req = self.new_request(M_JSTART);
        let mut j = job.clone();
        j.pid = pid;
        j.host = host.to_string();
        j.host_ip = host_ip.to_string();
        req.job = Some(j);
        self.checked(&req).await?;
        Ok(())
    }

    /// Keep the reservation alive. Returns true when the server wants the
    /// job killed.
    pub async fn touch(&mut self, job: &Job) -> Result<bool> {
        let mut req = self.new_request(M_JTOUCH);
        req.job = Some(job.clone());
        let resp = self.checked(&req).await?;
        Ok(resp.kill_called)
    }

    pub async fn archive(&mut self, job: &Job, end: JobEndState) -> Result<()> {
        let mut req = self.new_request(M_JARCHIVE);
        req.job = Some(job.clone());
        req.end_state = Some(end);
        self.checked(&req).await?;
        Ok(())
    }

    pub async fn release(
        &mut self,
        job: &Job,
        end: JobEndState,
        fail_reason: &str,
        delay: Duration,
    ) -> Result<()> {
        let mut req = self.new_request(M_JRELEASE);
        let mut j = job.clone();
        j.fail_reason = fail_reason.to_string();
        req.job = Some(j);
        req.end_state = Some(end);
        req.timeout = delay;
        self.checked(&req).await?;
        Ok(())
    }

    pub async fn bury(&mut self, job: &Job, end: JobEndState, fail_reason: &str) -> Result<()> {
        let mut req = self.new_request(M_JBURY);
        let mut j = job.clone();
        j.fail_reason = fail_reason.to_string();
        req.job = Some(j);
        req.end_state = Some(end);
        self.checked(&req).await?;
        Ok(())
    }

    /// Unbury jobs by key; returns how many were kicked.
    pub async fn kick(&mut self, keys: Vec<String>) -> Result<usize> {
        let mut req = self.new_request(M_JKICK);
        req.keys = keys;
        let resp = self.checked(&req).await?;
        Ok(resp.existed)
    }

    /// Delete non-running jobs by key; returns how many were deleted.
    pub async fn delete(&mut self, keys: Vec<String>) -> Result<usize> {
        let mut req = self.new_request(M_JDEL);
        req.keys = keys;
        let resp = self.checked(&req).await?;
        Ok(resp.existed)
    }

    /// Flag running jobs for killing; returns how many were flagged.
    pub async fn kill(&mut self, keys: Vec<String>) -> Result<usize> {
        let mut req = self.new_request(M_JKILL);
        req.keys = keys;
        let resp = self.checked(&req).await?;
        Ok(resp.existed)
    }

    /// Modify non-running jobs; returns the old-to-new key mapping.
    pub async fn modify(
        &mut self,
        keys: Vec<String>,
        modifier: JobModifier,
    ) -> Result<HashMap<String, String>> {
        let mut req = self.new_request(M_JMOD);
        req.keys = keys;
        req.modifier = Some(modifier);
        let resp = self.checked(&req).await?;
        Ok(resp.modified)
    }

    pub async fn jobs_by_keys(
        &mut self,
        keys: Vec<String>,
        get_std: bool,
        get_env: bool,
    ) -> Result<Vec<Job>> {
        let mut req = self.new_request(M_GETBC);
        req.keys = keys;
        req.get_std = get_std;
        req.get_env = get_env;
        let resp = self.checked(&req).await?;
        Ok(resp.jobs)
    }

    pub async fn jobs_by_rep_group(
        &mut self,
        rep_group: &str,
        search: bool,
        limit: usize,
        state: Option<JobState>,
    ) -> Result<Vec<Job>> {
        let mut req = self.new_request(M_GETBR);
        req.rep_group = rep_group.to_string();
        req.search = search;
        req.limit = limit;
        req.state = state;
        let resp = self.checked(&req).await?;
        Ok(resp.jobs)
    }

    pub async fn current_jobs(
        &mut self,
        limit: usize,
        state: Option<JobState>,
        get_std: bool,
        get_env: bool,
    ) -> Result<Vec<Job>> {
        let mut req = self.new_request(M_GETIN);
        req.limit = limit;
        req.state = state;
        req.get_std = get_std;
        req.get_env = get_env;
        let resp = self.checked(&req).await?;
        Ok(resp.jobs)
    }

    /// Fetch (and optionally confirm dead, destroying them) bad servers.
    pub async fn bad_servers(
        &mut self,
        confirm_dead: bool,
        cloud_server_id: &str,
    ) -> Result<(Vec<BadServer>, Vec<Job>)> {
        let mut req = self.new_request(M_GETBCS);
        req.confirm_dead_cloud_servers = confirm_dead;
        req.cloud_server_id = cloud_server_id.to_string();
        let resp = self.checked(&req).await?;
        Ok((resp.bad_servers, resp.jobs))
    }

    /// Read a limit group's limit ("name"), or set it ("name:count").
    /// Returns the resulting limit, -1 when unlimited.
    pub async fn limit_group(&mut self, group: &str) -> Result<i64> {
        let mut req = self.new_request(M_GETSETLG);
        req.limit_group = group.to_string();
        let resp = self.checked(&req).await?;
        Ok(resp.limit)
    }

    pub async fn pause(&mut self) -> Result<()> {
        let req = self.new_request(M_PAUSE);
        self.checked(&req).await?;
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<()> {
        let req = self.new_request(M_RESUME);
        self.checked(&req).await?;
        Ok(())
    }

    pub async fn drain(&mut self) -> Result<()> {
        let req = self.new_request(M_DRAIN);
        self.checked(&req).await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        let req = self.new_request(M_SHUTDOWN);
        self.checked(&req).await?;
        Ok(())
    }

    /// Fetch a serialized snapshot of the server's database.
    pub async fn backup(&mut self) -> Result<Vec<u8>> {
        let req = self.new_request(M_BACKUP);
        let resp = self.checked(&req).await?;
        Ok(resp.db)
    }

    /// Upload a gzip-compressed file; returns the path it was saved to.
    pub async fn upload(&mut self, compressed: Vec<u8>, path: &str) -> Result<String> {
        let mut req = self.new_request(M_UPLOAD);
        req.file = Some(compressed);
        req.path = path.to_string();
        let resp = self.checked(&req).await?;
        Ok(resp.path)
    }
}

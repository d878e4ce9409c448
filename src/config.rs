use std::path::PathBuf;
use std::time::Duration;

/// Server tunables, fixed for the lifetime of a server.
///
/// The defaults are the production constants; tests shrink the timing values
/// to keep runs fast.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on for client connections.
    pub port: u16,
    /// Name of the job queue this server manages.
    pub queue_name: String,
    /// Command line used to start a runner, with `{queue}` and `{group}`
    /// placeholders. Empty means runners are never spawned and must be
    /// started manually.
    pub runner_cmd: String,
    /// Fixed auth token. `None` means a random token is generated at
    /// startup and exposed via `Server::token()`.
    pub token: Option<Vec<u8>>,
    /// How long a receive waits before re-checking the shutdown signal.
    pub interrupt_time: Duration,
    /// Time-to-run for reserved items: a reserved job must be touched
    /// within this window or it is considered lost.
    pub item_ttr: Duration,
    /// How often a blocked reserve re-polls the ready sub-queue.
    pub reserve_ticker: Duration,
    /// Delay applied to a job at reserve time, used if it is later
    /// released without an explicit timeout.
    pub release_delay: Duration,
    /// Capacity of the lossy status broadcast channel.
    pub status_capacity: usize,
    /// Directory uploaded files are saved under when the client gives no
    /// target path.
    pub upload_dir: PathBuf,
}

pub const TOKEN_LENGTH: usize = 32;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 11301,
            queue_name: "cmds".to_string(),
            runner_cmd: String::new(),
            token: None,
            interrupt_time: Duration::from_secs(1),
            item_ttr: Duration::from_secs(60),
            reserve_ticker: Duration::from_secs(1),
            release_delay: Duration::from_secs(30),
            status_capacity: 128,
            upload_dir: PathBuf::from("/tmp/drover_uploads"),
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_runner_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.runner_cmd = cmd.into();
        self
    }

    pub fn with_token(mut self, token: Vec<u8>) -> Self {
        self.token = Some(token);
        self
    }
}

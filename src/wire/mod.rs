//! Wire protocol types: the request/reply structs exchanged between
//! clients and the server, bincode-encoded inside length-prefixed frames.

pub mod client;
pub mod frame;

pub use client::Client;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::job::{Job, JobEndState, JobModifier, JobState};

// Method names. Kept as strings on the wire so unrecognized commands can
// be answered with ErrUnknownCommand instead of a decode failure.
pub const M_PING: &str = "ping";
pub const M_SSTATS: &str = "sstats";
pub const M_ADD: &str = "add";
pub const M_RESERVE: &str = "reserve";
pub const M_JSTART: &str = "jstart";
pub const M_JTOUCH: &str = "jtouch";
pub const M_JARCHIVE: &str = "jarchive";
pub const M_JRELEASE: &str = "jrelease";
pub const M_JBURY: &str = "jbury";
pub const M_JKICK: &str = "jkick";
pub const M_JDEL: &str = "jdel";
pub const M_JMOD: &str = "jmod";
pub const M_JKILL: &str = "jkill";
pub const M_GETBC: &str = "getbc";
pub const M_GETBR: &str = "getbr";
pub const M_GETIN: &str = "getin";
pub const M_GETBCS: &str = "getbcs";
pub const M_GETSETLG: &str = "getsetlg";
pub const M_PAUSE: &str = "pause";
pub const M_RESUME: &str = "resume";
pub const M_DRAIN: &str = "drain";
pub const M_SHUTDOWN: &str = "shutdown";
pub const M_BACKUP: &str = "backup";
pub const M_UPLOAD: &str = "upload";

/// What a client sends. Only the fields a given method reads need to be
/// set; everything else stays at its default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub token: Vec<u8>,
    pub queue: String,
    pub jobs: Vec<Job>,
    pub job: Option<Job>,
    pub keys: Vec<String>,
    pub env: Option<Vec<u8>>,
    pub client_id: Uuid,
    pub scheduler_group: String,
    pub first_reserve: bool,
    /// Reserve wait budget; doubles as the release delay for jrelease.
    pub timeout: Duration,
    pub modifier: Option<JobModifier>,
    pub end_state: Option<JobEndState>,
    pub get_std: bool,
    pub get_env: bool,
    pub search: bool,
    /// Result cap for the get* methods; zero means unlimited.
    pub limit: usize,
    pub state: Option<JobState>,
    pub rep_group: String,
    pub ignore_complete: bool,
    pub limit_group: String,
    pub cloud_server_id: String,
    pub confirm_dead_cloud_servers: bool,
    pub file: Option<Vec<u8>>,
    pub path: String,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: M_PING.to_string(),
            token: Vec::new(),
            queue: String::new(),
            jobs: Vec::new(),
            job: None,
            keys: Vec::new(),
            env: None,
            client_id: Uuid::nil(),
            scheduler_group: String::new(),
            first_reserve: false,
            timeout: Duration::ZERO,
            modifier: None,
            end_state: None,
            get_std: false,
            get_env: false,
            search: false,
            limit: 0,
            state: None,
            rep_group: String::new(),
            ignore_complete: false,
            limit_group: String::new(),
            cloud_server_id: String::new(),
            confirm_dead_cloud_servers: false,
            file: None,
            path: String::new(),
        }
    }
}

/// What the server replies with. `err` is empty on success and one of the
/// stable error code strings otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub err: String,
    pub added: usize,
    pub existed: usize,
    pub job: Option<Job>,
    pub jobs: Vec<Job>,
    pub sstats: Option<ServerStats>,
    pub sinfo: Option<ServerInfo>,
    pub db: Vec<u8>,
    pub path: String,
    pub bad_servers: Vec<BadServer>,
    /// Old key to new key, for jmod.
    pub modified: std::collections::HashMap<String, String>,
    /// Configured limit for getsetlg; -1 when the group has no limit.
    pub limit: i64,
    pub kill_called: bool,
}

impl Response {
    pub fn error(code: &str) -> Self {
        Self {
            err: code.to_string(),
            ..Default::default()
        }
    }
}

/// Basic addressing info about a running server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub addr: String,
    pub host: String,
    pub port: u16,
    pub pid: u32,
}

/// A point-in-time summary of the server for clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStats {
    pub server_info: ServerInfo,
    pub delayed: usize,
    pub dependent: usize,
    pub ready: usize,
    pub running: usize,
    pub buried: usize,
    pub uptime: Duration,
}

/// A cluster host the scheduler adapter has flagged unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadServer {
    pub id: String,
    pub host: String,
    pub flagged_at: DateTime<Utc>,
    pub is_bad: bool,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| BrokerError::Wire(format!("encode: {e}")))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| BrokerError::Wire(format!("decode: {e}")))?;
    Ok(value)
}

/// Constant-time token comparison; a wrong length fails fast, content
/// comparison leaks nothing about where the mismatch is.
pub fn token_matches(given: &[u8], expected: &[u8]) -> bool {
    if given.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in given.iter().zip(expected.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

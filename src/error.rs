use thiserror::Error;

// Error code strings sent over the wire. Clients match on these exact
// values, so they are stable constants rather than Display output.
pub const ERR_INTERNAL_ERROR: &str = "internal error";
pub const ERR_UNKNOWN_COMMAND: &str = "unknown command";
pub const ERR_BAD_REQUEST: &str = "bad request (missing arguments?)";
pub const ERR_BAD_JOB: &str = "bad job (not in queue or correct sub-queue)";
pub const ERR_MISSING_JOB: &str = "corresponding job not found";
pub const ERR_MUST_RESERVE: &str = "you must reserve a job before passing it to other methods";
pub const ERR_DB_ERROR: &str = "failed to use database";
pub const ERR_QUEUE_CLOSED: &str = "queue closed";
pub const ERR_CLOSED_INT: &str = "queues closed due to SIGINT";
pub const ERR_CLOSED_TERM: &str = "queues closed due to SIGTERM";
pub const ERR_CLOSED_STOP: &str = "queues closed due to manual stop";
pub const ERR_NO_SERVER: &str = "could not reach the server";
pub const ERR_NO_HOST: &str = "could not determine the non-loopback ip address of this host";
pub const ERR_PERMISSION_DENIED: &str = "permission denied";

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("bad request (missing arguments?)")]
    BadRequest,

    #[error("bad job (not in queue or correct sub-queue)")]
    BadJob,

    #[error("corresponding job not found")]
    MissingJob,

    #[error("you must reserve a job before passing it to other methods")]
    MustReserve,

    #[error("permission denied")]
    PermissionDenied,

    #[error("queue closed")]
    QueueClosed,

    #[error("server stopped: {0}")]
    Closed(&'static str),

    #[error("database error: {0}")]
    Db(String),

    #[error("could not determine the non-loopback ip address of this host")]
    NoHost,

    #[error("could not reach the server: {0}")]
    NoServer(String),

    #[error("wire protocol error: {0}")]
    Wire(String),

    /// Client side only: the server replied with this error code.
    #[error("server replied with an error: {0}")]
    Remote(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// The stable wire code for this error, as sent in a reply's `err` field.
    pub fn wire_code(&self) -> &'static str {
        match self {
            BrokerError::BadRequest => ERR_BAD_REQUEST,
            BrokerError::BadJob => ERR_BAD_JOB,
            BrokerError::MissingJob => ERR_MISSING_JOB,
            BrokerError::MustReserve => ERR_MUST_RESERVE,
            BrokerError::PermissionDenied => ERR_PERMISSION_DENIED,
            BrokerError::QueueClosed => ERR_QUEUE_CLOSED,
            BrokerError::Closed(code) => code,
            BrokerError::Db(_) => ERR_DB_ERROR,
            BrokerError::NoHost => ERR_NO_HOST,
            BrokerError::NoServer(_) => ERR_NO_SERVER,
            BrokerError::Wire(_)
            | BrokerError::Io(_)
            | BrokerError::Internal(_)
            | BrokerError::Remote(_) => ERR_INTERNAL_ERROR,
        }
    }
}

/// A request-handling error enriched with the method and job key that caused
/// it, for server-side logging. The client only ever sees the wire code.
#[derive(Debug)]
pub struct RequestError {
    pub method: String,
    pub key: String,
    pub cause: String,
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({}): {}", self.method, self.key, self.cause)
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

use thiserror::Error;

/// Errors surfaced by the consensus core.
///
/// Storage and invariant violations collapse into [`DbError::Fatal`]: per
/// spec these abort the process rather than propagate as a retriable
/// result. Everything else is a tagged, retriable outcome a dispatcher can
/// turn into a protocol-level reply.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("moved to {0}")]
    Moved(String),

    #[error("membership update blocked: {0}")]
    MembershipBlocked(String),

    #[error("wrong number of arguments")]
    WrongArgs,

    #[error("wrong type")]
    WrongType,

    #[error("fatal invariant violation: {0}")]
    Fatal(String),
}

impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Io(e) => DbError::Io(std::io::Error::new(e.kind(), e.to_string())),
            DbError::Serialization(s) => DbError::Serialization(s.clone()),
            DbError::NotFound(s) => DbError::NotFound(s.clone()),
            DbError::InvalidArgument(s) => DbError::InvalidArgument(s.clone()),
            DbError::InvalidOperation(s) => DbError::InvalidOperation(s.clone()),
            DbError::NotAuthorized(s) => DbError::NotAuthorized(s.clone()),
            DbError::Unavailable(s) => DbError::Unavailable(s.clone()),
            DbError::Moved(s) => DbError::Moved(s.clone()),
            DbError::MembershipBlocked(s) => DbError::MembershipBlocked(s.clone()),
            DbError::WrongArgs => DbError::WrongArgs,
            DbError::WrongType => DbError::WrongType,
            DbError::Fatal(s) => DbError::Fatal(s.clone()),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for DbError {
    fn from(e: bincode::error::EncodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for DbError {
    fn from(e: bincode::error::DecodeError) -> Self {
        DbError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Aborts the process with a diagnostic. Storage/invariant violations are
/// fatal per the propagation policy; this is the single place that happens.
pub fn fatal(msg: impl Into<String>) -> ! {
    let msg = msg.into();
    tracing::error!(%msg, "fatal invariant violation, aborting");
    panic!("fatal invariant violation: {msg}");
}

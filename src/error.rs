use std::path::PathBuf;

use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    MissingRequiredParameter(String),

    #[error("{0}")]
    InvalidParameter(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("the response is not ready yet, please retry later")]
    ResponseNotReady,

    /// A cached response exists but is itself an error. Carried verbatim.
    #[error("upstream response is an error ({error_code})")]
    Upstream {
        content: serde_json::Value,
        status: u16,
        error_code: String,
        revision: Option<String>,
    },

    #[error("no job available")]
    EmptyQueue,

    #[error("the job does not exist")]
    JobNotFound,

    #[error("the job id is invalid: {0}")]
    InvalidJobId(String),

    #[error("incoherent queue state: {0}")]
    IncoherentState(String),

    #[error("unexpected error: {0}")]
    Unexpected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

/// The structured form of an error, safe to hand to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub error: serde_json::Value,
    pub error_code: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl Error {
    /// Stable error code for the client.
    pub fn code(&self) -> &str {
        match self {
            Error::MissingRequiredParameter(_) => "MissingRequiredParameter",
            Error::InvalidParameter(_) => "InvalidParameter",
            Error::Authentication(_) => "AuthenticationError",
            Error::ResponseNotReady => "ResponseNotReady",
            Error::Upstream { error_code, .. } => error_code,
            Error::EmptyQueue => "EmptyQueue",
            Error::JobNotFound => "JobNotFound",
            Error::InvalidJobId(_) => "InvalidJobId",
            Error::IncoherentState(_) => "IncoherentState",
            _ => "UnexpectedError",
        }
    }

    /// HTTP-like severity.
    pub fn status(&self) -> u16 {
        match self {
            Error::MissingRequiredParameter(_) | Error::InvalidParameter(_) => {
                422
            }
            Error::InvalidJobId(_) => 422,
            Error::Authentication(_) => 401,
            Error::Upstream { status, .. } => *status,
            Error::EmptyQueue | Error::JobNotFound => 404,
            _ => 500,
        }
    }

    /// Whether a later retry of the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ResponseNotReady | Error::EmptyQueue)
    }

    /// Convert into a client payload. Internal errors are reported as
    /// "Unexpected error." and their cause is only logged.
    pub fn to_payload(&self, revision: Option<&str>) -> ErrorPayload {
        let error = match self {
            Error::Upstream { content, .. } => content.clone(),
            Error::MissingRequiredParameter(_)
            | Error::InvalidParameter(_)
            | Error::Authentication(_)
            | Error::ResponseNotReady
            | Error::EmptyQueue
            | Error::JobNotFound
            | Error::InvalidJobId(_) => {
                serde_json::Value::String(self.to_string())
            }
            Error::IncoherentState(_) => {
                tracing::error!(error = %self, "incoherent state reported");
                serde_json::Value::String("Unexpected error.".into())
            }
            _ => {
                tracing::error!(error = %self, "unexpected error");
                serde_json::Value::String("Unexpected error.".into())
            }
        };

        let revision = match self {
            Error::Upstream {
                revision: Some(rev),
                ..
            } => Some(rev.clone()),
            _ => revision.map(str::to_string),
        };

        ErrorPayload {
            error,
            error_code: self.code().to_string(),
            status: self.status(),
            revision,
        }
    }
}

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A non-2xx response from one of the remote services.
#[derive(Debug, Clone)]
pub struct RemoteError {
    pub status: u16,
    pub url: String,
    pub body: String,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP {} for {}", self.status, self.url)?;
        if !self.body.trim().is_empty() {
            let snippet: String = self.body.chars().take(500).collect();
            write!(f, ": {snippet}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The service rejected the supplied credentials.
    #[error("authentication against {server} failed: {reason}")]
    Authentication { server: String, reason: String },

    /// More than one remote entity carries a name that must be unique.
    #[error("{count} {kind} entries share the name {name:?}")]
    AmbiguousEntity {
        kind: &'static str,
        name: String,
        count: usize,
    },

    /// Referenced names with no remote match.
    #[error("{kind} not found: {}", .names.join(", "))]
    NotFound {
        kind: &'static str,
        names: Vec<String>,
    },

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("remote request failed: {0}")]
    RemoteRequest(RemoteError),

    /// An operation needs an id that has not been assigned yet.
    #[error("incomplete reference: {0}")]
    IncompleteReference(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to access {}: {source}", .path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::File {
            path: path.into(),
            source,
        }
    }

    /// Status code of the remote response, if this error came from one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::RemoteRequest(remote) => Some(remote.status),
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

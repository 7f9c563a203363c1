//! Client-side error type.

/// Alias for `Result<T, tether::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client facade.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Fatal transport or protocol failure; the session is closed.
    #[error(transparent)]
    Protocol(#[from] tether_proto::Error),

    /// The agent answered `ok=false`. The session stays usable; the
    /// string is the agent's `error` field, verbatim.
    #[error("{0}")]
    Command(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Protocol(tether_proto::Error::Io(e))
    }
}

impl Error {
    /// True when the session that produced this error is still usable.
    pub fn is_command_failure(&self) -> bool {
        matches!(self, Error::Command(_))
    }
}

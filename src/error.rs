use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("authentication expired, run `plexcli login` again")]
    AuthExpired,

    #[error("no devices on this account provide a media server")]
    NoServers,

    #[error("library section no longer exists on the server")]
    SectionGone,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected response shape: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0} not found; install it or set its path in config.json")]
    ToolMissing(&'static str),

    #[error("{0} exited with {1}")]
    ToolFailed(&'static str, std::process::ExitStatus),

    #[error("timed out waiting for the {0} lock (another instance may hold it)")]
    LockTimeout(&'static str),

    #[error("cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("indexing \"{section}\" on {server}: {source}")]
    Index {
        server: String,
        section: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Transport(format!("JSON parse failure: {err}"))
    }
}

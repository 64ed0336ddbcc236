/// Error type shared by every crate in the workspace.
///
/// Most call sites downgrade these into failed-record entries or loop
/// transitions; only initialization paths let them bubble out.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("sandbox: {0}")]
    Sandbox(String),

    #[error("agent '{agent}' failed: {message}")]
    Agent { agent: String, message: String },

    #[error("git operation failed: {0}")]
    Git(String),

    #[error("artifact store: {0}")]
    Store(String),

    #[error("http request failed: {0}")]
    Http(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("filesystem: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

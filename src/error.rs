use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised by the container/bank/renderer backend.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("malformed container: {0}")]
    MalformedContainer(String),

    #[error("malformed sequence bank: {0}")]
    MalformedBank(String),

    #[error("no such path in container: {0}")]
    NotFound(String),

    #[error("unknown sequence: {0}")]
    UnknownSequence(String),

    #[error("renderer failure: {0}")]
    Renderer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error half of a call response. Crosses the worker boundary, so it is
/// serializable and carries messages rather than source errors.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CommandError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("library error: {0}")]
    Library(String),

    #[error("renderer {requested} was retired (active: {active})")]
    StaleRenderer { requested: u64, active: u64 },

    #[error("handler panicked: {0}")]
    Handler(String),

    #[error("call {0} timed out")]
    Timeout(u64),

    #[error("call {0} was cancelled")]
    Cancelled(u64),

    #[error("worker disconnected")]
    Disconnected,
}

impl From<LibraryError> for CommandError {
    fn from(e: LibraryError) -> Self {
        CommandError::Library(e.to_string())
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        CommandError::InvalidPayload(e.to_string())
    }
}

/// Terminal failure of the one-way pcm/state stream.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum StreamError {
    #[error("renderer failed while streaming: {0}")]
    Renderer(String),

    #[error("worker disconnected")]
    Disconnected,
}

/// Rejected state buffer appends.
#[derive(Debug, Error, PartialEq)]
pub enum BufferError {
    #[error("batch starting at {start:.4}s does not follow buffered time {latest:.4}s")]
    OutOfOrder { start: f64, latest: f64 },

    #[error("batch is not strictly increasing at index {0}")]
    Unordered(usize),
}

/// Failures while rendering a sequence to a WAV file.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("command failed: {0}")]
    Command(#[from] CommandError),

    #[error("stream closed: {0}")]
    Stream(#[from] StreamError),
}

/// Failures that end a visualization run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("command failed: {0}")]
    Command(#[from] CommandError),

    #[error("stream closed: {0}")]
    Stream(#[from] StreamError),

    #[error("display error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CommandResult<T> = Result<T, CommandError>;

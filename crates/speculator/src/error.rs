use crate::speculation::types::ObjectId;
use std::sync::Arc;
use thiserror::Error;

/// A user-level error raised by a speculative computation.
///
/// Shared so that repeated `get()` calls replay the very same error.
pub type UserError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// What a computation observes and propagates with `?`.
#[derive(Error, Debug, Clone)]
pub enum Fault {
    /// The current task was forced to abort; the computation must unwind.
    #[error("speculation aborted")]
    Aborted,

    /// The computation itself failed. Replayed at the point sequential
    /// execution would have reached it.
    #[error("{0}")]
    User(UserError),

    #[error("index {index} out of bounds for {array} of length {len}")]
    IndexOutOfBounds {
        array: ObjectId,
        index: u32,
        len: u32,
    },

    #[error("no object {0} on the heap")]
    DanglingReference(ObjectId),

    /// Internal invariant broken; the whole run terminates.
    #[error("fatal engine error: {0}")]
    Fatal(String),
}

impl Fault {
    pub fn user<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Fault::User(Arc::new(err))
    }

    pub(crate) fn panicked(message: String) -> Self {
        Fault::User(Arc::new(PanicError(message)))
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Fault::Aborted)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Fault::Fatal(_))
    }
}

/// A panic caught inside a speculative task, carried as a user error.
#[derive(Error, Debug)]
#[error("computation panicked: {0}")]
pub struct PanicError(pub String);

/// Errors surfaced to the embedder of the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("failed to start engine thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error("engine is shut down")]
    ShutDown,

    /// The program itself raised an error, exactly as sequential execution would.
    #[error("program failed: {0}")]
    Program(Fault),

    #[error("fatal engine error: {0}")]
    Fatal(String),
}

impl From<Fault> for EngineError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Fatal(msg) => EngineError::Fatal(msg),
            other => EngineError::Program(other),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Malformed input handed to the overspeculation controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("block {block} jumps to missing block {target}")]
    MissingBlock { block: usize, target: usize },

    #[error("method has no blocks")]
    EmptyMethod,

    #[error("fork site {0} is spawned more than once")]
    DuplicateSpawn(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_fault_into_engine_error() {
        let err: EngineError = Fault::Fatal("broken".into()).into();
        assert!(matches!(err, EngineError::Fatal(msg) if msg == "broken"));

        let err: EngineError = Fault::user(Boom).into();
        assert!(matches!(err, EngineError::Program(Fault::User(_))));
        assert_eq!(err.to_string(), "program failed: boom");
    }
}

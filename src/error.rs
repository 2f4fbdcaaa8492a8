use camino::Utf8PathBuf;
use thiserror::Error;

use crate::hash::{Hash, HashError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("couldn't prepare the blob store at '{0}'\n{1}")]
    Root(Utf8PathBuf, #[source] std::io::Error),

    #[error("blob {0} is not present in the store")]
    MissingBlob(Hash),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("reduction entry for {key} is corrupt\n{source}")]
    Corrupt { key: Hash, source: HashError },
}

#[derive(Debug, Error)]
pub enum ThunkError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("couldn't decode thunk\n{0}")]
    Encoding(#[from] serde_json::Error),

    #[error("thunk {0} declares no outputs")]
    NoOutputs(Hash),

    #[error("{0} does not name a thunk")]
    NotAThunk(Hash),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Thunk(#[from] ThunkError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("dependency cycle through {0}")]
    Cycle(Hash),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("couldn't decode message payload\n{0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine '{0}' was dispatched to before init")]
    NotInitialized(String),

    #[error("couldn't reach worker at '{addr}'\n{source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    #[error("malformed engine spec '{0}' (expected 'local=N' or 'remote=HOST:PORT/N')")]
    Spec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("transfer of {key} failed\n{reason}")]
    Transfer { key: Hash, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Anything that can abort a reduction run.
#[derive(Debug, Error)]
pub enum OroshiError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Thunk(#[from] ThunkError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("execution failed: {0}")]
    ExecutionFailed(Hash),

    #[error("no execution engine could execute {0}")]
    NoEngine(Hash),

    #[error("no execution engines are available")]
    NoEnginesConfigured,

    #[error("inconsistent cache entries for {0}")]
    InconsistentCache(Hash),

    #[error("unhandled poller failure, job is not finished")]
    UnhandledPoll,

    #[error("final answer not found for {0}")]
    MissingAnswer(Hash),
}

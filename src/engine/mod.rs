//! Execution engines.
//!
//! An engine is anything that can take an order-one thunk and eventually
//! deliver exactly one success or failure event for it through the event
//! loop. The scheduler treats engines uniformly through [`ExecutionEngine`]
//! and never blocks on them; capacity accounting (`job_count` against
//! `max_jobs`) is the only backpressure mechanism.

mod local;
mod remote;

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

pub use crate::engine::local::LocalEngine;
pub use crate::engine::remote::RemoteEngine;

use crate::cache::ReductionCache;
use crate::error::EngineError;
use crate::hash::Hash;
use crate::poller::EventLoop;
use crate::store::BlobStore;
use crate::thunk::Thunk;

/// Why a job did not produce outputs. Every reason except
/// `ExecutionFailure` is retriable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The thunk ran to completion but exited non-zero or produced
    /// invalid output. Deterministic, so retrying cannot help.
    ExecutionFailure,
    /// The engine could not launch the job.
    InvocationFailure,
    /// An external quota refused the job.
    RateLimit,
    /// The engine could not stage the thunk's inputs.
    FetchDependenciesFailure,
    /// The job produced outputs the engine could not persist.
    UploadOutputFailure,
    /// Engine-internal misbehavior.
    OperationalFailure,
    /// The transport to a remote engine broke.
    SocketFailure,
    /// A local subprocess died abnormally.
    ChildProcessFailure,
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobStatus::ExecutionFailure => "execution failed",
            JobStatus::InvocationFailure => "invocation failed",
            JobStatus::RateLimit => "rate limited",
            JobStatus::FetchDependenciesFailure => "fetching the dependencies failed",
            JobStatus::UploadOutputFailure => "uploading the output failed",
            JobStatus::OperationalFailure => "operational failure",
            JobStatus::SocketFailure => "socket failure",
            JobStatus::ChildProcessFailure => "child process failure",
        };
        f.write_str(text)
    }
}

impl JobStatus {
    pub fn is_fatal(self) -> bool {
        matches!(self, JobStatus::ExecutionFailure)
    }
}

/// The lifecycle contract every worker honors.
///
/// `init` is called exactly once, before any dispatch, and hands the engine
/// its outbox. `force_thunk` must return promptly — real work happens on
/// engine-internal threads — and must eventually be answered by exactly one
/// event carrying the dispatched hash.
pub trait ExecutionEngine: Send {
    /// Display name for the status line and diagnostics.
    fn label(&self) -> &str;

    /// Capacity cap.
    fn max_jobs(&self) -> usize;

    /// Jobs currently in flight.
    fn job_count(&self) -> usize;

    /// Engine-defined admissibility.
    fn can_execute(&self, thunk: &Thunk) -> bool;

    /// Registers the engine against the event loop.
    fn init(&mut self, events: &EventLoop) -> Result<(), EngineError>;

    /// Dispatches one order-one thunk.
    fn force_thunk(&mut self, hash: &Hash, thunk: &Thunk) -> Result<(), EngineError>;
}

/// Configuration-time factory: turns a CLI spec into an engine.
///
/// Accepted forms: `local`, `local=N`, `remote=HOST:PORT/N`.
pub fn from_spec(
    spec: &str,
    store: &BlobStore,
    cache: &ReductionCache,
) -> Result<Box<dyn ExecutionEngine>, EngineError> {
    let (kind, rest) = match spec.split_once('=') {
        Some((kind, rest)) => (kind, Some(rest)),
        None => (spec, None),
    };

    match kind {
        "local" => {
            let jobs = match rest {
                Some(n) => n.parse().map_err(|_| EngineError::Spec(spec.to_string()))?,
                None => std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1),
            };
            Ok(Box::new(LocalEngine::new(
                store.clone(),
                cache.clone(),
                jobs,
            )))
        }
        "remote" => {
            let rest = rest.ok_or_else(|| EngineError::Spec(spec.to_string()))?;
            let (addr, jobs) = rest
                .rsplit_once('/')
                .ok_or_else(|| EngineError::Spec(spec.to_string()))?;
            let jobs = jobs
                .parse()
                .map_err(|_| EngineError::Spec(spec.to_string()))?;
            Ok(Box::new(RemoteEngine::new(addr, cache.clone(), jobs)))
        }
        _ => Err(EngineError::Spec(spec.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8Path;

    #[test]
    fn specs_parse_into_engines() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join("store");
        let store = BlobStore::open(root).unwrap();
        let cache = ReductionCache::new(store.clone());

        let local = from_spec("local=4", &store, &cache).unwrap();
        assert_eq!(local.label(), "local");
        assert_eq!(local.max_jobs(), 4);

        let remote = from_spec("remote=10.0.0.1:9924/16", &store, &cache).unwrap();
        assert_eq!(remote.max_jobs(), 16);

        assert!(from_spec("lambda=4", &store, &cache).is_err());
        assert!(from_spec("local=many", &store, &cache).is_err());
        assert!(from_spec("remote=10.0.0.1:9924", &store, &cache).is_err());
    }
}

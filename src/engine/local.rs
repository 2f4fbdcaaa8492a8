//! The local subprocess engine.
//!
//! Each job gets a scratch directory on the store's filesystem: inputs are
//! staged under their hash names, hash-valued arguments are resolved to
//! those staged paths, the process runs with the scratch directory as its
//! working directory, and declared outputs are collected from files named
//! after their tags.

use std::fs;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crossbeam_channel::Sender;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::debug;

use crate::cache::{ReductionCache, ReductionResult};
use crate::engine::{ExecutionEngine, JobStatus};
use crate::error::EngineError;
use crate::hash::{Hash, ObjectType};
use crate::poller::{EngineEvent, EventLoop};
use crate::store::BlobStore;
use crate::thunk::{Thunk, ThunkOutput};

pub struct LocalEngine {
    store: BlobStore,
    cache: ReductionCache,
    max_jobs: usize,
    jobs: Arc<AtomicUsize>,
    events: Option<Sender<EngineEvent>>,
}

impl LocalEngine {
    pub fn new(store: BlobStore, cache: ReductionCache, max_jobs: usize) -> Self {
        Self {
            store,
            cache,
            max_jobs,
            jobs: Arc::new(AtomicUsize::new(0)),
            events: None,
        }
    }
}

impl ExecutionEngine for LocalEngine {
    fn label(&self) -> &str {
        "local"
    }

    fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    fn job_count(&self) -> usize {
        self.jobs.load(Ordering::SeqCst)
    }

    /// Binary compatibility here means: every executable the thunk needs
    /// is present in the local store.
    fn can_execute(&self, thunk: &Thunk) -> bool {
        thunk.executable_inputs().all(|exe| self.store.contains(exe))
    }

    fn init(&mut self, events: &EventLoop) -> Result<(), EngineError> {
        self.events = Some(events.sender());
        Ok(())
    }

    fn force_thunk(&mut self, hash: &Hash, thunk: &Thunk) -> Result<(), EngineError> {
        let events = self
            .events
            .clone()
            .ok_or_else(|| EngineError::NotInitialized(self.label().to_string()))?;

        self.jobs.fetch_add(1, Ordering::SeqCst);
        debug!(hash = %hash, "dispatching to local subprocess");

        let store = self.store.clone();
        let cache = self.cache.clone();
        let jobs = Arc::clone(&self.jobs);
        let hash = hash.clone();
        let thunk = thunk.clone();

        thread::spawn(move || {
            let event = match run_job(&store, &cache, &hash, &thunk) {
                Ok((outputs, cost)) => EngineEvent::Success {
                    hash,
                    outputs,
                    cost,
                },
                Err(status) => EngineEvent::Failure { hash, status },
            };

            jobs.fetch_sub(1, Ordering::SeqCst);
            let _ = events.send(event);
        });

        Ok(())
    }
}

fn run_job(
    store: &BlobStore,
    cache: &ReductionCache,
    hash: &Hash,
    thunk: &Thunk,
) -> Result<(Vec<ThunkOutput>, f64), JobStatus> {
    let scratch = store
        .scratch_dir()
        .map_err(|_| JobStatus::OperationalFailure)?;
    let workdir = scratch.path();

    // Stage every terminal input under its hash name. Deduplicated, so a
    // twice-listed input is copied once.
    let terminals: Vec<&Hash> = {
        let unique: std::collections::HashSet<&Hash> =
            thunk.inputs.iter().filter(|i| i.is_terminal()).collect();
        unique.into_iter().collect()
    };

    terminals
        .par_iter()
        .map(|&input| {
            let staged = workdir.join(input.as_str());

            match fs::copy(store.blob_path(input), &staged) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(JobStatus::FetchDependenciesFailure);
                }
                Err(_) => return Err(JobStatus::OperationalFailure),
            }

            if input.object_type() == ObjectType::Executable {
                mark_executable(&staged).map_err(|_| JobStatus::OperationalFailure)?;
            }

            Ok(())
        })
        .collect::<Result<Vec<()>, JobStatus>>()?;

    // An argument that names an input becomes the staged path.
    let argv: Vec<String> = thunk
        .args
        .iter()
        .map(|arg| {
            if thunk.inputs.iter().any(|input| input.as_str() == arg) {
                workdir.join(arg).to_string_lossy().into_owned()
            } else {
                arg.clone()
            }
        })
        .collect();

    let (program, rest) = argv.split_first().ok_or(JobStatus::InvocationFailure)?;

    let mut command = Command::new(program);
    command.args(rest).current_dir(workdir);
    for pair in &thunk.envars {
        if let Some((key, value)) = pair.split_once('=') {
            command.env(key, value);
        }
    }

    let output = command
        .output()
        .map_err(|_| JobStatus::InvocationFailure)?;

    match output.status.code() {
        Some(0) => {}
        Some(_) => return Err(JobStatus::ExecutionFailure),
        None => return Err(JobStatus::ChildProcessFailure),
    }

    // Collect, persist and record every declared output.
    let mut outputs = Vec::with_capacity(thunk.outputs.len());

    for tag in &thunk.outputs {
        let path = workdir.join(tag);
        let bytes = fs::read(&path).map_err(|_| JobStatus::ExecutionFailure)?;

        let kind = if is_executable(&path) {
            ObjectType::Executable
        } else {
            ObjectType::Value
        };

        let out_hash = Hash::of_bytes(kind, &bytes);
        store
            .put_blob(&out_hash, &bytes)
            .map_err(|_| JobStatus::UploadOutputFailure)?;

        cache
            .insert(
                &hash.for_output(tag),
                &ReductionResult {
                    hash: out_hash.clone(),
                    order: 0,
                },
            )
            .map_err(|_| JobStatus::UploadOutputFailure)?;

        outputs.push(ThunkOutput {
            hash: out_hash,
            tag: tag.clone(),
        });
    }

    let primary = outputs[0].hash.clone();
    let order = if primary.is_thunk() { 1 } else { 0 };
    cache
        .insert(hash, &ReductionResult { hash: primary, order })
        .map_err(|_| JobStatus::UploadOutputFailure)?;

    Ok((outputs, 0.0))
}

#[cfg(unix)]
fn mark_executable(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn mark_executable(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &std::path::Path) -> bool {
    false
}

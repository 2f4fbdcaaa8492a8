//! The scheduler that drives target thunks down to concrete values.
//!
//! One loop, single-threaded: drain the ready queue (cache hits are
//! finalized inline, misses are dispatched to the first admissible engine
//! with spare capacity), then block on the event loop for completions.
//! When a poll window passes with no progress, every running job is
//! duplicated onto the queue — content addressing makes the race benign,
//! because whichever copy finishes second forces an already-resolved node
//! and is absorbed as a no-op.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cache::ReductionCache;
use crate::engine::ExecutionEngine;
use crate::error::OroshiError;
use crate::graph::DepGraph;
use crate::hash::Hash;
use crate::poller::{EngineEvent, EventLoop, PollOutcome};
use crate::status::{EngineStat, StatusLine, StatusSnapshot};
use crate::storage::{GetRequest, PutRequest, StorageBackend};
use crate::store::BlobStore;
use crate::thunk::{Thunk, ThunkOutput};
use crate::utils::format_bytes;

/// Ceiling for the no-progress backoff window.
const MAX_POLLER_TIMEOUT: Duration = Duration::from_secs(300);

enum ExecState {
    CannotExecute,
    FullCapacity,
    FullFallbackCapacity,
    Executing,
}

pub struct Reductor {
    target_hashes: Vec<Hash>,
    remaining_targets: HashSet<Hash>,
    store: BlobStore,
    cache: ReductionCache,
    dep_graph: DepGraph,
    exec_loop: EventLoop,
    job_queue: VecDeque<Hash>,
    running_jobs: HashSet<Hash>,
    exec_engines: Vec<Box<dyn ExecutionEngine>>,
    fallback_engines: Vec<Box<dyn ExecutionEngine>>,
    storage_backend: Option<Box<dyn StorageBackend>>,
    finished_jobs: usize,
    estimated_cost: f64,
    base_poller_timeout: Option<Duration>,
    poller_timeout: Option<Duration>,
    status: Option<StatusLine>,
}

impl Reductor {
    /// Seeds the dependency graph from the targets, gathers the initial
    /// order-one frontier, and registers every engine with the event loop.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        target_hashes: Vec<Hash>,
        mut exec_engines: Vec<Box<dyn ExecutionEngine>>,
        mut fallback_engines: Vec<Box<dyn ExecutionEngine>>,
        storage_backend: Option<Box<dyn StorageBackend>>,
        store: BlobStore,
        cache: ReductionCache,
        base_poller_timeout: Option<Duration>,
        status_bar: bool,
    ) -> Result<Self, OroshiError> {
        if exec_engines.is_empty() {
            return Err(OroshiError::NoEnginesConfigured);
        }

        let mut dep_graph = DepGraph::new(store.clone());
        let mut frontier = HashSet::new();

        for target in &target_hashes {
            dep_graph.add_thunk(target)?;
            frontier.extend(dep_graph.order_one_dependencies(target));
        }

        let exec_loop = EventLoop::new();
        for engine in exec_engines.iter_mut().chain(fallback_engines.iter_mut()) {
            engine.init(&exec_loop)?;
        }

        Ok(Self {
            remaining_targets: target_hashes.iter().cloned().collect(),
            target_hashes,
            store,
            cache,
            dep_graph,
            exec_loop,
            job_queue: frontier.into_iter().collect(),
            running_jobs: HashSet::new(),
            exec_engines,
            fallback_engines,
            storage_backend,
            finished_jobs: 0,
            estimated_cost: 0.0,
            base_poller_timeout,
            poller_timeout: base_poller_timeout,
            status: status_bar.then(StatusLine::new),
        })
    }

    /// Pre-stages every terminal input into remote storage. Called once,
    /// before [`reduce`](Self::reduce).
    pub fn upload_dependencies(&mut self) -> Result<(), OroshiError> {
        let Some(backend) = self.storage_backend.as_mut() else {
            return Ok(());
        };

        let mut requests = Vec::new();
        let mut total_size = 0;

        let terminals = self
            .dep_graph
            .value_dependencies()
            .into_iter()
            .chain(self.dep_graph.executable_dependencies());

        for dep in terminals {
            if backend.is_available(&dep) {
                continue;
            }
            total_size += dep.size();
            requests.push(PutRequest {
                path: self.store.blob_path(&dep),
                key: dep,
            });
        }

        if requests.is_empty() {
            info!("no files to upload");
            return Ok(());
        }

        let plural = if requests.len() == 1 { "" } else { "s" };
        info!(
            "↗ uploading {} file{plural} ({})",
            requests.len(),
            format_bytes(total_size)
        );

        let started = Instant::now();
        backend.upload(&requests, &mut |request| {
            debug!(key = %request.key, "pre-staged");
        })?;
        info!("upload done ({} ms)", started.elapsed().as_millis());

        Ok(())
    }

    /// Fetches final outputs that are not yet in the local store. Called
    /// once, after [`reduce`](Self::reduce).
    pub fn download_targets(&mut self, hashes: &[Hash]) -> Result<(), OroshiError> {
        let Some(backend) = self.storage_backend.as_mut() else {
            return Ok(());
        };

        let mut requests = Vec::new();
        let mut total_size = 0;

        for hash in hashes {
            if self.store.contains(hash) {
                continue;
            }
            total_size += hash.size();
            requests.push(GetRequest {
                key: hash.clone(),
                path: self.store.blob_path(hash),
            });
        }

        if requests.is_empty() {
            info!("no files to download");
            return Ok(());
        }

        let plural = if requests.len() == 1 { "" } else { "s" };
        info!(
            "↘ downloading output file{plural} ({})",
            format_bytes(total_size)
        );

        let started = Instant::now();
        backend.download(&requests)?;
        info!("download done ({} ms)", started.elapsed().as_millis());

        Ok(())
    }

    /// Runs the scheduling loop to completion and returns the answer hash
    /// for every target, in target order.
    pub fn reduce(&mut self) -> Result<Vec<Hash>, OroshiError> {
        loop {
            while let Some(hash) = self.job_queue.pop_front() {
                // Don't bother executing anything that is in the cache.
                let chased = self.cache.chase(&hash)?;
                if chased != hash {
                    let outputs = self.outputs_from_cache(&hash)?;
                    self.finalize(&hash, &outputs, 0.0)?;
                    continue;
                }

                // A straggler duplicate whose twin already resolved.
                let Some(thunk) = self.dep_graph.get_thunk(&hash) else {
                    continue;
                };
                let thunk = thunk.clone();

                if self.try_dispatch(&hash, &thunk)? {
                    self.running_jobs.insert(hash);
                } else {
                    // Capacity exhausted: preserve order and stop
                    // dispatching until something completes.
                    self.job_queue.push_front(hash);
                    break;
                }
            }

            if self.is_finished() {
                return self.collect_answers();
            }

            self.refresh_status();

            match self.exec_loop.loop_once(self.poller_timeout) {
                PollOutcome::Ready(events) => {
                    self.poller_timeout = self.base_poller_timeout;
                    for event in events {
                        self.handle_event(event)?;
                    }
                }
                PollOutcome::Timeout => self.duplicate_stragglers(),
                PollOutcome::Exit => {
                    if self.is_finished() {
                        return self.collect_answers();
                    }
                    return Err(OroshiError::UnhandledPoll);
                }
            }
        }
    }

    /// Walks primary engines in order; an admissible-but-full engine is
    /// remembered while later engines are tried. Fallbacks are consulted
    /// only when no primary admits the thunk at all.
    fn try_dispatch(&mut self, hash: &Hash, thunk: &Thunk) -> Result<bool, OroshiError> {
        let mut state = ExecState::CannotExecute;

        for engine in &mut self.exec_engines {
            if engine.can_execute(thunk) {
                if engine.job_count() >= engine.max_jobs() {
                    state = ExecState::FullCapacity;
                    continue;
                }
                engine.force_thunk(hash, thunk)?;
                state = ExecState::Executing;
                break;
            }
        }

        if matches!(state, ExecState::CannotExecute) {
            for engine in &mut self.fallback_engines {
                if engine.can_execute(thunk) {
                    if engine.job_count() >= engine.max_jobs() {
                        state = ExecState::FullFallbackCapacity;
                        continue;
                    }
                    engine.force_thunk(hash, thunk)?;
                    state = ExecState::Executing;
                    break;
                }
            }
        }

        match state {
            ExecState::Executing => Ok(true),
            ExecState::FullCapacity | ExecState::FullFallbackCapacity => Ok(false),
            ExecState::CannotExecute => Err(OroshiError::NoEngine(hash.clone())),
        }
    }

    /// Synthesizes the output list of a cached thunk. Every declared tag
    /// must have its own cache entry; a partial record means the cache
    /// promised a reduction it cannot substantiate.
    fn outputs_from_cache(&self, hash: &Hash) -> Result<Vec<ThunkOutput>, OroshiError> {
        let thunk = Thunk::read(&self.store, hash)?;
        let mut outputs = Vec::with_capacity(thunk.outputs.len());

        for tag in &thunk.outputs {
            let result = self
                .cache
                .check(&hash.for_output(tag))?
                .ok_or_else(|| OroshiError::InconsistentCache(hash.clone()))?;
            outputs.push(ThunkOutput {
                hash: result.hash,
                tag: tag.clone(),
            });
        }

        Ok(outputs)
    }

    /// The single completion path, shared by cache hits and engine
    /// successes. Duplicate completions force nothing and count nothing.
    fn finalize(
        &mut self,
        hash: &Hash,
        outputs: &[ThunkOutput],
        cost: f64,
    ) -> Result<(), OroshiError> {
        self.running_jobs.remove(hash);

        let Some(primary) = outputs.first().map(|o| o.hash.clone()) else {
            return Ok(());
        };

        let Some(newly_ready) = self.dep_graph.force(hash, outputs)? else {
            debug!(hash = %hash, "duplicate completion absorbed");
            return Ok(());
        };

        self.estimated_cost += cost;
        self.finished_jobs += 1;
        self.job_queue.extend(newly_ready);

        if primary.is_terminal()
            && let Some(original) = self.dep_graph.original_hash(hash).cloned()
        {
            self.remaining_targets.remove(&original);
        }

        Ok(())
    }

    fn handle_event(&mut self, event: EngineEvent) -> Result<(), OroshiError> {
        match event {
            EngineEvent::Success {
                hash,
                outputs,
                cost,
            } => self.finalize(&hash, &outputs, cost),

            EngineEvent::Failure { hash, status } => {
                if status.is_fatal() {
                    return Err(OroshiError::ExecutionFailed(hash));
                }
                warn!("{status}: {hash}");
                self.running_jobs.remove(&hash);
                self.job_queue.push_back(hash);
                Ok(())
            }

            // loop_once turns Shutdown into Exit before delivery.
            EngineEvent::Shutdown { .. } => Ok(()),
        }
    }

    /// No job finished inside the poll window: put a copy of every running
    /// job back on the queue and widen the window. Any non-timeout poll
    /// resets it to the base.
    fn duplicate_stragglers(&mut self) {
        let Some(base) = self.base_poller_timeout else {
            return;
        };
        let current = self.poller_timeout.unwrap_or(base);

        info!(
            "no responses during last {} ms, duplicating {} job(s)",
            current.as_millis(),
            self.running_jobs.len()
        );

        self.job_queue.extend(self.running_jobs.iter().cloned());
        self.poller_timeout = Some((current * 2).min(MAX_POLLER_TIMEOUT));
    }

    fn is_finished(&self) -> bool {
        self.remaining_targets.is_empty()
            && self.running_jobs.is_empty()
            && self.job_queue.is_empty()
    }

    /// Every target must have a terminal cache entry under its final name.
    fn collect_answers(&mut self) -> Result<Vec<Hash>, OroshiError> {
        if let Some(status) = &self.status {
            status.finish();
        }

        let mut answers = Vec::with_capacity(self.target_hashes.len());

        for target in &self.target_hashes {
            let updated = self
                .dep_graph
                .updated_hash(target)
                .ok_or_else(|| OroshiError::MissingAnswer(target.clone()))?;
            let answer = self
                .cache
                .check(updated)?
                .ok_or_else(|| OroshiError::MissingAnswer(target.clone()))?;
            answers.push(answer.hash);
        }

        Ok(answers)
    }

    fn refresh_status(&mut self) {
        if self.status.is_none() {
            return;
        }

        let engines = self
            .exec_engines
            .iter()
            .chain(self.fallback_engines.iter())
            .map(|engine| EngineStat {
                label: engine.label().to_string(),
                running: engine.job_count(),
                max: engine.max_jobs(),
            })
            .collect();

        let snapshot = StatusSnapshot {
            queued: self.job_queue.len(),
            engines,
            finished: self.finished_jobs,
            remaining: self.dep_graph.size(),
            cost: self.estimated_cost,
        };

        if let Some(status) = &mut self.status {
            status.refresh(snapshot);
        }
    }
}

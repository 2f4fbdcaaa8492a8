//! The remote TCP engine.
//!
//! Talks to one worker process over the length-prefixed wire protocol:
//! `Hey` on connect, `Execute` per dispatch, `Pong` for every `Ping`, and
//! `Put` replies carrying results. The reader thread owns the receive side
//! and converts worker replies into engine events; a broken transport
//! fails every in-flight job with `SocketFailure` and takes the engine out
//! of admission.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::Bytes;
use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::cache::{ReductionCache, ReductionResult};
use crate::engine::{ExecutionEngine, JobStatus};
use crate::error::EngineError;
use crate::hash::Hash;
use crate::poller::{EngineEvent, EventLoop};
use crate::protocol::{ExecuteRequest, Message, MessageParser, OpCode, WorkerReply};
use crate::thunk::{Thunk, ThunkOutput};

pub struct RemoteEngine {
    addr: String,
    label: String,
    cache: ReductionCache,
    max_jobs: usize,
    jobs: Arc<AtomicUsize>,
    in_flight: Arc<Mutex<HashSet<Hash>>>,
    dead: Arc<AtomicBool>,
    events: Option<Sender<EngineEvent>>,
    writer: Option<Arc<Mutex<TcpStream>>>,
}

impl RemoteEngine {
    pub fn new(addr: impl Into<String>, cache: ReductionCache, max_jobs: usize) -> Self {
        let addr = addr.into();
        Self {
            label: format!("remote[{addr}]"),
            addr,
            cache,
            max_jobs,
            jobs: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            dead: Arc::new(AtomicBool::new(false)),
            events: None,
            writer: None,
        }
    }
}

impl ExecutionEngine for RemoteEngine {
    fn label(&self) -> &str {
        &self.label
    }

    fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    fn job_count(&self) -> usize {
        self.jobs.load(Ordering::SeqCst)
    }

    fn can_execute(&self, _thunk: &Thunk) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    fn init(&mut self, events: &EventLoop) -> Result<(), EngineError> {
        let stream = TcpStream::connect(&self.addr).map_err(|source| EngineError::Connect {
            addr: self.addr.clone(),
            source,
        })?;
        stream.set_nodelay(true).ok();

        let reader = stream.try_clone()?;
        let writer = Arc::new(Mutex::new(stream));

        writer
            .lock()
            .unwrap()
            .write_all(&Message::new(OpCode::Hey, Bytes::from_static(b"oroshi")).encode())?;

        let sender = events.sender();
        thread::spawn({
            let writer = Arc::clone(&writer);
            let cache = self.cache.clone();
            let jobs = Arc::clone(&self.jobs);
            let in_flight = Arc::clone(&self.in_flight);
            let dead = Arc::clone(&self.dead);
            let label = self.label.clone();
            let sender = sender.clone();
            move || read_worker(reader, writer, cache, jobs, in_flight, dead, label, sender)
        });

        self.events = Some(sender);
        self.writer = Some(writer);
        Ok(())
    }

    fn force_thunk(&mut self, hash: &Hash, thunk: &Thunk) -> Result<(), EngineError> {
        let events = self
            .events
            .clone()
            .ok_or_else(|| EngineError::NotInitialized(self.label.clone()))?;
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| EngineError::NotInitialized(self.label.clone()))?;

        let request = ExecuteRequest {
            hash: hash.clone(),
            thunk: thunk.clone(),
        };
        let message = Message::json(OpCode::Execute, &request)
            .map_err(|e| EngineError::Io(std::io::Error::other(e.to_string())))?;

        self.jobs.fetch_add(1, Ordering::SeqCst);
        self.in_flight.lock().unwrap().insert(hash.clone());
        debug!(hash = %hash, worker = %self.addr, "dispatching to remote worker");

        if writer.lock().unwrap().write_all(&message.encode()).is_err() {
            // Retriable from the scheduler's point of view.
            if self.in_flight.lock().unwrap().remove(hash) {
                self.jobs.fetch_sub(1, Ordering::SeqCst);
            }
            let _ = events.send(EngineEvent::Failure {
                hash: hash.clone(),
                status: JobStatus::SocketFailure,
            });
        }

        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn read_worker(
    mut stream: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    cache: ReductionCache,
    jobs: Arc<AtomicUsize>,
    in_flight: Arc<Mutex<HashSet<Hash>>>,
    dead: Arc<AtomicBool>,
    label: String,
    events: Sender<EngineEvent>,
) {
    let mut parser = MessageParser::default();
    let mut buffer = [0u8; 16 * 1024];

    'read: loop {
        let n = match stream.read(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        if parser.parse(&buffer[..n]).is_err() {
            warn!("{label}: worker sent a malformed message");
            break;
        }

        while let Some(message) = parser.pop() {
            match message.opcode() {
                OpCode::Ping => {
                    let pong = Message::new(OpCode::Pong, Bytes::new()).encode();
                    if writer.lock().unwrap().write_all(&pong).is_err() {
                        break 'read;
                    }
                }
                OpCode::Put => {
                    let reply = match message.decode_payload::<WorkerReply>() {
                        Ok(reply) => reply,
                        Err(_) => {
                            warn!("{label}: worker sent an undecodable reply");
                            break 'read;
                        }
                    };
                    settle(&cache, &jobs, &in_flight, &events, reply);
                }
                _ => {}
            }
        }
    }

    // The transport is gone. Everything still in flight is failed exactly
    // once, and the engine stops admitting new work.
    dead.store(true, Ordering::SeqCst);
    let stranded: Vec<Hash> = in_flight.lock().unwrap().drain().collect();
    for hash in stranded {
        jobs.fetch_sub(1, Ordering::SeqCst);
        let _ = events.send(EngineEvent::Failure {
            hash,
            status: JobStatus::SocketFailure,
        });
    }
}

fn settle(
    cache: &ReductionCache,
    jobs: &AtomicUsize,
    in_flight: &Mutex<HashSet<Hash>>,
    events: &Sender<EngineEvent>,
    reply: WorkerReply,
) {
    match reply {
        WorkerReply::Done {
            hash,
            outputs,
            cost,
        } => {
            if !in_flight.lock().unwrap().remove(&hash) {
                return;
            }
            jobs.fetch_sub(1, Ordering::SeqCst);

            let event = match record(cache, &hash, &outputs) {
                Ok(()) => EngineEvent::Success {
                    hash,
                    outputs,
                    cost,
                },
                Err(status) => EngineEvent::Failure { hash, status },
            };
            let _ = events.send(event);
        }
        WorkerReply::Failed { hash, status } => {
            if !in_flight.lock().unwrap().remove(&hash) {
                return;
            }
            jobs.fetch_sub(1, Ordering::SeqCst);
            let _ = events.send(EngineEvent::Failure { hash, status });
        }
    }
}

/// Remote results must be visible to cache chasing like local ones.
fn record(
    cache: &ReductionCache,
    hash: &Hash,
    outputs: &[ThunkOutput],
) -> Result<(), JobStatus> {
    let primary = outputs.first().ok_or(JobStatus::OperationalFailure)?;

    for output in outputs {
        cache
            .insert(
                &hash.for_output(&output.tag),
                &ReductionResult {
                    hash: output.hash.clone(),
                    order: 0,
                },
            )
            .map_err(|_| JobStatus::UploadOutputFailure)?;
    }

    let order = if primary.hash.is_thunk() { 1 } else { 0 };
    cache
        .insert(
            hash,
            &ReductionResult {
                hash: primary.hash.clone(),
                order,
            },
        )
        .map_err(|_| JobStatus::UploadOutputFailure)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ObjectType;
    use crate::poller::PollOutcome;
    use camino::Utf8Path;
    use std::net::TcpListener;
    use std::time::Duration;

    fn cache() -> (tempfile::TempDir, ReductionCache) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap().join("store");
        let store = crate::store::BlobStore::open(root).unwrap();
        (dir, ReductionCache::new(store))
    }

    fn sample_thunk() -> Thunk {
        Thunk {
            args: vec!["run".into()],
            envars: vec![],
            inputs: vec![],
            outputs: vec!["out".into()],
        }
    }

    /// A scripted worker: expects Hey then Execute, replies Put(Done).
    fn scripted_worker(listener: TcpListener, result: Hash) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut parser = MessageParser::default();
            let mut buffer = [0u8; 4096];

            loop {
                let n = socket.read(&mut buffer).unwrap();
                parser.parse(&buffer[..n]).unwrap();

                while let Some(message) = parser.pop() {
                    match message.opcode() {
                        OpCode::Hey => {}
                        OpCode::Execute => {
                            let request: ExecuteRequest = message.decode_payload().unwrap();
                            let reply = WorkerReply::Done {
                                hash: request.hash,
                                outputs: vec![ThunkOutput {
                                    hash: result.clone(),
                                    tag: "out".into(),
                                }],
                                cost: 0.25,
                            };
                            let framed = Message::json(OpCode::Put, &reply).unwrap();
                            socket.write_all(&framed.encode()).unwrap();
                            return;
                        }
                        other => panic!("worker got unexpected {other:?}"),
                    }
                }
            }
        })
    }

    #[test]
    fn dispatch_round_trips_through_a_worker() {
        let (_dir, cache) = cache();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let result = Hash::of_bytes(ObjectType::Value, b"remote result");
        let worker = scripted_worker(listener, result.clone());

        let mut engine = RemoteEngine::new(addr.to_string(), cache.clone(), 8);
        let events = EventLoop::new();
        engine.init(&events).unwrap();

        let thunk = sample_thunk();
        let hash = thunk.hash().unwrap();
        engine.force_thunk(&hash, &thunk).unwrap();
        assert_eq!(engine.job_count(), 1);

        match events.loop_once(Some(Duration::from_secs(10))) {
            PollOutcome::Ready(batch) => match &batch[0] {
                EngineEvent::Success {
                    hash: done,
                    outputs,
                    cost,
                } => {
                    assert_eq!(done, &hash);
                    assert_eq!(outputs[0].hash, result);
                    assert_eq!(*cost, 0.25);
                }
                other => panic!("unexpected event: {other:?}"),
            },
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert_eq!(engine.job_count(), 0);
        assert_eq!(cache.check(&hash).unwrap().unwrap().hash, result);
        assert!(cache.check(&hash.for_output("out")).unwrap().is_some());

        worker.join().unwrap();
    }

    #[test]
    fn transport_death_strands_jobs_as_socket_failures() {
        let (_dir, cache) = cache();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Accept, wait for the dispatch to arrive, then hang up without
        // answering it.
        let worker = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut parser = MessageParser::default();
            let mut buffer = [0u8; 4096];

            loop {
                let n = socket.read(&mut buffer).unwrap();
                parser.parse(&buffer[..n]).unwrap();
                while let Some(message) = parser.pop() {
                    if message.opcode() == OpCode::Execute {
                        return;
                    }
                }
            }
        });

        let mut engine = RemoteEngine::new(addr.to_string(), cache, 8);
        let events = EventLoop::new();
        engine.init(&events).unwrap();

        let thunk = sample_thunk();
        let hash = thunk.hash().unwrap();
        engine.force_thunk(&hash, &thunk).unwrap();
        worker.join().unwrap();

        match events.loop_once(Some(Duration::from_secs(10))) {
            PollOutcome::Ready(batch) => match &batch[0] {
                EngineEvent::Failure { hash: failed, status } => {
                    assert_eq!(failed, &hash);
                    assert_eq!(*status, JobStatus::SocketFailure);
                }
                other => panic!("unexpected event: {other:?}"),
            },
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert_eq!(engine.job_count(), 0);
        assert!(!engine.can_execute(&thunk));
    }
}

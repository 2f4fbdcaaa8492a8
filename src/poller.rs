//! The event loop the scheduler blocks on.
//!
//! Engines never call back into scheduler state. Instead they deliver
//! [`EngineEvent`] records into this loop's channel from whatever thread
//! their I/O runs on, and the scheduler consumes them single-threaded from
//! [`EventLoop::loop_once`]. The dependency is strictly
//! engine → outbox → scheduler, which keeps ownership acyclic.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::warn;

use crate::engine::JobStatus;
use crate::hash::Hash;
use crate::thunk::ThunkOutput;

/// One completed unit of engine work, or a request to stop the loop.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Success {
        hash: Hash,
        outputs: Vec<ThunkOutput>,
        cost: f64,
    },
    Failure {
        hash: Hash,
        status: JobStatus,
    },
    /// An engine hit a condition it cannot continue from.
    Shutdown {
        reason: String,
    },
}

/// What one poll tick observed.
#[derive(Debug)]
pub enum PollOutcome {
    /// At least one event arrived; the batch holds everything that was
    /// pending so handlers run before the next scheduling step.
    Ready(Vec<EngineEvent>),
    /// The timeout elapsed with no progress.
    Timeout,
    /// A handler asked to stop the loop.
    Exit,
}

pub struct EventLoop {
    tx: Sender<EngineEvent>,
    rx: Receiver<EngineEvent>,
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// The outbox handed to engines at `init`.
    pub fn sender(&self) -> Sender<EngineEvent> {
        self.tx.clone()
    }

    /// Blocks until an event arrives, the timeout elapses, or the loop is
    /// asked to exit. `None` blocks indefinitely.
    pub fn loop_once(&self, timeout: Option<Duration>) -> PollOutcome {
        let first = match timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => return PollOutcome::Timeout,
                Err(RecvTimeoutError::Disconnected) => return PollOutcome::Exit,
            },
            None => match self.rx.recv() {
                Ok(event) => event,
                Err(_) => return PollOutcome::Exit,
            },
        };

        let mut events = vec![first];
        events.extend(self.rx.try_iter());

        for event in &events {
            if let EngineEvent::Shutdown { reason } = event {
                warn!("event loop asked to exit: {reason}");
                return PollOutcome::Exit;
            }
        }

        PollOutcome::Ready(events)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ObjectType;

    #[test]
    fn ready_drains_every_pending_event() {
        let events = EventLoop::new();
        let tx = events.sender();

        for i in 0..3u8 {
            tx.send(EngineEvent::Failure {
                hash: Hash::of_bytes(ObjectType::Thunk, [i]),
                status: JobStatus::RateLimit,
            })
            .unwrap();
        }

        match events.loop_once(Some(Duration::from_millis(100))) {
            PollOutcome::Ready(batch) => assert_eq!(batch.len(), 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn timeout_elapses_without_progress() {
        let events = EventLoop::new();
        assert!(matches!(
            events.loop_once(Some(Duration::from_millis(10))),
            PollOutcome::Timeout
        ));
    }

    #[test]
    fn shutdown_turns_into_exit() {
        let events = EventLoop::new();
        events
            .sender()
            .send(EngineEvent::Shutdown {
                reason: "worker gone".into(),
            })
            .unwrap();

        assert!(matches!(
            events.loop_once(Some(Duration::from_millis(100))),
            PollOutcome::Exit
        ));
    }
}

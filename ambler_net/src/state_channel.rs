// MVISP state reporting: client-side batching and server-side sinks.
//
// Client side, `StateReporter` holds the session's `StateRecord` and a
// bounded queue of `StateChangeEvent`s. Events are validated on entry
// (agent, state index, and time all in range), so nothing the server would
// reject ever reaches the wire. `push` hands back a full batch once the
// queue reaches capacity; `drain` empties it on demand. The reporter does no
// I/O; `MobilityClient` sends the batches it returns.
//
// Server side, accepted events are applied in arrival order to a
// `StateSink`. Two sinks are provided: `StateLog` keeps every applied event
// in memory (tests, embedding), and `TracingStateSink` logs each event.

use std::mem;
use std::sync::{Mutex, PoisonError};

use ambler_protocol::{Result, SessionParameters, StateChangeEvent, StateRecord};
use serde::Serialize;
use tracing::info;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct StateReporter {
    record: StateRecord,
    params: SessionParameters,
    capacity: usize,
    queue: Vec<StateChangeEvent>,
}

impl StateReporter {
    /// A capacity of 0 is treated as 1 (every event is sent on its own).
    pub fn new(record: StateRecord, params: SessionParameters, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            record,
            params,
            capacity,
            queue: Vec::with_capacity(capacity),
        }
    }

    pub fn record(&self) -> &StateRecord {
        &self.record
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Validate and queue an event. Returns the batch to send if the queue
    /// is now full.
    pub fn push(&mut self, event: StateChangeEvent) -> Result<Option<Vec<StateChangeEvent>>> {
        self.record.validate(&event, &self.params)?;
        self.queue.push(event);
        if self.queue.len() >= self.capacity {
            Ok(self.drain())
        } else {
            Ok(None)
        }
    }

    /// Take every queued event, or `None` if the queue is empty.
    pub fn drain(&mut self) -> Option<Vec<StateChangeEvent>> {
        if self.queue.is_empty() {
            return None;
        }
        Some(mem::replace(
            &mut self.queue,
            Vec::with_capacity(self.capacity),
        ))
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Receives validated state changes, in the order the client sent them.
pub trait StateSink: Send + Sync {
    fn apply(&self, event: &StateChangeEvent, record: &StateRecord);
}

/// One event as recorded by `StateLog`, with its state name resolved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AppliedState {
    pub event: StateChangeEvent,
    pub state: String,
}

/// Keeps every applied event in memory.
#[derive(Debug, Default)]
pub struct StateLog {
    entries: Mutex<Vec<AppliedState>>,
}

impl StateLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AppliedState> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StateSink for StateLog {
    fn apply(&self, event: &StateChangeEvent, record: &StateRecord) {
        let state = record.name(event.state_index).unwrap_or_default().to_owned();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AppliedState {
                event: *event,
                state,
            });
    }
}

/// Logs each event at `info`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingStateSink;

impl StateSink for TracingStateSink {
    fn apply(&self, event: &StateChangeEvent, record: &StateRecord) {
        info!(
            agent = %event.agent,
            time = %event.time,
            state = record.name(event.state_index).unwrap_or_default(),
            "state change"
        );
    }
}

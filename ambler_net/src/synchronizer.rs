// Time-synchronized view across all agents.
//
// The `Synchronizer` merges the per-agent command sequences of a
// `CommandBuffer` into one global timeline. It keeps a "synchronized
// instant" and, for every agent, a current command that covers it. Between
// the instant and the earliest current `end_time` (the "horizon") no agent
// changes command, so every agent's movement over that slice is one straight
// line; `intersect_command` returns exactly that slice.
//
// `advance_oldest` moves the instant to the horizon and advances every agent
// whose command ends there. It is a k-way merge over a min-heap keyed by
// `(end_time, agent)`: all entries sharing the minimum `end_time` are popped
// together, their refills are fetched in one LocationRequest, and their new
// commands pushed back. Agents whose final (time-limit) command is current
// are no longer in the heap; an empty heap means nothing is left to advance.
//
// **Determinism.** Ties are broken by agent ID, so the order of returned
// agents and of the batched request is stable.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use ambler_protocol::{AgentId, Command, Result, Time};

use crate::buffer::CommandBuffer;
use crate::client::WaypointSource;

/// Heap entry: when an agent's current command ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Boundary {
    end_time: Time,
    agent: AgentId,
}

// BinaryHeap is a max-heap; reverse so the earliest boundary pops first.
impl Ord for Boundary {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .end_time
            .cmp(&self.end_time)
            .then_with(|| other.agent.cmp(&self.agent))
    }
}

impl PartialOrd for Boundary {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Synchronizer<S: WaypointSource> {
    buffer: CommandBuffer<S>,
    heap: BinaryHeap<Boundary>,
    now: Time,
}

impl<S: WaypointSource> Synchronizer<S> {
    /// Take over `buffer` and load every agent's first command, fetching
    /// them all in one request.
    pub fn new(mut buffer: CommandBuffer<S>) -> Result<Self> {
        let agents: Vec<AgentId> = buffer.params().agents().collect();
        buffer.prefetch(&agents)?;
        let mut heap = BinaryHeap::with_capacity(agents.len());
        for agent in agents {
            let cmd = buffer.advance(agent)?;
            if buffer.has_more(agent) {
                heap.push(Boundary {
                    end_time: cmd.end_time,
                    agent,
                });
            }
        }
        Ok(Self {
            buffer,
            heap,
            now: Time::ZERO,
        })
    }

    /// The synchronized instant.
    pub fn current_time(&self) -> Time {
        self.now
    }

    /// Earliest end of any current command. Once every agent is on its final
    /// command that is the time limit.
    pub fn horizon(&self) -> Time {
        self.heap
            .peek()
            .map_or(self.buffer.params().time_limit(), |b| b.end_time)
    }

    /// True while at least one agent has not reached its final command.
    pub fn has_any_more(&self) -> bool {
        !self.heap.is_empty()
    }

    /// `agent`'s movement over `[current_time, horizon]`. `None` for an
    /// agent outside the session.
    pub fn intersect_command(&self, agent: AgentId) -> Option<Command> {
        let cmd = self.buffer.last_returned(agent)?;
        Some(cmd.clip(self.now, self.horizon()))
    }

    /// Advance every agent whose current command ends at the horizon and
    /// move the synchronized instant there. Returns the advanced agents in
    /// ID order; empty once nothing is left to advance.
    pub fn advance_oldest(&mut self) -> Result<Vec<AgentId>> {
        let Some(first) = self.heap.pop() else {
            return Ok(Vec::new());
        };
        let mut tied = vec![first.agent];
        while let Some(next) = self.heap.peek() {
            if next.end_time != first.end_time {
                break;
            }
            tied.push(next.agent);
            self.heap.pop();
        }
        self.now = first.end_time;

        self.buffer.prefetch(&tied)?;
        for &agent in &tied {
            let cmd = self.buffer.advance(agent)?;
            if self.buffer.has_more(agent) {
                self.heap.push(Boundary {
                    end_time: cmd.end_time,
                    agent,
                });
            }
        }
        Ok(tied)
    }

    pub fn buffer(&self) -> &CommandBuffer<S> {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut CommandBuffer<S> {
        &mut self.buffer
    }

    pub fn into_buffer(self) -> CommandBuffer<S> {
        self.buffer
    }
}

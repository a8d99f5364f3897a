// Per-agent command buffering on top of the command stream.
//
// `CommandBuffer` turns the stream of waypoints the server sends for each
// agent into a sequence of `Command`s (consecutive waypoint pairs) and hands
// them out one at a time. It owns its `WaypointSource` (normally the
// `MobilityClient`, and with it the connection) and an arena of per-agent
// queues indexed by agent ID.
//
// Per agent the buffer keeps:
// - `anchor`: the waypoint that starts the next command (the end of the last
//   one handed out), or `None` before the first waypoint was received.
// - `queue`: waypoints received but not yet used as a command end.
// - `current` / `peeked`: the last command returned by `advance`, and the
//   first command fetched early by `current` before any `advance`.
//
// Fetching: a request is issued only when the queue cannot supply the next
// command. It asks for `prefetch_depth` waypoints per agent at once (more if
// the first command still needs its anchor). Once an agent's time-limit
// waypoint has been received, no further request names that agent; any extra
// copies of it in the same batch (the server replays the final reply) are
// dropped.

use std::collections::{HashSet, VecDeque};

use ambler_protocol::{AgentId, Command, ProtocolError, Result, SessionParameters, Waypoint};

use crate::client::WaypointSource;

#[derive(Debug, Default)]
struct AgentQueue {
    anchor: Option<Waypoint>,
    queue: VecDeque<Waypoint>,
    received_final: bool,
    peeked: Option<Command>,
    current: Option<Command>,
    returned_final: bool,
}

impl AgentQueue {
    /// Waypoints still missing before the next command can be formed.
    fn shortfall(&self) -> usize {
        if self.received_final {
            return 0;
        }
        let needed = usize::from(self.anchor.is_none()) + 1;
        needed.saturating_sub(self.queue.len())
    }
}

pub struct CommandBuffer<S: WaypointSource> {
    source: S,
    params: SessionParameters,
    prefetch_depth: usize,
    agents: Vec<AgentQueue>,
}

impl<S: WaypointSource> CommandBuffer<S> {
    /// A `prefetch_depth` of 0 is treated as 1.
    pub fn new(source: S, prefetch_depth: u32) -> Self {
        let params = source.params();
        let agents = params.agents().map(|_| AgentQueue::default()).collect();
        Self {
            source,
            params,
            prefetch_depth: (prefetch_depth as usize).max(1),
            agents,
        }
    }

    pub fn params(&self) -> SessionParameters {
        self.params
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Direct access to the source, e.g. to report state changes over the
    /// same connection.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    /// False once the agent's time-limit command has been returned by
    /// `advance`.
    pub fn has_more(&self, agent: AgentId) -> bool {
        self.agents
            .get(agent.index())
            .is_some_and(|q| !q.returned_final)
    }

    /// The next command of `agent`. After the final command, returns the
    /// final command again.
    pub fn advance(&mut self, agent: AgentId) -> Result<Command> {
        let i = self.index(agent)?;
        if self.agents[i].returned_final {
            if let Some(cmd) = self.agents[i].current {
                return Ok(cmd);
            }
        }
        let cmd = match self.agents[i].peeked.take() {
            Some(cmd) => cmd,
            None => self.next_command(agent)?,
        };
        let q = &mut self.agents[i];
        q.current = Some(cmd);
        if cmd.end_time == self.params.time_limit() {
            q.returned_final = true;
        }
        Ok(cmd)
    }

    /// The last command returned by `advance`. Before the first `advance`
    /// this is the agent's time-0 command, which is fetched if needed but
    /// still returned by the next `advance`.
    pub fn current(&mut self, agent: AgentId) -> Result<Command> {
        let i = self.index(agent)?;
        if let Some(cmd) = self.agents[i].current.or(self.agents[i].peeked) {
            return Ok(cmd);
        }
        let cmd = self.next_command(agent)?;
        self.agents[i].peeked = Some(cmd);
        Ok(cmd)
    }

    /// The last command returned by `advance`, without fetching.
    pub fn last_returned(&self, agent: AgentId) -> Option<Command> {
        self.agents.get(agent.index()).and_then(|q| q.current)
    }

    /// Make sure each of `agents` can produce its next command without a
    /// further round trip, using a single request for all of them.
    pub fn prefetch(&mut self, agents: &[AgentId]) -> Result<()> {
        let mut request = Vec::new();
        let mut queued = HashSet::new();
        for &agent in agents {
            let i = self.index(agent)?;
            let q = &self.agents[i];
            if q.shortfall() == 0 || !queued.insert(agent) {
                continue;
            }
            let count = q.shortfall().max(self.prefetch_depth);
            request.extend(std::iter::repeat_n(agent, count));
        }
        if request.is_empty() {
            return Ok(());
        }
        let replies = self.source.fetch(&request)?;
        if replies.len() != request.len() {
            return Err(ProtocolError::ProtocolViolation(format!(
                "{} replies for {} requests",
                replies.len(),
                request.len()
            )));
        }
        let limit = self.params.time_limit();
        for (agent, reply) in request.into_iter().zip(replies) {
            let q = &mut self.agents[agent.index()];
            if q.received_final {
                continue;
            }
            q.received_final = reply.time == limit;
            q.queue.push_back(reply);
        }
        Ok(())
    }

    fn next_command(&mut self, agent: AgentId) -> Result<Command> {
        let i = self.index(agent)?;
        if self.agents[i].shortfall() > 0 {
            self.prefetch(&[agent])?;
        }
        let q = &mut self.agents[i];
        let anchor = match q.anchor {
            Some(anchor) => anchor,
            None => {
                let first = q.queue.pop_front().ok_or_else(|| starved(agent))?;
                q.anchor = Some(first);
                first
            }
        };
        if anchor.time == self.params.time_limit() {
            // Only reachable in a zero-length session: the single waypoint
            // is both start and end.
            return Ok(Command::at(&anchor));
        }
        let next = q.queue.pop_front().ok_or_else(|| starved(agent))?;
        q.anchor = Some(next);
        Ok(Command::between(&anchor, &next))
    }

    fn index(&self, agent: AgentId) -> Result<usize> {
        if self.params.contains(agent) {
            Ok(agent.index())
        } else {
            Err(ProtocolError::ProtocolViolation(format!(
                "agent {agent} outside [0, {})",
                self.params.num_agents()
            )))
        }
    }
}

fn starved(agent: AgentId) -> ProtocolError {
    ProtocolError::ProtocolViolation(format!("no waypoint available for agent {agent}"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ambler_protocol::{Coordinate, Time};
    use std::collections::BTreeMap;

    /// In-memory source replaying per-agent waypoint lists the way the
    /// server does: the last waypoint repeats forever.
    pub(crate) struct ScriptSource {
        pub params: SessionParameters,
        pub scripts: BTreeMap<AgentId, Vec<Waypoint>>,
        pub served: BTreeMap<AgentId, usize>,
        pub requests: Vec<Vec<AgentId>>,
    }

    impl ScriptSource {
        pub(crate) fn new(limit: u32, scripts: Vec<Vec<(u32, u32)>>) -> Self {
            let params = SessionParameters::new(scripts.len() as u32, Time(limit), 0).unwrap();
            let scripts = scripts
                .into_iter()
                .enumerate()
                .map(|(i, points)| {
                    let points = points
                        .into_iter()
                        .map(|(t, x)| Waypoint {
                            time: Time(t),
                            pos: Coordinate::flat(x, 0),
                            present: true,
                        })
                        .collect();
                    (AgentId(i as u32), points)
                })
                .collect();
            Self {
                params,
                scripts,
                served: BTreeMap::new(),
                requests: Vec::new(),
            }
        }
    }

    impl WaypointSource for ScriptSource {
        fn params(&self) -> SessionParameters {
            self.params
        }

        fn fetch(&mut self, agents: &[AgentId]) -> Result<Vec<Waypoint>> {
            self.requests.push(agents.to_vec());
            Ok(agents
                .iter()
                .map(|agent| {
                    let script = &self.scripts[agent];
                    let n = self.served.entry(*agent).or_insert(0);
                    let point = script[(*n).min(script.len() - 1)];
                    *n += 1;
                    point
                })
                .collect())
        }
    }

    fn buffer(depth: u32) -> CommandBuffer<ScriptSource> {
        let source = ScriptSource::new(
            5000,
            vec![
                vec![(0, 0), (1000, 10), (2500, 20), (5000, 30)],
                vec![(0, 100), (5000, 100)],
            ],
        );
        CommandBuffer::new(source, depth)
    }

    #[test]
    fn advance_walks_consecutive_waypoints() {
        let mut b = buffer(1);
        let a = AgentId(0);
        let c1 = b.advance(a).unwrap();
        assert_eq!((c1.start_time, c1.end_time), (Time(0), Time(1000)));
        assert_eq!(c1.end_pos, Coordinate::flat(10, 0));
        let c2 = b.advance(a).unwrap();
        assert_eq!(c2.start_time, c1.end_time);
        assert_eq!(c2.start_pos, c1.end_pos);
        b.advance(a).unwrap();
        assert!(!b.has_more(a));
    }

    #[test]
    fn advance_after_final_repeats_it() {
        let mut b = buffer(4);
        let a = AgentId(1);
        let last = b.advance(a).unwrap();
        assert_eq!(last.end_time, Time(5000));
        assert!(!b.has_more(a));
        assert_eq!(b.advance(a).unwrap(), last);
        assert_eq!(b.current(a).unwrap(), last);
    }

    #[test]
    fn prefetch_depth_batches_requests() {
        let mut b = buffer(4);
        let a = AgentId(0);
        for _ in 0..3 {
            b.advance(a).unwrap();
        }
        // One request of four covers all four waypoints.
        assert_eq!(b.source().requests, vec![vec![a; 4]]);
    }

    #[test]
    fn no_request_after_final_received() {
        let mut b = buffer(8);
        let a = AgentId(1);
        b.advance(a).unwrap();
        b.advance(a).unwrap();
        b.advance(a).unwrap();
        assert_eq!(b.source().requests.len(), 1);
    }

    #[test]
    fn depth_one_fetches_as_needed() {
        let mut b = buffer(1);
        let a = AgentId(0);
        b.advance(a).unwrap();
        // The first command needs two waypoints even at depth 1.
        assert_eq!(b.source().requests, vec![vec![a, a]]);
        b.advance(a).unwrap();
        assert_eq!(b.source().requests.len(), 2);
    }

    #[test]
    fn current_before_advance_peeks_first_command() {
        let mut b = buffer(2);
        let a = AgentId(0);
        let peeked = b.current(a).unwrap();
        assert_eq!(peeked.start_time, Time(0));
        assert!(b.last_returned(a).is_none());
        assert_eq!(b.advance(a).unwrap(), peeked);
        assert_eq!(b.current(a).unwrap(), peeked);
        assert_ne!(b.advance(a).unwrap(), peeked);
    }

    #[test]
    fn prefetch_combines_agents() {
        let mut b = buffer(2);
        b.prefetch(&[AgentId(0), AgentId(1), AgentId(0)]).unwrap();
        assert_eq!(
            b.source().requests,
            vec![vec![AgentId(0), AgentId(0), AgentId(1), AgentId(1)]]
        );
        b.advance(AgentId(0)).unwrap();
        b.advance(AgentId(1)).unwrap();
        assert_eq!(b.source().requests.len(), 1);
    }

    #[test]
    fn prefetch_of_many_agents_names_each_once() {
        let n = 10_000;
        let source = ScriptSource::new(100, vec![vec![(0, 0), (50, 1), (100, 2)]; n]);
        let mut b = CommandBuffer::new(source, 2);
        let mut agents: Vec<AgentId> = (0..n as u32).map(AgentId).collect();
        agents.extend((0..n as u32).rev().map(AgentId));
        b.prefetch(&agents).unwrap();
        let requests = &b.source().requests;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].len(), 2 * n);
        assert_eq!(&requests[0][..4], &[AgentId(0), AgentId(0), AgentId(1), AgentId(1)]);
    }

    #[test]
    fn zero_time_limit_yields_single_command() {
        let source = ScriptSource::new(0, vec![vec![(0, 7)]]);
        let mut b = CommandBuffer::new(source, 3);
        let cmd = b.advance(AgentId(0)).unwrap();
        assert_eq!(cmd.start_time, Time(0));
        assert_eq!(cmd.end_time, Time(0));
        assert_eq!(cmd.start_pos, cmd.end_pos);
        assert!(!b.has_more(AgentId(0)));
    }

    #[test]
    fn unknown_agent_is_rejected() {
        let mut b = buffer(1);
        assert!(b.advance(AgentId(2)).is_err());
        assert!(!b.has_more(AgentId(2)));
    }
}

// Client side of a connection: negotiation and the command stream.
//
// `MobilityClient::connect` performs, on the calling thread:
//   1. TCP connect and socket timeouts.
//   2. The handshake (`Role::Client`, the configured versions and variants).
//   3. For MVISP, the state-list exchange.
//   4. Session negotiation.
// and returns a client in the update phase, which owns the stream.
//
// `request_locations` sends LocationRequests and reads exactly one reply per
// requested ID, attributing replies to IDs in request order. Long ID lists
// are split into requests of at most `max_request_entries` IDs, since the
// server drops clients that exceed its per-message limit. Each reply is
// checked against what the client already saw for that agent: the first
// reply must be at time 0, later ones strictly increase up to the time limit,
// and after the limit only an identical repeat of the final reply is
// accepted. Any other reply is a `ProtocolViolation`.
//
// Errors that happen on the wire end the session: the client shuts the
// socket down and every later call fails with `ConnectionLost`. Arguments
// rejected before anything is sent (an agent outside the session, an invalid
// state event) leave the session usable.
//
// State reporting (MVISP) goes through a `StateReporter`, which batches
// events; full batches are sent as they fill, and `terminate` flushes what
// is left before sending Terminate.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use ambler_protocol::message::write_terminate;
use ambler_protocol::{
    AgentId, ClientMessage, HandshakeNegotiator, Negotiated, ProtocolError, Result, Role,
    SessionParameters, SimulationRequest, StateChangeEvent, StateRecord, Time, Waypoint,
    announce_states, request_session,
};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::state_channel::StateReporter;

/// Anything that can answer location requests for a session. Implemented by
/// `MobilityClient`; the buffering layers are generic over it.
pub trait WaypointSource {
    fn params(&self) -> SessionParameters;

    /// One waypoint per entry of `agents`, in the same order.
    fn fetch(&mut self, agents: &[AgentId]) -> Result<Vec<Waypoint>>;
}

/// What the client has seen of one agent.
#[derive(Clone, Copy, Debug, Default)]
struct AgentReplies {
    last: Option<Waypoint>,
}

/// Per-agent reply ordering rules.
#[derive(Debug)]
pub struct ReplyValidator {
    time_limit: Time,
    agents: Vec<AgentReplies>,
}

impl ReplyValidator {
    pub fn new(params: &SessionParameters) -> Self {
        Self {
            time_limit: params.time_limit(),
            agents: vec![AgentReplies::default(); params.num_agents() as usize],
        }
    }

    pub fn check(&mut self, agent: AgentId, reply: Waypoint) -> Result<()> {
        let Some(seen) = self.agents.get_mut(agent.index()) else {
            return Err(ProtocolError::ProtocolViolation(format!(
                "reply for unknown agent {agent}"
            )));
        };
        let violation = |what: String| -> Result<()> {
            Err(ProtocolError::ProtocolViolation(format!("agent {agent}: {what}")))
        };
        match seen.last {
            None if reply.time != Time::ZERO => {
                return violation(format!("first reply at {}, expected 0ms", reply.time));
            }
            Some(last) if last.time == self.time_limit => {
                if reply != last {
                    return violation(format!(
                        "repeat of the final reply differs ({reply:?} != {last:?})"
                    ));
                }
            }
            Some(last) if reply.time <= last.time => {
                return violation(format!(
                    "reply at {} does not follow {}",
                    reply.time, last.time
                ));
            }
            _ => {}
        }
        if reply.time > self.time_limit {
            return violation(format!(
                "reply at {} is past the time limit {}",
                reply.time, self.time_limit
            ));
        }
        seen.last = Some(reply);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MobilityClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    negotiated: Negotiated,
    params: SessionParameters,
    validator: ReplyValidator,
    reporter: Option<StateReporter>,
    max_request_entries: usize,
    /// Why the session ended, once a wire error has closed it.
    closed: Option<String>,
}

impl MobilityClient {
    /// Connect, negotiate, and open a session. `states` is required for
    /// MVISP and must be `None` for UAMP.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        config: &ClientConfig,
        request: SimulationRequest,
        states: Option<StateRecord>,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream, config, request, states)
    }

    /// Negotiate over an already-connected stream.
    pub fn from_stream(
        stream: TcpStream,
        config: &ClientConfig,
        request: SimulationRequest,
        states: Option<StateRecord>,
    ) -> Result<Self> {
        match (config.family.reports_state(), &states) {
            (true, None) => {
                return Err(ProtocolError::ProtocolViolation(format!(
                    "{} needs a state list",
                    config.family
                )));
            }
            (false, Some(_)) => {
                return Err(ProtocolError::ProtocolViolation(format!(
                    "{} does not carry state changes",
                    config.family
                )));
            }
            _ => {}
        }
        // Checked before anything is sent.
        SessionParameters::try_from(request)?;

        stream.set_read_timeout(config.io_timeout())?;
        stream.set_write_timeout(config.io_timeout())?;
        stream.set_nodelay(true)?;
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = BufWriter::new(stream);

        let negotiated = HandshakeNegotiator::new(
            Role::Client,
            config.family,
            config.versions,
            config.variants.flags(),
        )
        .run(&mut reader, &mut writer)?;

        if let Some(record) = &states {
            announce_states(&mut reader, &mut writer, record)?;
        }
        let params = request_session(&mut reader, &mut writer, request)?;
        info!(
            family = %negotiated.family,
            variants = %negotiated.variants,
            num_agents = params.num_agents(),
            time_limit = %params.time_limit(),
            "session open"
        );

        let reporter =
            states.map(|record| StateReporter::new(record, params, config.state_batch_capacity));
        Ok(Self {
            reader,
            writer,
            negotiated,
            params,
            validator: ReplyValidator::new(&params),
            reporter,
            max_request_entries: (config.max_request_entries as usize).max(1),
            closed: None,
        })
    }

    pub fn negotiated(&self) -> Negotiated {
        self.negotiated
    }

    pub fn params(&self) -> SessionParameters {
        self.params
    }

    pub fn state_record(&self) -> Option<&StateRecord> {
        self.reporter.as_ref().map(StateReporter::record)
    }

    /// False once a wire error has ended the session.
    pub fn is_open(&self) -> bool {
        self.closed.is_none()
    }

    /// Request one waypoint per entry of `agents`. IDs may repeat. Either
    /// every reply is returned or none is.
    pub fn request_locations(&mut self, agents: &[AgentId]) -> Result<Vec<Waypoint>> {
        self.ensure_open()?;
        if let Some(bad) = agents.iter().find(|a| !self.params.contains(**a)) {
            return Err(ProtocolError::ProtocolViolation(format!(
                "agent {bad} outside [0, {})",
                self.params.num_agents()
            )));
        }
        let mut replies = Vec::with_capacity(agents.len());
        for chunk in agents.chunks(self.max_request_entries) {
            let exchanged = self.exchange(chunk, &mut replies);
            self.close_on_error(exchanged)?;
        }
        debug!(count = replies.len(), "location replies received");
        Ok(replies)
    }

    /// Queue a state change, sending a batch if the queue filled up.
    pub fn report_state(&mut self, event: StateChangeEvent) -> Result<()> {
        self.ensure_open()?;
        let batch = self.reporter_mut()?.push(event)?;
        if let Some(batch) = batch {
            self.send_states(batch)?;
        }
        Ok(())
    }

    /// Send every queued state change now.
    pub fn flush_states(&mut self) -> Result<()> {
        self.ensure_open()?;
        if let Some(batch) = self.reporter_mut()?.drain() {
            self.send_states(batch)?;
        }
        Ok(())
    }

    pub fn pending_states(&self) -> usize {
        self.reporter.as_ref().map_or(0, StateReporter::pending)
    }

    /// Flush pending state changes, send Terminate, and close.
    pub fn terminate(mut self) -> Result<()> {
        self.ensure_open()?;
        if self.reporter.is_some() {
            self.flush_states()?;
        }
        write_terminate(&mut self.writer)?;
        debug!("terminate sent");
        Ok(())
    }

    /// One LocationRequest and its replies.
    fn exchange(&mut self, agents: &[AgentId], replies: &mut Vec<Waypoint>) -> Result<()> {
        ClientMessage::LocationRequest(agents.to_vec()).send(&mut self.writer)?;
        let variants = self.negotiated.variants;
        for &agent in agents {
            let reply = Waypoint::decode_reply(&mut self.reader, variants)?;
            self.validator.check(agent, reply)?;
            replies.push(reply);
        }
        Ok(())
    }

    fn send_states(&mut self, batch: Vec<StateChangeEvent>) -> Result<()> {
        let sent = ClientMessage::StateChanges(batch).send(&mut self.writer);
        self.close_on_error(sent)
    }

    /// A failed exchange leaves the stream at an unknown position, so the
    /// session is over: shut the socket and refuse further calls.
    fn close_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(error = %e, "closing session");
            self.closed = Some(e.to_string());
            let _ = self.writer.get_ref().shutdown(Shutdown::Both);
        }
        result
    }

    fn ensure_open(&self) -> Result<()> {
        match &self.closed {
            None => Ok(()),
            Some(reason) => Err(ProtocolError::ConnectionLost(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("session already ended: {reason}"),
            ))),
        }
    }

    fn reporter_mut(&mut self) -> Result<&mut StateReporter> {
        let family = self.negotiated.family;
        self.reporter.as_mut().ok_or_else(|| {
            ProtocolError::ProtocolViolation(format!("{family} does not carry state changes"))
        })
    }
}

impl WaypointSource for MobilityClient {
    fn params(&self) -> SessionParameters {
        self.params
    }

    fn fetch(&mut self, agents: &[AgentId]) -> Result<Vec<Waypoint>> {
        self.request_locations(agents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambler_protocol::Coordinate;

    fn wp(time: u32, x: u32) -> Waypoint {
        Waypoint {
            time: Time(time),
            pos: Coordinate::flat(x, 0),
            present: true,
        }
    }

    fn validator() -> ReplyValidator {
        ReplyValidator::new(&SessionParameters::new(2, Time(1000), 0).unwrap())
    }

    #[test]
    fn accepts_ordered_replies_and_identical_repeat() {
        let mut v = validator();
        v.check(AgentId(0), wp(0, 0)).unwrap();
        v.check(AgentId(0), wp(400, 1)).unwrap();
        v.check(AgentId(0), wp(1000, 2)).unwrap();
        v.check(AgentId(0), wp(1000, 2)).unwrap();
        // Agents are tracked independently.
        v.check(AgentId(1), wp(0, 9)).unwrap();
    }

    #[test]
    fn first_reply_must_be_zero() {
        assert!(validator().check(AgentId(0), wp(1, 0)).is_err());
    }

    #[test]
    fn non_increasing_reply_is_violation() {
        let mut v = validator();
        v.check(AgentId(0), wp(0, 0)).unwrap();
        v.check(AgentId(0), wp(500, 0)).unwrap();
        let err = v.check(AgentId(0), wp(500, 1)).unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
    }

    #[test]
    fn repeat_after_limit_must_be_identical() {
        let mut v = validator();
        v.check(AgentId(0), wp(0, 0)).unwrap();
        v.check(AgentId(0), wp(1000, 5)).unwrap();
        assert!(v.check(AgentId(0), wp(1000, 6)).is_err());
    }

    #[test]
    fn reply_past_limit_is_violation() {
        let mut v = validator();
        v.check(AgentId(0), wp(0, 0)).unwrap();
        assert!(v.check(AgentId(0), wp(1001, 0)).is_err());
    }

    #[test]
    fn unknown_agent_is_violation() {
        assert!(validator().check(AgentId(2), wp(0, 0)).is_err());
    }
}

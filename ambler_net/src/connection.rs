// Server side of one connection, from Hello to disconnect.
//
// `serve_connection` runs the phases in order, each to completion:
//
//   Handshake ─▶ [StateList, MVISP only] ─▶ Session ─▶ Update ─▶ closed
//
// The update phase is the server half of the command stream. `ReplyStream`
// owns the session's `AgentSimulator` and turns each requested agent ID into
// the bytes of one location reply:
// - The first reply for an agent is at time 0 and later replies strictly
//   increase, ending at the time limit. Once the limit reply was produced it
//   is cached and replayed byte for byte; the simulator is not consulted
//   again for that agent.
// - The simulator's output is checked against those rules (and against the
//   negotiated variants) before it is encoded. A violation is a server-side
//   fault: the client is sent Terminate and the connection is closed.
//
// A LocationRequest is answered all-or-nothing: every reply is encoded into
// a buffer first and written with one flush, so a fault halfway through a
// request never leaves a partial answer on the wire.
//
// Client misbehavior (bad request counts, unknown agents, malformed bytes)
// ends the connection without a Terminate; the error is returned to the
// listener, which logs it.

use std::io::{BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use ambler_prng::SeedMixer;
use ambler_protocol::message::write_terminate;
use ambler_protocol::{
    AgentId, ClientMessage, HandshakeNegotiator, Negotiated, ProtocolError, Role,
    SessionDecision, SessionNegotiator, SessionParameters, StateRecord, Time, VariantFlags,
    VersionSet, Waypoint, accept_states,
};
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::mobility::{AgentSimulator, MobilityModel};
use crate::state_channel::StateSink;

/// Collaborators shared by every connection of a server.
#[derive(Clone)]
pub struct ServerServices {
    pub model: Arc<dyn MobilityModel>,
    pub mixer: Arc<dyn SeedMixer>,
    pub sink: Arc<dyn StateSink>,
}

/// The mobility model broke one of the reply rules.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ModelFault {
    #[error("agent {agent}: first waypoint at {time}, expected 0ms")]
    FirstNotZero { agent: AgentId, time: Time },

    #[error("agent {agent}: waypoint at {time} does not follow {previous}")]
    NotIncreasing {
        agent: AgentId,
        previous: Time,
        time: Time,
    },

    #[error("agent {agent}: waypoint at {time} is past the time limit {limit}")]
    PastLimit {
        agent: AgentId,
        time: Time,
        limit: Time,
    },

    #[error("agent {agent}: waypoint cannot be sent with variants {variants}: {reason}")]
    Unencodable {
        agent: AgentId,
        variants: VariantFlags,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("mobility model fault: {0}")]
    Model(#[from] ModelFault),
}

/// How a connection ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server declined the simulation request.
    Denied,
    /// The client sent Terminate.
    Terminated,
    /// The client closed the stream between messages.
    Closed,
}

// ---------------------------------------------------------------------------
// Reply stream
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AgentProgress {
    last: Option<Time>,
    final_reply: Option<Vec<u8>>,
}

/// Server half of the command stream for one session.
pub struct ReplyStream {
    params: SessionParameters,
    variants: VariantFlags,
    simulator: Box<dyn AgentSimulator>,
    agents: Vec<AgentProgress>,
}

impl ReplyStream {
    pub fn new(
        params: SessionParameters,
        variants: VariantFlags,
        simulator: Box<dyn AgentSimulator>,
    ) -> Self {
        let agents = params.agents().map(|_| AgentProgress::default()).collect();
        Self {
            params,
            variants,
            simulator,
            agents,
        }
    }

    /// Encoded reply for `agent`, which the caller has checked is in range.
    pub fn reply(&mut self, agent: AgentId) -> Result<Vec<u8>, ModelFault> {
        let limit = self.params.time_limit();
        let progress = &mut self.agents[agent.index()];
        if let Some(bytes) = &progress.final_reply {
            return Ok(bytes.clone());
        }

        let waypoint = self.simulator.advance_agent(agent);
        match progress.last {
            None if waypoint.time != Time::ZERO => {
                return Err(ModelFault::FirstNotZero {
                    agent,
                    time: waypoint.time,
                });
            }
            Some(previous) if waypoint.time <= previous => {
                return Err(ModelFault::NotIncreasing {
                    agent,
                    previous,
                    time: waypoint.time,
                });
            }
            _ => {}
        }
        if waypoint.time > limit {
            return Err(ModelFault::PastLimit {
                agent,
                time: waypoint.time,
                limit,
            });
        }

        let bytes = encode(agent, &waypoint, self.variants)?;
        progress.last = Some(waypoint.time);
        if waypoint.time == limit {
            progress.final_reply = Some(bytes.clone());
        }
        Ok(bytes)
    }
}

fn encode(agent: AgentId, waypoint: &Waypoint, variants: VariantFlags) -> Result<Vec<u8>, ModelFault> {
    waypoint
        .reply_bytes(variants)
        .map_err(|e| ModelFault::Unencodable {
            agent,
            variants,
            reason: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Connection state machine
// ---------------------------------------------------------------------------

/// Run one connection to completion.
pub fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: &ServerConfig,
    services: &ServerServices,
) -> Result<SessionEnd, ConnectionError> {
    stream.set_read_timeout(config.io_timeout()).map_err(ProtocolError::from)?;
    stream.set_write_timeout(config.io_timeout()).map_err(ProtocolError::from)?;
    let mut reader = BufReader::new(stream.try_clone().map_err(ProtocolError::from)?);
    let mut writer = BufWriter::new(stream);

    let negotiated = HandshakeNegotiator::new(
        Role::Server,
        config.family,
        VersionSet::SUPPORTED,
        config.variants.flags(),
    )
    .run(&mut reader, &mut writer)?;
    info!(%peer, family = %negotiated.family, variants = %negotiated.variants, "handshake complete");

    let record = if negotiated.family.reports_state() {
        Some(accept_states(&mut reader, &mut writer)?)
    } else {
        None
    };

    let params = match SessionNegotiator::new(config.limits()).serve(&mut reader, &mut writer)? {
        SessionDecision::Accept(params) => params,
        SessionDecision::Deny(_) => return Ok(SessionEnd::Denied),
    };

    let mixed_seed = services.mixer.mix(params.seed());
    let simulator = services.model.spawn(&params, negotiated.variants, mixed_seed);
    let mut session = UpdatePhase {
        params,
        negotiated,
        record,
        replies: ReplyStream::new(params, negotiated.variants, simulator),
        sink: services.sink.as_ref(),
        max_entries: config.max_requests_per_message,
    };
    let end = session.run(&mut reader, &mut writer);
    match &end {
        Ok(end) => debug!(%peer, ?end, "session ended"),
        Err(ConnectionError::Model(fault)) => {
            error!(%peer, %fault, "terminating session");
            let _ = write_terminate(&mut writer);
        }
        Err(ConnectionError::Protocol(_)) => {}
    }
    end
}

struct UpdatePhase<'a> {
    params: SessionParameters,
    negotiated: Negotiated,
    record: Option<StateRecord>,
    replies: ReplyStream,
    sink: &'a dyn StateSink,
    max_entries: u32,
}

impl UpdatePhase<'_> {
    fn run<R: std::io::Read, W: Write>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<SessionEnd, ConnectionError> {
        loop {
            match ClientMessage::read(reader, self.max_entries)? {
                None => return Ok(SessionEnd::Closed),
                Some(ClientMessage::Terminate) => return Ok(SessionEnd::Terminated),
                Some(ClientMessage::LocationRequest(agents)) => {
                    self.answer(&agents, writer)?;
                }
                Some(ClientMessage::StateChanges(events)) => {
                    let Some(record) = &self.record else {
                        return Err(ProtocolError::ProtocolViolation(format!(
                            "state changes are not part of {}",
                            self.negotiated.family
                        ))
                        .into());
                    };
                    // Validate the whole batch before applying any of it.
                    for event in &events {
                        record.validate(event, &self.params)?;
                    }
                    for event in &events {
                        self.sink.apply(event, record);
                    }
                }
            }
        }
    }

    fn answer<W: Write>(&mut self, agents: &[AgentId], writer: &mut W) -> Result<(), ConnectionError> {
        if let Some(bad) = agents.iter().find(|a| !self.params.contains(**a)) {
            warn!(agent = %bad, num_agents = self.params.num_agents(), "request for unknown agent");
            return Err(ProtocolError::ProtocolViolation(format!(
                "agent {bad} outside [0, {})",
                self.params.num_agents()
            ))
            .into());
        }
        let mut out = Vec::with_capacity(agents.len() * self.negotiated.variants.reply_len());
        for &agent in agents {
            out.extend_from_slice(&self.replies.reply(agent)?);
        }
        writer.write_all(&out).map_err(ProtocolError::from)?;
        writer.flush().map_err(ProtocolError::from)?;
        Ok(())
    }
}

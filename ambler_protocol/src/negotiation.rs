// Session negotiation and the MVISP state-list exchange.
//
// Both run after a `Ready` handshake, in this order:
//
//   [MVISP only] client: StateList          ─▶ server: StateListReply
//                client: SimulationRequest  ─▶ server: SessionReply
//
// The server side is split into a pure `decide` (limits check, no I/O) and
// `serve`, which reads the request and writes the reply. A denial is a normal
// outcome for the server (`SessionDecision::Deny`) but an error for the
// client (`ProtocolError::SessionDenied`), since the client cannot continue.

use std::fmt;
use std::io::{Read, Write};

use tracing::{debug, info, warn};

use crate::error::{NegotiationFailure, ProtocolError, Result};
use crate::message::{SessionReply, StateListReply};
use crate::state::StateRecord;
use crate::types::{SessionParameters, SimulationRequest, Time};

/// Server-side bounds on what a client may ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_agents: u32,
    pub max_time_limit: Time,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_agents: 10_000,
            // One day of simulated time.
            max_time_limit: Time(86_400_000),
        }
    }
}

/// Why the server refused a simulation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenyReason {
    NoAgents,
    TooManyAgents { requested: u32, max: u32 },
    TimeLimitTooLong { requested: Time, max: Time },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::NoAgents => write!(f, "request names zero agents"),
            DenyReason::TooManyAgents { requested, max } => {
                write!(f, "{requested} agents requested, at most {max} allowed")
            }
            DenyReason::TimeLimitTooLong { requested, max } => {
                write!(f, "time limit {requested} exceeds {max}")
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionDecision {
    Accept(SessionParameters),
    Deny(DenyReason),
}

/// Server half of session negotiation.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionNegotiator {
    limits: SessionLimits,
}

impl SessionNegotiator {
    pub fn new(limits: SessionLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    pub fn decide(&self, request: SimulationRequest) -> SessionDecision {
        if request.num_agents == 0 {
            return SessionDecision::Deny(DenyReason::NoAgents);
        }
        if request.num_agents > self.limits.max_agents {
            return SessionDecision::Deny(DenyReason::TooManyAgents {
                requested: request.num_agents,
                max: self.limits.max_agents,
            });
        }
        if request.time_limit > self.limits.max_time_limit {
            return SessionDecision::Deny(DenyReason::TimeLimitTooLong {
                requested: request.time_limit,
                max: self.limits.max_time_limit,
            });
        }
        match SessionParameters::try_from(request) {
            Ok(params) => SessionDecision::Accept(params),
            Err(_) => SessionDecision::Deny(DenyReason::NoAgents),
        }
    }

    /// Read a `SimulationRequest`, answer it, and report the decision.
    pub fn serve<R: Read, W: Write>(&self, reader: &mut R, writer: &mut W) -> Result<SessionDecision> {
        let request = SimulationRequest::decode(reader)?;
        let decision = self.decide(request);
        let reply = match decision {
            SessionDecision::Accept(params) => {
                info!(
                    num_agents = params.num_agents(),
                    time_limit = %params.time_limit(),
                    seed = params.seed(),
                    "session accepted"
                );
                SessionReply::Okay
            }
            SessionDecision::Deny(reason) => {
                if reason == DenyReason::NoAgents {
                    warn!(%reason, "session denied");
                } else {
                    info!(%reason, "session denied");
                }
                SessionReply::Denied
            }
        };
        reply.encode(writer)?;
        writer.flush()?;
        Ok(decision)
    }
}

/// Client half of session negotiation. Fails locally, without touching the
/// stream, if the request names no agents.
pub fn request_session<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    request: SimulationRequest,
) -> Result<SessionParameters> {
    let params = SessionParameters::try_from(request)?;
    request.encode(writer)?;
    writer.flush()?;
    match SessionReply::decode(reader)? {
        SessionReply::Okay => {
            debug!(num_agents = params.num_agents(), "session accepted by server");
            Ok(params)
        }
        SessionReply::Denied => Err(ProtocolError::SessionDenied),
    }
}

/// Client half of the MVISP state-list exchange.
pub fn announce_states<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    record: &StateRecord,
) -> Result<()> {
    record.send(writer)?;
    match StateListReply::decode(reader)? {
        StateListReply::Accepted => {
            debug!(num_states = record.len(), "state list accepted");
            Ok(())
        }
        StateListReply::Rejected => Err(NegotiationFailure::StateListRejected.into()),
    }
}

/// Server half of the MVISP state-list exchange. An invalid list is answered
/// with `Rejected` before the error is returned.
pub fn accept_states<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> Result<StateRecord> {
    match StateRecord::decode(reader) {
        Ok(record) => {
            StateListReply::Accepted.encode(writer)?;
            writer.flush()?;
            debug!(num_states = record.len(), "state list received");
            Ok(record)
        }
        Err(e) if e.is_peer_fault() => {
            warn!(error = %e, "rejecting state list");
            // Best effort: the connection is closed either way.
            let _ = StateListReply::Rejected
                .encode(writer)
                .and_then(|()| writer.flush().map_err(ProtocolError::from));
            Err(e)
        }
        Err(e) => Err(e),
    }
}

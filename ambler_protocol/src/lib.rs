// ambler_protocol: the UAMP/MVISP wire protocol.
//
// Everything both ends of a connection need to agree on: value types, the
// primitive codec, the message set, and the negotiation state machines. The
// crate performs blocking I/O over any `std::io::Read`/`Write` pair and has
// no networking runtime of its own; `ambler_net` provides the server and
// client built on it.
//
// Module overview:
// - `types.rs`:       `AgentId`, `Time`, `Coordinate`, `Waypoint`, `Command`,
//                     `VersionSet`, `VariantFlags`, `SessionParameters`, ...
// - `error.rs`:       `ProtocolError` and `NegotiationFailure`.
// - `codec.rs`:       Big-endian `UInt32`, ASCII strings, coordinates, and the
//                     Terminate-aware reply reader.
// - `message.rs`:     Per-phase message enums with `encode`/`decode`.
// - `handshake.rs`:   `HandshakeNegotiator` (Hello, version and variant choice).
// - `negotiation.rs`: `SessionNegotiator`, `request_session`, and the MVISP
//                     state-list exchange.
// - `state.rs`:       `StateRecord` (MVISP state names) and event validation.
//
// Design decisions:
// - **No global message header.** The connection phase determines what comes
//   next, so each phase has its own closed message set.
// - **Pure state machines.** Negotiation transitions take and return values;
//   the stream drivers are thin wrappers, which keeps every failure path
//   testable without sockets.

pub mod codec;
pub mod error;
pub mod handshake;
pub mod message;
pub mod negotiation;
pub mod state;
pub mod types;

pub use error::{NegotiationFailure, ProtocolError, Result};
pub use handshake::{HandshakeNegotiator, HandshakeState, Role};
pub use message::{ClientMessage, Hello, NegotiationReply, SessionReply, StateListReply};
pub use negotiation::{
    DenyReason, SessionDecision, SessionLimits, SessionNegotiator, accept_states,
    announce_states, request_session,
};
pub use state::{MAX_STATES, StateRecord};
pub use types::{
    AgentId, Command, Coordinate, Negotiated, ProtocolFamily, SessionParameters,
    SimulationRequest, StateChangeEvent, Time, VariantFlags, VersionSet, Waypoint,
};

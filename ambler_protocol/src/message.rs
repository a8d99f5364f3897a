// Protocol messages.
//
// The wire has no global message header: what comes next is determined by
// the connection phase. Each phase therefore gets its own closed set of
// messages, modeled as enums (or plain structs for single-message phases)
// with `encode`/`decode` methods that match exhaustively on the variant:
//
// - Handshake:  `Hello` (both directions), then `NegotiationReply`
//               (`InitFailed` | `VersionChoice`).
// - State list: `StateListReply` (MVISP only; the list itself lives in
//               `state.rs`).
// - Session:    `SimulationRequest` (client → server), `SessionReply`.
// - Update:     `ClientMessage` (tagged: Terminate, LocationRequest,
//               StateChanges) and location replies (`Waypoint`), whose
//               layout depends on the negotiated variants.
//
// `send` helpers encode and then flush, so one call puts one whole message on
// the wire.

use std::io::{Read, Write};

use crate::codec::{
    TERMINATE_LEN, read_array, read_reply_bytes, read_tag, read_time, read_u8, read_u32,
    write_coordinate, write_time, write_u8, write_u32,
};
use crate::error::{ProtocolError, Result};
use crate::types::{
    AgentId, Coordinate, SimulationRequest, StateChangeEvent, VariantFlags, VersionSet, Waypoint,
};

/// Single byte signalling a failed handshake.
pub const INIT_FAILED: u8 = 0x00;

const TAG_TERMINATE: u8 = 0x00;
const TAG_LOCATION_REQUEST: u8 = 0x01;
const TAG_STATE_CHANGES: u8 = 0x02;

const REPLY_OKAY: u8 = 0x00;
const REPLY_DENIED: u8 = 0x01;

/// Opening message of both ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hello {
    pub magic: [u8; 4],
    pub versions: VersionSet,
    pub variants: VariantFlags,
}

impl Hello {
    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        write_u8(writer, self.versions.0)?;
        write_u32(writer, self.variants.0)
    }

    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            magic: read_array(reader)?,
            versions: VersionSet(read_u8(reader)?),
            variants: VariantFlags(read_u32(reader)?),
        })
    }
}

/// Second handshake message: the agreed version, or a refusal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationReply {
    InitFailed,
    VersionChoice(VersionSet),
}

impl NegotiationReply {
    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            NegotiationReply::InitFailed => write_u8(writer, INIT_FAILED),
            NegotiationReply::VersionChoice(set) => {
                if !set.is_single() {
                    return Err(ProtocolError::MalformedValue(format!(
                        "version choice {set} must have exactly one bit set"
                    )));
                }
                write_u8(writer, set.0)
            }
        }
    }

    /// Decode a reply. A zero byte is `InitFailed`; any other byte is a
    /// version choice, validated by the handshake state machine.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        match read_u8(reader)? {
            INIT_FAILED => Ok(NegotiationReply::InitFailed),
            bits => Ok(NegotiationReply::VersionChoice(VersionSet(bits))),
        }
    }
}

impl SimulationRequest {
    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_u32(writer, self.num_agents)?;
        write_time(writer, self.time_limit)?;
        write_u32(writer, self.seed)
    }

    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            num_agents: read_u32(reader)?,
            time_limit: read_time(reader)?,
            seed: read_u32(reader)?,
        })
    }
}

/// Server's answer to a `SimulationRequest`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionReply {
    Okay,
    Denied,
}

impl SessionReply {
    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            SessionReply::Okay => write_u8(writer, REPLY_OKAY),
            SessionReply::Denied => write_u8(writer, REPLY_DENIED),
        }
    }

    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        match read_u8(reader)? {
            REPLY_OKAY => Ok(SessionReply::Okay),
            REPLY_DENIED => Ok(SessionReply::Denied),
            other => Err(ProtocolError::MalformedValue(format!(
                "session reply must be 0x00 or 0x01, got {other:#04x}"
            ))),
        }
    }
}

/// Server's answer to an MVISP state list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateListReply {
    Accepted,
    Rejected,
}

impl StateListReply {
    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            StateListReply::Accepted => write_u8(writer, REPLY_OKAY),
            StateListReply::Rejected => write_u8(writer, REPLY_DENIED),
        }
    }

    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        match read_u8(reader)? {
            REPLY_OKAY => Ok(StateListReply::Accepted),
            REPLY_DENIED => Ok(StateListReply::Rejected),
            other => Err(ProtocolError::MalformedValue(format!(
                "state list reply must be 0x00 or 0x01, got {other:#04x}"
            ))),
        }
    }
}

/// Update-phase messages sent by the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    Terminate,
    /// One reply is expected per entry, in order. Entries may repeat.
    LocationRequest(Vec<AgentId>),
    /// MVISP only. No reply.
    StateChanges(Vec<StateChangeEvent>),
}

impl ClientMessage {
    pub fn encode<W: Write>(&self, writer: &mut W) -> Result<()> {
        match self {
            ClientMessage::Terminate => write_terminate(writer),
            ClientMessage::LocationRequest(agents) => {
                if agents.is_empty() {
                    return Err(ProtocolError::ProtocolViolation(
                        "location request must name at least one agent".into(),
                    ));
                }
                write_u8(writer, TAG_LOCATION_REQUEST)?;
                write_u32(writer, count_u32(agents.len())?)?;
                for agent in agents {
                    write_u32(writer, agent.0)?;
                }
                Ok(())
            }
            ClientMessage::StateChanges(events) => {
                if events.is_empty() {
                    return Err(ProtocolError::ProtocolViolation(
                        "state change batch must not be empty".into(),
                    ));
                }
                write_u8(writer, TAG_STATE_CHANGES)?;
                write_u32(writer, count_u32(events.len())?)?;
                for event in events {
                    write_u32(writer, event.agent.0)?;
                    write_time(writer, event.time)?;
                    write_u32(writer, event.state_index)?;
                }
                Ok(())
            }
        }
    }

    pub fn send<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.encode(writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Read the next client message. Returns `None` if the client closed the
    /// stream between messages. `max_entries` bounds the element count of a
    /// single request or batch.
    pub fn read<R: Read>(reader: &mut R, max_entries: u32) -> Result<Option<Self>> {
        let Some(tag) = read_tag(reader)? else {
            return Ok(None);
        };
        let msg = match tag {
            TAG_TERMINATE => {
                let rest: [u8; TERMINATE_LEN - 1] = read_array(reader)?;
                if rest != [0; TERMINATE_LEN - 1] {
                    return Err(ProtocolError::MalformedValue(format!(
                        "terminate must be five zero bytes, got 00{rest:02x?}"
                    )));
                }
                ClientMessage::Terminate
            }
            TAG_LOCATION_REQUEST => {
                let count = read_entry_count(reader, max_entries, "location request")?;
                let mut agents = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    agents.push(AgentId(read_u32(reader)?));
                }
                ClientMessage::LocationRequest(agents)
            }
            TAG_STATE_CHANGES => {
                let count = read_entry_count(reader, max_entries, "state change batch")?;
                let mut events = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    events.push(StateChangeEvent {
                        agent: AgentId(read_u32(reader)?),
                        time: read_time(reader)?,
                        state_index: read_u32(reader)?,
                    });
                }
                ClientMessage::StateChanges(events)
            }
            other => {
                return Err(ProtocolError::MalformedValue(format!(
                    "unknown client message tag {other:#04x}"
                )));
            }
        };
        Ok(Some(msg))
    }
}

fn read_entry_count<R: Read>(reader: &mut R, max_entries: u32, what: &str) -> Result<u32> {
    let count = read_u32(reader)?;
    if count == 0 {
        return Err(ProtocolError::ProtocolViolation(format!("empty {what}")));
    }
    if count > max_entries {
        return Err(ProtocolError::ProtocolViolation(format!(
            "{what} of {count} entries exceeds the limit of {max_entries}"
        )));
    }
    Ok(count)
}

fn count_u32(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| ProtocolError::MalformedValue(format!("{len} entries do not fit a u32 count")))
}

/// Write the 5-byte Terminate message and flush.
pub fn write_terminate<W: Write>(writer: &mut W) -> Result<()> {
    writer.write_all(&[0u8; TERMINATE_LEN])?;
    writer.flush()?;
    Ok(())
}

impl Waypoint {
    /// Encode as a location reply under the negotiated variants.
    pub fn encode_reply<W: Write>(&self, writer: &mut W, variants: VariantFlags) -> Result<()> {
        write_time(writer, self.time)?;
        write_coordinate(writer, self.pos, variants)?;
        if variants.add_remove() {
            write_u8(writer, u8::from(self.present))?;
        } else if !self.present {
            return Err(ProtocolError::MalformedValue(
                "absent agent cannot be sent without ADD_REMOVE".into(),
            ));
        }
        Ok(())
    }

    /// Decode one location reply. See `codec::read_reply_bytes` for how a
    /// server Terminate in place of a reply is reported.
    pub fn decode_reply<R: Read>(reader: &mut R, variants: VariantFlags) -> Result<Self> {
        let bytes = read_reply_bytes(reader, variants.reply_len())?;
        let mut cursor = bytes.as_slice();
        let time = read_time(&mut cursor)?;
        let x = read_u32(&mut cursor)?;
        let y = read_u32(&mut cursor)?;
        let z = if variants.three_dimensions() {
            read_u32(&mut cursor)?
        } else {
            0
        };
        let present = if variants.add_remove() {
            match read_u8(&mut cursor)? {
                0 => false,
                1 => true,
                other => {
                    return Err(ProtocolError::MalformedValue(format!(
                        "presence byte must be 0 or 1, got {other:#04x}"
                    )));
                }
            }
        } else {
            true
        };
        Ok(Waypoint {
            time,
            pos: Coordinate { x, y, z },
            present,
        })
    }

    /// The exact bytes of this waypoint as a reply. Used to check that a
    /// repeated final reply is byte-identical.
    pub fn reply_bytes(&self, variants: VariantFlags) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(variants.reply_len());
        self.encode_reply(&mut buf, variants)?;
        Ok(buf)
    }
}

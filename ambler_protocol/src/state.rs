// MVISP state record and the state-list exchange.
//
// After a successful handshake, an MVISP client announces the names of the
// states it will report: `numStates: UInt32`, then that many length-prefixed
// ASCII names. The server validates the list (non-empty, bounded, no
// duplicates), answers with `StateListReply`, and keeps the result as an
// immutable `StateRecord`. Later `StateChangeEvent`s refer to states by index
// into this record.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::codec::{read_string, read_u32, write_string, write_u32};
use crate::error::{ProtocolError, Result};
use crate::types::{SessionParameters, StateChangeEvent};

/// Most states a client may announce.
pub const MAX_STATES: u32 = 65_536;

/// Ordered, duplicate-free list of state names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    names: Vec<String>,
}

impl StateRecord {
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(ProtocolError::ProtocolViolation(
                "state list must name at least one state".into(),
            ));
        }
        if names.len() > MAX_STATES as usize {
            return Err(ProtocolError::ProtocolViolation(format!(
                "{} states exceed the limit of {MAX_STATES}",
                names.len()
            )));
        }
        let mut seen = BTreeSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(ProtocolError::ProtocolViolation(format!(
                    "duplicate state name {name:?}"
                )));
            }
        }
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, index: u32) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.names.iter().position(|n| n == name).map(|i| i as u32)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Check an event against this record and the session it belongs to.
    pub fn validate(&self, event: &StateChangeEvent, params: &SessionParameters) -> Result<()> {
        if !params.contains(event.agent) {
            return Err(ProtocolError::ProtocolViolation(format!(
                "state change for agent {} outside [0, {})",
                event.agent,
                params.num_agents()
            )));
        }
        if event.state_index as usize >= self.names.len() {
            return Err(ProtocolError::ProtocolViolation(format!(
                "state index {} outside [0, {})",
                event.state_index,
                self.names.len()
            )));
        }
        if event.time > params.time_limit() {
            return Err(ProtocolError::ProtocolViolation(format!(
                "state change at {} is past the time limit {}",
                event.time,
                params.time_limit()
            )));
        }
        Ok(())
    }

    /// Write the state list and flush.
    pub fn send<W: Write>(&self, writer: &mut W) -> Result<()> {
        write_u32(writer, self.names.len() as u32)?;
        for name in &self.names {
            write_string(writer, name)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read and validate a state list.
    pub fn decode<R: Read>(reader: &mut R) -> Result<Self> {
        let count = read_u32(reader)?;
        if count == 0 || count > MAX_STATES {
            return Err(ProtocolError::ProtocolViolation(format!(
                "state count {count} outside [1, {MAX_STATES}]"
            )));
        }
        let mut names = Vec::with_capacity(count as usize);
        for _ in 0..count {
            names.push(read_string(reader)?);
        }
        Self::new(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentId, Time};
    use std::io::Cursor;

    fn record() -> StateRecord {
        StateRecord::new(vec!["susceptible".into(), "infected".into(), "recovered".into()])
            .unwrap()
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = StateRecord::new(vec!["a".into(), "b".into(), "a".into()]).unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
    }

    #[test]
    fn empty_list_rejected() {
        assert!(StateRecord::new(Vec::new()).is_err());
    }

    #[test]
    fn wire_roundtrip() {
        let rec = record();
        let mut buf = Vec::new();
        rec.send(&mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 3]);
        assert_eq!(StateRecord::decode(&mut Cursor::new(buf)).unwrap(), rec);
    }

    #[test]
    fn decode_rejects_duplicates_on_the_wire() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 2).unwrap();
        write_string(&mut buf, "idle").unwrap();
        write_string(&mut buf, "idle").unwrap();
        let err = StateRecord::decode(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
    }

    #[test]
    fn lookup_by_name_and_index() {
        let rec = record();
        assert_eq!(rec.index_of("infected"), Some(1));
        assert_eq!(rec.name(2), Some("recovered"));
        assert_eq!(rec.name(3), None);
    }

    #[test]
    fn validate_checks_agent_index_and_time() {
        let rec = record();
        let params = SessionParameters::new(2, Time(1000), 0).unwrap();
        let ok = StateChangeEvent {
            agent: AgentId(1),
            time: Time(1000),
            state_index: 2,
        };
        assert!(rec.validate(&ok, &params).is_ok());
        assert!(rec
            .validate(&StateChangeEvent { agent: AgentId(2), ..ok }, &params)
            .is_err());
        assert!(rec
            .validate(&StateChangeEvent { state_index: 3, ..ok }, &params)
            .is_err());
        assert!(rec
            .validate(&StateChangeEvent { time: Time(1001), ..ok }, &params)
            .is_err());
    }
}

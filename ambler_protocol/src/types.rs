// Core value types shared by every layer of the protocol.
//
// Wire-level primitives (`Time`, `Coordinate`, `VersionSet`, `VariantFlags`)
// and the domain values built on them (`Waypoint`, `Command`,
// `SessionParameters`, `StateChangeEvent`). Everything that can be out of
// range for its wire width is constructed through a checked constructor that
// returns `ProtocolError::MalformedValue`, so the encoder never sees a value
// it cannot represent.
//
// Bit numbering follows the wire convention: bit 1 is the most significant
// bit of the first byte.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Index of an agent within a session, in `[0, num_agents)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub u32);

impl AgentId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Simulation time in milliseconds since the start of the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Time(pub u32);

impl Time {
    pub const ZERO: Time = Time(0);

    /// Convert a wide millisecond count, failing if it does not fit the wire.
    pub fn from_millis(millis: u64) -> Result<Self, ProtocolError> {
        u32::try_from(millis)
            .map(Time)
            .map_err(|_| ProtocolError::MalformedValue(format!("time {millis} ms exceeds u32")))
    }

    pub fn as_millis(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Position in millimetres from an arbitrary origin. `z` is always 0 unless
/// the `THREE_DIMENSIONS` variant was negotiated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Coordinate {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn flat(x: u32, y: u32) -> Self {
        Self { x, y, z: 0 }
    }

    /// Build a coordinate from signed millimetre values, rejecting anything
    /// negative or wider than 32 bits.
    pub fn from_mm(x: i64, y: i64, z: i64) -> Result<Self, ProtocolError> {
        Ok(Self {
            x: checked_axis("x", x)?,
            y: checked_axis("y", y)?,
            z: checked_axis("z", z)?,
        })
    }

    /// Integer linear interpolation between `self` and `to` at
    /// `numer / denom` of the way. `denom` must be non-zero and
    /// `numer <= denom`.
    pub fn lerp(self, to: Coordinate, numer: u64, denom: u64) -> Coordinate {
        debug_assert!(denom > 0 && numer <= denom);
        let axis = |a: u32, b: u32| -> u32 {
            let a = i128::from(a);
            let b = i128::from(b);
            let v = a + (b - a) * i128::from(numer) / i128::from(denom);
            v as u32
        };
        Coordinate {
            x: axis(self.x, to.x),
            y: axis(self.y, to.y),
            z: axis(self.z, to.z),
        }
    }

    /// Euclidean distance in millimetres, rounded down.
    pub fn distance_mm(self, other: Coordinate) -> u64 {
        // Squares of u32 differences need 64 bits each; their sum needs more.
        let d = |a: u32, b: u32| u128::from(a.abs_diff(b));
        let (dx, dy, dz) = (d(self.x, other.x), d(self.y, other.y), d(self.z, other.z));
        // sqrt(3 * (2^32)^2) < 2^34, so the root always fits.
        (dx * dx + dy * dy + dz * dz).isqrt() as u64
    }
}

fn checked_axis(axis: &str, value: i64) -> Result<u32, ProtocolError> {
    u32::try_from(value).map_err(|_| {
        ProtocolError::MalformedValue(format!("{axis} coordinate {value} is outside u32"))
    })
}

/// One reply of the command stream: where an agent is at an event time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Waypoint {
    pub time: Time,
    pub pos: Coordinate,
    /// Always `true` unless `ADD_REMOVE` was negotiated.
    pub present: bool,
}

/// A straight-line, constant-speed movement (or a pause) of one agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub start_time: Time,
    pub end_time: Time,
    pub start_pos: Coordinate,
    pub end_pos: Coordinate,
    pub present: bool,
}

impl Command {
    /// The command spanning two consecutive waypoints of one agent. Presence
    /// is that of the starting waypoint.
    pub fn between(from: &Waypoint, to: &Waypoint) -> Self {
        Self {
            start_time: from.time,
            end_time: to.time,
            start_pos: from.pos,
            end_pos: to.pos,
            present: from.present,
        }
    }

    /// Zero-length command at a single waypoint (sessions with a zero time
    /// limit consist of exactly one of these).
    pub fn at(point: &Waypoint) -> Self {
        Self::between(point, point)
    }

    pub fn is_pause(&self) -> bool {
        self.start_pos == self.end_pos
    }

    pub fn covers(&self, t: Time) -> bool {
        self.start_time <= t && t <= self.end_time
    }

    /// Interpolated position at `t`, clamped to the command's interval.
    pub fn position_at(&self, t: Time) -> Coordinate {
        if t <= self.start_time || self.start_time == self.end_time {
            return self.start_pos;
        }
        if t >= self.end_time {
            return self.end_pos;
        }
        let elapsed = u64::from(t.0 - self.start_time.0);
        let span = u64::from(self.end_time.0 - self.start_time.0);
        self.start_pos.lerp(self.end_pos, elapsed, span)
    }

    /// The same movement restricted to `[from, to]`, which must lie inside
    /// the command's interval.
    pub fn clip(&self, from: Time, to: Time) -> Command {
        Command {
            start_time: from,
            end_time: to,
            start_pos: self.position_at(from),
            end_pos: self.position_at(to),
            present: self.present,
        }
    }
}

/// Set of protocol major versions. Version `n` is bit `n`, counted from the
/// high bit of the byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionSet(pub u8);

impl VersionSet {
    /// Versions this implementation speaks.
    pub const SUPPORTED: VersionSet = VersionSet::single(1);

    pub const fn single(version: u8) -> Self {
        debug_assert!(version >= 1 && version <= 8);
        VersionSet(0x80 >> (version - 1))
    }

    pub fn contains(self, version: u8) -> bool {
        (1..=8).contains(&version) && self.0 & (0x80 >> (version - 1)) != 0
    }

    pub fn intersect(self, other: VersionSet) -> VersionSet {
        VersionSet(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Exactly one version present (the state after negotiation).
    pub fn is_single(self) -> bool {
        self.0.count_ones() == 1
    }

    /// Highest version number present, if any.
    pub fn highest(self) -> Option<u8> {
        if self.is_empty() {
            None
        } else {
            // Highest version is the lowest-order set bit.
            Some(8 - self.0.trailing_zeros() as u8)
        }
    }
}

impl fmt::Display for VersionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010b}", self.0)
    }
}

/// Optional protocol capabilities negotiated at connect time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantFlags(pub u32);

impl VariantFlags {
    pub const NONE: VariantFlags = VariantFlags(0);
    pub const THREE_DIMENSIONS: VariantFlags = VariantFlags(0x8000_0000);
    pub const ADD_REMOVE: VariantFlags = VariantFlags(0x4000_0000);
    /// Every flag this implementation understands.
    pub const KNOWN: VariantFlags = VariantFlags(0xC000_0000);

    pub fn contains(self, flag: VariantFlags) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub fn with(self, flag: VariantFlags) -> VariantFlags {
        VariantFlags(self.0 | flag.0)
    }

    /// Drop reserved bits.
    pub fn recognized(self) -> VariantFlags {
        VariantFlags(self.0 & Self::KNOWN.0)
    }

    pub fn three_dimensions(self) -> bool {
        self.contains(Self::THREE_DIMENSIONS)
    }

    pub fn add_remove(self) -> bool {
        self.contains(Self::ADD_REMOVE)
    }

    /// Build from the two booleans used in configuration files.
    pub fn from_options(three_dimensions: bool, add_remove: bool) -> VariantFlags {
        let mut flags = VariantFlags::NONE;
        if three_dimensions {
            flags = flags.with(Self::THREE_DIMENSIONS);
        }
        if add_remove {
            flags = flags.with(Self::ADD_REMOVE);
        }
        flags
    }

    /// Size in bytes of one location reply under these variants.
    pub fn reply_len(self) -> usize {
        let coords = if self.three_dimensions() { 3 } else { 2 };
        4 + 4 * coords + usize::from(self.add_remove())
    }
}

impl fmt::Display for VariantFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.three_dimensions() {
            names.push("THREE_DIMENSIONS");
        }
        if self.add_remove() {
            names.push("ADD_REMOVE");
        }
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Which of the two protocol families a connection speaks. The family is
/// identified by the magic that opens the Hello message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    /// Unidirectional mobility delivery.
    #[default]
    Uamp,
    /// Mobility delivery plus client-reported state changes.
    Mvisp,
}

impl ProtocolFamily {
    pub fn magic(self) -> [u8; 4] {
        match self {
            ProtocolFamily::Uamp => *b"UAMP",
            ProtocolFamily::Mvisp => *b"MVIS",
        }
    }

    pub fn reports_state(self) -> bool {
        matches!(self, ProtocolFamily::Mvisp)
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolFamily::Uamp => write!(f, "UAMP"),
            ProtocolFamily::Mvisp => write!(f, "MVISP"),
        }
    }
}

/// Outcome of a successful handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Negotiated {
    pub family: ProtocolFamily,
    pub version: u8,
    pub variants: VariantFlags,
}

/// The simulation a client asked for, as read off the wire (unvalidated).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub num_agents: u32,
    pub time_limit: Time,
    pub seed: u32,
}

/// Accepted simulation parameters. Immutable for the rest of the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParameters {
    num_agents: u32,
    time_limit: Time,
    seed: u32,
}

impl SessionParameters {
    pub fn new(num_agents: u32, time_limit: Time, seed: u32) -> Result<Self, ProtocolError> {
        if num_agents == 0 {
            return Err(ProtocolError::ProtocolViolation(
                "a session needs at least one agent".into(),
            ));
        }
        Ok(Self {
            num_agents,
            time_limit,
            seed,
        })
    }

    pub fn num_agents(&self) -> u32 {
        self.num_agents
    }

    pub fn time_limit(&self) -> Time {
        self.time_limit
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    pub fn contains(&self, agent: AgentId) -> bool {
        agent.0 < self.num_agents
    }

    /// Iterate over every agent of the session.
    pub fn agents(&self) -> impl Iterator<Item = AgentId> + use<> {
        (0..self.num_agents).map(AgentId)
    }

    pub fn as_request(&self) -> SimulationRequest {
        SimulationRequest {
            num_agents: self.num_agents,
            time_limit: self.time_limit,
            seed: self.seed,
        }
    }
}

impl TryFrom<SimulationRequest> for SessionParameters {
    type Error = ProtocolError;

    fn try_from(req: SimulationRequest) -> Result<Self, Self::Error> {
        SessionParameters::new(req.num_agents, req.time_limit, req.seed)
    }
}

/// A client-reported change of an agent's state (MVISP only).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub agent: AgentId,
    pub time: Time,
    pub state_index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_bits_count_from_high_bit() {
        assert_eq!(VersionSet::single(1), VersionSet(0x80));
        assert_eq!(VersionSet::single(2), VersionSet(0x40));
        assert!(VersionSet(0xC0).contains(2));
        assert!(!VersionSet(0x80).contains(2));
    }

    #[test]
    fn highest_version_is_lowest_order_bit() {
        assert_eq!(VersionSet(0xE0).highest(), Some(3));
        assert_eq!(VersionSet(0x80).highest(), Some(1));
        assert_eq!(VersionSet(0x01).highest(), Some(8));
        assert_eq!(VersionSet(0).highest(), None);
    }

    #[test]
    fn variant_flags_ignore_reserved_bits() {
        let flags = VariantFlags(0x8000_0001 | 0x0F00_0000);
        assert_eq!(flags.recognized(), VariantFlags::THREE_DIMENSIONS);
        assert!(flags.three_dimensions());
        assert!(!flags.add_remove());
    }

    #[test]
    fn reply_len_per_variant() {
        assert_eq!(VariantFlags::NONE.reply_len(), 12);
        assert_eq!(VariantFlags::THREE_DIMENSIONS.reply_len(), 16);
        assert_eq!(VariantFlags::ADD_REMOVE.reply_len(), 13);
        assert_eq!(VariantFlags::KNOWN.reply_len(), 17);
    }

    #[test]
    fn time_from_millis_rejects_overflow() {
        assert_eq!(Time::from_millis(5000).unwrap(), Time(5000));
        assert!(matches!(
            Time::from_millis(u64::from(u32::MAX) + 1),
            Err(ProtocolError::MalformedValue(_))
        ));
    }

    #[test]
    fn coordinate_from_mm_rejects_negative() {
        assert!(Coordinate::from_mm(1, 2, 3).is_ok());
        assert!(matches!(
            Coordinate::from_mm(-1, 2, 0),
            Err(ProtocolError::MalformedValue(_))
        ));
        assert!(Coordinate::from_mm(0, i64::from(u32::MAX) + 1, 0).is_err());
    }

    #[test]
    fn session_parameters_need_agents() {
        assert!(SessionParameters::new(0, Time(10), 1).is_err());
        let params = SessionParameters::new(3, Time(10), 1).unwrap();
        assert!(params.contains(AgentId(2)));
        assert!(!params.contains(AgentId(3)));
        assert_eq!(params.agents().count(), 3);
    }

    #[test]
    fn command_interpolates_in_integers() {
        let cmd = Command {
            start_time: Time(1000),
            end_time: Time(2000),
            start_pos: Coordinate::flat(0, 0),
            end_pos: Coordinate::flat(1000, 500),
            present: true,
        };
        assert_eq!(cmd.position_at(Time(1500)), Coordinate::flat(500, 250));
        assert_eq!(cmd.position_at(Time(0)), Coordinate::flat(0, 0));
        assert_eq!(cmd.position_at(Time(9000)), Coordinate::flat(1000, 500));
    }

    #[test]
    fn command_interpolates_backwards() {
        let cmd = Command {
            start_time: Time(0),
            end_time: Time(100),
            start_pos: Coordinate::flat(1000, 1000),
            end_pos: Coordinate::flat(0, 1000),
            present: true,
        };
        assert_eq!(cmd.position_at(Time(25)), Coordinate::flat(750, 1000));
    }

    #[test]
    fn clip_keeps_trajectory() {
        let cmd = Command {
            start_time: Time(0),
            end_time: Time(400),
            start_pos: Coordinate::flat(0, 0),
            end_pos: Coordinate::flat(400, 0),
            present: true,
        };
        let clipped = cmd.clip(Time(100), Time(300));
        assert_eq!(clipped.start_pos, Coordinate::flat(100, 0));
        assert_eq!(clipped.end_pos, Coordinate::flat(300, 0));
        assert_eq!(clipped.start_time, Time(100));
    }

    #[test]
    fn distance_is_euclidean() {
        let a = Coordinate::flat(0, 0);
        let b = Coordinate::flat(3000, 4000);
        assert_eq!(a.distance_mm(b), 5000);
    }

    #[test]
    fn distance_spans_whole_axis_range() {
        let origin = Coordinate::default();
        let far = Coordinate::new(u32::MAX, u32::MAX, u32::MAX);
        assert_eq!(origin.distance_mm(far), 7_439_101_571);
        assert_eq!(far.distance_mm(origin), 7_439_101_571);
        assert_eq!(origin.distance_mm(Coordinate::flat(u32::MAX, u32::MAX)), 6_074_000_998);
    }

    #[test]
    fn family_magic() {
        assert_eq!(&ProtocolFamily::Uamp.magic(), b"UAMP");
        assert_eq!(&ProtocolFamily::Mvisp.magic(), b"MVIS");
        let json = serde_json::to_string(&ProtocolFamily::Mvisp).unwrap();
        assert_eq!(json, "\"mvisp\"");
    }
}

// Mobility models: the server's source of waypoints.
//
// The connection state machine does not compute movement itself. It asks a
// `MobilityModel` for one `AgentSimulator` per session and then calls
// `advance_agent` once per reply. Two models are provided:
//
// - `RandomWaypoint`: the reference pedestrian model. Each agent picks a
//   uniformly random destination, walks there in a straight line at a random
//   speed, pauses, and repeats. With `ADD_REMOVE` negotiated an agent may
//   leave the area on arrival and re-enter somewhere else after a random
//   absence. Everything is integer arithmetic.
// - `ScriptedModel`: fixed per-agent waypoint scripts, for tests and demos.
//
// Determinism: each agent owns its own `AgentRng` seeded from
// `(mixed_seed, agent)`, and nothing an agent does depends on the number of
// agents in the session or on the time limit. The time limit only clips: when
// the next event would fall at or after it, the simulator returns the
// agent's interpolated position at the limit instead. So the position of agent
// `n` at time `t` is the same in every session with the same seed that has
// more than `n` agents and a limit of at least `t`.

use std::collections::BTreeMap;

use ambler_prng::AgentRng;
use ambler_protocol::{AgentId, Coordinate, SessionParameters, Time, VariantFlags, Waypoint};

use crate::config::MobilityConfig;

/// Produces per-session simulators.
pub trait MobilityModel: Send + Sync {
    fn spawn(
        &self,
        params: &SessionParameters,
        variants: VariantFlags,
        mixed_seed: u64,
    ) -> Box<dyn AgentSimulator>;
}

/// Simulates the agents of one session.
pub trait AgentSimulator: Send {
    /// Advance `agent` to its next event. The first call for an agent
    /// returns its waypoint at time 0; the call that reaches the session's
    /// time limit returns the waypoint at exactly the limit, after which the
    /// agent is never advanced again.
    fn advance_agent(&mut self, agent: AgentId) -> Waypoint;
}

/// A proposed next event. Its time is kept wide so events past the end of
/// the `Time` range can still be clipped correctly.
#[derive(Clone, Copy, Debug)]
struct Candidate {
    time_ms: u64,
    pos: Coordinate,
    present: bool,
}

impl From<Waypoint> for Candidate {
    fn from(w: Waypoint) -> Self {
        Self {
            time_ms: u64::from(w.time.0),
            pos: w.pos,
            present: w.present,
        }
    }
}

/// The waypoint to emit for `next` following `last`. An event at or past
/// `limit` becomes the interpolated position at exactly `limit`.
fn clip_to_limit(last: &Waypoint, next: Candidate, limit: Time) -> Waypoint {
    if next.time_ms <= u64::from(limit.0) {
        return Waypoint {
            time: Time(next.time_ms as u32),
            pos: next.pos,
            present: next.present,
        };
    }
    let start = u64::from(last.time.0);
    Waypoint {
        time: limit,
        pos: last
            .pos
            .lerp(next.pos, u64::from(limit.0) - start, next.time_ms - start),
        present: last.present,
    }
}

fn after(t: Time, ms: u64) -> u64 {
    u64::from(t.0) + ms
}

// ---------------------------------------------------------------------------
// Random waypoint
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct RandomWaypoint {
    config: MobilityConfig,
}

impl RandomWaypoint {
    pub fn new(config: MobilityConfig) -> Self {
        Self { config }
    }
}

impl MobilityModel for RandomWaypoint {
    fn spawn(
        &self,
        params: &SessionParameters,
        variants: VariantFlags,
        mixed_seed: u64,
    ) -> Box<dyn AgentSimulator> {
        Box::new(RandomWaypointSession {
            config: self.config.clone(),
            three_dimensions: variants.three_dimensions(),
            add_remove: variants.add_remove(),
            time_limit: params.time_limit(),
            mixed_seed,
            walkers: BTreeMap::new(),
        })
    }
}

/// What the walker did last, which decides what it does next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Standing at a destination (or the start point).
    Arrived,
    /// Finished pausing; walks next.
    Paused,
    /// Out of the area; re-enters next.
    Absent,
}

struct Walker {
    rng: AgentRng,
    last: Waypoint,
    phase: Phase,
}

struct RandomWaypointSession {
    config: MobilityConfig,
    three_dimensions: bool,
    add_remove: bool,
    time_limit: Time,
    mixed_seed: u64,
    // Walkers are created on first request, so sessions with many agents
    // only pay for the ones a client asks about.
    walkers: BTreeMap<AgentId, Walker>,
}

impl RandomWaypointSession {
    fn random_position(&self, rng: &mut AgentRng) -> Coordinate {
        let z = if self.three_dimensions {
            rng.range_u32_inclusive(0, self.config.area_height_mm)
        } else {
            0
        };
        Coordinate {
            x: rng.range_u32_inclusive(0, self.config.area_width_mm),
            y: rng.range_u32_inclusive(0, self.config.area_depth_mm),
            z,
        }
    }

    fn next_event(&self, walker: &mut Walker) -> Candidate {
        let cfg = &self.config;
        let last = walker.last;
        loop {
            match walker.phase {
                Phase::Arrived => {
                    walker.phase = Phase::Paused;
                    let pause = walker.rng.range_u32_inclusive(cfg.min_pause_ms, cfg.max_pause_ms);
                    if pause > 0 {
                        return Candidate {
                            time_ms: after(last.time, u64::from(pause)),
                            ..Candidate::from(last)
                        };
                    }
                }
                Phase::Paused => {
                    let dest = self.random_position(&mut walker.rng);
                    let speed = walker
                        .rng
                        .range_u32_inclusive(cfg.min_speed_mm_per_s, cfg.max_speed_mm_per_s);
                    let travel_ms = last.pos.distance_mm(dest) * 1000 / u64::from(speed.max(1));
                    let leaves = self.add_remove && walker.rng.chance_per_mille(cfg.absence_per_mille);
                    walker.phase = if leaves { Phase::Absent } else { Phase::Arrived };
                    return Candidate {
                        time_ms: after(last.time, travel_ms.max(1)),
                        pos: dest,
                        present: !leaves,
                    };
                }
                Phase::Absent => {
                    let away = walker.rng.range_u32_inclusive(cfg.min_absence_ms, cfg.max_absence_ms);
                    let pos = self.random_position(&mut walker.rng);
                    walker.phase = Phase::Arrived;
                    return Candidate {
                        time_ms: after(last.time, u64::from(away.max(1))),
                        pos,
                        present: true,
                    };
                }
            }
        }
    }
}

impl AgentSimulator for RandomWaypointSession {
    fn advance_agent(&mut self, agent: AgentId) -> Waypoint {
        let Some(mut walker) = self.walkers.remove(&agent) else {
            let mut rng = AgentRng::for_agent(self.mixed_seed, agent.0);
            let start = Waypoint {
                time: Time::ZERO,
                pos: self.random_position(&mut rng),
                present: true,
            };
            self.walkers.insert(
                agent,
                Walker {
                    rng,
                    last: start,
                    phase: Phase::Arrived,
                },
            );
            return start;
        };
        let next = self.next_event(&mut walker);
        let emitted = clip_to_limit(&walker.last, next, self.time_limit);
        walker.last = emitted;
        self.walkers.insert(agent, walker);
        emitted
    }
}

// ---------------------------------------------------------------------------
// Scripted
// ---------------------------------------------------------------------------

/// Replays fixed waypoint lists. Agents without a script stand still at the
/// origin. A script's first waypoint should be at time 0; once a script is
/// exhausted the agent stays at its last position until the time limit.
#[derive(Clone, Debug, Default)]
pub struct ScriptedModel {
    scripts: BTreeMap<AgentId, Vec<Waypoint>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, agent: AgentId, waypoints: Vec<Waypoint>) -> Self {
        self.scripts.insert(agent, waypoints);
        self
    }
}

impl MobilityModel for ScriptedModel {
    fn spawn(
        &self,
        params: &SessionParameters,
        _variants: VariantFlags,
        _mixed_seed: u64,
    ) -> Box<dyn AgentSimulator> {
        Box::new(ScriptedSession {
            scripts: self.scripts.clone(),
            time_limit: params.time_limit(),
            progress: BTreeMap::new(),
        })
    }
}

struct ScriptedSession {
    scripts: BTreeMap<AgentId, Vec<Waypoint>>,
    time_limit: Time,
    /// Per agent: next script index and the last emitted waypoint.
    progress: BTreeMap<AgentId, (usize, Waypoint)>,
}

impl AgentSimulator for ScriptedSession {
    fn advance_agent(&mut self, agent: AgentId) -> Waypoint {
        let script = self.scripts.get(&agent).map(Vec::as_slice).unwrap_or(&[]);
        let (index, last) = match self.progress.get(&agent) {
            Some(&(index, last)) => (index, Some(last)),
            None => (0, None),
        };
        let candidate = script.get(index).copied();
        let emitted = match (last, candidate) {
            (None, Some(first)) => first,
            (None, None) => Waypoint {
                time: Time::ZERO,
                pos: Coordinate::default(),
                present: true,
            },
            (Some(last), Some(next)) => clip_to_limit(&last, next.into(), self.time_limit),
            (Some(last), None) => Waypoint {
                time: self.time_limit,
                ..last
            },
        };
        self.progress.insert(agent, (index + 1, emitted));
        emitted
    }
}

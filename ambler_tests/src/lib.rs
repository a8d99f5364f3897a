// Test-only harness for end-to-end mobility tests.
//
// Starts a real server (`ambler_net::start_server_with`) on an ephemeral
// port with test collaborators: a caller-chosen mobility model, the
// passthrough seed mixer, and an in-memory `StateLog`. Clients connect with
// the real `MobilityClient`, so every byte goes through the same code paths
// as the binaries. The only test-specific code is the setup and the
// collect-everything helpers below.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use ambler_net::{
    ClientConfig, CommandBuffer, MobilityClient, MobilityModel, ServerConfig, ServerHandle,
    ServerServices, StateLog, Synchronizer, start_server_with,
};
use ambler_prng::PassthroughMixer;
use ambler_protocol::{
    AgentId, Command, Coordinate, ProtocolFamily, SimulationRequest, StateRecord, Time, Waypoint,
};

/// Socket timeout for test servers and clients. Long enough for slow CI,
/// short enough that a hung test fails instead of blocking forever.
pub const IO_TIMEOUT_MS: u64 = 5_000;

/// Server config for tests: ephemeral port, short timeouts.
pub fn server_config(family: ProtocolFamily) -> ServerConfig {
    ServerConfig {
        port: 0,
        family,
        io_timeout_ms: IO_TIMEOUT_MS,
        ..ServerConfig::default()
    }
}

/// Client config for tests: supports every variant, short timeouts.
pub fn client_config(family: ProtocolFamily) -> ClientConfig {
    ClientConfig {
        family,
        io_timeout_ms: IO_TIMEOUT_MS,
        ..ClientConfig::default()
    }
}

pub fn request(num_agents: u32, time_limit_ms: u32, seed: u32) -> SimulationRequest {
    SimulationRequest {
        num_agents,
        time_limit: Time(time_limit_ms),
        seed,
    }
}

/// A 2D, present waypoint.
pub fn wp(time_ms: u32, x: u32, y: u32) -> Waypoint {
    Waypoint {
        time: Time(time_ms),
        pos: Coordinate::flat(x, y),
        present: true,
    }
}

/// A running test server. Stopped on drop.
pub struct TestServer {
    handle: Option<ServerHandle>,
    pub addr: SocketAddr,
    pub states: Arc<StateLog>,
}

impl TestServer {
    pub fn start(config: ServerConfig, model: impl MobilityModel + 'static) -> Self {
        let states = Arc::new(StateLog::new());
        let services = ServerServices {
            model: Arc::new(model),
            mixer: Arc::new(PassthroughMixer),
            sink: states.clone(),
        };
        let (handle, addr) = start_server_with(config, services).expect("start_server_with failed");
        Self {
            handle: Some(handle),
            addr,
            states,
        }
    }

    /// Connect and open a session, returning the error instead of panicking.
    pub fn try_connect(
        &self,
        config: &ClientConfig,
        request: SimulationRequest,
        states: Option<StateRecord>,
    ) -> ambler_protocol::Result<MobilityClient> {
        MobilityClient::connect(self.addr, config, request, states)
    }

    pub fn connect(
        &self,
        config: &ClientConfig,
        request: SimulationRequest,
        states: Option<StateRecord>,
    ) -> MobilityClient {
        self.try_connect(config, request, states)
            .expect("MobilityClient::connect failed")
    }

    /// A bare socket for tests that speak the protocol by hand.
    pub fn raw(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).expect("raw connect failed");
        stream
            .set_read_timeout(Some(Duration::from_millis(IO_TIMEOUT_MS)))
            .expect("set_read_timeout failed");
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.stop();
        }
    }
}

/// Every command of every agent, agent by agent, through a `CommandBuffer`.
/// Returns the commands and the buffer (for terminating the client).
pub fn collect_per_agent(
    client: MobilityClient,
    prefetch_depth: u32,
) -> (Vec<Vec<Command>>, CommandBuffer<MobilityClient>) {
    let mut buffer = CommandBuffer::new(client, prefetch_depth);
    let agents: Vec<AgentId> = buffer.params().agents().collect();
    let mut all = Vec::with_capacity(agents.len());
    for agent in agents {
        let mut commands = Vec::new();
        while buffer.has_more(agent) {
            commands.push(buffer.advance(agent).expect("advance failed"));
        }
        all.push(commands);
    }
    (all, buffer)
}

/// The synchronized timeline: one entry per slice, holding every agent's
/// clipped command for that slice.
pub fn collect_synchronized(
    client: MobilityClient,
    prefetch_depth: u32,
) -> (Vec<Vec<Command>>, CommandBuffer<MobilityClient>) {
    let buffer = CommandBuffer::new(client, prefetch_depth);
    let agents: Vec<AgentId> = buffer.params().agents().collect();
    let mut sync = Synchronizer::new(buffer).expect("Synchronizer::new failed");
    let mut slices = Vec::new();
    loop {
        let slice = agents
            .iter()
            .map(|&a| sync.intersect_command(a).expect("agent has no command"))
            .collect();
        slices.push(slice);
        if !sync.has_any_more() {
            break;
        }
        sync.advance_oldest().expect("advance_oldest failed");
    }
    (slices, sync.into_buffer())
}

/// Stable text form of a command list, for comparing whole runs.
pub fn to_json(commands: &[Vec<Command>]) -> String {
    serde_json::to_string(commands).expect("serialize commands failed")
}

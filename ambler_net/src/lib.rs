// ambler_net: mobility server and client runtime for UAMP/MVISP.
//
// Builds the two ends of a connection on top of `ambler_protocol`, using
// blocking `std::net` sockets and one thread per connection.
//
// Module overview:
// - `config.rs`:        `ServerConfig`, `ClientConfig`, `MobilityConfig`
//                       (serde, JSON files) and `ConfigError`.
// - `mobility.rs`:      `MobilityModel` / `AgentSimulator` collaborator traits,
//                       the `RandomWaypoint` reference model, `ScriptedModel`.
// - `connection.rs`:    Server-side connection state machine and the reply
//                       stream (time-limit cache, model output checks).
// - `server.rs`:        Listener thread, `start_server`, `ServerHandle`.
// - `client.rs`:        `MobilityClient` (negotiation, location requests,
//                       reply ordering checks, state reporting) and the
//                       `WaypointSource` trait.
// - `buffer.rs`:        `CommandBuffer`, per-agent command queues with
//                       prefetch.
// - `synchronizer.rs`:  `Synchronizer`, the cross-agent timeline.
// - `state_channel.rs`: `StateReporter` batching and the `StateSink`
//                       implementations.
//
// The binaries `ambler-server` and `ambler-client` wrap `start_server` and
// `MobilityClient` with CLI flags and `tracing-subscriber` logging.

pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod mobility;
pub mod server;
pub mod state_channel;
pub mod synchronizer;

pub use buffer::CommandBuffer;
pub use client::{MobilityClient, ReplyValidator, WaypointSource};
pub use config::{ClientConfig, ConfigError, MobilityConfig, ServerConfig, VariantOptions};
pub use connection::{ConnectionError, ModelFault, ReplyStream, ServerServices, SessionEnd};
pub use mobility::{AgentSimulator, MobilityModel, RandomWaypoint, ScriptedModel};
pub use server::{ServerHandle, start_server, start_server_with};
pub use state_channel::{AppliedState, StateLog, StateReporter, StateSink, TracingStateSink};
pub use synchronizer::Synchronizer;

/// Install a `tracing` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Used by the binaries.
pub fn init_logging(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

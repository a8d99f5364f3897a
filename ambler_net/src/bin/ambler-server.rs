// CLI entry point for the mobility server.
//
// Loads a `ServerConfig` (JSON file, optional), applies command-line
// overrides, and serves the reference random-waypoint model until the
// process is killed. See `server.rs` for the threading model and
// `connection.rs` for the per-connection protocol.
//
// Usage:
//   ambler-server [--config server.json] [--port 7411] [--family mvisp]
//                 [--three-dimensions] [--add-remove] ...
//
// Logging goes to stderr; `RUST_LOG` overrides the default `info` filter.

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use ambler_net::{ServerConfig, init_logging, start_server};
use ambler_protocol::ProtocolFamily;
use clap::{Parser, ValueEnum};
use tracing::{error, info};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Family {
    Uamp,
    Mvisp,
}

impl From<Family> for ProtocolFamily {
    fn from(f: Family) -> Self {
        match f {
            Family::Uamp => ProtocolFamily::Uamp,
            Family::Mvisp => ProtocolFamily::Mvisp,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "ambler-server", about = "Serve synthetic pedestrian mobility over UAMP/MVISP", version)]
struct Cli {
    /// JSON config file. Flags below override its values.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to bind.
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (0 picks a free port).
    #[arg(long)]
    port: Option<u16>,

    #[arg(long, value_enum)]
    family: Option<Family>,

    /// Require clients to support 3D coordinates.
    #[arg(long)]
    three_dimensions: bool,

    /// Require clients to support agent add/remove.
    #[arg(long)]
    add_remove: bool,

    #[arg(long)]
    max_agents: Option<u32>,

    #[arg(long, value_name = "MS")]
    max_time_limit_ms: Option<u32>,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig, ambler_net::ConfigError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_json_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(family) = self.family {
            config.family = family.into();
        }
        config.variants.three_dimensions |= self.three_dimensions;
        config.variants.add_remove |= self.add_remove;
        if let Some(max) = self.max_agents {
            config.max_agents = max;
        }
        if let Some(max) = self.max_time_limit_ms {
            config.max_time_limit_ms = max;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    init_logging("info");
    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "bad configuration");
            return ExitCode::FAILURE;
        }
    };

    let family = config.family;
    let variants = config.variants.flags();
    let (handle, addr) = match start_server(config) {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "failed to start server");
            return ExitCode::FAILURE;
        }
    };
    info!(%addr, %family, %variants, "ready; stop with Ctrl+C");

    // The process exits on SIGINT/SIGTERM; connection threads go with it.
    while handle.is_running() {
        thread::sleep(Duration::from_millis(200));
    }
    error!("listener exited unexpectedly");
    ExitCode::FAILURE
}

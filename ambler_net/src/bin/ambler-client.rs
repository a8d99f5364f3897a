// CLI mobility client: fetches a whole session and prints it as JSON lines.
//
// Two output modes:
// - `per-agent`: every command of agent 0, then agent 1, ... One line per
//   command: `{"agent":0,"start_time":0,"end_time":1200,...}`.
// - `sync`: the synchronized timeline. One line per agent per slice, slices
//   in time order, each clipped to the common interval.
//
// For MVISP (`--family mvisp`) a state list must be given with `--states`;
// the client announces it but reports no state changes.
//
// Usage:
//   ambler-client 127.0.0.1:7411 --agents 10 --time-limit-ms 60000 --seed 42

use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use ambler_net::{ClientConfig, CommandBuffer, MobilityClient, Synchronizer, init_logging};
use ambler_protocol::{AgentId, Command, ProtocolFamily, SimulationRequest, StateRecord, Time};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::error;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Family {
    Uamp,
    Mvisp,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum Mode {
    #[default]
    PerAgent,
    Sync,
}

#[derive(Parser, Debug)]
#[command(name = "ambler-client", about = "Fetch a mobility session and print it as JSON lines", version)]
struct Cli {
    /// Server address, e.g. 127.0.0.1:7411.
    addr: String,

    /// JSON config file. Flags below override its values.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    family: Option<Family>,

    #[arg(long, default_value_t = 1)]
    agents: u32,

    #[arg(long, value_name = "MS", default_value_t = 60_000)]
    time_limit_ms: u32,

    #[arg(long, default_value_t = 0)]
    seed: u32,

    #[arg(long, value_enum, default_value_t = Mode::PerAgent)]
    mode: Mode,

    /// Comma-separated state names (MVISP).
    #[arg(long, value_delimiter = ',')]
    states: Vec<String>,

    #[arg(long)]
    prefetch_depth: Option<u32>,

    /// Most agent IDs per LocationRequest. Keep at or below the server's limit.
    #[arg(long)]
    max_request_entries: Option<u32>,
}

#[derive(Serialize)]
struct Line {
    agent: AgentId,
    #[serde(flatten)]
    command: Command,
}

fn main() -> ExitCode {
    init_logging("warn");
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "client failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(family) = cli.family {
        config.family = match family {
            Family::Uamp => ProtocolFamily::Uamp,
            Family::Mvisp => ProtocolFamily::Mvisp,
        };
    }
    if let Some(depth) = cli.prefetch_depth {
        config.prefetch_depth = depth;
    }
    if let Some(max) = cli.max_request_entries {
        config.max_request_entries = max;
    }
    config.validate()?;

    let states = if config.family.reports_state() {
        Some(StateRecord::new(cli.states)?)
    } else {
        None
    };
    let request = SimulationRequest {
        num_agents: cli.agents,
        time_limit: Time(cli.time_limit_ms),
        seed: cli.seed,
    };
    let client = MobilityClient::connect(cli.addr.as_str(), &config, request, states)?;
    let buffer = CommandBuffer::new(client, config.prefetch_depth);
    let mut out = BufWriter::new(io::stdout().lock());

    let buffer = match cli.mode {
        Mode::PerAgent => print_per_agent(buffer, &mut out)?,
        Mode::Sync => print_synchronized(buffer, &mut out)?,
    };
    out.flush()?;
    buffer.into_source().terminate()?;
    Ok(())
}

fn emit<W: Write>(out: &mut W, agent: AgentId, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    serde_json::to_writer(&mut *out, &Line { agent, command })?;
    out.write_all(b"\n")?;
    Ok(())
}

fn print_per_agent<W: Write>(
    mut buffer: CommandBuffer<MobilityClient>,
    out: &mut W,
) -> Result<CommandBuffer<MobilityClient>, Box<dyn std::error::Error>> {
    let agents: Vec<AgentId> = buffer.params().agents().collect();
    for agent in agents {
        while buffer.has_more(agent) {
            let command = buffer.advance(agent)?;
            emit(out, agent, command)?;
        }
    }
    Ok(buffer)
}

fn print_synchronized<W: Write>(
    buffer: CommandBuffer<MobilityClient>,
    out: &mut W,
) -> Result<CommandBuffer<MobilityClient>, Box<dyn std::error::Error>> {
    let agents: Vec<AgentId> = buffer.params().agents().collect();
    let mut sync = Synchronizer::new(buffer)?;
    loop {
        for &agent in &agents {
            if let Some(command) = sync.intersect_command(agent) {
                emit(out, agent, command)?;
            }
        }
        if !sync.has_any_more() {
            break;
        }
        sync.advance_oldest()?;
    }
    Ok(sync.into_buffer())
}

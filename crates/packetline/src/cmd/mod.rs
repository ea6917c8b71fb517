use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Subcommand, ValueEnum};
use packetline::demo::{self, CounterAction};
use packetline_codec::Role;
use packetline_engine::{EngineConfig, PacketEngine};
use packetline_transport::{TcpTransport, Transport};

use crate::exit::{
    codec_error, engine_error, io_error, transport_error, CliError, CliResult, FAILURE, INTERNAL,
    USAGE,
};
use crate::output::OutputFormat;

pub mod chat;
pub mod request;
pub mod serve;
pub mod version;

const PUMP_SLEEP: Duration = Duration::from_millis(1);

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept clients, answer counter requests and echo chat messages.
    Serve(ServeArgs),
    /// Send acknowledged counter requests and print the responses.
    Request(RequestArgs),
    /// Send a chat message.
    Chat(ChatArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Request(args) => request::run(args, format),
        Command::Chat(args) => chat::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to listen on.
    #[arg(default_value = "127.0.0.1:4200")]
    pub addr: String,
    /// Amount each increment or decrement moves the counter.
    #[arg(long, default_value_t = demo::DEFAULT_STEP)]
    pub step: u32,
    /// Stop accepting after N clients and exit once they disconnect.
    #[arg(long)]
    pub max_clients: Option<usize>,
    /// Stop a session on the first undecodable packet instead of skipping it.
    #[arg(long)]
    pub strict: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum ActionArg {
    Incr,
    Decr,
    Get,
}

impl From<ActionArg> for CounterAction {
    fn from(action: ActionArg) -> Self {
        match action {
            ActionArg::Incr => CounterAction::Increment,
            ActionArg::Decr => CounterAction::Decrement,
            ActionArg::Get => CounterAction::Get,
        }
    }
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Server address.
    pub addr: String,
    /// Counter action to request.
    #[arg(long, short = 'a', value_enum, default_value = "incr")]
    pub action: ActionArg,
    /// Number of requests to send, one after another.
    #[arg(long, short = 'n', default_value_t = 1)]
    pub repeat: usize,
    /// Time to wait for a response before re-sending (e.g. 1s, 250ms).
    #[arg(long, default_value = "1s")]
    pub timeout: String,
    /// Re-sends before giving up.
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    /// Server address.
    pub addr: String,
    /// Message text.
    #[arg(long, short = 'm')]
    pub message: String,
    /// Wait for the server to echo the message and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the echo when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

pub fn resolve_addr(addr: &str) -> CliResult<SocketAddr> {
    addr.to_socket_addrs()
        .map_err(|err| io_error(&format!("cannot resolve {addr}"), err))?
        .next()
        .ok_or_else(|| CliError::new(USAGE, format!("{addr} resolved to no address")))
}

/// Dial `addr` and start a client engine over the demo codec.
pub fn connect_engine(addr: SocketAddr, thread_name: &str) -> CliResult<PacketEngine> {
    let transport = TcpTransport::new(addr);
    transport
        .connect()
        .map_err(|err| transport_error("connect failed", err))?;
    let codec = demo::codec(Role::Client).map_err(|err| codec_error("codec setup failed", err))?;
    let engine = PacketEngine::with_config(
        transport,
        codec,
        EngineConfig {
            thread_name: thread_name.to_string(),
            ..EngineConfig::default()
        },
    );
    engine
        .start()
        .map_err(|err| engine_error("engine start failed", err))?;
    Ok(engine)
}

/// Stop the engine and close its connection.
pub fn shutdown(engine: PacketEngine) -> CliResult<()> {
    let stopped = engine.stop();
    if engine.transport().is_connected() {
        let _ = engine.transport().disconnect();
    }
    stopped.map_err(|err| engine_error("engine stopped with error", err))
}

/// Dispatch inbound packets on this thread until `done` returns true.
///
/// Returns `Ok(false)` when `deadline` passes first.
pub fn pump_until<F>(engine: &PacketEngine, deadline: Instant, mut done: F) -> CliResult<bool>
where
    F: FnMut() -> bool,
{
    let batch = engine.config().dispatch_batch_size;
    loop {
        engine
            .process_inbound_queue(batch)
            .map_err(|err| engine_error("dispatch failed", err))?;
        if done() {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        if !engine.transport().is_connected() && engine.inbound_len() == 0 {
            return Err(CliError::new(FAILURE, "connection closed by server"));
        }
        thread::sleep(PUMP_SLEEP);
    }
}

pub fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

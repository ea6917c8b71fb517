use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use packetline::demo::{self, ChatPacket, CounterService};
use packetline_ack::ExchangeConfig;
use packetline_codec::Role;
use packetline_engine::{EngineConfig, PacketEngine, Priority};
use packetline_transport::{TcpAcceptor, TcpTransport, Transport};
use tracing::{info, warn};

use crate::cmd::{install_ctrlc_handler, ServeArgs};
use crate::exit::{codec_error, engine_error, transport_error, CliResult, SUCCESS};
use crate::output::{print_chat, OutputFormat};

const ACCEPT_POLL: Duration = Duration::from_millis(25);
const SESSION_IDLE: Duration = Duration::from_millis(1);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let acceptor =
        TcpAcceptor::bind(args.addr.as_str()).map_err(|err| transport_error("bind failed", err))?;
    info!(addr = %acceptor.local_addr(), step = args.step, "serving counter and chat");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let service = Arc::new(CounterService::with_step(args.step));
    let mut sessions: Vec<JoinHandle<()>> = Vec::new();
    let mut accepted = 0usize;

    while running.load(Ordering::SeqCst) {
        if args.max_clients.is_some_and(|max| accepted >= max) {
            break;
        }
        match acceptor.try_accept() {
            Ok(Some(transport)) => {
                accepted += 1;
                sessions.push(spawn_session(
                    transport,
                    Arc::clone(&service),
                    Arc::clone(&running),
                    args.strict,
                    format,
                ));
            }
            Ok(None) => thread::sleep(ACCEPT_POLL),
            Err(err) => return Err(transport_error("accept failed", err)),
        }
        sessions.retain(|session| !session.is_finished());
    }

    for session in sessions {
        let _ = session.join();
    }
    info!(accepted, count = service.count(), "server stopped");
    Ok(SUCCESS)
}

fn spawn_session(
    transport: TcpTransport,
    service: Arc<CounterService>,
    running: Arc<AtomicBool>,
    strict: bool,
    format: OutputFormat,
) -> JoinHandle<()> {
    let peer = transport
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    info!(%peer, "client connected");

    thread::spawn(move || {
        match serve_session(transport, &service, &running, strict, &peer, format) {
            Ok(()) => info!(%peer, "client disconnected"),
            Err(err) => warn!(%peer, code = err.code, error = %err, "session ended with error"),
        }
    })
}

fn serve_session(
    transport: TcpTransport,
    service: &Arc<CounterService>,
    running: &AtomicBool,
    strict: bool,
    peer: &str,
    format: OutputFormat,
) -> CliResult<()> {
    let codec = demo::codec(Role::Server).map_err(|err| codec_error("codec setup failed", err))?;
    let engine = PacketEngine::with_config(
        transport,
        codec,
        EngineConfig {
            strict,
            thread_name: "packetline-serve".to_string(),
            ..EngineConfig::default()
        },
    );

    let _counter = service.serve(&engine, ExchangeConfig::default());

    let logged_peer = peer.to_string();
    engine
        .dispatcher()
        .register_listener(Priority::Highest, move |packet| {
            info!(peer = %logged_peer, ?packet, "received");
            Ok(())
        });

    let outbound = engine.outbound();
    let chat_peer = peer.to_string();
    engine
        .dispatcher()
        .register_handler_for::<ChatPacket, _>(Priority::Normal, move |chat| {
            print_chat(chat, &chat_peer, format);
            outbound.send(chat.clone());
            Ok(true)
        });

    engine
        .start()
        .map_err(|err| engine_error("engine start failed", err))?;

    let batch = engine.config().dispatch_batch_size;
    while running.load(Ordering::SeqCst) && engine.transport().is_connected() {
        match engine.process_inbound_queue(batch) {
            Ok(0) => thread::sleep(SESSION_IDLE),
            Ok(_) => {}
            Err(err) => warn!(%peer, error = %err, "dispatch failed"),
        }
    }
    // Deliver whatever arrived before the connection closed.
    let _ = engine.process_inbound_queue(usize::MAX);

    let stopped = engine.stop();
    if engine.transport().is_connected() {
        let _ = engine.transport().disconnect();
    }
    stopped.map_err(|err| engine_error("session engine failed", err))
}

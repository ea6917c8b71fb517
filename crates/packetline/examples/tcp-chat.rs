//! Chat over TCP: a server thread echoes every message back to the client.
//!
//! Run with:
//!   cargo run --example tcp-chat

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use packetline::codec::Role;
use packetline::demo::{self, ChatPacket};
use packetline::engine::{PacketEngine, Priority};
use packetline::transport::{TcpAcceptor, TcpTransport, Transport};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0")?;
    let addr = acceptor.local_addr();

    let server = thread::spawn(move || -> Result<(), String> {
        let transport = acceptor.accept().map_err(|e| e.to_string())?;
        let codec = demo::codec(Role::Server).map_err(|e| e.to_string())?;
        let engine = PacketEngine::new(transport, codec);
        let outbound = engine.outbound();
        engine
            .dispatcher()
            .register_handler_for::<ChatPacket, _>(Priority::Normal, move |chat| {
                eprintln!("server got {chat}");
                outbound.send(ChatPacket::new(format!("echo: {}", chat.message)));
                Ok(true)
            });
        engine.start().map_err(|e| e.to_string())?;
        while engine.transport().is_connected() {
            if engine.process_inbound_queue(10).map_err(|e| e.to_string())? == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        engine.stop().map_err(|e| e.to_string())
    });

    let transport = TcpTransport::new(addr);
    transport.connect()?;
    let client = PacketEngine::new(transport, demo::codec(Role::Client)?);
    let (tx, rx) = mpsc::channel();
    client
        .dispatcher()
        .register_handler_for::<ChatPacket, _>(Priority::Normal, move |chat| {
            let _ = tx.send(chat.message.clone());
            Ok(true)
        });
    client.start()?;

    for message in ["hello", "packets over tcp"] {
        client.enqueue_outbound(ChatPacket::new(message));
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            client.process_inbound_queue(10)?;
            if let Ok(reply) = rx.try_recv() {
                println!("{reply}");
                break;
            }
            if Instant::now() >= deadline {
                return Err("no echo".into());
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    client.stop()?;
    client.transport().disconnect()?;
    server.join().map_err(|_| "server panicked")??;
    Ok(())
}

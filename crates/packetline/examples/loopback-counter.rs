//! Counter client and server in one process, joined by an in-memory transport.
//!
//! Run with:
//!   cargo run --example loopback-counter

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use packetline::ack::{ExchangeConfig, ReliableExchange};
use packetline::codec::Role;
use packetline::demo::{self, CounterAction, CounterPacket, CounterService};
use packetline::engine::{PacketEngine, Priority};
use packetline::transport::LoopbackTransport;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (client_end, server_end) = LoopbackTransport::pair();
    let client = PacketEngine::new(client_end, demo::codec(Role::Client)?);
    let server = PacketEngine::new(server_end, demo::codec(Role::Server)?);

    let service = Arc::new(CounterService::default());
    let _counter = service.serve(&server, ExchangeConfig::default());
    server
        .dispatcher()
        .register_listener(Priority::Highest, |packet| {
            eprintln!("server received {packet:?}");
            Ok(())
        });

    let exchange = ReliableExchange::<CounterPacket>::attach(&client);
    let _watchdog = exchange.spawn_watchdog(Duration::from_millis(100))?;

    client.start()?;
    server.start()?;

    for action in [
        CounterAction::Increment,
        CounterAction::Increment,
        CounterAction::Decrement,
    ] {
        let mut handle = exchange.request(CounterPacket::request(action));
        let deadline = Instant::now() + Duration::from_secs(5);
        let response = loop {
            server.process_inbound_queue(10)?;
            client.process_inbound_queue(10)?;
            if let Some(result) = handle.try_result() {
                break result?;
            }
            if Instant::now() >= deadline {
                return Err("no response".into());
            }
            thread::sleep(Duration::from_millis(1));
        };
        println!("{action} -> {}", response.count);
    }

    client.stop()?;
    server.stop()?;
    Ok(())
}

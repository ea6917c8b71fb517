use std::time::{Duration, Instant};

use packetline::demo::{CounterAction, CounterPacket};
use packetline_ack::{ExchangeConfig, ExchangeError, ReliableExchange, ResponseHandle};
use packetline_engine::PacketEngine;
use tracing::debug;

use crate::cmd::{connect_engine, parse_duration, pump_until, resolve_addr, shutdown, RequestArgs};
use crate::exit::{exchange_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_counter, OutputFormat};

const MIN_WATCHDOG_INTERVAL: Duration = Duration::from_millis(5);

pub fn run(args: RequestArgs, format: OutputFormat) -> CliResult<i32> {
    if args.repeat == 0 {
        return Err(CliError::new(USAGE, "--repeat must be at least 1"));
    }
    let timeout = parse_duration(&args.timeout)?;
    let addr = resolve_addr(&args.addr)?;
    let action = CounterAction::from(args.action);

    let engine = connect_engine(addr, "packetline-request")?;
    let exchange = ReliableExchange::<CounterPacket>::builder(ExchangeConfig {
        timeout,
        max_retries: args.retries,
        ..ExchangeConfig::default()
    })
    .attach(&engine);
    let watchdog = exchange
        .spawn_watchdog(watchdog_interval(timeout))
        .map_err(|err| exchange_error("watchdog failed", err))?;

    // Every attempt gets a full timeout, plus one more for the final expiry scan.
    let budget = timeout.saturating_mul(args.retries.saturating_add(2));
    for _ in 0..args.repeat {
        let mut handle = exchange.request(CounterPacket::request(action));
        debug!(key = handle.key(), %action, "counter request sent");

        let response = wait_for_response(&engine, &mut handle, Instant::now() + budget)?
            .map_err(|err| exchange_error("request failed", err))?;
        print_counter(action, &response, format);
    }

    drop(watchdog);
    drop(exchange);
    shutdown(engine)?;
    Ok(SUCCESS)
}

fn watchdog_interval(timeout: Duration) -> Duration {
    (timeout / 4).max(MIN_WATCHDOG_INTERVAL)
}

fn wait_for_response(
    engine: &PacketEngine,
    handle: &mut ResponseHandle<CounterPacket>,
    deadline: Instant,
) -> CliResult<Result<CounterPacket, ExchangeError>> {
    let mut outcome = None;
    pump_until(engine, deadline, || {
        outcome = handle.try_result();
        outcome.is_some()
    })?;
    outcome.ok_or_else(|| {
        CliError::new(
            TIMEOUT,
            format!("no response for request {} before deadline", handle.key()),
        )
    })
}

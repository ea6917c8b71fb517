use std::sync::mpsc;
use std::time::Instant;

use packetline::demo::ChatPacket;
use packetline_engine::Priority;

use crate::cmd::{
    connect_engine, parse_duration, pump_until, resolve_addr, shutdown, ChatArgs,
};
use crate::exit::{engine_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::{print_chat, OutputFormat};

pub fn run(args: ChatArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let addr = resolve_addr(&args.addr)?;
    let engine = connect_engine(addr, "packetline-chat")?;

    let (echo_tx, echo_rx) = mpsc::channel();
    if args.wait {
        engine
            .dispatcher()
            .register_handler_for::<ChatPacket, _>(Priority::Normal, move |chat| {
                let _ = echo_tx.send(chat.clone());
                Ok(true)
            });
    }

    engine
        .send_immediately(&ChatPacket::new(args.message))
        .map_err(|err| engine_error("send failed", err))?;

    if args.wait {
        let mut echoed = None;
        pump_until(&engine, Instant::now() + wait_timeout, || {
            echoed = echo_rx.try_recv().ok();
            echoed.is_some()
        })?;
        match echoed {
            Some(chat) => print_chat(&chat, &addr.to_string(), format),
            None => {
                let _ = shutdown(engine);
                return Err(CliError::new(
                    TIMEOUT,
                    format!("no echo within {}", args.wait_timeout),
                ));
            }
        }
    }

    shutdown(engine)?;
    Ok(SUCCESS)
}

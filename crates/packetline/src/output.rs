use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use packetline::demo::{ChatPacket, CounterAction, CounterPacket};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct CounterOutput<'a> {
    kind: &'a str,
    key: u32,
    action: &'a str,
    count: u32,
    timestamp: String,
}

#[derive(Serialize)]
struct ChatOutput<'a> {
    kind: &'a str,
    peer: &'a str,
    size: usize,
    message: &'a str,
    timestamp: String,
}

pub fn print_counter(action: CounterAction, response: &CounterPacket, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = CounterOutput {
                kind: "counter-response",
                key: response.key,
                action: action.as_str(),
                count: response.count,
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KEY", "ACTION", "COUNT"])
                .add_row(vec![
                    response.key.to_string(),
                    action.to_string(),
                    response.count.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "key={} action={} count={}",
                response.key, action, response.count
            );
        }
        OutputFormat::Raw => {
            print_raw(format!("{}\n", response.count).as_bytes());
        }
    }
}

pub fn print_chat(chat: &ChatPacket, peer: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ChatOutput {
                kind: "chat",
                peer,
                size: chat.message.len(),
                message: &chat.message,
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PEER", "SIZE", "MESSAGE"])
                .add_row(vec![
                    peer.to_string(),
                    chat.message.len().to_string(),
                    chat.message.clone(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("peer={peer} message={:?}", chat.message);
        }
        OutputFormat::Raw => {
            print_raw(chat.message.as_bytes());
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

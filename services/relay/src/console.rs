//! Interactive admin console on the server's own standard input.
//!
//! Mirrors a subset of the control plane with human-readable output.
//! Runs as a detached task; it never blocks shutdown.

use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::state::SharedState;

/// Bounded window read for `tail`: only the last 64 KiB of the log file
/// are examined.
const TAIL_WINDOW_BYTES: u64 = 64 * 1024;

pub async fn run_console(state: SharedState, message_log: PathBuf) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v, a.trim()),
            None => (line, ""),
        };
        match verb {
            "stats" => print_stats(&state).await,
            "clients" => print_clients(&state),
            "pending" => {
                if arg.is_empty() {
                    println!("usage: pending <identity>");
                } else {
                    print_pending(&state, arg).await;
                }
            }
            "tail" => {
                let n = arg.parse::<usize>().unwrap_or(10);
                print_tail(&message_log, n);
            }
            "help" => print_help(),
            other => println!("unknown command '{other}' (try: help)"),
        }
    }
}

fn print_help() {
    println!("commands:");
    println!("  stats           queue and session counters");
    println!("  clients         live sessions with transport and last activity");
    println!("  pending <id>    pending records queued for an identity");
    println!("  tail <n>        last n lines of the message log");
    println!("  help            this text");
}

async fn print_stats(state: &SharedState) {
    let online = state.online_count();
    let (pending, total, known) = {
        let store = state.store.lock().await;
        (
            store.pending_count().unwrap_or(0),
            store.total_count().unwrap_or(0),
            store.client_count().unwrap_or(0),
        )
    };
    println!("online sessions : {online}");
    println!("pending records : {pending}");
    println!("total records   : {total}");
    println!("known clients   : {known}");
}

fn print_clients(state: &SharedState) {
    let rows = state.session_snapshots();
    if rows.is_empty() {
        println!("no live sessions");
        return;
    }
    println!("{:<24} {:<6} {}", "IDENTITY", "TYPE", "LAST ACTIVITY");
    for row in rows {
        println!(
            "{:<24} {:<6} {}",
            row.identity,
            row.kind.label(),
            format_ms(row.last_activity)
        );
    }
}

/// Millisecond timestamp as UTC wall-clock time for operator output.
fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map_or_else(|| ms.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
}

async fn print_pending(state: &SharedState, identity: &str) {
    let rows = {
        let store = state.store.lock().await;
        store.pending_summaries_for(identity).unwrap_or_default()
    };
    if rows.is_empty() {
        println!("nothing pending for '{identity}'");
        return;
    }
    println!("{:<24} {:<8} BODY", "FROM", "PRIORITY");
    for row in rows {
        println!("{:<24} {:<8} {}", row.from, row.priority, row.body);
    }
}

/// Bounded tail of the message log: at most the last [`TAIL_WINDOW_BYTES`]
/// are read, and the last `n` lines of that window printed.
fn print_tail(path: &PathBuf, n: usize) {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            println!("cannot open {}: {e}", path.display());
            return;
        }
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(TAIL_WINDOW_BYTES);
    if file.seek(SeekFrom::Start(start)).is_err() {
        println!("cannot seek {}", path.display());
        return;
    }
    let mut window = String::new();
    if file.read_to_string(&mut window).is_err() {
        println!("cannot read {}", path.display());
        return;
    }
    let lines: Vec<&str> = window.lines().collect();
    let skip = lines.len().saturating_sub(n);
    for line in &lines[skip..] {
        println!("{line}");
    }
}

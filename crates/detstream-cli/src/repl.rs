//! REPL – Read-Eval-Print Loop for the detstream shell.
//!
//! Supported slash-commands:
//!   /start <destination|none> <n_frames> [overwritable] [frame_time_s]
//!                 – arm the simulated detector and open a series
//!   /stop         – end the current series
//!   /status       – loop health, state, and frame counters
//!   /snapshot     – fetch the latest frame over the monitor channel
//!   /tap          – toggle a logging consumer on the data stream
//!   /reinit       – tear down and relaunch the streamer
//!   /help         – show this list
//!   /quit | /exit – terminate the streamer and exit

use colored::Colorize;
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use detstream_runtime::LoopHealth;

use crate::config::Config;
use crate::session::Session;

/// How often the shell re-checks the shutdown flag while waiting for input.
const INPUT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Start {
        destination: String,
        n_frames: u64,
        overwritable: bool,
        frame_time: Option<Duration>,
    },
    Stop,
    Status,
    Snapshot,
    Tap,
    Reinit,
    Help,
    Quit,
}

/// Parse one input line.  `Ok(None)` for a blank line.
pub fn parse_command(line: &str) -> Result<Option<ReplCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match head {
        "/start" => parse_start(&args)?,
        "/stop" => ReplCommand::Stop,
        "/status" => ReplCommand::Status,
        "/snapshot" => ReplCommand::Snapshot,
        "/tap" => ReplCommand::Tap,
        "/reinit" => ReplCommand::Reinit,
        "/help" => ReplCommand::Help,
        "/quit" | "/exit" => ReplCommand::Quit,
        other => return Err(format!("Unknown command '{other}'")),
    };
    if !matches!(command, ReplCommand::Start { .. }) && !args.is_empty() {
        return Err(format!("{head} takes no arguments"));
    }
    Ok(Some(command))
}

fn parse_start(args: &[&str]) -> Result<ReplCommand, String> {
    const USAGE: &str = "usage: /start <destination|none> <n_frames> [overwritable] [frame_time_s]";
    let (destination, n_frames, rest) = match args {
        [destination, n_frames, rest @ ..] if rest.len() <= 2 => (*destination, *n_frames, rest),
        _ => return Err(USAGE.to_string()),
    };
    let n_frames = n_frames
        .parse::<u64>()
        .map_err(|_| format!("'{n_frames}' is not a frame count; {USAGE}"))?;
    let overwritable = match rest.first() {
        None => false,
        Some(flag) => parse_flag(flag).ok_or_else(|| format!("'{flag}' is not a boolean"))?,
    };
    let frame_time = match rest.get(1) {
        None => None,
        Some(raw) => {
            let seconds = raw
                .parse::<f64>()
                .map_err(|_| format!("'{raw}' is not a frame time in seconds"))?;
            Some(
                Duration::try_from_secs_f64(seconds)
                    .map_err(|_| format!("'{raw}' is not a valid frame time"))?,
            )
        }
    };
    Ok(ReplCommand::Start {
        destination: destination.to_string(),
        n_frames,
        overwritable,
        frame_time,
    })
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "overwrite" => Some(true),
        "false" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled between lines; when set the REPL exits and the
/// streamer is terminated.
pub fn run(config: Config, mut session: Session, shutdown: Arc<AtomicBool>) {
    let lines = spawn_line_reader();
    let mut stdout = io::stdout();
    let mut prompt = true;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if prompt {
            print!("{} ", "detstream>".bold().cyan());
            stdout.flush().ok();
            prompt = false;
        }

        let line = match lines.recv_timeout(INPUT_POLL) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            // EOF or read error.
            Err(RecvTimeoutError::Disconnected) => break,
        };
        prompt = true;

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{} {}. Type {} for available commands.", "Error:".red(), e, "/help".bold());
                continue;
            }
        };

        match command {
            ReplCommand::Start {
                destination,
                n_frames,
                overwritable,
                frame_time,
            } => cmd_start(&mut session, &destination, n_frames, overwritable, frame_time),
            ReplCommand::Stop => cmd_stop(&session),
            ReplCommand::Status => cmd_status(&mut session),
            ReplCommand::Snapshot => cmd_snapshot(&session),
            ReplCommand::Tap => cmd_tap(&mut session),
            ReplCommand::Reinit => {
                session = match cmd_reinit(&config, session) {
                    Some(s) => s,
                    None => return,
                };
            }
            ReplCommand::Help => cmd_help(),
            ReplCommand::Quit => {
                println!("{}", "Goodbye.".green());
                break;
            }
        }
    }

    report_exit(session.shutdown());
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "detstream Commands".bold().underline());
    println!(
        "  {}  – open a series",
        "/start <dest|none> <n> [overwritable] [frame_time_s]".bold().cyan()
    );
    println!("  {}      – end the current series", "/stop".bold().cyan());
    println!("  {}    – loop health and counters", "/status".bold().cyan());
    println!("  {}  – latest frame from the monitor", "/snapshot".bold().cyan());
    println!("  {}       – toggle a logging consumer", "/tap".bold().cyan());
    println!("  {}    – relaunch the streamer", "/reinit".bold().cyan());
    println!("  {}  – exit", "/quit  /exit".bold().cyan());
    println!("  {}", "n = 0 streams until /stop.".dimmed());
    println!();
}

fn cmd_start(
    session: &mut Session,
    destination: &str,
    n_frames: u64,
    overwritable: bool,
    frame_time: Option<Duration>,
) {
    match session.start(destination, n_frames, overwritable, frame_time) {
        Ok(id) => println!("  {} series {} queued", "✓".green().bold(), id.to_string().dimmed()),
        Err(e) => println!("{}: {}", "Start failed".red(), e),
    }
}

fn cmd_stop(session: &Session) {
    match session.stop() {
        Ok(()) => println!("  {} stop queued", "✓".green().bold()),
        Err(e) => println!("{}: {}", "Stop failed".red(), e),
    }
}

fn cmd_status(session: &mut Session) {
    let (health, status) = session.status();
    let verdict = match &health {
        LoopHealth::Alive => "alive".green().to_string(),
        LoopHealth::Stalled { silent_for } => {
            format!("stalled ({:.1}s silent)", silent_for.as_secs_f64())
                .yellow()
                .bold()
                .to_string()
        }
        LoopHealth::Exited => "exited".yellow().to_string(),
        LoopHealth::Faulted(record) => format!("DEAD: {}", record.error).red().bold().to_string(),
    };
    println!("  Loop      : {verdict}");
    println!("  State     : {:?}", status.state);
    let expected = if status.expected_frames == 0 {
        "∞".to_string()
    } else {
        status.expected_frames.to_string()
    };
    println!("  Frames    : {} / {}", status.sent_frames, expected);
    println!("  Series    : {} completed", status.completed_series);
    println!("  Rejected  : {} command(s)", status.rejected_commands);
    println!("  Iterations: {}", status.iterations);
    println!(
        "  Tap       : {}",
        if session.tap_enabled() { "on" } else { "off" }
    );
    if matches!(health, LoopHealth::Faulted(_)) {
        println!(
            "  {} the loop is dead; use {} to relaunch it",
            "!".red().bold(),
            "/reinit".bold()
        );
    }
}

fn cmd_snapshot(session: &Session) {
    match session.snapshot() {
        Ok(view) => {
            let [rows, cols] = view.image.shape();
            let total: u64 = view
                .image
                .to_u32_vec()
                .map(|v| v.iter().map(|&x| u64::from(x)).sum())
                .unwrap_or(0);
            let exptime = view
                .exptime
                .map(|t| format!("{t:.3}s"))
                .unwrap_or_else(|| "n/a".to_string());
            println!(
                "  frame {} | {}x{} {} | {} counts | exptime {}",
                view.frame.to_string().bold(),
                rows,
                cols,
                view.image.dtype(),
                total,
                exptime
            );
        }
        Err(e) => println!("{}: {}", "Snapshot failed".red(), e),
    }
}

fn cmd_tap(session: &mut Session) {
    match session.toggle_tap() {
        Ok(true) => println!("  {} tap on", "✓".green().bold()),
        Ok(false) => println!("  {} tap off", "✓".green().bold()),
        Err(e) => println!("{}: {}", "Tap failed".red(), e),
    }
}

fn cmd_reinit(config: &Config, session: Session) -> Option<Session> {
    report_exit(session.shutdown());
    match Session::launch(config) {
        Ok(session) => {
            println!("  {} streamer relaunched", "✓".green().bold());
            Some(session)
        }
        Err(e) => {
            println!("{}: {}", "Relaunch failed".red(), e);
            None
        }
    }
}

fn report_exit(fault: Option<detstream_types::FaultRecord>) {
    if let Some(record) = fault {
        println!(
            "  {} loop died after {} frame(s): {}",
            "!".red().bold(),
            record.sent_frames,
            record.error
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Read stdin on a helper thread so the shell can notice Ctrl-C between lines.
fn spawn_line_reader() -> Receiver<String> {
    let (tx, rx) = channel::unbounded();
    let spawned = std::thread::Builder::new()
        .name("detstream-stdin".into())
        .spawn(move || {
            let stdin = io::stdin();
            loop {
                let mut line = String::new();
                match stdin.lock().read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        eprintln!("{}: {}", "Read error".red(), e);
                        break;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        eprintln!("{}: {}", "Failed to start input reader".red(), e);
    }
    rx
}

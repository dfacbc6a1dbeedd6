//! `detstream-cli` – interactive shell for the detector streamer
//!
//! This binary runs the acquisition loop against a simulated detector.  It:
//!
//! 1. Loads `~/.detstream/config.toml`, writing the defaults on first run.
//! 2. Launches the streamer on the configured transport (in-process bus, or
//!    ZeroMQ PUB/REP sockets when built with `zmq-transport`).
//! 3. Drops the user into an **interactive REPL** with slash-commands
//!    (`/start`, `/stop`, `/status`, `/snapshot`, `/tap`, `/reinit`, `/help`).
//! 4. Intercepts **Ctrl-C** to terminate the loop cleanly, closing any open
//!    series with its footer.

mod config;
mod repl;
mod session;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

fn main() {
    // Held for the whole process; dropping it flushes pending spans.
    let _tracing = detstream_runtime::init_tracing("detstream");

    print_banner();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – terminating the streamer …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => write_first_run_defaults(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let session = match session::Session::launch(&cfg) {
        Ok(session) => session,
        Err(e) => {
            println!("{}: {}", "Failed to launch the streamer".red().bold(), e);
            std::process::exit(1);
        }
    };
    println!(
        "  Streaming over {} ({} ch × {} bins, buffer {} frames)",
        cfg.transport.to_string().bold(),
        cfg.sim.channels,
        cfg.sim.bins,
        cfg.sim.buffer_frames
    );
    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(cfg, session, shutdown);
}

fn write_first_run_defaults() -> config::Config {
    let mut cfg = config::Config::default();
    config::apply_env_overrides(&mut cfg);
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} No config found; defaults written to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"     _      _       _                            "#.bold().cyan());
    println!("{}", r#"  __| | ___| |_ ___| |_ _ __ ___  __ _ _ __ ___  "#.bold().cyan());
    println!("{}", r#" / _` |/ _ \ __/ __| __| '__/ _ \/ _` | '_ ` _ \ "#.bold().cyan());
    println!("{}", r#"| (_| |  __/ |_\__ \ |_| | |  __/ (_| | | | | | |"#.bold().cyan());
    println!("{}", r#" \__,_|\___|\__|___/\__|_|  \___|\__,_|_| |_| |_|"#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "detstream".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Circular-buffer detector streamer");
    println!();
}

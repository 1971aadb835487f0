//! Collector entry point: configuration, logging and signal wiring
//! around the reactor.

use std::path::PathBuf;
use std::process;
use std::thread;

use argh::FromArgs;
use log::*;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use telemd_common::config::Config;
use telemd_daemon::decoder::LineDecoder;
use telemd_daemon::reactor::Daemon;

/// Streaming-telemetry collector daemon.
#[derive(FromArgs)]
struct Options {
    /// path to the configuration file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// log filter, eg. "debug" (overrides RUST_LOG)
    #[argh(option)]
    log: Option<String>,
}

fn main() {
    let opts: Options = argh::from_env();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(filter) = &opts.log {
        logger.parse_filters(filter);
    }
    logger.init();

    let cfg = match &opts.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        },
        None => Config::default(),
    };

    let mut daemon = match Daemon::new(cfg, LineDecoder) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    // SIGHUP reopens per-peer log files; SIGINT and SIGTERM stop the
    // reactor. The reactor itself never touches signal handlers.
    let handle = daemon.handle();
    let mut signals = match Signals::new([SIGHUP, SIGINT, SIGTERM]) {
        Ok(signals) => signals,
        Err(e) => {
            error!("unable to install signal handlers: {}", e);
            process::exit(1);
        }
    };
    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGHUP => handle.reload(),
                _ => handle.shutdown(),
            }
        }
    });

    if let Err(e) = daemon.run() {
        error!("{}", e);
        process::exit(1);
    }
}

use std::{
    io,
    path::PathBuf,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use clap::Parser;
use relayd::{
    bind,
    config::{Config, RunMode},
    daemon,
    handler::{Handler, Role},
    logging,
    server::Server,
};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use tracing::{error, info};

/// Multi-threaded TCP/UDP application server driven by a handler plugin.
#[derive(Parser)]
#[command(name = "relayd", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(default_value = "./config.ini")]
    config: PathBuf,
    /// Path to the handler shared object
    #[arg(default_value = "./libhandler.so")]
    handler: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("relayd: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::load(&cli.config)?;

    // Fork before any thread (the logging worker included) exists.
    if cfg.run_mode == RunMode::Background {
        daemon::daemonize()?;
    }
    let _log_guard = logging::init(&cfg);

    let stop = Arc::new(AtomicBool::new(false));
    let restart = Arc::new(AtomicBool::new(false));
    install_signal_flags(&stop, &restart)?;

    let argv: Vec<String> = std::env::args().collect();
    let handler = Arc::new(Handler::load(&cli.handler, argv)?);
    let binds = bind::parse_bind_file(&cfg.bind_file)?;

    let mut server = Server::start(&cfg, &binds, handler.clone(), stop.clone())?;
    let rc = handler.init(Role::Main);
    if rc != 0 {
        error!(rc, "handle_init(MAIN) failed");
        server.shutdown();
        return Err(format!("handler init failed with {rc}").into());
    }
    info!(config = %cli.config.display(), handler = %cli.handler.display(), "relayd up");

    let mut last_tick = Instant::now();
    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_secs(1));
        let mut elapsed_ms = last_tick.elapsed().as_millis() as i32;
        last_tick = Instant::now();
        handler.timer(&mut elapsed_ms);
    }

    if restart.load(Ordering::Acquire) {
        info!("restart requested, exiting for the supervisor to respawn");
    } else {
        info!("stop requested");
    }
    server.shutdown();
    handler.fini(Role::Main);
    Ok(())
}

/// SIGINT/SIGTERM raise stop; SIGHUP raises restart-requested and stop, the
/// classic daemon convention.
fn install_signal_flags(stop: &Arc<AtomicBool>, restart: &Arc<AtomicBool>) -> io::Result<()> {
    signal_hook::flag::register(SIGINT, stop.clone())?;
    signal_hook::flag::register(SIGTERM, stop.clone())?;
    signal_hook::flag::register(SIGHUP, restart.clone())?;
    signal_hook::flag::register(SIGHUP, stop.clone())?;
    Ok(())
}

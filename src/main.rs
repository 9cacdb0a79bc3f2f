//! Server binary: configuration, wiring and lifecycle

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use kino::config::ServerConfig;
use kino::connection::StepContext;
use kino::pool::WorkerPool;
use kino::queue::TaskQueue;
use kino::reactor::Reactor;
use kino::sessions::SessionTable;
use kino::store::Store;

#[derive(Debug, Parser)]
#[command(version, about = "Non-blocking HTTP/1.1 video streaming server")]
struct Args {
    /// KEY=VALUE configuration file; defaults apply without one.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override the configured port.
    #[arg(short, long)]
    port: Option<u16>,
    /// Override the configured SQLite database path.
    #[arg(long)]
    db: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("kino: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(db) = args.db {
        config.db_path = db;
    }

    // Signals only flip a flag; the reactor polls it between rounds.
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let store = Store::open(&config.db_path)?;
    let sessions = SessionTable::new();

    let queue = Arc::new(TaskQueue::bounded(config.queue_capacity));
    let (completed_tx, completed_rx) = crossbeam_channel::unbounded();
    let mut reactor = Reactor::new(&config, Arc::clone(&queue), completed_rx)?;

    let ctx = Arc::new(StepContext {
        completed: completed_tx,
        waker: reactor.waker(),
        sessions,
        store,
        config: config.clone(),
    });
    let workers = WorkerPool::spawn(config.worker_threads, Arc::clone(&queue), Arc::clone(&ctx))?;

    info!(
        "serving {} with {} workers",
        config.root_dir.display(),
        config.worker_threads
    );
    reactor.run(&shutdown)?;

    // Three-phase teardown: close the queue, join the workers, then tear
    // down whatever connections are still live.
    workers.shutdown();
    workers.join();
    reactor.drain();
    ctx.sessions.clear();

    info!("shutdown complete");
    Ok(())
}

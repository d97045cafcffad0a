//! Framed stdio front end for the worker pool.
//!
//! Reads request frames from stdin, runs them on the pool and writes
//! response frames to stdout. Logs go to stderr. On stdin EOF or Ctrl-C the
//! pool is shut down within `--shutdown-timeout-secs`.

mod wire;

use std::env;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use crossbeam_channel::{Receiver, Sender, unbounded};
use sqlworker::{PoolConfig, WorkerPool};
use sqlworker_db::fake::FakeDriver;
use sqlworker_db::sqlite::SqliteDriver;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use wire::{ResponseEnvelope, Status, WireCodec};

type Outgoing = (WireCodec, ResponseEnvelope);

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum DriverKind {
    Sqlite,
    /// Scripted in-process driver; `SQLWORKER_FAKE_DELAY_MS` adds latency.
    Fake,
}

#[derive(Debug, Parser)]
#[command(name = "sqlworker", version, about = "Run SQL over stdio on a bounded worker pool")]
struct Args {
    /// Execution units to keep alive (overrides DB_WORKERS)
    #[arg(long)]
    threads: Option<usize>,

    #[arg(long, value_enum, default_value_t = DriverKind::Sqlite)]
    driver: DriverKind,

    /// Database target (overrides DB_HOST)
    #[arg(long)]
    database: Option<String>,

    /// Environment file loaded before reading DB_* variables
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Hard limit on graceful shutdown
    #[arg(long, default_value_t = 10)]
    shutdown_timeout_secs: u64,

    #[arg(long)]
    debug: bool,
}

fn init_tracing(debug: bool) -> Result<()> {
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(debug)
        .compact()
        .try_init()
        .map_err(|err| anyhow!(err))
}

fn build_pool(args: &Args) -> Result<WorkerPool> {
    let mut config = PoolConfig::from_env().context("reading pool configuration")?;
    if let Some(threads) = args.threads {
        config.workers = threads;
    }
    if let Some(database) = &args.database {
        config.credentials.connect_string = database.clone();
    }
    let pool = match args.driver {
        DriverKind::Sqlite => WorkerPool::start(SqliteDriver::default(), config),
        DriverKind::Fake => {
            let delay = env::var("SQLWORKER_FAKE_DELAY_MS")
                .ok()
                .and_then(|val| val.parse::<u64>().ok())
                .unwrap_or(0);
            WorkerPool::start(FakeDriver::with_delay(Duration::from_millis(delay)), config)
        }
    };
    pool.context("starting worker pool")
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.debug)?;
    match dotenvy::from_path(&args.env_file) {
        Ok(()) => debug!(path = %args.env_file.display(), "loaded environment file"),
        Err(err) if err.not_found() => {}
        Err(err) => warn!(path = %args.env_file.display(), error = %err, "ignoring environment file"),
    }

    let pool = Arc::new(build_pool(&args)?);
    info!(workers = pool.target_workers(), driver = ?args.driver, "accepting requests on stdin");
    let (response_tx, response_rx) = unbounded::<Outgoing>();
    let writer = thread::Builder::new()
        .name("sqlworker-writer".into())
        .spawn(move || write_loop(response_rx))
        .context("spawning writer thread")?;
    let mut in_flight = serve(&pool, &response_tx).await;

    let limit = Duration::from_secs(args.shutdown_timeout_secs);
    let drained = tokio::time::timeout(limit, async {
        pool.shutdown().await;
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    drop(response_tx);

    match drained {
        Ok(()) => {
            let _ = tokio::task::spawn_blocking(move || writer.join()).await;
            info!("database connections closed");
            Ok(ExitCode::SUCCESS)
        }
        Err(_) => {
            error!(timeout = ?limit, "shutdown timed out; exiting");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Accept frames until stdin closes or an interrupt arrives. Returns the
/// tasks still waiting on query results.
async fn serve(pool: &Arc<WorkerPool>, responses: &Sender<Outgoing>) -> JoinSet<()> {
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
    let _reader = thread::Builder::new()
        .name("sqlworker-reader".into())
        .spawn(move || read_loop(frame_tx));

    let mut in_flight = JoinSet::new();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("interrupt received; shutting down");
                break;
            }
            frame = frame_rx.recv() => match frame {
                Some(Ok(bytes)) => submit(pool, &bytes, responses, &mut in_flight),
                Some(Err(err)) => {
                    let _ = responses.send((
                        WireCodec::Json,
                        ResponseEnvelope::failure(0, Status::InvalidInput, err.to_string()),
                    ));
                    break;
                }
                None => {
                    info!("input closed; shutting down");
                    break;
                }
            },
        }
        // Reap finished response tasks so the set does not grow unbounded.
        while in_flight.try_join_next().is_some() {}
    }
    in_flight
}

fn submit(
    pool: &Arc<WorkerPool>,
    bytes: &[u8],
    responses: &Sender<Outgoing>,
    in_flight: &mut JoinSet<()>,
) {
    let (request, wire) = match wire::decode_request(bytes) {
        Ok(decoded) => decoded,
        Err(err) => {
            let _ = responses.send((
                WireCodec::Json,
                ResponseEnvelope::failure(0, Status::InvalidInput, err),
            ));
            return;
        }
    };
    let request_id = request.request_id;
    match pool.execute_query(request.sql, request.params) {
        Ok(handle) => {
            let responses = responses.clone();
            in_flight.spawn(async move {
                let outcome = handle.await;
                let _ = responses.send((wire, ResponseEnvelope::from_outcome(request_id, outcome)));
            });
        }
        Err(err) => {
            let _ = responses.send((wire, ResponseEnvelope::from_outcome(request_id, Err(err))));
        }
    }
}

fn read_loop(frames: mpsc::UnboundedSender<io::Result<Vec<u8>>>) {
    let stdin = io::stdin();
    let mut reader = stdin.lock();
    loop {
        match wire::read_frame(&mut reader) {
            Ok(Some(frame)) => {
                if frames.send(Ok(frame)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let _ = frames.send(Err(err));
                break;
            }
        }
    }
}

fn write_loop(responses: Receiver<Outgoing>) {
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    while let Ok((wire, response)) = responses.recv() {
        let encoded = match wire::encode_response(&response, wire) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(request_id = response.request_id, error = %err, "failed to encode response");
                continue;
            }
        };
        if let Err(err) = wire::write_frame(&mut writer, &encoded) {
            error!(error = %err, "failed to write response");
            break;
        }
    }
}

//! One load run: input stream, scanner, inserter, report.
//!
//! [`run_load`] drives an already opened reader into any [`Destination`];
//! [`execute`] adds the process concerns (opening the input, connecting,
//! truncating) in front of it. Both always produce a [`LoadReport`], so a
//! failed run still shows how far it got.

use serde::Serialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, DbConfig, LoadConfig};
use crate::db;
use crate::ingest::{Parser, ParserOptions, ParserStats, ScanError, Scanner, ScannerOptions, ScannerStats};
use crate::insert::{Destination, InsertFailure, InsertMethod, build_inserter};
use crate::models::{NameType, TextPolicy, TrimmedText};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot open input {}: {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("truncate failed: {0}")]
    Truncate(#[source] sqlx::Error),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Insert(#[from] InsertFailure),
    #[error("load timed out after {0:?}")]
    TimedOut(Duration),
    #[error("load interrupted")]
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportConfig {
    pub input: String,
    pub name_type: NameType,
    pub method: InsertMethod,
    pub pipeline: bool,
    pub batch_size: usize,
    /// Zero when the run has no timeout.
    pub timeout_ms: u64,
}

impl From<&LoadConfig> for ReportConfig {
    fn from(config: &LoadConfig) -> Self {
        Self {
            input: config
                .input
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
            name_type: config.name_type,
            method: config.method,
            pipeline: config.pipeline,
            batch_size: config.batch_size.get(),
            timeout_ms: config
                .timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub elapsed_ms: u64,
    pub parser: ParserStats,
    pub scanner: ScannerStats,
    pub inserted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub config: ReportConfig,
    pub stats: RunStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct LoadOutcome {
    pub report: LoadReport,
    pub result: Result<u64, LoadError>,
}

impl LoadOutcome {
    fn finish(config: &LoadConfig, stats: RunStats, result: Result<u64, LoadError>) -> Self {
        let report = LoadReport {
            config: ReportConfig::from(config),
            stats,
            error: result.as_ref().err().map(ToString::to_string),
        };
        Self { report, result }
    }

    fn failed_early(config: &LoadConfig, started: Instant, err: LoadError) -> Self {
        let stats = RunStats {
            elapsed_ms: elapsed_ms(started),
            ..RunStats::default()
        };
        Self::finish(config, stats, Err(err))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Cancels `cancel` once `timeout` elapses; the flag tells a timeout apart
/// from any other cancellation.
fn spawn_timer(timeout: Duration, cancel: CancellationToken) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let fired = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&fired);
    let handle = tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                flag.store(true, Ordering::Release);
                log::warn!("load timeout of {:?} reached, cancelling", timeout);
                cancel.cancel();
            }
        }
    });
    (handle, fired)
}

/// Read `reader` to the end (or to the first stop condition) and insert every
/// valid record into `conn`.
pub async fn run_load<R, D>(
    config: &LoadConfig,
    reader: R,
    conn: D,
    shutdown: &CancellationToken,
) -> LoadOutcome
where
    R: BufRead + Send,
    D: Destination,
{
    let started = Instant::now();
    let cancel = shutdown.child_token();
    let timer = config.timeout.map(|t| spawn_timer(t, cancel.clone()));

    let policy: Arc<dyn TextPolicy> = Arc::new(TrimmedText);
    let parser = Parser::new(
        ParserOptions {
            reject_sparse: !config.keep_sparse,
        },
        Arc::clone(&policy),
    );
    let mut scanner = Scanner::with_parser(reader, config.name_type, parser, policy).options(
        ScannerOptions {
            infer_gender: config.infer_gender,
        },
    );
    let mut inserter = build_inserter(config.method, conn, config.batch_size);

    log::info!(
        "loading {} records with {} (pipeline: {}, batch: {})",
        config.name_type,
        config.method,
        config.pipeline,
        config.batch_size
    );

    let inserted = {
        let mut records = scanner.records(&cancel);
        if config.pipeline {
            inserter.insert_with_pipeline(&cancel, &mut records).await
        } else {
            inserter.insert(&cancel, &mut records).await
        }
    };

    let timed_out = match timer {
        Some((handle, fired)) => {
            handle.abort();
            fired.load(Ordering::Acquire)
        }
        None => false,
    };

    let result = match inserted {
        Ok(rows) => match scanner.take_error() {
            Some(err) => Err((rows, LoadError::Scan(err))),
            None => Ok(rows),
        },
        Err(failure) if failure.is_cancelled() => {
            let rows = failure.inserted;
            match config.timeout {
                Some(timeout) if timed_out => Err((rows, LoadError::TimedOut(timeout))),
                _ if shutdown.is_cancelled() => Err((rows, LoadError::Interrupted)),
                _ => Err((rows, LoadError::Insert(failure))),
            }
        }
        Err(failure) => Err((failure.inserted, LoadError::Insert(failure))),
    };

    let (rows, result) = match result {
        Ok(rows) => (rows, Ok(rows)),
        Err((rows, err)) => (rows, Err(err)),
    };

    let stats = RunStats {
        elapsed_ms: elapsed_ms(started),
        parser: scanner.parser().stats(),
        scanner: scanner.stats(),
        inserted: rows,
    };
    match &result {
        Ok(_) => log::info!(
            "loaded {} rows from {} lines in {} ms",
            rows,
            stats.scanner.total_lines,
            stats.elapsed_ms
        ),
        Err(err) => log::error!("load failed after {} rows: {}", rows, err),
    }

    LoadOutcome::finish(config, stats, result)
}

fn open_input(path: Option<&Path>) -> Result<Box<dyn BufRead + Send>, LoadError> {
    match path {
        None => Ok(Box::new(BufReader::new(io::stdin()))),
        Some(path) if path.as_os_str() == "-" => Ok(Box::new(BufReader::new(io::stdin()))),
        Some(path) => {
            let file = File::open(path).map_err(|source| LoadError::Input {
                path: path.to_path_buf(),
                source,
            })?;
            Ok(Box::new(BufReader::new(file)))
        }
    }
}

/// Full run against PostgreSQL as described by `db_config`.
pub async fn execute(
    config: &LoadConfig,
    db_config: &DbConfig,
    shutdown: &CancellationToken,
) -> LoadOutcome {
    let started = Instant::now();

    let reader = match open_input(config.input.as_deref()) {
        Ok(reader) => reader,
        Err(err) => return LoadOutcome::failed_early(config, started, err),
    };

    let options = match db_config.connect_options() {
        Ok(options) => options,
        Err(err) => return LoadOutcome::failed_early(config, started, err.into()),
    };

    let mut conn = match db::connect(&options).await {
        Ok(conn) => conn,
        Err(err) => return LoadOutcome::failed_early(config, started, LoadError::Connect(err)),
    };

    if config.truncate {
        if let Err(err) = db::truncate_names(&mut conn).await {
            return LoadOutcome::failed_early(config, started, LoadError::Truncate(err));
        }
    }

    let mut outcome = run_load(config, reader, conn, shutdown).await;
    outcome.report.stats.elapsed_ms = elapsed_ms(started);
    outcome
}

use std::io::{self, Write};
use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use fillnames::config::{self, DbConfig, LoadConfig, LogConfig};
use fillnames::insert::InsertMethod;
use fillnames::load;
use fillnames::logging;
use fillnames::models::NameType;

#[derive(Parser, Debug)]
#[command(
    name = "fillnames",
    about = "Load name-frequency JSON lines into the PostgreSQL names table"
)]
struct Args {
    /// Input file, one JSON object per line (`-` or unset reads stdin; default $INPUT_FILE).
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Name type assigned to every record: name, surname or patronymic (default $NAME_TYPE or surname).
    #[arg(long = "type")]
    name_type: Option<String>,

    /// Insertion strategy: copyfrom, pgxbatch or unnestbatch.
    #[arg(long, default_value = "copyfrom")]
    method: String,

    /// Rows per batch for the batch strategies.
    #[arg(long, default_value_t = 1000, allow_negative_numbers = true)]
    batch: i64,

    /// Overlap reading and transmission.
    #[arg(long)]
    pipeline: bool,

    /// Whole-run timeout in milliseconds; zero or negative disables it.
    #[arg(long, default_value_t = config::DEFAULT_TIMEOUT_MS, allow_negative_numbers = true)]
    timeout_ms: i64,

    /// Empty the names table before loading.
    #[arg(long)]
    truncate: bool,

    /// Fill unknown genders from the name suffix.
    #[arg(long)]
    infer_gender: bool,

    /// Keep records the sparse-record filter would drop.
    #[arg(long)]
    keep_sparse: bool,
}

fn load_config(args: Args) -> Result<LoadConfig, config::ConfigError> {
    let mut config = LoadConfig::from_env()?;
    if let Some(input) = args.input {
        config.input = Some(input);
    }
    if let Some(name_type) = args.name_type {
        config.name_type = name_type.parse::<NameType>()?;
    }
    config.method = args.method.parse::<InsertMethod>()?;
    config.batch_size = config::batch_size(args.batch)?;
    config.pipeline = args.pipeline;
    config.timeout = config::timeout(args.timeout_ms);
    config.truncate = args.truncate;
    config.infer_gender = args.infer_gender;
    config.keep_sparse = args.keep_sparse;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init(&LogConfig::from_env());

    let args = Args::parse();
    let config = match load_config(args) {
        Ok(config) => config,
        Err(err) => {
            writeln!(io::stderr(), "error: {err}")?;
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, stopping load");
            interrupt.cancel();
        }
    });

    let outcome = load::execute(&config, &DbConfig::from_env(), &shutdown).await;

    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &outcome.report)?;
    writeln!(stdout)?;
    stdout.flush()?;

    if outcome.result.is_err() {
        std::process::exit(1);
    }
    Ok(())
}

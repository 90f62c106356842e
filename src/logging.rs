use env_logger::{Builder, Target};
use std::io::Write;
use std::sync::Once;

use crate::config::{LogConfig, LogFormat};

static LOGGER: Once = Once::new();

/// Install the process-wide logger on stderr. Later calls are no-ops.
pub fn init(config: &LogConfig) {
    LOGGER.call_once(|| {
        if let Err(err) = builder(config).try_init() {
            eprintln!("failed to install logger: {err}");
        }
    });
}

fn builder(config: &LogConfig) -> Builder {
    let mut builder = Builder::new();
    builder.parse_filters(&config.level).target(Target::Stderr);

    if config.format == LogFormat::Json {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "time": buf.timestamp_millis().to_string(),
                "level": record.level().as_str().to_ascii_lowercase(),
                "target": record.target(),
                "msg": record.args().to_string(),
            });
            writeln!(buf, "{line}")
        });
    }
    builder
}

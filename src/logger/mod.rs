use std::sync::OnceLock;
use std::{fs, io};

use chrono::Local;
use fern::Dispatch;
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

use crate::config::LoggerConfig;

/// Handle the server components log through.
///
/// Zero-sized: every copy forwards to the process-wide `log` facade, so
/// cloning one into each session task costs nothing.
#[derive(Clone, Debug, Default)]
pub struct Logger;

impl Logger {
    pub fn debug(&self, msg: &str) {
        log::debug!("{}", msg);
    }

    pub fn info(&self, msg: &str) {
        log::info!("{}", msg);
    }

    pub fn warn(&self, msg: &str) {
        log::warn!("{}", msg);
    }

    pub fn error(&self, msg: &str) {
        log::error!("{}", msg);
    }
}

// Set by the first `init_logger` call; later calls reuse it.
static LOGGER: OnceLock<Logger> = OnceLock::new();

/// File the file branch writes to: `<log_file_path>/<name>.log`, dots replaced.
fn log_file_path(name: &str, cfg: &LoggerConfig) -> String {
    let file = format!("{}.log", name.replace('.', "_"));
    if cfg.log_file_path.is_empty() {
        file
    } else {
        format!("{}/{}", cfg.log_file_path.trim_end_matches('/'), file)
    }
}

/// Install the fern dispatcher described by `cfg` and return a handle.
///
/// Only the first call configures anything; `name` and `cfg` of later calls
/// are ignored.
pub fn init_logger(name: &str, cfg: &LoggerConfig) -> Logger {
    LOGGER
        .get_or_init(|| {
            // Unknown level strings fall back to Info
            let level = cfg.log_level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);

            let mut base = Dispatch::new().level(level);

            // Console branch: colored `time - name - LEVEL - message`
            if cfg.enable_console_log {
                let nm = name.to_string();
                let datefmt = cfg.date_format.clone();
                let colors = ColoredLevelConfig::new()
                    .info(Color::Green)
                    .warn(Color::Yellow)
                    .error(Color::Red)
                    .debug(Color::Blue)
                    .trace(Color::Magenta);

                base = base.chain(
                    Dispatch::new()
                        .format(move |out, message, record| {
                            out.finish(format_args!(
                                "\x1b[92m{}\x1b[0m - \x1b[94m{}\x1b[0m - {} - {}",
                                Local::now().format(&datefmt),
                                nm,
                                colors.color(record.level()),
                                message
                            ))
                        })
                        .chain(io::stdout()),
                );
            }

            // File branch: plain text or a JSON envelope per line
            if cfg.enable_file_log {
                if !cfg.log_file_path.is_empty() {
                    let _ = fs::create_dir_all(&cfg.log_file_path);
                }

                let nm = name.to_string();
                let datefmt = cfg.date_format.clone();
                let enable_json = cfg.enable_json_log;
                let filepath = log_file_path(name, cfg);

                let log_format_file = move |out: fern::FormatCallback,
                                            message: &std::fmt::Arguments,
                                            record: &log::Record| {
                    if enable_json {
                        let envelope = serde_json::json!({
                            "timestamp": Local::now().format(&datefmt).to_string(),
                            "name":      nm,
                            "level":     record.level().to_string(),
                            "message":   message.to_string(),
                        });
                        out.finish(format_args!("{}", envelope))
                    } else {
                        out.finish(format_args!(
                            "{} - {} - {} - {}",
                            Local::now().format(&datefmt),
                            nm,
                            record.level(),
                            message
                        ))
                    }
                };

                // Unwritable path: keep serving, drop file output
                let file_output: Box<dyn io::Write + Send> = match fern::log_file(&filepath) {
                    Ok(fh) => Box::new(fh),
                    Err(err) => {
                        eprintln!("Warning: could not open log file {}: {}", filepath, err);
                        Box::new(io::sink())
                    }
                };

                base = base.chain(Dispatch::new().format(log_format_file).chain(file_output));
            }

            // Test harnesses may have claimed the facade first
            if let Err(err) = base.apply() {
                eprintln!("Warning: logger already installed: {}", err);
            }

            Logger
        })
        .clone()
}

use std::process::ExitCode;

use rust_server_echo::{ServerConfig, init_logger, run_server};

/// Usage: `rust_server_echo [config.json]`. Without a file every setting takes its default.
fn main() -> ExitCode {
    // Read the config before anything else; nothing is logged yet, so report on stderr.
    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Invalid configuration: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };

    let logger = init_logger("rust_server_echo", &config.logger);

    // Multi-threaded Tokio runtime sized by `worker_threads`.
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("rust-server-worker")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            logger.error(&format!("Failed to build Tokio runtime: {}", e));
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run_server(config, logger.clone())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logger.error(&format!("Rust server error: {}", e));
            ExitCode::FAILURE
        }
    }
}

pub mod cli;
pub mod protocol;

use std::io::{self, Write};

use chrono::Local;
use env_logger::{Builder, Target};
use log::LevelFilter;

pub use protocol::{BusEvent, ExceptionCode, MasterConfig, ModbusMaster, Telegram};

/// Initialize logging for the CLI binary. `FFUBUS_LOG_FILE` redirects the
/// log to a file, which keeps the console output clean for scripted use.
pub fn init_logging() {
    match std::env::var("FFUBUS_LOG_FILE") {
        Ok(path) => {
            if let Err(err) = init_file_logger(&path) {
                eprintln!("Failed to initialize file logger at '{path}': {err}");
                env_logger::init();
            }
        }
        Err(_) => env_logger::init(),
    }
}

fn init_file_logger(path: &str) -> io::Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {} - {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(file)))
        .filter_level(LevelFilter::Debug)
        .parse_default_env()
        .init();

    log::info!("File logger initialized at {path}");

    Ok(())
}

pub mod client;
pub mod clock;
pub mod config;
pub mod constants;
pub mod daq;
pub mod dispatcher;
pub mod error;
pub mod handshake;
pub mod helper;
pub mod hv;
pub mod instruments;
pub mod interpreter;
pub mod modbus;
pub mod protocol;
pub mod registry;
pub mod run_control;
pub mod server;
pub mod transport;

#[cfg(test)]
mod testing;

use std::path::Path;

use simplelog::{ColorChoice, CombinedLogger, Config, LevelFilter, SharedLogger, TermLogger, TerminalMode, WriteLogger};

use crate::error::LoggingError;

/// Terminal logging, plus a copy in log_file when one is given
pub fn init_logging(level: LevelFilter, log_file: Option<&Path>) -> Result<(), LoggingError> {
    let mut loggers: Vec<Box<dyn SharedLogger>> =
        vec![TermLogger::new(level, Config::default(), TerminalMode::Mixed, ColorChoice::Auto)];
    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        loggers.push(WriteLogger::new(level, Config::default(), file));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

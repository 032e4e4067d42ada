use serdeconv;
use slog::{o, Discard, Logger};
use sloggers::{Config, LoggerConfig};
use std::fmt;
use std::path::Path;

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

#[derive(Debug)]
pub enum LogError {
    Config(serdeconv::Error),
    Build(sloggers::Error),
}

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogError::Config(err) => write!(f, "invalid logger configuration: {}", err),
            LogError::Build(err) => write!(f, "logger construction failed: {}", err),
        }
    }
}

impl From<serdeconv::Error> for LogError {
    #[inline]
    fn from(err: serdeconv::Error) -> Self {
        LogError::Config(err)
    }
}

impl From<sloggers::Error> for LogError {
    #[inline]
    fn from(err: sloggers::Error) -> Self {
        LogError::Build(err)
    }
}

/// Builds the default terminal logger writing to stderr at debug level.
pub fn init() -> Result<Logger, LogError> {
    from_toml(DEFAULT_CONFIG)
}

/// Builds a logger from the TOML logger configuration file at the supplied path.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Logger, LogError> {
    let config: LoggerConfig = serdeconv::from_toml_file(path)?;
    Ok(config.build_logger()?)
}

/// Builds a logger from a TOML logger configuration string.
pub fn from_toml(config: &str) -> Result<Logger, LogError> {
    let config: LoggerConfig = serdeconv::from_toml_str(config)?;
    Ok(config.build_logger()?)
}

/// Logger swallowing every record.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::info;

    #[test]
    fn test_default_config() {
        let log = init().unwrap();
        info!(log, "logger ready"; "source" => "test");
    }

    #[test]
    fn test_invalid_config() {
        match from_toml("type = \"carrier-pigeon\"") {
            Err(LogError::Config(_)) => (),
            Err(err) => panic!("Unexpected error {}", err),
            Ok(_) => panic!("Invalid configuration accepted"),
        }
    }
}

use std::path::{Path, PathBuf};

use log::LevelFilter;
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    filter::threshold::ThresholdFilter,
    Config,
};

const CONSOLE_PATTERN: &str = "{h({d(%Y-%m-%d %H:%M:%S)} [{l}] from line {L} in {M})} - {m}{n}";
const FILE_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} [{l}] {M}:{L} - {m}{n}";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Could not open log file {}: {inner}", path.display())]
    LogFile { path: PathBuf, inner: std::io::Error },
    #[error("Invalid logging configuration: {0}")]
    Config(#[from] log4rs::config::runtime::ConfigErrors),
    #[error("A logger was already initialized: {0}")]
    AlreadyInitialized(#[from] log::SetLoggerError),
}

/// Log to stderr at `level` and, if `log_file` is given, to that file at
/// debug level or more verbose. An existing log file is appended to.
pub fn init_logging(level: LevelFilter, log_file: Option<&Path>) -> Result<(), LoggingError> {
    let stderr = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .target(Target::Stderr)
        .build();

    let mut builder = Config::builder().appender(
        Appender::builder()
            .filter(Box::new(ThresholdFilter::new(level)))
            .build("stderr", Box::new(stderr)),
    );
    let mut root = Root::builder().appender("stderr");
    let mut root_level = level;

    if let Some(path) = log_file {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
            .append(true)
            .build(path)
            .map_err(|e| LoggingError::LogFile {
                path: path.to_path_buf(),
                inner: e,
            })?;
        let file_level = level.max(LevelFilter::Debug);
        builder = builder.appender(
            Appender::builder()
                .filter(Box::new(ThresholdFilter::new(file_level)))
                .build("file", Box::new(file)),
        );
        root = root.appender("file");
        root_level = file_level;
    }

    let config = builder.build(root.build(root_level))?;
    log4rs::init_config(config)?;
    Ok(())
}

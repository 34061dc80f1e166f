use std::path::Path;

use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};

/// Starts the global logger writing to `logs/`.
pub fn setup_logging(base_level: &str) -> LoggerHandle {
    setup_logging_in(Path::new("logs"), base_level)
}

/// Starts the global logger writing rotated files into `directory`.
///
/// Warnings are duplicated to stderr and everything to stdout. The returned
/// handle must be kept alive for the lifetime of the program.
pub fn setup_logging_in(directory: &Path, base_level: &str) -> LoggerHandle {
    Logger::try_with_env_or_str(base_level)
        .unwrap_or_else(|e| panic!("Invalid log filter '{}': {}", base_level, e))
        .log_to_file(FileSpec::default().directory(directory))
        .duplicate_to_stderr(Duplicate::Warn)
        .duplicate_to_stdout(Duplicate::All)
        .rotate(
            Criterion::Size(1024 * 1024), //1MB
            Naming::Timestamps,
            Cleanup::KeepLogFiles(5),
        )
        .start()
        .unwrap_or_else(|e| panic!("Logger initialization failed with {}", e))
}

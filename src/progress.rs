use std::fmt::Debug;

/// Where the engine reports narrative lines and per-file progress. The
/// statuses are plain strings ("0%".."100%", "Completed", "File Not Found",
/// "Error", "Incomplete") so a presentation layer can be swapped without
/// touching the core. Implementations must be callable from any thread.
pub trait ProgressSink: Send + Sync + Debug {
    fn log(&self, message: &str);

    fn update_progress(&self, filename: &str, status: &str);
}

/// Sink that forwards everything to the `log` facade. Used by the CLI node,
/// where there is no table to paint.
#[derive(Debug, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn log(&self, message: &str) {
        log::info!("{}", message);
    }

    fn update_progress(&self, filename: &str, status: &str) {
        log::info!("{}: {}", filename, status);
    }
}

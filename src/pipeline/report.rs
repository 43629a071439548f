//! Progress reporting injected into each pipeline component.
//!
//! There is no process-wide logger: every component that reports progress
//! takes a `Reporter` explicitly, so callers decide where output goes.

/// Destination for informational and debug progress messages.
pub trait Reporter {
    fn info(&self, message: &str);
    fn debug(&self, message: &str);
}

/// Prints every message to stdout.
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    pub fn new() -> Self {
        ConsoleReporter
    }
}

impl Reporter for ConsoleReporter {
    fn info(&self, message: &str) {
        println!("{}", message);
    }

    fn debug(&self, message: &str) {
        println!("{}", message);
    }
}

/// Discards everything. Used by tests and library callers that do not want
/// console output.
#[derive(Debug, Default)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn info(&self, _message: &str) {}

    fn debug(&self, _message: &str) {}
}

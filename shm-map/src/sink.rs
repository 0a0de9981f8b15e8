//! Diagnostics delivered to the host of a store.
//!
//! A store is given at most one sink when it is opened and calls it synchronously, from the
//! thread performing the operation. There is no global logger. Independently of the sink every
//! message is also emitted as a `tracing` event, which is silent unless a subscriber is set.
use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives engine events, see the module documentation.
pub trait LogSink {
    fn log(&self, level: Level, message: &str);
}

impl<F: Fn(Level, &str)> LogSink for F {
    fn log(&self, level: Level, message: &str) {
        self(level, message)
    }
}

/// Prints `-LEVEL- message` lines to standard output.
///
/// Never installed implicitly, pass it to `init` if this is what you want.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn log(&self, level: Level, message: &str) {
        println!("-{level}- {message}");
    }
}

pub(crate) type BoxedSink = Box<dyn LogSink + Send>;

/// The store's view of its (optional) sink.
#[derive(Default)]
pub(crate) struct Diagnostics {
    sink: Option<BoxedSink>,
}

impl Diagnostics {
    pub(crate) fn new(sink: Option<BoxedSink>) -> Self {
        Diagnostics { sink }
    }

    pub(crate) fn emit(&self, level: Level, message: fmt::Arguments<'_>) {
        match level {
            Level::Debug => tracing::debug!("{message}"),
            Level::Info => tracing::info!("{message}"),
            Level::Warn => tracing::warn!("{message}"),
            Level::Error => tracing::error!("{message}"),
        }

        if let Some(sink) = &self.sink {
            match message.as_str() {
                Some(text) => sink.log(level, text),
                None => sink.log(level, &message.to_string()),
            }
        }
    }

    pub(crate) fn info(&self, message: fmt::Arguments<'_>) {
        self.emit(Level::Info, message)
    }

    pub(crate) fn warn(&self, message: fmt::Arguments<'_>) {
        self.emit(Level::Warn, message)
    }

    pub(crate) fn error(&self, message: fmt::Arguments<'_>) {
        self.emit(Level::Error, message)
    }
}

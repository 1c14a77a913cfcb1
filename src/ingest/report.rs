//! Reporting of progress, warnings and errors to the caller.

/// Callbacks through which a long running step hands back control.
///
/// The pipeline calls `progress` after every bounded unit of work (each chunk
/// or each milestone), so a caller driving a user interface can repaint.
pub trait Reporter {
    /// Report progress in percent with a status message.
    fn progress(&mut self, percent: f32, message: &str);
    /// Report a non-fatal problem.
    fn warning(&mut self, message: &str);
    /// Report the error that aborts the current ingestion.
    fn error(&mut self, message: &str);
}

/// Reporter that forwards everything to `tracing`.
#[derive(Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn progress(&mut self, percent: f32, message: &str) {
        tracing::info!("[{:>5.1}%] {}", percent, message);
    }

    fn warning(&mut self, message: &str) {
        tracing::warn!("{}", message);
    }

    fn error(&mut self, message: &str) {
        tracing::error!("{}", message);
    }
}

/// The share of the overall progress owned by one pass over the input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressBand {
    pub from: f32,
    pub to: f32,
}

impl ProgressBand {
    pub fn new(from: f32, to: f32) -> Self {
        Self { from, to }
    }

    /// Percentage after `done` of `total` units; stays at `from` if the
    /// total is unknown.
    pub fn at(&self, done: u64, total: u64) -> f32 {
        if total == 0 {
            return self.from;
        }
        let fraction = (done as f64 / total as f64).min(1.0) as f32;
        self.from + fraction * (self.to - self.from)
    }

    /// The first or second half of the band.
    pub fn half(&self, second: bool) -> Self {
        let mid = (self.from + self.to) / 2.0;
        if second {
            Self::new(mid, self.to)
        } else {
            Self::new(self.from, mid)
        }
    }
}

/// One event recorded by `RecordingReporter`.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Progress(f32, String),
    Warning(String),
    Error(String),
}

/// Reporter that records all events, e.g., for inspection in tests.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub events: Vec<Event>,
}

impl RecordingReporter {
    /// The recorded warning messages.
    pub fn warnings(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Warning(msg) => Some(msg.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The recorded error messages.
    pub fn errors(&self) -> Vec<&str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Error(msg) => Some(msg.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The recorded progress percentages.
    pub fn percentages(&self) -> Vec<f32> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Progress(percent, _) => Some(*percent),
                _ => None,
            })
            .collect()
    }
}

impl Reporter for RecordingReporter {
    fn progress(&mut self, percent: f32, message: &str) {
        self.events.push(Event::Progress(percent, message.to_owned()));
    }

    fn warning(&mut self, message: &str) {
        self.events.push(Event::Warning(message.to_owned()));
    }

    fn error(&mut self, message: &str) {
        self.events.push(Event::Error(message.to_owned()));
    }
}

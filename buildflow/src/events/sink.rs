//! Progress sink trait and implementations.

use super::ProgressEvent;
use parking_lot::RwLock;
use tracing::{debug, info, Level};

/// Receives progress events from every layer of the engine.
///
/// Sinks are invoked inline on the control flow, so implementations must be
/// cheap and must never panic.
pub trait ProgressSink: Send + Sync {
    /// Handles one progress event.
    fn emit(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn emit(&self, event: &ProgressEvent) {
        self(event);
    }
}

/// A no-op sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgressSink;

impl ProgressSink for NoOpProgressSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// A sink that logs events through `tracing`.
///
/// Output chunks are logged at debug level regardless of the configured
/// level so that build logs do not drown phase transitions.
#[derive(Debug, Clone)]
pub struct LoggingProgressSink {
    level: Level,
}

impl Default for LoggingProgressSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingProgressSink {
    /// Creates a new logging sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl ProgressSink for LoggingProgressSink {
    fn emit(&self, event: &ProgressEvent) {
        if let Some(chunk) = event.stdout_chunk.as_deref().or(event.stderr_chunk.as_deref()) {
            debug!(phase = %event.phase, "{}", chunk);
            return;
        }

        if self.level == Level::DEBUG {
            debug!(
                phase = %event.phase,
                percent = event.percent,
                current_step = ?event.current_step,
                total_steps = ?event.total_steps,
                "{}", event.message
            );
        } else {
            info!(
                phase = %event.phase,
                percent = event.percent,
                current_step = ?event.current_step,
                total_steps = ?event.total_steps,
                "{}", event.message
            );
        }
    }
}

/// A sink that keeps every event in memory, for tests and reports.
#[derive(Debug, Default)]
pub struct CollectingProgressSink {
    events: RwLock<Vec<ProgressEvent>>,
}

impl CollectingProgressSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns the messages of all collected events, in order.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.events.read().iter().map(|e| e.message.clone()).collect()
    }

    /// Returns events whose message contains `needle`.
    #[must_use]
    pub fn matching(&self, needle: &str) -> Vec<ProgressEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.message.contains(needle))
            .cloned()
            .collect()
    }
}

impl ProgressSink for CollectingProgressSink {
    fn emit(&self, event: &ProgressEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelinePhase;

    #[test]
    fn test_noop_sink() {
        let sink = NoOpProgressSink;
        sink.emit(&ProgressEvent::new(PipelinePhase::Cloning, "cloning"));
    }

    #[test]
    fn test_logging_sink() {
        let sink = LoggingProgressSink::debug();
        sink.emit(&ProgressEvent::new(PipelinePhase::Building, "building web"));
        sink.emit(&ProgressEvent::new(PipelinePhase::Building, "").with_stdout("compiled"));
    }

    #[test]
    fn test_closure_sink() {
        let seen = RwLock::new(Vec::new());
        let sink = |event: &ProgressEvent| seen.write().push(event.message.clone());
        sink.emit(&ProgressEvent::new(PipelinePhase::Verifying, "checking"));

        assert_eq!(seen.read().as_slice(), ["checking".to_string()]);
    }

    #[test]
    fn test_collecting_sink_filter() {
        let sink = CollectingProgressSink::new();
        assert!(sink.is_empty());

        sink.emit(&ProgressEvent::new(PipelinePhase::Cloning, "Cloning api"));
        sink.emit(&ProgressEvent::new(PipelinePhase::Cloning, "Cloning web"));
        sink.emit(&ProgressEvent::new(PipelinePhase::Building, "Retrying install"));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.matching("Cloning").len(), 2);
        assert_eq!(sink.messages()[2], "Retrying install");
    }
}

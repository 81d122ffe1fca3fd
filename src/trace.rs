use std::fmt;
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

/// The kind of step a trace line narrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// informational step
    Info,
    /// the operation did what was asked
    Success,
    /// something failed
    Error,
    /// degraded but not failed
    Warn,
    /// elapsed time
    Timer,
    /// publish/subscribe traffic
    PubSub,
    /// network round trips
    Net,
    /// store-side work
    Db,
}

impl Category {
    fn marker(self) -> &'static str {
        match self {
            Category::Info => "info",
            Category::Success => "success",
            Category::Error => "error",
            Category::Warn => "warn",
            Category::Timer => "timer",
            Category::PubSub => "pubsub",
            Category::Net => "net",
            Category::Db => "db",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// Accumulates a human readable narrative of one request.
///
/// A `Tracer` lives for exactly one dispatcher call or bulk load. It records what was done
/// against the backend (including the native query text that was executed) and when it was
/// started, so the response can report both the steps and the elapsed wall-clock time.
/// Nothing is shared between requests and nothing is persisted.
#[derive(Debug)]
pub struct Tracer {
    source: String,
    entries: Vec<(Category, String)>,
    query: Option<String>,
    started: Instant,
}

impl Tracer {
    /// starts a new trace labelled with `source` (usually the backend name)
    pub fn new(source: &str) -> Self {
        Tracer {
            source: source.to_uppercase(),
            entries: Vec::new(),
            query: None,
            started: Instant::now(),
        }
    }

    /// appends one step
    pub fn log(&mut self, category: Category, msg: impl Into<String>) {
        let msg = msg.into();
        debug!(source = %self.source, %category, "{}", msg);
        self.entries.push((category, msg));
    }

    /// records an informational line
    pub fn info(&mut self, msg: impl Into<String>) {
        self.log(Category::Info, msg)
    }

    /// records a success line
    pub fn success(&mut self, msg: impl Into<String>) {
        self.log(Category::Success, msg)
    }

    /// records a warning line
    pub fn warn(&mut self, msg: impl Into<String>) {
        self.log(Category::Warn, msg)
    }

    /// records an error line
    pub fn error(&mut self, msg: impl Into<String>) {
        self.log(Category::Error, msg)
    }

    /// records a pub/sub line
    pub fn pubsub(&mut self, msg: impl Into<String>) {
        self.log(Category::PubSub, msg)
    }

    /// records a network line
    pub fn net(&mut self, msg: impl Into<String>) {
        self.log(Category::Net, msg)
    }

    /// records a store-side line
    pub fn db(&mut self, msg: impl Into<String>) {
        self.log(Category::Db, msg)
    }

    /// records the native query text (or pseudo-code) the request executes
    pub fn query(&mut self, text: impl Into<String>) {
        self.query = Some(text.into());
    }

    /// the recorded query text, if any
    pub fn query_str(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// the raw entries
    pub fn entries(&self) -> &[(Category, String)] {
        &self.entries
    }

    /// milliseconds since the trace was started, rounded to two decimals
    pub fn elapsed_ms(&self) -> f64 {
        let ms = self.started.elapsed().as_secs_f64() * 1000.0;
        (ms * 100.0).round() / 100.0
    }

    /// renders every entry as `[SOURCE] [category] message`
    pub fn lines(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(category, msg)| format!("[{}] [{}] {}", self.source, category, msg))
            .collect()
    }

    /// consumes the tracer, returning the rendered lines, the query text and the elapsed time
    pub fn finish(mut self) -> (Vec<String>, Option<String>, f64) {
        let elapsed = self.elapsed_ms();
        self.log(Category::Timer, format!("completed in {} ms", elapsed));
        (self.lines(), self.query.take(), elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_keep_order_and_label() {
        let mut t = Tracer::new("redis");
        t.info("connecting");
        t.error("gone");
        assert_eq!(t.lines(), vec!["[REDIS] [info] connecting", "[REDIS] [error] gone"]);
        assert_eq!(t.entries()[1].0, Category::Error);
    }

    #[test]
    fn finish_appends_timer_and_returns_query() {
        let mut t = Tracer::new("mongo");
        t.query("db.poblacion.find({})");
        let (lines, query, elapsed) = t.finish();
        assert!(elapsed >= 0.0);
        assert_eq!(query.as_deref(), Some("db.poblacion.find({})"));
        assert!(lines.last().unwrap().starts_with("[MONGO] [timer] completed in"));
    }

    #[test]
    fn elapsed_is_monotonic() {
        let t = Tracer::new("x");
        let a = t.elapsed_ms();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(t.elapsed_ms() >= a);
    }
}

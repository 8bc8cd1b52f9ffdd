//! Scripted handlers that record every invocation.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use eventline_core::event::{BaseEvent, Event};
use eventline_core::handler::{EventHandler, HandlerError};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ordered log of handler names shared by several handlers.
///
/// Lets a test assert on the relative order of invocations across handlers.
#[derive(Clone, Debug, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, name: &str) {
        self.0.lock().unwrap().push(name.to_string());
    }

    /// Handler names in invocation order.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

type Predicate = Arc<dyn Fn(&dyn Event) -> bool + Send + Sync>;

#[derive(Clone)]
enum FailureMode {
    Never,
    Always,
    FirstN(u32),
    When(Predicate),
}

/// Handler that records the events it sees and fails as scripted.
///
/// ```
/// use eventline_testing::RecordingHandler;
///
/// let handler = RecordingHandler::new("mailer", ["user.registered"]).failing_times(2);
/// assert_eq!(handler.call_count(), 0);
/// ```
#[derive(Clone)]
pub struct RecordingHandler {
    name: String,
    event_types: Vec<String>,
    mode: FailureMode,
    message: String,
    delay: Option<Duration>,
    calls: Arc<AtomicU32>,
    events: Arc<Mutex<Vec<BaseEvent>>>,
    log: Option<CallLog>,
}

impl RecordingHandler {
    /// Handler that always succeeds.
    pub fn new<I, S>(name: impl Into<String>, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            event_types: event_types.into_iter().map(Into::into).collect(),
            mode: FailureMode::Never,
            message: "handler failure".to_string(),
            delay: None,
            calls: Arc::new(AtomicU32::new(0)),
            events: Arc::new(Mutex::new(Vec::new())),
            log: None,
        }
    }

    /// Fail on every call.
    #[must_use]
    pub fn failing_always(mut self) -> Self {
        self.mode = FailureMode::Always;
        self
    }

    /// Fail the first `n` calls, then succeed.
    #[must_use]
    pub fn failing_times(mut self, n: u32) -> Self {
        self.mode = FailureMode::FirstN(n);
        self
    }

    /// Fail whenever `predicate` matches the event.
    #[must_use]
    pub fn failing_when(
        mut self,
        predicate: impl Fn(&dyn Event) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.mode = FailureMode::When(Arc::new(predicate));
        self
    }

    /// Error text used for scripted failures.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Sleep before returning.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Record invocations into a shared log.
    #[must_use]
    pub fn with_call_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Events seen so far, in call order.
    #[must_use]
    pub fn events(&self) -> Vec<BaseEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Wrap in an `Arc` for subscribing.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn should_fail(&self, call: u32, event: &dyn Event) -> bool {
        match &self.mode {
            FailureMode::Never => false,
            FailureMode::Always => true,
            FailureMode::FirstN(n) => call <= *n,
            FailureMode::When(predicate) => predicate(event),
        }
    }
}

impl EventHandler for RecordingHandler {
    fn handle<'a>(&'a self, event: &'a dyn Event) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.events.lock().unwrap().push(event.to_base_event());
            if let Some(log) = &self.log {
                log.push(&self.name);
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.should_fail(call, event) {
                return Err(HandlerError::Failed(self.message.clone()));
            }
            Ok(())
        })
    }

    fn handler_name(&self) -> &str {
        &self.name
    }

    fn supported_event_types(&self) -> Vec<String> {
        self.event_types.clone()
    }
}

//! Telemetry capability.
//!
//! The pipeline only needs two things from telemetry: capturing an
//! exception and running an async unit inside a named span. Exporters and
//! sampling are configured by whoever installs the tracing subscriber.

use std::error::Error;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::{error, info_span, Instrument, Span};

/// Exception capture plus span creation.
pub trait Telemetry: Send + Sync {
    /// Report an error that must not go unnoticed.
    fn record_exception(&self, error: &(dyn Error + 'static));

    /// Span for one unit of work.
    fn span(&self, name: &str) -> Span;
}

/// Run `future` inside a span named `name`.
pub async fn in_span<F: Future>(telemetry: &dyn Telemetry, name: &str, future: F) -> F::Output {
    future.instrument(telemetry.span(name)).await
}

fn error_chain(error: &(dyn Error + 'static)) -> Vec<String> {
    let mut chain = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain
}

/// Telemetry over `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn record_exception(&self, error: &(dyn Error + 'static)) {
        error!(error = %error, causes = ?error_chain(error), "Exception captured");
    }

    fn span(&self, name: &str) -> Span {
        info_span!("unit", name = %name)
    }
}

/// Telemetry that remembers what it saw, for tests.
#[derive(Debug, Default)]
pub struct MockTelemetry {
    exceptions: Mutex<Vec<String>>,
    spans: Mutex<Vec<String>>,
}

impl MockTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of every recorded exception, oldest first.
    pub fn exceptions(&self) -> Vec<String> {
        self.exceptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Names of every span opened, oldest first.
    pub fn spans(&self) -> Vec<String> {
        self.spans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Telemetry for MockTelemetry {
    fn record_exception(&self, error: &(dyn Error + 'static)) {
        self.exceptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(error.to_string());
    }

    fn span(&self, name: &str) -> Span {
        self.spans
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(name.to_string());
        Span::none()
    }
}

/// Per-process invocation state, owned by the entry point.
///
/// Created once at startup and passed by reference into every invocation.
#[derive(Debug)]
pub struct InvocationContext {
    cold_start: AtomicBool,
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl InvocationContext {
    pub fn new() -> Self {
        Self {
            cold_start: AtomicBool::new(true),
        }
    }

    /// `true` for the first invocation of this context only.
    pub fn take_cold_start(&self) -> bool {
        self.cold_start.swap(false, Ordering::SeqCst)
    }
}

//! Capture `tracing` events so tests can assert on log output.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Dispatch, Event, Level, Subscriber, dispatcher};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

impl CapturedEvent {
    /// Field value without surrounding quotes.
    pub fn field(&self, key: &str) -> Option<String> {
        self.fields.get(key).map(|v| v.trim_matches('"').to_string())
    }
}

#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<CapturedEvent>>>);

impl Captured {
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.0.lock().unwrap().clone()
    }

    /// Events emitted under `target` whose message equals `message`.
    pub fn matching(&self, target: &str, message: &str) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.target == target && e.message == message)
            .collect()
    }

    pub fn any_from(&self, target: &str) -> bool {
        self.events().iter().any(|e| e.target == target)
    }
}

struct CaptureLayer {
    captured: Captured,
}

struct Fields<'a>(&'a mut BTreeMap<String, String>);

impl Visit for Fields<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = BTreeMap::new();
        event.record(&mut Fields(&mut fields));
        let meta = event.metadata();
        let message = fields.remove("message").unwrap_or_default();
        self.captured.0.lock().unwrap().push(CapturedEvent {
            level: *meta.level(),
            target: meta.target().to_string(),
            message,
            fields,
        });
    }
}

/// Install a thread-local subscriber capturing every event until the guard
/// is dropped.
pub fn capture() -> (Captured, dispatcher::DefaultGuard) {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::registry()
        .with(CaptureLayer {
            captured: captured.clone(),
        })
        .with(LevelFilter::TRACE);
    let guard = dispatcher::set_default(&Dispatch::new(subscriber));
    (captured, guard)
}

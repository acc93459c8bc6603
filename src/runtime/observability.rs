//! Structured logging setup and engine counters.
//!
//! Logging is plain `tracing`; `init_logging` installs a `tracing-subscriber`
//! registry honoring `RUST_LOG`. Counters are lock-free atomics shared by the
//! executor and the host, read back through [`MetricsSnapshot`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format with all fields
    Pretty,
    /// timestamp level module [instance_id] message
    #[default]
    Compact,
}

/// Logging and metrics configuration.
///
/// ```rust,no_run
/// # use duroflow::runtime::{ObservabilityConfig, LogFormat};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
///     metrics_enabled: true,
///     ..Default::default()
/// };
/// ```
///
/// Engine logs carry `instance_id`, `activity_instance`, `activity` and,
/// where relevant, `work_item`, `bookmark` and `operation` fields.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Keep engine counters
    pub metrics_enabled: bool,
    pub log_format: LogFormat,
    /// Level for the engine targets (e.g. "info", "debug")
    pub log_level: String,
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
            service_name: "duroflow".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,duroflow::runtime={level},duroflow::activity={level}")
}

/// Install a global subscriber unless one is already in place.
///
/// Returns `true` when this call installed it. An existing subscriber (from
/// another host in the same process, or a test harness) is left untouched.
pub fn init_logging(config: &ObservabilityConfig) -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    let installed = match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    };
    match installed {
        Ok(()) => true,
        Err(err) => {
            tracing::debug!(error = %err, format = ?config.log_format, "keeping the existing subscriber");
            false
        }
    }
}

/// Snapshot of engine counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub work_items_executed: u64,
    pub bookmarks_resumed: u64,
    pub faults_propagated: u64,
    pub unhandled_faults: u64,
    pub persists: u64,
    pub persist_failures: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub instances_completed: u64,
    pub instances_aborted: u64,
}

#[derive(Debug, Default)]
pub struct MetricsProvider {
    work_items_executed: AtomicU64,
    bookmarks_resumed: AtomicU64,
    faults_propagated: AtomicU64,
    unhandled_faults: AtomicU64,
    persists: AtomicU64,
    persist_failures: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    instances_completed: AtomicU64,
    instances_aborted: AtomicU64,
}

macro_rules! counter {
    ($($method:ident => $field:ident),* $(,)?) => {
        impl MetricsProvider {
            $(
                #[inline]
                pub fn $method(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> MetricsSnapshot {
                MetricsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counter! {
    record_work_item => work_items_executed,
    record_bookmark_resumed => bookmarks_resumed,
    record_fault_propagated => faults_propagated,
    record_unhandled_fault => unhandled_faults,
    record_persist => persists,
    record_persist_failure => persist_failures,
    record_transaction_committed => transactions_committed,
    record_transaction_rolled_back => transactions_rolled_back,
    record_instance_completed => instances_completed,
    record_instance_aborted => instances_aborted,
}

/// Owns the logging/metrics lifecycle for one host.
pub struct ObservabilityHandle {
    metrics_provider: Arc<MetricsProvider>,
    metrics_enabled: bool,
}

impl ObservabilityHandle {
    pub fn init(config: &ObservabilityConfig) -> Self {
        init_logging(config);
        Self {
            metrics_provider: Arc::new(MetricsProvider::default()),
            metrics_enabled: config.metrics_enabled,
        }
    }

    pub fn metrics_provider(&self) -> &Arc<MetricsProvider> {
        &self.metrics_provider
    }

    /// Counters, or `None` when metrics are disabled.
    pub fn metrics_snapshot(&self) -> Option<MetricsSnapshot> {
        self.metrics_enabled.then(|| self.metrics_provider.snapshot())
    }
}

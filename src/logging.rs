//! Logging macros for activity code.
//!
//! Each macro takes an [`crate::ActivityContext`] first and attaches
//! `instance_id`, `activity_instance` and `activity` fields. They emit under the
//! `duroflow::activity` target and are silent while the context reports
//! logging as disabled.
//!
//! ```rust,ignore
//! activity_info!(ctx, order = %order_id, "order accepted");
//! ```

#[macro_export]
macro_rules! activity_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::info!(
                target: "duroflow::activity",
                instance_id = %$ctx.workflow_instance_id(),
                activity_instance = %$ctx.instance_id(),
                activity = $ctx.display_name(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! activity_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::warn!(
                target: "duroflow::activity",
                instance_id = %$ctx.workflow_instance_id(),
                activity_instance = %$ctx.instance_id(),
                activity = $ctx.display_name(),
                $($arg)+
            );
        }
    }};
}

#[macro_export]
macro_rules! activity_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if $ctx.is_logging_enabled() {
            ::tracing::error!(
                target: "duroflow::activity",
                instance_id = %$ctx.workflow_instance_id(),
                activity_instance = %$ctx.instance_id(),
                activity = $ctx.display_name(),
                $($arg)+
            );
        }
    }};
}

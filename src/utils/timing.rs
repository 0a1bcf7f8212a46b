use std::time::{Duration, Instant};

use serde_json::json;

use crate::logging::{LogLevel, Logger};

pub struct ScopedExecutionTimer<'a> {
    task_name: &'a str,
    context: Option<&'a str>,
    started_at: Instant,
    logger: &'a Logger,
}

impl<'a> ScopedExecutionTimer<'a> {
    pub fn new(task_name: &'a str, context: Option<&'a str>, logger: &'a Logger) -> Self {
        Self {
            task_name,
            context,
            started_at: Instant::now(),
            logger,
        }
    }
}

impl Drop for ScopedExecutionTimer<'_> {
    fn drop(&mut self) {
        if !self.logger.enabled(LogLevel::Debug) {
            return;
        }
        let elapsed = self.started_at.elapsed();
        self.logger.log(
            LogLevel::Debug,
            self.context,
            &format!(
                "task '{}' finished in {}",
                self.task_name,
                format_duration_human_friendly(elapsed)
            ),
            Some(json!({
                "task": self.task_name,
                "elapsed_us": u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
            })),
        );
    }
}

pub fn measure_execution<T, F>(
    task_name: &str,
    context: Option<&str>,
    logger: &Logger,
    task: F,
) -> T
where
    F: FnOnce() -> T,
{
    let timer = ScopedExecutionTimer::new(task_name, context, logger);
    let result = task();
    drop(timer);
    result
}

fn format_duration_human_friendly(duration: Duration) -> String {
    let total_ms = duration.as_secs_f64() * 1000.0;
    if total_ms < 1_000.0 {
        return format!("{total_ms:.2} ms");
    }

    let total_seconds = total_ms / 1_000.0;
    if total_seconds < 60.0 {
        return format!("{total_ms:.2} ms ({total_seconds:.2} s)");
    }

    let minutes = (total_seconds / 60.0).floor();
    let seconds_remainder = total_seconds - (minutes * 60.0);
    format!(
        "{total_ms:.2} ms ({:.0}m {:.2}s)",
        minutes, seconds_remainder
    )
}

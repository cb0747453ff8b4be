//! Wall-time collection for tasks and layers.
//!
//! The collector is the only mutable state shared between concurrent
//! tasks; appends go through a mutex.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Collects `task:<name>` and `layer:<a>+<b>` timing entries.
#[derive(Default)]
pub struct TimingsCollector {
    entries: Mutex<Vec<(String, Duration)>>,
}

impl TimingsCollector {
    /// Record a timing entry. Safe to call from concurrent tasks.
    pub fn add(&self, label: &str, duration: Duration) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((label.to_string(), duration));
    }

    /// Render the post-run summary: per-layer breakdowns, totals, and the
    /// effective parallelism (CPU time over wall time).
    #[must_use]
    pub fn summary(&self) -> Vec<String> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if entries.is_empty() {
            return Vec::new();
        }

        let mut task_timings: Vec<(String, f64)> = Vec::new();
        let mut layer_timings: Vec<(f64, Vec<String>)> = Vec::new();
        for (label, duration) in &entries {
            if let Some(name) = label.strip_prefix("task:") {
                task_timings.push((name.to_string(), duration.as_secs_f64()));
            } else if let Some(names) = label.strip_prefix("layer:") {
                layer_timings.push((
                    duration.as_secs_f64(),
                    names.split('+').map(str::to_string).collect(),
                ));
            }
        }

        let mut lines = Vec::new();
        if !layer_timings.is_empty() {
            lines.push("Parallel Execution Layers:".to_string());
            for (layer_duration, tasks) in &layer_timings {
                lines.push(format!("\n  Layer (wall time: {layer_duration:.2}s):"));
                let mut sorted = tasks.clone();
                sorted.sort();
                for name in sorted {
                    let task_duration = task_timings
                        .iter()
                        .find(|(task, _)| *task == name)
                        .map_or(0.0, |(_, duration)| *duration);
                    lines.push(format!("    ├─ {name}: {task_duration:.2}s"));
                }
            }
        }

        let total_wall: f64 = layer_timings.iter().map(|(duration, _)| duration).sum();
        let total_cpu: f64 = task_timings.iter().map(|(_, duration)| duration).sum();
        lines.push(format!("\nTotal wall time: {total_wall:.2}s"));
        lines.push(format!("Total CPU time: {total_cpu:.2}s"));
        if total_wall > 0.0 {
            lines.push(format!(
                "Effective parallelism: {:.2}x",
                total_cpu / total_wall
            ));
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_empty_collector_is_empty() {
        let timings = TimingsCollector::default();
        assert!(timings.summary().is_empty());
    }

    #[test]
    fn test_summary_groups_tasks_under_their_layer() {
        let timings = TimingsCollector::default();
        timings.add("task:install-bun", Duration::from_secs(30));
        timings.add("task:install-go-toolchain", Duration::from_secs(50));
        timings.add(
            "layer:install-bun+install-go-toolchain",
            Duration::from_secs(50),
        );
        let summary = timings.summary().join("\n");
        assert!(summary.contains("Parallel Execution Layers:"));
        assert!(summary.contains("├─ install-bun: 30.00s"));
        assert!(summary.contains("├─ install-go-toolchain: 50.00s"));
    }

    #[test]
    fn test_summary_reports_wall_cpu_and_parallelism() {
        let timings = TimingsCollector::default();
        timings.add("task:a", Duration::from_secs(10));
        timings.add("task:b", Duration::from_secs(10));
        timings.add("layer:a+b", Duration::from_secs(10));
        let summary = timings.summary().join("\n");
        assert!(summary.contains("Total wall time: 10.00s"));
        assert!(summary.contains("Total CPU time: 20.00s"));
        assert!(summary.contains("Effective parallelism: 2.00x"));
    }

    #[test]
    fn test_summary_unknown_task_renders_zero() {
        let timings = TimingsCollector::default();
        timings.add("layer:mystery", Duration::from_secs(5));
        let summary = timings.summary().join("\n");
        assert!(summary.contains("├─ mystery: 0.00s"));
    }

    #[test]
    fn test_concurrent_appends_are_all_recorded() {
        let timings = std::sync::Arc::new(TimingsCollector::default());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let timings = timings.clone();
                std::thread::spawn(move || {
                    timings.add(&format!("task:worker-{worker}"), Duration::from_secs(1));
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        let summary = timings.summary().join("\n");
        assert!(summary.contains("Total CPU time: 8.00s"));
    }
}

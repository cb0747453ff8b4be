//! Task registry and the layered parallel scheduler.
//!
//! Tasks are pure values registered at program start. Scheduling is
//! layered-topological: every task whose dependencies are complete runs
//! concurrently with its layer siblings; a failure lets siblings finish
//! but schedules no further layer. Dependency names are validated at
//! scheduling time (forward references are fine at registration).

pub mod context;
pub mod graph;
pub mod timings;

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;

use crate::error::EngineError;
use crate::output::Console;
use timings::TimingsCollector;

/// Boxed task future.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Task body: a plain function from the shared context to a future.
pub type TaskBody<C> = fn(Arc<C>) -> TaskFuture;

/// What the scheduler needs from a context. Production uses
/// [`context::TaskContext`]; tests substitute a recording double.
pub trait EngineContext: Send + Sync + 'static {
    fn console(&self) -> &Console;
    fn timings(&self) -> &TimingsCollector;
    /// Checked between layers; a set flag refuses further scheduling.
    fn interrupted(&self) -> bool;
}

/// An immutable task record.
pub struct Task<C> {
    pub name: &'static str,
    pub deps: &'static [&'static str],
    pub description: &'static str,
    pub body: TaskBody<C>,
}

/// Ordered mapping from task name to task.
pub struct TaskRegistry<C> {
    tasks: Vec<Task<C>>,
}

impl<C> Default for TaskRegistry<C> {
    fn default() -> Self {
        Self { tasks: Vec::new() }
    }
}

impl<C> TaskRegistry<C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. Dependency names may be forward references; they
    /// are resolved when the graph is scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateTask`] when the name is taken.
    pub fn register(&mut self, task: Task<C>) -> Result<(), EngineError> {
        if self.tasks.iter().any(|existing| existing.name == task.name) {
            return Err(EngineError::DuplicateTask(task.name.to_string()));
        }
        self.tasks.push(task);
        Ok(())
    }

    #[must_use]
    pub fn tasks(&self) -> &[Task<C>] {
        &self.tasks
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

async fn run_task_with_timing<C: EngineContext>(ctx: Arc<C>, task: &Task<C>) -> Result<()> {
    let start = Instant::now();
    (task.body)(ctx.clone()).await?;
    let duration = start.elapsed();
    ctx.timings()
        .add(&format!("task:{}", task.name), duration);
    ctx.console().info(&format!(
        "✓ {} completed in {:.2}s",
        task.name,
        duration.as_secs_f64()
    ));
    Ok(())
}

/// Execute every task in the registry, respecting dependencies.
///
/// Each task runs exactly once, only after all its transitive dependencies
/// completed. Within a layer, ordering is deterministic-by-name for log
/// readability only.
///
/// # Errors
///
/// Returns [`EngineError::DependencyCycle`] when no ready layer can be
/// formed, [`EngineError::Interrupted`] when the context was interrupted
/// between layers, or the first failing task's error (by name order).
pub async fn run_task_graph<C: EngineContext>(
    registry: &TaskRegistry<C>,
    ctx: &Arc<C>,
) -> Result<()> {
    let mut remaining: BTreeMap<&str, &Task<C>> = registry
        .tasks()
        .iter()
        .map(|task| (task.name, task))
        .collect();
    let mut completed: HashSet<&str> = HashSet::new();

    while !remaining.is_empty() {
        if ctx.interrupted() {
            return Err(EngineError::Interrupted.into());
        }

        let ready: Vec<&Task<C>> = remaining
            .values()
            .filter(|task| task.deps.iter().all(|dep| completed.contains(dep)))
            .copied()
            .collect();
        if ready.is_empty() {
            let unresolved = remaining.keys().copied().collect::<Vec<_>>().join(", ");
            return Err(EngineError::DependencyCycle(unresolved).into());
        }

        for task in &ready {
            ctx.console().info(&format!("→ starting task {}", task.name));
        }

        let layer_names: Vec<&'static str> = ready.iter().map(|task| task.name).collect();
        let start = Instant::now();
        let results = futures_util::future::join_all(
            ready
                .iter()
                .copied()
                .map(|task| run_task_with_timing(ctx.clone(), task)),
        )
        .await;
        drop(ready);
        let duration = start.elapsed();
        ctx.timings()
            .add(&format!("layer:{}", layer_names.join("+")), duration);
        ctx.console().info(&format!(
            "✓ Layer completed in {:.2}s (tasks: {})",
            duration.as_secs_f64(),
            layer_names.join(", ")
        ));

        // Siblings have all finished by now; surface the first failure
        // (by name order) and schedule nothing further.
        for result in results {
            result?;
        }

        for name in layer_names {
            completed.insert(name);
            remaining.remove(name);
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Instant;

    /// Recording context for scheduler tests.
    pub struct RecordingContext {
        console: Console,
        timings: TimingsCollector,
        pub interrupted: AtomicBool,
        pub events: Mutex<Vec<(String, Instant)>>,
    }

    impl Default for RecordingContext {
        fn default() -> Self {
            Self {
                console: Console::new(true),
                timings: TimingsCollector::default(),
                interrupted: AtomicBool::new(false),
                events: Mutex::new(Vec::new()),
            }
        }
    }

    impl RecordingContext {
        pub fn record(&self, name: &str) {
            self.events
                .lock()
                .expect("events lock")
                .push((name.to_string(), Instant::now()));
        }

        pub fn names(&self) -> Vec<String> {
            self.events
                .lock()
                .expect("events lock")
                .iter()
                .map(|(name, _)| name.clone())
                .collect()
        }
    }

    impl EngineContext for RecordingContext {
        fn console(&self) -> &Console {
            &self.console
        }

        fn timings(&self) -> &TimingsCollector {
            &self.timings
        }

        fn interrupted(&self) -> bool {
            self.interrupted.load(Ordering::Relaxed)
        }
    }

    /// Inert task for structure-only tests (graph rendering).
    pub fn inert_task(
        name: &'static str,
        deps: &'static [&'static str],
    ) -> Task<RecordingContext> {
        fn body(_ctx: Arc<RecordingContext>) -> TaskFuture {
            Box::pin(async move { Ok(()) })
        }
        Task {
            name,
            deps,
            description: "",
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingContext;
    use super::*;
    use std::sync::atomic::Ordering;

    // Recording bodies: fn pointers cannot capture, so each test task gets
    // a dedicated function that records its own name.
    macro_rules! recording_body {
        ($fn_name:ident, $task_name:literal) => {
            fn $fn_name(ctx: Arc<RecordingContext>) -> TaskFuture {
                Box::pin(async move {
                    ctx.record($task_name);
                    Ok(())
                })
            }
        };
    }

    recording_body!(body_a, "a");
    recording_body!(body_b, "b");
    recording_body!(body_c, "c");
    recording_body!(body_d, "d");

    fn failing_body(ctx: Arc<RecordingContext>) -> TaskFuture {
        Box::pin(async move {
            ctx.record("boom");
            anyhow::bail!("boom failed")
        })
    }

    fn task(
        name: &'static str,
        deps: &'static [&'static str],
        body: TaskBody<RecordingContext>,
    ) -> Task<RecordingContext> {
        Task {
            name,
            deps,
            description: "",
            body,
        }
    }

    fn registry(tasks: Vec<Task<RecordingContext>>) -> TaskRegistry<RecordingContext> {
        let mut registry = TaskRegistry::new();
        for entry in tasks {
            registry.register(entry).expect("unique names");
        }
        registry
    }

    #[test]
    fn test_register_rejects_duplicate_names() {
        let mut reg = TaskRegistry::new();
        reg.register(task("a", &[], body_a)).expect("first");
        let err = reg.register(task("a", &[], body_a)).expect_err("dup");
        assert!(matches!(err, EngineError::DuplicateTask(_)));
    }

    #[tokio::test]
    async fn test_empty_registry_completes_in_zero_layers() {
        let reg: TaskRegistry<RecordingContext> = TaskRegistry::new();
        let ctx = Arc::new(RecordingContext::default());
        run_task_graph(&reg, &ctx).await.expect("empty graph");
        assert!(ctx.names().is_empty());
        assert!(ctx.timings().summary().is_empty());
    }

    #[tokio::test]
    async fn test_single_task_runs_once() {
        let reg = registry(vec![task("a", &[], body_a)]);
        let ctx = Arc::new(RecordingContext::default());
        run_task_graph(&reg, &ctx).await.expect("graph");
        assert_eq!(ctx.names(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_diamond_runs_in_three_layers() {
        // a → {b, c} → d
        let reg = registry(vec![
            task("d", &["b", "c"], body_d),
            task("b", &["a"], body_b),
            task("c", &["a"], body_c),
            task("a", &[], body_a),
        ]);
        let ctx = Arc::new(RecordingContext::default());
        run_task_graph(&reg, &ctx).await.expect("graph");

        let events = ctx.events.lock().expect("events lock").clone();
        assert_eq!(events.len(), 4);
        let position = |name: &str| {
            events
                .iter()
                .position(|(event, _)| event == name)
                .expect("task ran")
        };
        assert!(position("a") < position("b"));
        assert!(position("a") < position("c"));
        assert!(position("b") < position("d"));
        assert!(position("c") < position("d"));

        // b and c share a layer: their starts are near-simultaneous.
        let time_of = |name: &str| events[position(name)].1;
        let gap = time_of("b")
            .max(time_of("c"))
            .duration_since(time_of("b").min(time_of("c")));
        assert!(gap.as_millis() < 10, "siblings must start together");
    }

    #[tokio::test]
    async fn test_each_task_runs_exactly_once() {
        let reg = registry(vec![
            task("a", &[], body_a),
            task("b", &["a"], body_b),
            task("c", &["a", "b"], body_c),
        ]);
        let ctx = Arc::new(RecordingContext::default());
        run_task_graph(&reg, &ctx).await.expect("graph");
        let mut names = ctx.names();
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_cycle_reports_remaining_tasks() {
        let reg = registry(vec![task("a", &["b"], body_a), task("b", &["a"], body_b)]);
        let ctx = Arc::new(RecordingContext::default());
        let err = run_task_graph(&reg, &ctx).await.expect_err("cycle");
        let engine = err.downcast_ref::<EngineError>().expect("typed");
        let message = engine.to_string();
        assert!(message.contains("dependency cycle"));
        assert!(message.contains('a') && message.contains('b'));
        assert!(ctx.names().is_empty(), "no task may run before the error");
    }

    #[tokio::test]
    async fn test_failing_task_aborts_following_layers() {
        let reg = registry(vec![
            task("boom", &[], failing_body),
            task("after", &["boom"], body_b),
        ]);
        let ctx = Arc::new(RecordingContext::default());
        let err = run_task_graph(&reg, &ctx).await.expect_err("failure");
        assert!(err.to_string().contains("boom failed"));
        assert_eq!(ctx.names(), vec!["boom"], "dependent task must not run");
    }

    #[tokio::test]
    async fn test_layer_siblings_finish_even_when_one_fails() {
        let reg = registry(vec![
            task("boom", &[], failing_body),
            task("c", &[], body_c),
        ]);
        let ctx = Arc::new(RecordingContext::default());
        let _ = run_task_graph(&reg, &ctx).await.expect_err("failure");
        let mut names = ctx.names();
        names.sort();
        assert_eq!(names, vec!["boom".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_interrupt_refuses_to_schedule() {
        let reg = registry(vec![task("a", &[], body_a)]);
        let ctx = Arc::new(RecordingContext::default());
        ctx.interrupted.store(true, Ordering::Relaxed);
        let err = run_task_graph(&reg, &ctx).await.expect_err("interrupted");
        assert!(err.to_string().contains("interrupted"));
        assert!(ctx.names().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_dependency_reports_cycle() {
        let reg = registry(vec![task("a", &["ghost"], body_a)]);
        let ctx = Arc::new(RecordingContext::default());
        let err = run_task_graph(&reg, &ctx).await.expect_err("unresolvable");
        assert!(err.to_string().contains("dependency cycle"));
    }
}

//! Deferred sink tasks and the sink scheduler.
//!
//! Sinks are the only place the engine moves data. During DAG traversal each
//! sink stage enqueues a thunk capturing its collection handle and sink
//! function; after traversal the scheduler runs the queue either sequentially
//! or on one named worker thread per task.

use std::thread;

use tracing::{error, info};
use weir_common::{Result, WeirError};

/// A deferred action that materializes one collection into its sink.
pub struct SinkTask {
    stage: String,
    task: Box<dyn FnOnce() -> Result<()> + Send + 'static>,
}

impl SinkTask {
    /// Wraps a sink thunk for `stage`.
    pub fn new(
        stage: impl Into<String>,
        task: impl FnOnce() -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            stage: stage.into(),
            task: Box::new(task),
        }
    }

    /// The sink stage this task writes for.
    pub fn stage(&self) -> &str {
        &self.stage
    }
}

/// Collects sink tasks during traversal and runs them at the end of the run.
#[derive(Default)]
pub struct SinkScheduler {
    tasks: Vec<SinkTask>,
}

impl SinkScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task; enqueue order is execution order in sequential mode
    /// and failure-reporting order in parallel mode.
    pub fn enqueue(&mut self, task: SinkTask) {
        self.tasks.push(task);
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs every queued task and surfaces the first failure.
    ///
    /// Sequential mode runs tasks in enqueue order and stops at the first
    /// error. Parallel mode spawns one named worker thread per task, then
    /// joins handles in enqueue order; once a failure is observed the
    /// remaining workers are detached (their side effects may or may not
    /// complete — no rollback guarantee) and the failure is surfaced. The
    /// surfaced error wraps the task's own error as its source, never
    /// another wrapper.
    pub fn run(self, parallel: bool) -> Result<()> {
        if self.tasks.is_empty() {
            return Ok(());
        }
        if !parallel {
            for task in self.tasks {
                let stage = task.stage;
                info!(stage = %stage, "running sink task");
                (task.task)().map_err(|source| sink_failure(&stage, source))?;
            }
            return Ok(());
        }

        info!(sinks = self.tasks.len(), "running sink tasks in parallel");
        let mut handles = Vec::with_capacity(self.tasks.len());
        for (index, task) in self.tasks.into_iter().enumerate() {
            let stage = task.stage;
            let thunk = task.task;
            let handle = thread::Builder::new()
                .name(format!("pipeline-sink-task-{index}"))
                .spawn(move || (stage, thunk()))
                .map_err(|e| {
                    WeirError::Interrupted(format!("failed to spawn sink worker: {e}"))
                })?;
            handles.push(handle);
        }

        let mut failure = None;
        for handle in handles {
            match handle.join() {
                Ok((_, Ok(()))) => {}
                Ok((stage, Err(source))) => {
                    error!(stage = %stage, error = %source, "sink task failed");
                    failure = Some(sink_failure(&stage, source));
                    break;
                }
                Err(_) => {
                    failure = Some(WeirError::Interrupted(
                        "sink worker panicked".to_string(),
                    ));
                    break;
                }
            }
        }
        // Breaking out of the join loop drops the remaining handles, which
        // detaches those workers.
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn sink_failure(stage: &str, source: WeirError) -> WeirError {
    WeirError::Sink {
        stage: stage.to_string(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn recording_task(
        stage: &str,
        log: &Arc<Mutex<Vec<String>>>,
        result: Result<()>,
    ) -> SinkTask {
        let log = Arc::clone(log);
        let stage_name = stage.to_string();
        SinkTask::new(stage, move || {
            log.lock().expect("log lock").push(stage_name.clone());
            result
        })
    }

    #[test]
    fn sequential_mode_runs_in_enqueue_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = SinkScheduler::new();
        scheduler.enqueue(recording_task("first", &log, Ok(())));
        scheduler.enqueue(recording_task("second", &log, Ok(())));
        scheduler.enqueue(recording_task("third", &log, Ok(())));
        scheduler.run(false).expect("all sinks succeed");
        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn sequential_mode_stops_at_first_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = SinkScheduler::new();
        scheduler.enqueue(recording_task("ok", &log, Ok(())));
        scheduler.enqueue(recording_task(
            "boom",
            &log,
            Err(WeirError::Backend("write refused".to_string())),
        ));
        scheduler.enqueue(recording_task("never", &log, Ok(())));

        let err = scheduler.run(false).expect_err("failure propagates");
        match err {
            WeirError::Sink { stage, source } => {
                assert_eq!(stage, "boom");
                assert!(matches!(*source, WeirError::Backend(_)));
            }
            other => panic!("expected sink failure, got {other:?}"),
        }
        assert_eq!(*log.lock().expect("log lock"), vec!["ok", "boom"]);
    }

    #[test]
    fn parallel_mode_runs_all_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut scheduler = SinkScheduler::new();
        for i in 0..4 {
            let counter = Arc::clone(&counter);
            scheduler.enqueue(SinkTask::new(format!("sink-{i}"), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        scheduler.run(true).expect("all sinks succeed");
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn parallel_mode_surfaces_first_enqueued_failure() {
        let mut scheduler = SinkScheduler::new();
        scheduler.enqueue(SinkTask::new("slow-fail", || {
            thread::sleep(Duration::from_millis(50));
            Err(WeirError::Backend("slow failure".to_string()))
        }));
        scheduler.enqueue(SinkTask::new("fast-fail", || {
            Err(WeirError::Backend("fast failure".to_string()))
        }));

        // Handles are joined in enqueue order, so the first enqueued failure
        // wins even though the second failed first chronologically.
        let err = scheduler.run(true).expect_err("failure propagates");
        match err {
            WeirError::Sink { stage, source } => {
                assert_eq!(stage, "slow-fail");
                assert_eq!(source.to_string(), "backend error: slow failure");
            }
            other => panic!("expected sink failure, got {other:?}"),
        }
    }

    #[test]
    fn parallel_mode_maps_worker_panic_to_interrupted() {
        let mut scheduler = SinkScheduler::new();
        scheduler.enqueue(SinkTask::new("panics", || panic!("sink blew up")));
        let err = scheduler.run(true).expect_err("panic surfaces");
        assert!(matches!(err, WeirError::Interrupted(_)));
    }
}

use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::error::{ErrorKind, StageError};
use crate::guard::GuardedPath;
use crate::pipeline::StageResult;
use crate::sandbox::{Sandbox, StageSpec};

static HOST_PARALLELISM: Lazy<usize> = Lazy::new(|| {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
});

/// Upper bound for any batch on this host.
pub fn host_parallelism() -> usize {
    *HOST_PARALLELISM
}

/// One independent tool invocation inside a batch.
#[derive(Debug, Clone)]
pub struct CompressionTask {
    pub spec: StageSpec,
    pub input: GuardedPath,
    pub output: GuardedPath,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ParallelCompressionScheduler {
    sandbox: Sandbox,
    max_concurrency: usize,
}

impl ParallelCompressionScheduler {
    pub fn new(sandbox: Sandbox, max_concurrency: usize) -> Self {
        Self {
            sandbox,
            max_concurrency: max_concurrency.clamp(1, host_parallelism().max(1)),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run every task, at most `max_concurrency` at once.
    ///
    /// The returned results line up index-for-index with `tasks`. A failing
    /// task never stops its siblings; once `cancel` fires, tasks that have not
    /// started yet are reported as cancelled without launching.
    pub fn run_batch(
        &self,
        tasks: &[CompressionTask],
        cancel: &CancellationToken,
    ) -> Vec<StageResult> {
        if tasks.is_empty() {
            return Vec::new();
        }
        let workers = self.max_concurrency.min(tasks.len());
        debug!(tasks = tasks.len(), workers, "Dispatching compression batch");

        let run_one = |task: &CompressionTask| {
            if cancel.is_cancelled() {
                return StageResult::failure(
                    &task.spec.name,
                    Duration::ZERO,
                    0,
                    StageError::new(ErrorKind::Cancelled, "batch cancelled before start"),
                );
            }
            self.sandbox
                .run(&task.spec, &task.input, &task.output, &task.workdir, cancel)
        };

        let results: Vec<StageResult> = match ThreadPoolBuilder::new().num_threads(workers).build()
        {
            Ok(pool) => pool.install(|| tasks.par_iter().map(run_one).collect()),
            Err(err) => {
                debug!(error = %err, "Thread pool unavailable, running batch sequentially");
                tasks.iter().map(run_one).collect()
            }
        };

        let failed = results.iter().filter(|result| !result.success).count();
        info!(
            tasks = results.len(),
            failed,
            workers,
            "Compression batch finished"
        );
        results
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::guard::PathGuard;
    use crate::sandbox::{ArgToken, ToolPath};
    use std::fs;
    use std::time::Instant;
    use tempfile::tempdir;

    fn task(guard: &PathGuard, index: usize, script: &'static str) -> CompressionTask {
        let input_name = format!("in{index}.bin");
        fs::write(guard.root().join(&input_name), format!("task {index}")).unwrap();
        let workdir = guard.root().join(format!("work{index}"));
        fs::create_dir(&workdir).unwrap();
        CompressionTask {
            spec: StageSpec::new(
                format!("task[{index}]"),
                ToolPath::new("/bin/sh").unwrap(),
                vec![
                    ArgToken::Literal("-c"),
                    ArgToken::Literal(script),
                    ArgToken::Literal("sh"),
                    ArgToken::Input,
                    ArgToken::Output,
                ],
            ),
            input: guard.resolve_file(&input_name).unwrap(),
            output: guard.resolve_new(&format!("out{index}.bin")).unwrap(),
            workdir,
        }
    }

    #[test]
    fn results_keep_submission_order() {
        let dir = tempdir().unwrap();
        let guard = PathGuard::new(dir.path()).unwrap();
        let tasks = vec![
            task(&guard, 0, r#"sleep 0.3; cp "$1" "$2""#),
            task(&guard, 1, "exit 7"),
            task(&guard, 2, r#"cp "$1" "$2""#),
            task(&guard, 3, r#"sleep 0.1; cp "$1" "$2""#),
        ];
        let scheduler = ParallelCompressionScheduler::new(Sandbox::default(), 4);
        let results = scheduler.run_batch(&tasks, &CancellationToken::new());

        let names: Vec<_> = results.iter().map(|r| r.stage.as_str()).collect();
        assert_eq!(names, ["task[0]", "task[1]", "task[2]", "task[3]"]);
        let outcomes: Vec<_> = results.iter().map(|r| r.success).collect();
        assert_eq!(outcomes, [true, false, true, true]);
        assert_eq!(results[1].exit_code, Some(7));
        assert_eq!(
            fs::read_to_string(guard.root().join("out0.bin")).unwrap(),
            "task 0"
        );
    }

    #[test]
    fn cancelled_batch_launches_nothing() {
        let dir = tempdir().unwrap();
        let guard = PathGuard::new(dir.path()).unwrap();
        let tasks: Vec<_> = (0..3)
            .map(|i| task(&guard, i, r#"cp "$1" "$2""#))
            .collect();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Instant::now();
        let results =
            ParallelCompressionScheduler::new(Sandbox::default(), 2).run_batch(&tasks, &cancel);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(results.iter().all(|r| r.error.as_ref().map(|e| e.kind)
            == Some(ErrorKind::Cancelled)));
        assert!(!guard.root().join("out0.bin").exists());
    }

    #[test]
    fn concurrency_is_clamped_to_at_least_one() {
        let scheduler = ParallelCompressionScheduler::new(Sandbox::default(), 0);
        assert_eq!(scheduler.max_concurrency(), 1);
        let scheduler = ParallelCompressionScheduler::new(Sandbox::default(), usize::MAX);
        assert!(scheduler.max_concurrency() <= host_parallelism());
    }

    #[test]
    fn no_more_than_max_concurrency_tasks_overlap() {
        const SCRIPT: &str = r#"slots="$(dirname "$1")/slots"
mkdir -p "$slots"
: > "$slots/$$"
sleep 0.3
ls "$slots" | wc -l > "$2"
sleep 0.3
rm "$slots/$$""#;
        let dir = tempdir().unwrap();
        let guard = PathGuard::new(dir.path()).unwrap();
        let tasks: Vec<_> = (0..6).map(|i| task(&guard, i, SCRIPT)).collect();
        let scheduler = ParallelCompressionScheduler::new(Sandbox::default(), 2);
        let results = scheduler.run_batch(&tasks, &CancellationToken::new());
        assert!(results.iter().all(|r| r.success), "{results:?}");

        let running: Vec<usize> = (0..6)
            .map(|i| {
                let seen = fs::read_to_string(guard.root().join(format!("out{i}.bin"))).unwrap();
                seen.trim().parse().unwrap()
            })
            .collect();
        let peak = running.iter().copied().max().unwrap();
        assert!(peak <= scheduler.max_concurrency(), "{running:?}");
        if scheduler.max_concurrency() == 2 {
            assert_eq!(peak, 2, "{running:?}");
        }
    }
}

//! Purpose: Fixed-size worker pool that runs independent jobs and collects every failure.
//! Exports: `run_jobs`, `first_error`.
//! Role: Shared scheduling discipline for export jobs and each restore phase.
//! Invariants: At most `parallelism` (min 1) jobs run at once; every job runs even after failures.
//! Invariants: The error buffer holds one slot per job, so workers never block reporting.
//! Invariants: Returns only after all workers have joined.
use crate::core::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::mpsc::sync_channel;
use std::thread;
use tracing::error;

/// Runs `work` over `jobs` and returns the errors in completion order.
pub fn run_jobs<J, F>(jobs: Vec<J>, parallelism: usize, work: F) -> Vec<Error>
where
    J: Send,
    F: Fn(J) -> Result<()> + Sync,
{
    let total = jobs.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = parallelism.max(1).min(total);
    let queue = Mutex::new(jobs.into_iter().collect::<VecDeque<_>>());
    let (errors_tx, errors_rx) = sync_channel::<Error>(total);

    thread::scope(|scope| {
        for _ in 0..workers {
            let errors_tx = errors_tx.clone();
            let queue = &queue;
            let work = &work;
            scope.spawn(move || {
                loop {
                    let job = match queue.lock() {
                        Ok(mut queue) => queue.pop_front(),
                        Err(poisoned) => poisoned.into_inner().pop_front(),
                    };
                    let Some(job) = job else {
                        break;
                    };
                    if let Err(err) = work(job) {
                        let _ = errors_tx.send(err);
                    }
                }
            });
        }
    });
    drop(errors_tx);

    errors_rx.try_iter().collect()
}

/// Logs every error and returns the first.
pub fn first_error(phase: &str, errors: Vec<Error>) -> Result<()> {
    let count = errors.len();
    let mut errors = errors.into_iter();
    let Some(first) = errors.next() else {
        return Ok(());
    };
    error!(phase, error = %first, "job failed");
    for err in errors {
        error!(phase, error = %err, "job failed");
    }
    if count > 1 {
        let hint = format!("{count} jobs failed in phase {phase}; see logs for the rest");
        return Err(first.with_hint(hint));
    }
    Err(first)
}

#[cfg(test)]
mod tests {
    use super::{first_error, run_jobs};
    use crate::core::error::{Error, ErrorKind};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn every_job_runs_despite_failures() {
        let done = Mutex::new(Vec::new());
        let errors = run_jobs((0..10).collect(), 3, |i: u32| {
            done.lock().expect("lock").push(i);
            if i % 3 == 0 {
                return Err(Error::new(ErrorKind::Io).with_message(format!("job {i}")));
            }
            Ok(())
        });
        let mut done = done.into_inner().expect("lock");
        done.sort();
        assert_eq!(done, (0..10).collect::<Vec<_>>());
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn concurrency_never_exceeds_parallelism() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let errors = run_jobs((0..12).collect(), 4, |_: u32| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(errors.is_empty());
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[test]
    fn parallelism_zero_runs_sequentially() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        run_jobs((0..5).collect(), 0, |_: u32| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_error_reports_the_earliest() {
        assert!(first_error("schemas", Vec::new()).is_ok());
        let err = first_error(
            "schemas",
            vec![
                Error::new(ErrorKind::Execution).with_object("a"),
                Error::new(ErrorKind::Io).with_object("b"),
            ],
        )
        .expect_err("failure");
        assert_eq!(err.object(), Some("a"));
        assert!(err.hint().is_some_and(|hint| hint.contains("2 jobs failed")));
    }
}

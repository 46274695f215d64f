//! Bounded pool running one benchmark per worker at a time.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel;

use crate::error::ModelError;

#[derive(Debug, Default)]
pub struct Outcome {
    pub completed: Vec<String>,
    pub failed: Vec<(String, ModelError)>,
    pub cancelled: bool,
}

/// Runs `work` for every benchmark on at most `jobs` threads. A failing
/// benchmark is reported and the others keep going; once `cancel` is set no
/// further benchmark starts. Returns after every worker has been joined.
pub fn run<F>(benchmarks: &[String], jobs: usize, cancel: &AtomicBool, work: F) -> Outcome
where
    F: Fn(&str) -> Result<(), ModelError> + Sync,
{
    let (job_tx, job_rx) = channel::bounded::<&str>(benchmarks.len().max(1));
    for bench in benchmarks {
        if job_tx.send(bench).is_err() {
            break;
        }
    }
    drop(job_tx);

    let (done_tx, done_rx) = channel::unbounded();
    let workers = jobs.clamp(1, benchmarks.len().max(1));
    let joined = crossbeam::scope(|s| {
        for id in 0..workers {
            let jobs = job_rx.clone();
            let done = done_tx.clone();
            let work = &work;
            s.spawn(move |_| {
                for bench in jobs.iter() {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    tracing::info!(worker = id, benchmark = bench, "starting");
                    let result = work(bench);
                    if done.send((bench.to_string(), result)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(done_tx);
    if joined.is_err() {
        tracing::error!("a benchmark worker panicked");
    }

    let mut outcome = Outcome::default();
    for (bench, result) in done_rx.iter() {
        match result {
            Ok(()) => outcome.completed.push(bench),
            Err(ModelError::Cancelled) => {}
            Err(err) => {
                tracing::error!(benchmark = %bench, "{err}");
                outcome.failed.push((bench, err));
            }
        }
    }
    outcome.cancelled = cancel.load(Ordering::Relaxed);
    outcome
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("bench{i}")).collect()
    }

    #[test]
    fn failures_do_not_stop_the_others() {
        let cancel = AtomicBool::new(false);
        let mut outcome = run(&names(6), 3, &cancel, |bench| {
            if bench == "bench2" {
                Err(ModelError::MissingInput(bench.to_string()))
            } else {
                Ok(())
            }
        });
        outcome.completed.sort();
        assert_eq!(outcome.completed.len(), 5);
        assert!(!outcome.completed.contains(&"bench2".to_string()));
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "bench2");
        assert!(!outcome.cancelled);
    }

    #[test]
    fn cancellation_stops_new_benchmarks() {
        let cancel = AtomicBool::new(false);
        let started = Mutex::new(Vec::new());
        let outcome = run(&names(4), 1, &cancel, |bench| {
            started.lock().unwrap().push(bench.to_string());
            cancel.store(true, Ordering::Relaxed);
            Err(ModelError::Cancelled)
        });
        assert_eq!(*started.lock().unwrap(), vec!["bench0".to_string()]);
        assert!(outcome.cancelled);
        assert!(outcome.completed.is_empty());
        assert!(outcome.failed.is_empty());
    }

    #[test]
    fn no_benchmarks() {
        let cancel = AtomicBool::new(false);
        let outcome = run(&[], 4, &cancel, |_| Ok(()));
        assert!(outcome.completed.is_empty());
    }
}

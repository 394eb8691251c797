//! Worker pools that run trials off the optimizer's control thread.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, TryRecvError};

use crate::error::{HyperError, Result};
use crate::trial::Trial;

/// A unit of work submitted to a pool.
pub type Job = Box<dyn FnOnce() -> Result<Trial> + Send + 'static>;

/// Handle to a submitted job. Dropping it without waiting does not stop the
/// job, [`TrialFuture::cancel`] does if it has not started yet.
pub struct TrialFuture {
    rx: Receiver<Result<Trial>>,
    cancelled: Arc<AtomicBool>,
}

impl fmt::Debug for TrialFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrialFuture")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl TrialFuture {
    pub fn receiver(&self) -> &Receiver<Result<Trial>> {
        &self.rx
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The result if the job has finished.
    pub fn try_result(&self) -> Option<Result<Trial>> {
        match self.rx.try_recv() {
            Ok(res) => Some(res),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(HyperError::WorkerFailed("job was dropped".to_string()))),
        }
    }

    /// Block until the job finishes.
    pub fn wait(self) -> Result<Trial> {
        self.rx
            .recv()
            .map_err(|_| HyperError::WorkerFailed("job was dropped".to_string()))?
    }
}

/// Wrap `job` so that it is skipped once cancelled and a panic inside it
/// turns into an error, returning the runnable task and its future.
fn package(job: Job) -> (impl FnOnce() + Send + 'static, TrialFuture) {
    let (tx, rx) = bounded(1);
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);
    let task = move || {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        let res = panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "trial panicked".to_string());
            Err(HyperError::WorkerFailed(msg))
        });
        // the receiver may be gone if the optimizer stopped early
        let _ = tx.send(res);
    };
    (task, TrialFuture { rx, cancelled })
}

/// Something that can run trials concurrently.
pub trait WorkerPool: Send + Sync {
    fn submit(&self, job: Job) -> TrialFuture;

    fn num_workers(&self) -> usize;
}

/// A pool of rayon worker threads.
pub struct ThreadPool {
    pool: rayon::ThreadPool,
}

impl ThreadPool {
    /// `num_threads == 0` lets rayon pick.
    pub fn new(num_threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("hyper-worker-{}", i))
            .build()
            .map_err(|e| HyperError::ThreadPool(e.to_string()))?;
        Ok(ThreadPool { pool })
    }
}

impl WorkerPool for ThreadPool {
    fn submit(&self, job: Job) -> TrialFuture {
        let (task, future) = package(job);
        self.pool.spawn(task);
        future
    }

    fn num_workers(&self) -> usize {
        self.pool.current_num_threads()
    }
}

/// Runs every job synchronously inside `submit`, while still reporting
/// `num_workers` so the optimizer drives its parallel loop.
#[derive(Debug, Clone, Copy)]
pub struct ImmediatePool {
    pub num_workers: usize,
}

impl Default for ImmediatePool {
    fn default() -> Self {
        ImmediatePool { num_workers: 2 }
    }
}

impl WorkerPool for ImmediatePool {
    fn submit(&self, job: Job) -> TrialFuture {
        let (task, future) = package(job);
        task();
        future
    }

    fn num_workers(&self) -> usize {
        self.num_workers.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::ContractionProblem;
    use crate::space::Setting;
    use crate::tree::ContractionTree;
    use std::sync::Barrier;

    fn job(seed: u64) -> Job {
        Box::new(move || {
            let problem = Arc::new(ContractionProblem::from_equation("ab,bc->ac", [('a', 2), ('b', 3), ('c', 4)])?);
            let tree = ContractionTree::from_ssa_path(problem, &[vec![0, 1]])?;
            let setting = Setting {
                method: "test".to_string(),
                params: Default::default(),
                seed,
            };
            Ok(Trial::new(tree, setting))
        })
    }

    #[test]
    fn immediate_pool_resolves_on_submit() {
        let pool = ImmediatePool::default();
        let fut = pool.submit(job(3));
        let trial = fut.try_result().unwrap().unwrap();
        assert_eq!(trial.setting.seed, 3);
        assert_eq!(trial.flops, 24.0);
    }

    #[test]
    fn thread_pool_runs_jobs() {
        let pool = ThreadPool::new(2).unwrap();
        assert_eq!(pool.num_workers(), 2);
        let futures: Vec<TrialFuture> = (0..6).map(|s| pool.submit(job(s))).collect();
        let mut seeds: Vec<u64> = futures.into_iter().map(|f| f.wait().unwrap().setting.seed).collect();
        seeds.sort_unstable();
        assert_eq!(seeds, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn panics_become_errors() {
        let pool = ImmediatePool::default();
        let fut = pool.submit(Box::new(|| -> Result<Trial> { panic!("boom") }));
        match fut.wait() {
            Err(HyperError::WorkerFailed(msg)) => assert_eq!(msg, "boom"),
            other => panic!("unexpected {:?}", other.map(|t| t.setting)),
        }
    }

    #[test]
    fn cancelled_jobs_never_run() {
        let pool = ThreadPool::new(1).unwrap();
        let gate = Arc::new(Barrier::new(2));
        let g = Arc::clone(&gate);
        // occupy the single worker until the second job is cancelled
        let blocker = pool.submit(Box::new(move || {
            g.wait();
            job(0)()
        }));
        let queued = pool.submit(job(1));
        queued.cancel();
        gate.wait();
        assert!(blocker.wait().is_ok());
        assert!(matches!(queued.wait(), Err(HyperError::WorkerFailed(_))));
    }
}

//! Serial job queues keyed by storage id.
//!
//! Each key gets one worker task, created on first use, that runs its jobs
//! one at a time in submission order. Different keys run concurrently. A
//! job that fails or panics is reported through its completion channel and
//! the worker moves on to the next one.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

pub type Job = BoxFuture<'static, anyhow::Result<()>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    Panicked(String),
}

struct QueuedJob {
    job: Job,
    done: oneshot::Sender<JobOutcome>,
}

#[derive(Default)]
pub struct JobQueue {
    workers: Mutex<HashMap<i32, mpsc::UnboundedSender<QueuedJob>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job to the queue of `key`. The receiver resolves once the
    /// job has run; dropping it does not cancel the job.
    pub fn enqueue(&self, key: i32, job: Job) -> oneshot::Receiver<JobOutcome> {
        let (done, receiver) = oneshot::channel();
        let mut queued = QueuedJob { job, done };

        let Ok(mut workers) = self.workers.lock() else {
            error!(key, "Job queue registry poisoned, dropping job");
            return receiver;
        };

        if let Some(sender) = workers.get(&key) {
            match sender.send(queued) {
                Ok(()) => return receiver,
                // worker is gone, start a fresh one below
                Err(mpsc::error::SendError(job)) => queued = job,
            }
        }

        let (sender, jobs) = mpsc::unbounded_channel();
        tokio::spawn(worker(key, jobs));
        debug!(key, "Started job queue");
        if sender.send(queued).is_err() {
            error!(key, "Job queue worker stopped before accepting a job");
        }
        workers.insert(key, sender);
        receiver
    }

    /// Number of keys that have a queue.
    pub fn len(&self) -> usize {
        self.workers.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn worker(key: i32, mut jobs: mpsc::UnboundedReceiver<QueuedJob>) {
    while let Some(QueuedJob { job, done }) = jobs.recv().await {
        let outcome = match AssertUnwindSafe(job).catch_unwind().await {
            Ok(Ok(())) => JobOutcome::Completed,
            Ok(Err(e)) => {
                error!(key, error = %format!("{e:#}"), "Job failed");
                JobOutcome::Failed(format!("{e:#}"))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(key, panic = %message, "Job panicked");
                JobOutcome::Panicked(message)
            }
        };
        // the submitter may have stopped waiting
        let _ = done.send(outcome);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ntest::timeout;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Barrier;

    fn tracked(
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<usize>>>,
        n: usize,
    ) -> Job {
        Box::pin(async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            order.lock().unwrap().push(n);
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn test_same_key_never_overlaps() {
        let queue = JobQueue::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let receivers: Vec<_> = (0..4)
            .map(|n| queue.enqueue(7, tracked(running.clone(), peak.clone(), order.clone(), n)))
            .collect();
        for receiver in receivers {
            assert_eq!(receiver.await.unwrap(), JobOutcome::Completed);
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    #[timeout(5000)]
    async fn test_distinct_keys_run_concurrently() {
        let queue = JobQueue::new();
        let barrier = Arc::new(Barrier::new(2));

        // each job waits for the other; serial execution would deadlock
        let receivers: Vec<_> = [1, 2]
            .into_iter()
            .map(|key| {
                let barrier = barrier.clone();
                queue.enqueue(
                    key,
                    Box::pin(async move {
                        barrier.wait().await;
                        Ok(())
                    }),
                )
            })
            .collect();
        for receiver in receivers {
            assert_eq!(receiver.await.unwrap(), JobOutcome::Completed);
        }
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    #[timeout(5000)]
    async fn test_failures_and_panics_do_not_block_the_queue() {
        let queue = JobQueue::new();

        let failed = queue.enqueue(3, Box::pin(async { Err(anyhow::anyhow!("disk full")) }));
        let panicked = queue.enqueue(
            3,
            Box::pin(async {
                let broken = true;
                if broken {
                    panic!("executor bug");
                }
                Ok(())
            }),
        );
        let next = queue.enqueue(3, Box::pin(async { Ok(()) }));

        assert_eq!(failed.await.unwrap(), JobOutcome::Failed("disk full".to_string()));
        assert_eq!(
            panicked.await.unwrap(),
            JobOutcome::Panicked("executor bug".to_string())
        );
        assert_eq!(next.await.unwrap(), JobOutcome::Completed);
    }
}

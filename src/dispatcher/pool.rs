//! Bounded worker pool primitive backing the dispatcher.
//!
//! A pool is a bounded job queue drained by a fixed set of tokio tasks.
//! Producers enqueue, workers dequeue; there is no external locking and no
//! unbounded growth: a full queue is reported immediately instead of blocking
//! the producer.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ErrorKind, ErrorRecord};

pub(crate) type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Queue slot reserved ahead of job construction.
///
/// Reserving first lets callers keep ownership of completion channels until
/// admission is certain, so queue saturation can be reported through the same
/// channel the job would have used.
pub(crate) struct JobPermit {
    permit: mpsc::OwnedPermit<Job>,
}

impl std::fmt::Debug for JobPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPermit").finish_non_exhaustive()
    }
}

impl JobPermit {
    pub(crate) fn submit(self, job: impl Future<Output = ()> + Send + 'static) {
        self.permit.send(Box::pin(job));
    }
}

/// Fixed-size pool of workers draining a bounded queue.
pub(crate) struct WorkerPool {
    name: &'static str,
    sender: StdMutex<Option<mpsc::Sender<Job>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl WorkerPool {
    /// Spawns `workers` tasks draining a queue of `capacity` slots.
    ///
    /// Must be called within a tokio runtime.
    pub(crate) fn new(name: &'static str, workers: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|_| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        // 先取任务再释放锁 执行期间其它 worker 可继续取队
                        let job = { receiver.lock().await.recv().await };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            name,
            sender: StdMutex::new(Some(sender)),
            workers: StdMutex::new(handles),
            capacity,
        }
    }

    /// Reserves a queue slot, failing fast with `resource-exhausted` when full.
    pub(crate) fn reserve(&self) -> Result<JobPermit, ErrorRecord> {
        // sender 的锁只覆盖克隆 永不跨 await
        let sender = {
            let guard = self.sender.lock().expect("pool sender lock");
            guard.clone()
        };
        let Some(sender) = sender else {
            return Err(ErrorRecord::new(
                ErrorKind::InternalError,
                "tsumugi",
                format!("{} pool is shut down", self.name),
            ));
        };

        match sender.try_reserve_owned() {
            Ok(permit) => Ok(JobPermit { permit }),
            Err(TrySendError::Full(_)) => {
                warn!(pool = self.name, "job queue is full");
                Err(ErrorRecord::new(
                    ErrorKind::ResourceExhausted,
                    "tsumugi",
                    format!("{} pool queue is full ({} slots)", self.name, self.capacity),
                ))
            }
            Err(TrySendError::Closed(_)) => Err(ErrorRecord::new(
                ErrorKind::InternalError,
                "tsumugi",
                format!("{} pool is shut down", self.name),
            )),
        }
    }

    /// Pending jobs currently queued.
    pub(crate) fn queue_depth(&self) -> usize {
        let guard = self.sender.lock().expect("pool sender lock");
        guard
            .as_ref()
            .map(|sender| self.capacity - sender.capacity())
            .unwrap_or(0)
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Closes the queue, drains running work up to `timeout`, then aborts the rest.
    pub(crate) async fn shutdown(&self, timeout: Duration) {
        // 关闭队列 worker 取完存量任务后自行退出
        {
            let mut guard = self.sender.lock().expect("pool sender lock");
            guard.take();
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().expect("pool workers lock");
            guard.drain(..).collect()
        };

        let drain = async {
            for handle in &handles {
                while !handle.is_finished() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        };

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(pool = self.name, "shutdown timed out, aborting workers");
            for handle in &handles {
                handle.abort();
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
        debug!(pool = self.name, "pool shut down");
    }
}

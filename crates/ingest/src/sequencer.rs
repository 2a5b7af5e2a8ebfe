use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(60);

type Job = BoxFuture<'static, ()>;

/// How a sequenced task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed(String),
    Panicked,
    /// Submitted after `shutdown`; never ran.
    Rejected,
    /// The lane went away before reporting, e.g. during runtime shutdown.
    Abandoned,
}

/// Handle to a queued task. Dropping it does not cancel anything.
#[derive(Debug)]
pub struct Completion(oneshot::Receiver<TaskOutcome>);

impl Completion {
    pub async fn wait(self) -> TaskOutcome {
        self.0.await.unwrap_or(TaskOutcome::Abandoned)
    }
}

struct Lane {
    id: u64,
    tx: mpsc::UnboundedSender<Job>,
}

struct LaneTable {
    lanes: HashMap<String, Lane>,
    /// Cloned into every worker; `None` once shutdown has begun.
    alive: Option<mpsc::Sender<()>>,
}

struct Inner {
    table: Mutex<LaneTable>,
    /// Yields `None` when every worker has exited.
    workers_gone: Mutex<Option<mpsc::Receiver<()>>>,
    idle_grace: Duration,
    next_lane_id: AtomicU64,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, LaneTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runs tasks one at a time per key, in submission order.
///
/// Every key owns a lane: an unbounded queue drained by its own worker task.
/// Different keys never wait on each other. A lane whose queue stays empty for
/// the idle grace period is retired; the next task for that key opens a new one.
#[derive(Clone)]
pub struct Sequencer {
    inner: Arc<Inner>,
}

impl Sequencer {
    pub fn new(idle_grace: Duration) -> Self {
        let (alive, workers_gone) = mpsc::channel(1);
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(LaneTable {
                    lanes: HashMap::new(),
                    alive: Some(alive),
                }),
                workers_gone: Mutex::new(Some(workers_gone)),
                idle_grace,
                next_lane_id: AtomicU64::new(1),
            }),
        }
    }

    /// Queue `task` behind everything already queued for `key`.
    ///
    /// Errors and panics end that task only; later tasks for the key still run.
    /// After `shutdown` the task is dropped and reported as `Rejected`.
    /// Must be called from within a Tokio runtime.
    pub fn enqueue<F, E>(&self, key: &str, task: F) -> Completion
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job_key = key.to_string();
        let job: Job = Box::pin(async move {
            let outcome = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => TaskOutcome::Completed,
                Ok(Err(e)) => {
                    error!(key = %job_key, error = %e, "sequenced task failed");
                    TaskOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    error!(key = %job_key, "sequenced task panicked");
                    TaskOutcome::Panicked
                }
            };
            let _ = done_tx.send(outcome);
        });

        let mut table = self.inner.table();
        let Some(alive) = table.alive.clone() else {
            drop(table);
            debug!(key, "sequencer closed, task rejected");
            let (done_tx, done_rx) = oneshot::channel();
            let _ = done_tx.send(TaskOutcome::Rejected);
            return Completion(done_rx);
        };
        let job = match table.lanes.get(key) {
            Some(lane) => match lane.tx.send(job) {
                Ok(()) => return Completion(done_rx),
                // Worker is gone without retiring its entry; replace the lane.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let lane_id = self.inner.next_lane_id.fetch_add(1, Ordering::Relaxed);
        // The receiver is alive right here, so this send cannot fail.
        let _ = tx.send(job);
        table.lanes.insert(key.to_string(), Lane { id: lane_id, tx });
        drop(table);

        debug!(key, lane_id, "lane opened");
        tokio::spawn(run_lane(
            self.inner.clone(),
            key.to_string(),
            lane_id,
            rx,
            alive,
        ));

        Completion(done_rx)
    }

    /// Number of keys that currently own a lane.
    pub fn lane_count(&self) -> usize {
        self.inner.table().lanes.len()
    }

    /// Stop accepting work and wait for every lane to finish what it already
    /// holds. Returns `false` if lanes were still busy when `timeout` ran out.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let pending = {
            let mut table = self.inner.table();
            table.alive = None;
            // Dropping the senders lets each worker exit once its queue is empty.
            let lanes = table.lanes.len();
            table.lanes.clear();
            lanes
        };
        let workers_gone = self
            .inner
            .workers_gone
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut workers_gone) = workers_gone else {
            return true;
        };

        debug!(lanes = pending, "draining sequencer");
        tokio::time::timeout(timeout, workers_gone.recv())
            .await
            .is_ok()
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_GRACE)
    }
}

async fn run_lane(
    inner: Arc<Inner>,
    key: String,
    lane_id: u64,
    mut rx: mpsc::UnboundedReceiver<Job>,
    _alive: mpsc::Sender<()>,
) {
    loop {
        let job = match tokio::time::timeout(inner.idle_grace, rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => {
                // Holding the map lock means no sender can slip a job in between
                // the emptiness check and the removal.
                let pending = {
                    let mut table = inner.table();
                    match rx.try_recv() {
                        Ok(job) => Some(job),
                        Err(_) => {
                            if table.lanes.get(&key).is_some_and(|lane| lane.id == lane_id) {
                                table.lanes.remove(&key);
                            }
                            None
                        }
                    }
                };
                match pending {
                    Some(job) => job,
                    None => {
                        debug!(key = %key, lane_id, "lane retired after idle grace");
                        break;
                    }
                }
            }
        };
        job.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn same_key_runs_in_submission_order_without_overlap() {
        let sequencer = Sequencer::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut completions = Vec::new();
        for i in 0..8u64 {
            let order = order.clone();
            let running = running.clone();
            let overlaps = overlaps.clone();
            completions.push(sequencer.enqueue("5551234", async move {
                if running.swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                // Earlier tasks sleep longer, so any parallelism would reorder them.
                tokio::time::sleep(Duration::from_millis(40 - i * 5)).await;
                order.lock().unwrap().push(i);
                running.store(false, Ordering::SeqCst);
                Ok::<_, String>(())
            }));
        }

        for completion in completions {
            assert_eq!(completion.wait().await, TaskOutcome::Completed);
        }
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(sequencer.lane_count(), 1);
    }

    #[tokio::test]
    async fn failure_does_not_break_the_chain() {
        let sequencer = Sequencer::default();
        let ran = Arc::new(AtomicBool::new(false));

        let failing = sequencer.enqueue("k", async { Err::<(), _>("db unavailable") });
        let ran_flag = ran.clone();
        let next = sequencer.enqueue("k", async move {
            ran_flag.store(true, Ordering::SeqCst);
            Ok::<_, String>(())
        });

        assert_eq!(failing.wait().await, TaskOutcome::Failed("db unavailable".into()));
        assert_eq!(next.wait().await, TaskOutcome::Completed);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panic_is_contained_to_its_task() {
        let sequencer = Sequencer::default();

        let boom = sequencer.enqueue("k", async {
            if true {
                panic!("boom");
            }
            Ok::<_, String>(())
        });
        let after = sequencer.enqueue("k", async { Ok::<_, String>(()) });

        assert_eq!(boom.wait().await, TaskOutcome::Panicked);
        assert_eq!(after.wait().await, TaskOutcome::Completed);
    }

    #[tokio::test]
    async fn different_keys_run_concurrently() {
        let sequencer = Sequencer::default();
        let gate = Arc::new(Notify::new());

        let waiter_gate = gate.clone();
        let blocked = sequencer.enqueue("a", async move {
            waiter_gate.notified().await;
            Ok::<_, String>(())
        });
        let opener_gate = gate.clone();
        let opener = sequencer.enqueue("b", async move {
            opener_gate.notify_one();
            Ok::<_, String>(())
        });

        let both = async { (blocked.wait().await, opener.wait().await) };
        let (a, b) = tokio::time::timeout(Duration::from_secs(5), both)
            .await
            .expect("key b must not wait behind key a");
        assert_eq!(a, TaskOutcome::Completed);
        assert_eq!(b, TaskOutcome::Completed);
        assert_eq!(sequencer.lane_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_lane_is_retired_after_grace() {
        let sequencer = Sequencer::new(Duration::from_secs(60));
        sequencer
            .enqueue("k", async { Ok::<_, String>(()) })
            .wait()
            .await;
        assert_eq!(sequencer.lane_count(), 1);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(sequencer.lane_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(sequencer.lane_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_lets_queued_work_finish() {
        let sequencer = Sequencer::default();
        let finished = Arc::new(AtomicUsize::new(0));

        let completions: Vec<_> = (0..3)
            .map(|_| {
                let finished = finished.clone();
                sequencer.enqueue("5551234", async move {
                    tokio::time::sleep(Duration::from_secs(20)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                })
            })
            .collect();

        assert!(sequencer.shutdown(Duration::from_secs(120)).await);
        assert_eq!(finished.load(Ordering::SeqCst), 3);
        assert_eq!(sequencer.lane_count(), 0);
        for completion in completions {
            assert_eq!(completion.wait().await, TaskOutcome::Completed);
        }

        let late = sequencer.enqueue("5551234", async { Ok::<_, String>(()) });
        assert_eq!(late.wait().await, TaskOutcome::Rejected);
        assert_eq!(sequencer.lane_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_gives_up_after_timeout() {
        let sequencer = Sequencer::default();
        let _stuck = sequencer.enqueue("k", async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok::<_, String>(())
        });

        assert!(!sequencer.shutdown(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn shutdown_without_lanes_returns_immediately() {
        let sequencer = Sequencer::default();
        assert!(sequencer.shutdown(Duration::from_millis(10)).await);
        assert!(sequencer.shutdown(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn new_work_resets_the_grace_period() {
        let sequencer = Sequencer::new(Duration::from_secs(60));
        sequencer.enqueue("k", async { Ok::<_, String>(()) }).wait().await;

        tokio::time::sleep(Duration::from_secs(45)).await;
        sequencer.enqueue("k", async { Ok::<_, String>(()) }).wait().await;

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(sequencer.lane_count(), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        tokio::task::yield_now().await;
        assert_eq!(sequencer.lane_count(), 0);

        // A retired key opens a fresh lane on demand.
        let outcome = sequencer.enqueue("k", async { Ok::<_, String>(()) }).wait().await;
        assert_eq!(outcome, TaskOutcome::Completed);
        assert_eq!(sequencer.lane_count(), 1);
    }
}

//! Rate limited, de-duplicating work queue of object keys.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use opentelemetry::{KeyValue, global, metrics::Counter};
use tokio::{sync::Notify, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    errors::ControllerError,
    utils::{ControllerMetrics, metric_name},
};

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

struct State<T> {
    queue: VecDeque<T>,
    /// Items waiting to be processed, every queued item is dirty.
    dirty: HashSet<T>,
    /// Items currently handed out to a worker.
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

/// A key is never handed to two workers at once: an item re-added while being
/// processed is queued again once [`WorkQueue::done`] is called.
pub(crate) struct WorkQueue<T> {
    name: &'static str,
    state: Mutex<State<T>>,
    notify: Notify,
    requeues: Counter<u64>,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
{
    pub fn new(name: &'static str) -> Arc<Self> {
        let requeues = global::meter("apiextensions_workqueue")
            .u64_counter(metric_name("workqueue_requeue_count"))
            .with_description("Count of rate limited re-queues")
            .build();
        Arc::new(Self {
            name,
            state: Mutex::new(State {
                queue: Default::default(),
                dirty: Default::default(),
                processing: Default::default(),
                failures: Default::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            requeues,
        })
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, item: T) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.notify.notify_one();
    }

    /// Adds the item once `delay` elapsed.
    pub fn add_after(self: &Arc<Self>, item: T, delay: Duration) {
        if delay.is_zero() {
            return self.add(item);
        }
        let queue = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            queue.add(item);
        });
    }

    /// Adds the item after its exponential back-off delay.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut state = self.lock();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            let delay = backoff(*failures);
            *failures += 1;
            delay
        };
        self.requeues.add(1, &[KeyValue::new("queue", self.name)]);
        self.add_after(item, delay);
    }

    /// Stops tracking failures of the item.
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Blocks until an item is available, `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Marks processing of the item as finished.
    pub fn done(&self, item: &T) {
        let mut state = self.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}

fn backoff(failures: u32) -> Duration {
    BASE_DELAY
        .checked_mul(2u32.saturating_pow(failures.min(31)))
        .unwrap_or(MAX_DELAY)
        .min(MAX_DELAY)
}

/// Runs `workers` loops processing items of `queue` with `handler` until
/// `cancel` fires. Failed items are re-queued rate limited, successful ones
/// are forgotten.
pub(crate) async fn run_workers<T, H, F>(
    name: &'static str,
    queue: Arc<WorkQueue<T>>,
    workers: usize,
    cancel: CancellationToken,
    handler: H,
) where
    T: Clone + Eq + Hash + Send + Sync + std::fmt::Debug + 'static,
    H: Fn(T) -> F + Clone + Send + Sync + 'static,
    F: Future<Output = Result<(), ControllerError>> + Send,
{
    info!("starting {} with {} worker(s)", name, workers);
    let metrics = ControllerMetrics::new(name);
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers.max(1) {
        let queue = queue.clone();
        let handler = handler.clone();
        let metrics = metrics.clone();
        handles.push(tokio::spawn(async move {
            while let Some(key) = queue.get().await {
                let start = Instant::now();
                let result = handler(key.clone()).await;
                metrics.record(start, result.is_err());
                match result {
                    Ok(()) => queue.forget(&key),
                    Err(e) => {
                        warn!("{} failed to sync {:?}, requeuing: {}", name, key, e);
                        queue.add_rate_limited(key.clone());
                    }
                }
                queue.done(&key);
            }
        }));
    }
    cancel.cancelled().await;
    info!("shutting down {}", name);
    queue.shut_down();
    for handle in handles {
        if let Err(e) = handle.await {
            error!("{} worker terminated abnormally: {}", name, e);
        }
    }
}

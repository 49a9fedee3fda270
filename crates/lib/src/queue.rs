//! Append-only work queue drained either concurrently or sequentially.
//!
//! `enqueue` never blocks: it appends and, when no drain loop is running, spawns one.
//! In concurrent mode the loop starts every item without waiting for it; in sequential
//! mode each item fully settles before the next is popped. Outcomes go to observers
//! registered with [`TaskQueue::on_result`]; the queue never halts on a failed item.
//!
//! There is no capacity bound, cancellation, or per-item timeout. Wrap the processing
//! function to add them.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    /// Overlapping invocations; completion order is unconstrained.
    Concurrent,
    /// One invocation at a time, in enqueue order.
    Sequential,
}

/// Outcome of one processed item. Successful items that produced nothing are not reported.
#[derive(Debug)]
pub enum QueueOutcome<R> {
    Completed(R),
    Failed(anyhow::Error),
}

type ProcessFn<I, R> =
    Arc<dyn Fn(I) -> BoxFuture<'static, anyhow::Result<Option<R>>> + Send + Sync>;
type Observer<R> = Arc<dyn Fn(&QueueOutcome<R>) + Send + Sync>;

struct DrainState<I> {
    tasks: VecDeque<I>,
    draining: bool,
    in_flight: usize,
}

struct Inner<I, R> {
    mode: DrainMode,
    process: ProcessFn<I, R>,
    state: Mutex<DrainState<I>>,
    observers: RwLock<Vec<Observer<R>>>,
    idle: Notify,
}

/// Cheaply cloneable handle; clones share the same queue.
pub struct TaskQueue<I, R> {
    inner: Arc<Inner<I, R>>,
}

impl<I, R> Clone for TaskQueue<I, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I, R> TaskQueue<I, R>
where
    I: Send + 'static,
    R: Send + 'static,
{
    pub fn new<F, Fut>(mode: DrainMode, process: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<R>>> + Send + 'static,
    {
        let process: ProcessFn<I, R> = Arc::new(move |item| process(item).boxed());
        Self {
            inner: Arc::new(Inner {
                mode,
                process,
                state: Mutex::new(DrainState {
                    tasks: VecDeque::new(),
                    draining: false,
                    in_flight: 0,
                }),
                observers: RwLock::new(Vec::new()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn concurrent<F, Fut>(process: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<R>>> + Send + 'static,
    {
        Self::new(DrainMode::Concurrent, process)
    }

    pub fn sequential<F, Fut>(process: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<R>>> + Send + 'static,
    {
        Self::new(DrainMode::Sequential, process)
    }

    pub fn mode(&self) -> DrainMode {
        self.inner.mode
    }

    /// Subscribe to item outcomes. Observers run on the task that processed the item.
    pub fn on_result<F>(&self, observer: F)
    where
        F: Fn(&QueueOutcome<R>) + Send + Sync + 'static,
    {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(observer));
    }

    /// Append to the tail and start draining if idle. Must be called within a tokio runtime.
    pub fn enqueue(&self, item: I) {
        let start = {
            let mut state = self.inner.lock_state();
            state.tasks.push_back(item);
            !std::mem::replace(&mut state.draining, true)
        };
        if start {
            let inner = self.inner.clone();
            tokio::spawn(inner.drain());
        }
    }

    /// Items waiting to be popped (not counting in-flight ones).
    pub fn len(&self) -> usize {
        self.inner.lock_state().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// No drain loop is running and no invocation is in flight.
    pub fn is_idle(&self) -> bool {
        self.inner.lock_state().is_idle()
    }

    /// Wait until the queue is idle.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl<I> DrainState<I> {
    fn is_idle(&self) -> bool {
        !self.draining && self.in_flight == 0
    }
}

impl<I, R> Inner<I, R>
where
    I: Send + 'static,
    R: Send + 'static,
{
    fn lock_state(&self) -> MutexGuard<'_, DrainState<I>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let item = {
                let mut state = self.lock_state();
                match state.tasks.pop_front() {
                    Some(item) => {
                        state.in_flight += 1;
                        item
                    }
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };
            let invocation = self.clone().invoke(item);
            match self.mode {
                DrainMode::Sequential => invocation.await,
                DrainMode::Concurrent => {
                    tokio::spawn(invocation);
                }
            }
        }
        self.notify_if_idle();
    }

    /// Run one item to completion, report its outcome, and release its in-flight slot.
    async fn invoke(self: Arc<Self>, item: I) {
        let process = self.process.clone();
        let settled = AssertUnwindSafe(async move { process(item).await })
            .catch_unwind()
            .await;
        let outcome = match settled {
            Ok(Ok(Some(result))) => Some(QueueOutcome::Completed(result)),
            Ok(Ok(None)) => None,
            Ok(Err(e)) => Some(QueueOutcome::Failed(e)),
            Err(panic) => Some(QueueOutcome::Failed(anyhow::anyhow!(
                "processing panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };
        if let Some(outcome) = outcome {
            self.report(&outcome);
        }
        self.lock_state().in_flight -= 1;
        self.notify_if_idle();
    }

    fn report(&self, outcome: &QueueOutcome<R>) {
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if observers.is_empty() {
            if let QueueOutcome::Failed(e) = outcome {
                log::warn!("queue: item failed with no observer: {:#}", e);
            }
            return;
        }
        for observer in observers {
            observer(outcome);
        }
    }

    fn notify_if_idle(&self) {
        if self.lock_state().is_idle() {
            self.idle.notify_waiters();
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

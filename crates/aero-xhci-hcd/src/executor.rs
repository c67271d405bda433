//! Single-threaded continuation scheduler owned by an event ring.
//!
//! Continuations are polled only from [`TaskQueue::run_until_idle`], which the interrupt path calls
//! after draining events. Wakers merely requeue the task, so a completion resolved anywhere (the
//! interrupt thread or a submitting thread) never runs user code in place.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Wake, Waker};

use futures::future::BoxFuture;
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

#[derive(Default)]
struct ReadyQueue {
    ids: Mutex<VecDeque<TaskId>>,
}

impl ReadyQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<TaskId>> {
        match self.ids.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, id: TaskId) {
        let mut ids = self.lock();
        if !ids.contains(&id) {
            ids.push_back(id);
        }
    }

    fn pop(&self) -> Option<TaskId> {
        self.lock().pop_front()
    }
}

struct TaskWaker {
    id: TaskId,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.push(self.id);
    }
}

pub struct TaskQueue {
    next_id: AtomicU64,
    ready: Arc<ReadyQueue>,
    tasks: Mutex<BTreeMap<TaskId, BoxFuture<'static, ()>>>,
    running: AtomicBool,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ready: Arc::new(ReadyQueue::default()),
            tasks: Mutex::new(BTreeMap::new()),
            running: AtomicBool::new(false),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, BTreeMap<TaskId, BoxFuture<'static, ()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queues `future`; it is first polled by the next [`run_until_idle`](Self::run_until_idle).
    pub fn spawn(&self, future: BoxFuture<'static, ()>) -> TaskId {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.tasks().insert(id, future);
        self.ready.push(id);
        trace!(task = id.0, "continuation spawned");
        id
    }

    /// Number of continuations that have not completed yet.
    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Polls runnable continuations until none is ready. Returns how many completed.
    ///
    /// Re-entrant calls (a continuation draining the queue it runs on) return immediately; the
    /// outer call picks up anything they would have run.
    pub fn run_until_idle(&self) -> usize {
        if self.running.swap(true, Ordering::Acquire) {
            return 0;
        }

        let mut completed = 0;
        while let Some(id) = self.ready.pop() {
            // The future is polled without the map locked so it may spawn further tasks.
            let Some(mut future) = self.tasks().remove(&id) else {
                continue;
            };
            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                ready: Arc::clone(&self.ready),
            }));
            let mut cx = Context::from_waker(&waker);
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    completed += 1;
                    trace!(task = id.0, "continuation completed");
                }
                Poll::Pending => {
                    self.tasks().insert(id, future);
                }
            }
        }

        self.running.store(false, Ordering::Release);
        completed
    }
}

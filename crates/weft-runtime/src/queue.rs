//! Task queue
//!
//! MPMC FIFO of fiber/closure tasks with blocking pop and cooperative stop.
//! After `stop()`, consumers drain whatever remains and then receive the
//! `None` sentinel.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::sync::Arc;

use crate::fiber::Fiber;

/// A unit of schedulable work
pub enum Task {
    /// Resume a fiber
    Fiber(Arc<Fiber>),
    /// Invoke a closure inline on the scheduler fiber
    Closure(Box<dyn FnOnce() + Send + 'static>),
}

struct QueueInner {
    tasks: VecDeque<Task>,
    stopped: bool,
}

/// Blocking MPMC task queue
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl TaskQueue {
    pub fn new() -> TaskQueue {
        TaskQueue {
            inner: Mutex::new(QueueInner {
                tasks: VecDeque::new(),
                stopped: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a task and wake one waiting consumer.
    pub fn push(&self, task: Task) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.push_back(task);
        drop(inner);
        self.available.notify_one();
    }

    /// Block until a task arrives or the queue is stopped and empty.
    ///
    /// Returns `None` only once the queue is both stopped and drained.
    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(task) = inner.tasks.pop_front() {
                return Some(task);
            }
            if inner.stopped {
                return None;
            }
            inner = self.available.wait(inner).unwrap();
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<Task> {
        self.inner.lock().unwrap().tasks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().tasks.is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    /// Stop the queue and wake every waiting consumer.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.stopped = true;
        drop(inner);
        self.available.notify_all();
    }

    /// Reopen a stopped queue (scheduler restart). Queued tasks survive.
    pub fn restart(&self) {
        self.inner.lock().unwrap().stopped = false;
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        TaskQueue::new()
    }
}

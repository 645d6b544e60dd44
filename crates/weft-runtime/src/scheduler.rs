//! M:N scheduler
//!
//! N worker threads multiplex user fibers off one shared task queue. Each
//! worker hosts the hierarchy `main fiber <-> scheduler fiber <-> user
//! fibers`: the worker's entry captures the native context as the main
//! fiber, then resumes a scheduler fiber running the dispatch loop. User
//! fibers yield back into the scheduler fiber, which picks the next task.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use weft_core::{log_debug, log_error, log_info, log_warn};

use crate::config::SchedulerConfig;
use crate::fiber::Fiber;
use crate::pool::FiberPool;
use crate::queue::{Task, TaskQueue};
use crate::stack::DEFAULT_STACK_SIZE;
use crate::tls::{self, StackMode};

struct SchedulerInner {
    config: SchedulerConfig,
    queue: TaskQueue,
    stopping: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
}

/// Cheap-clone handle to a scheduler.
///
/// Clones share one worker pool and task queue; the thread context and the
/// I/O dispatch path hold clones to requeue fibers.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(thread_count: usize, name: &str) -> Scheduler {
        Scheduler::with_config(SchedulerConfig::new(thread_count, name))
    }

    pub fn with_config(config: SchedulerConfig) -> Scheduler {
        config.validate().expect("invalid scheduler configuration");
        log_info!(
            "scheduler[{}] created: threads={}, shared_stack={}",
            config.name,
            config.thread_count,
            config.shared_stack
        );
        Scheduler {
            inner: Arc::new(SchedulerInner {
                config,
                queue: TaskQueue::new(),
                stopping: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
                active_threads: AtomicUsize::new(0),
                idle_threads: AtomicUsize::new(0),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    #[inline]
    pub fn thread_count(&self) -> usize {
        self.inner.config.thread_count
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopping.load(Ordering::Relaxed)
            && !self.inner.threads.lock().unwrap().is_empty()
    }

    /// Spawn the worker threads. Idempotent; scheduling before `start` just
    /// queues tasks up.
    pub fn start(&self) {
        let mut threads = self.inner.threads.lock().unwrap();
        if !threads.is_empty() {
            log_warn!("scheduler[{}] already started, skip", self.name());
            return;
        }

        self.inner.stopping.store(false, Ordering::Relaxed);
        self.inner.queue.restart();

        for i in 0..self.inner.config.thread_count {
            let sched = self.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-worker-{}", self.name(), i))
                .spawn(move || sched.worker_main(i))
                .expect("failed to spawn scheduler worker");
            threads.push(handle);
        }

        log_info!(
            "scheduler[{}] started with {} workers",
            self.name(),
            self.inner.config.thread_count
        );
    }

    /// Stop the queue and join every worker. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::Relaxed) {
            log_debug!("scheduler[{}] already stopping, skip", self.name());
            return;
        }

        log_info!(
            "scheduler[{}] stopping: pending_tasks={}",
            self.name(),
            self.inner.queue.len()
        );
        self.inner.queue.stop();

        let threads = std::mem::take(&mut *self.inner.threads.lock().unwrap());
        for handle in threads {
            let _ = handle.join();
        }
        log_info!("scheduler[{}] stopped", self.name());
    }

    /// Schedule a closure: wrapped in a pool fiber so it can yield.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let fiber = FiberPool::global().acquire(Box::new(f));
        log_debug!(
            "scheduler[{}] scheduled pooled fiber id={}, queue_len={}",
            self.name(),
            fiber.id(),
            self.inner.queue.len()
        );
        self.inner.queue.push(Task::Fiber(fiber));
    }

    /// Schedule an existing fiber for resumption.
    pub fn schedule_fiber(&self, fiber: Arc<Fiber>) {
        log_debug!(
            "scheduler[{}] scheduled fiber name={}, id={}",
            self.name(),
            fiber.name(),
            fiber.id()
        );
        self.inner.queue.push(Task::Fiber(fiber));
    }

    /// Schedule a raw closure task, invoked inline on a scheduler fiber
    /// (timer expirations take this path).
    pub fn schedule_closure(&self, f: Box<dyn FnOnce() + Send + 'static>) {
        self.inner.queue.push(Task::Closure(f));
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Workers currently executing a task (statistics only)
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Workers currently blocked on the queue (statistics only)
    pub fn idle_threads(&self) -> usize {
        self.inner.idle_threads.load(Ordering::Relaxed)
    }

    /// Worker thread entry: build the fiber hierarchy, run the dispatch
    /// loop inside the scheduler fiber, then tear the thread context down.
    fn worker_main(&self, index: usize) {
        log_debug!("scheduler[{}] worker {} started", self.name(), index);

        tls::set_scheduler(Some(self.clone()));
        if self.inner.config.shared_stack {
            tls::set_stack_mode(StackMode::Shared);
        }

        let main = Fiber::new_main();
        tls::set_main_fiber(Some(main.clone()));
        tls::set_current_fiber(Some(main));

        let sched = self.clone();
        let scheduler_fiber = Fiber::new(
            Box::new(move || sched.schedule_loop()),
            DEFAULT_STACK_SIZE,
            "scheduler",
        );
        tls::set_scheduler_fiber(Some(scheduler_fiber.clone()));

        if panic::catch_unwind(AssertUnwindSafe(|| scheduler_fiber.resume())).is_err() {
            log_error!("scheduler[{}] worker {} dispatch fiber panicked", self.name(), index);
        }

        tls::set_scheduler_fiber(None);
        tls::set_main_fiber(None);
        tls::set_current_fiber(None);
        tls::set_scheduler(None);
        log_debug!("scheduler[{}] worker {} exited", self.name(), index);
    }

    /// Dispatch loop, running inside the scheduler fiber.
    fn schedule_loop(&self) {
        loop {
            self.inner.idle_threads.fetch_add(1, Ordering::Relaxed);
            let task = self.inner.queue.pop();
            self.inner.idle_threads.fetch_sub(1, Ordering::Relaxed);

            let Some(task) = task else {
                log_debug!("scheduler[{}] queue stopped, leaving dispatch loop", self.name());
                break;
            };

            self.inner.active_threads.fetch_add(1, Ordering::Relaxed);
            match task {
                Task::Fiber(fiber) => {
                    if fiber.state() == weft_core::FiberState::Running {
                        // The fiber was requeued before its switch out
                        // completed on another worker; retry shortly.
                        self.inner.queue.push(Task::Fiber(fiber));
                        self.inner.active_threads.fetch_sub(1, Ordering::Relaxed);
                        continue;
                    }

                    if panic::catch_unwind(AssertUnwindSafe(|| fiber.resume())).is_err() {
                        log_error!(
                            "scheduler[{}] fiber failed: name={}, id={}",
                            self.name(),
                            fiber.name(),
                            fiber.id()
                        );
                    }
                    if fiber.state().is_terminated() {
                        FiberPool::global().release(fiber);
                    }
                }
                Task::Closure(f) => {
                    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                        log_error!("scheduler[{}] closure task panicked", self.name());
                    }
                }
            }
            self.inner.active_threads.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::yield_now;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use std::time::{Duration, Instant};

    fn wait_for(cond: impl Fn() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_closures_run_on_workers() {
        let sched = Scheduler::new(2, "t-closures");
        let counter = Arc::new(AtomicUsize::new(0));

        sched.start();
        for _ in 0..16 {
            let c = counter.clone();
            sched.schedule(move || {
                c.fetch_add(1, SeqCst);
            });
        }

        assert!(wait_for(|| counter.load(SeqCst) == 16, Duration::from_secs(5)));
        sched.stop();
    }

    #[test]
    fn test_schedule_before_start() {
        let sched = Scheduler::new(1, "t-prestart");
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        sched.schedule(move || {
            c.fetch_add(1, SeqCst);
        });
        assert_eq!(sched.queue_len(), 1);

        sched.start();
        assert!(wait_for(|| counter.load(SeqCst) == 1, Duration::from_secs(5)));
        sched.stop();
    }

    // A single worker must interleave yielding fibers rather than wedge on
    // the first one.
    #[test]
    fn test_single_worker_runs_yielding_fibers() {
        let sched = Scheduler::new(1, "t-yield");
        let counter = Arc::new(AtomicUsize::new(0));
        sched.start();

        for _ in 0..4 {
            let c = counter.clone();
            let s = sched.clone();
            sched.schedule(move || {
                c.fetch_add(1, SeqCst);
                // Park and requeue ourselves once.
                let me = tls::current_fiber().unwrap();
                s.schedule_fiber(me);
                yield_now();
                c.fetch_add(1, SeqCst);
            });
        }

        assert!(wait_for(|| counter.load(SeqCst) == 8, Duration::from_secs(5)));
        sched.stop();
    }

    #[test]
    fn test_panicking_task_does_not_kill_worker() {
        let sched = Scheduler::new(1, "t-panic");
        let counter = Arc::new(AtomicUsize::new(0));
        sched.start();

        sched.schedule(|| panic!("task failure"));
        let c = counter.clone();
        sched.schedule(move || {
            c.fetch_add(1, SeqCst);
        });

        assert!(wait_for(|| counter.load(SeqCst) == 1, Duration::from_secs(5)));
        sched.stop();
    }

    #[test]
    fn test_start_stop_idempotent() {
        let sched = Scheduler::new(1, "t-idem");
        sched.start();
        sched.start();
        sched.stop();
        sched.stop();

        // A full second cycle must also work.
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        sched.schedule(move || {
            c.fetch_add(1, SeqCst);
        });
        sched.start();
        assert!(wait_for(|| counter.load(SeqCst) == 1, Duration::from_secs(5)));
        sched.stop();
    }

    #[test]
    fn test_terminated_fibers_return_to_pool() {
        let sched = Scheduler::new(1, "t-pool");
        sched.start();
        let before = FiberPool::global().statistics();

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let c = counter.clone();
            sched.schedule(move || {
                c.fetch_add(1, SeqCst);
            });
        }
        assert!(wait_for(|| counter.load(SeqCst) == 4, Duration::from_secs(5)));
        sched.stop();

        let after = FiberPool::global().statistics();
        assert!(after.total_created + after.total_reused >= before.total_created + 4
            || after.total_reused > before.total_reused);
    }
}

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::ExecuteError;

#[derive(Default)]
struct Tasks {
    /// Number of tasks that have not finished
    active: usize,

    /// Threads currently running a task
    threads: HashSet<ThreadId>,
}

/// Runs every task on its own OS thread
///
/// Shutdown is level-triggered: after [`Executor::shutdown`] new tasks are
/// rejected and running tasks are expected to poll [`Executor::is_shutdown`]
/// and return.
pub struct Executor {
    shutdown: AtomicBool,
    tasks: Mutex<Tasks>,
    idle: Condvar,
}

impl Executor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shutdown: AtomicBool::new(false),
            tasks: Mutex::new(Tasks::default()),
            idle: Condvar::new(),
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting tasks; returns `false` if already shut down
    pub fn shutdown(&self) -> bool {
        let _tasks = self.tasks.lock();
        !self.shutdown.swap(true, Ordering::AcqRel)
    }

    /// Spawn `task` on a new thread named `name`
    pub fn execute<F>(self: &Arc<Self>, name: String, task: F) -> Result<(), ExecuteError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut tasks = self.tasks.lock();
            if self.is_shutdown() {
                return Err(ExecuteError::Shutdown);
            }
            tasks.active += 1;
            trace!(active = tasks.active, "Task submitted");
        }

        let executor = Arc::clone(self);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            let _guard = TaskGuard::enter(executor);
            task();
        });

        if let Err(e) = spawned {
            self.finish(None);
            return Err(e.into());
        }
        Ok(())
    }

    /// Number of tasks still running
    pub fn active_count(&self) -> usize {
        self.tasks.lock().active
    }

    /// Whether the calling thread is running one of this executor's tasks
    pub fn is_current_worker(&self) -> bool {
        self.tasks.lock().threads.contains(&thread::current().id())
    }

    /// Wait up to `timeout` for every task to finish; returns whether they did
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut tasks = self.tasks.lock();
        while tasks.active > 0 {
            if self.idle.wait_until(&mut tasks, deadline).timed_out() {
                return tasks.active == 0;
            }
        }
        true
    }

    fn finish(&self, thread: Option<ThreadId>) {
        let mut tasks = self.tasks.lock();
        tasks.active -= 1;
        if let Some(thread) = thread {
            tasks.threads.remove(&thread);
        }
        if tasks.active == 0 {
            self.idle.notify_all();
        }
    }
}

/// Registers the worker thread and marks its task finished when the thread
/// ends, even on panic
struct TaskGuard {
    executor: Arc<Executor>,
    thread: ThreadId,
}

impl TaskGuard {
    fn enter(executor: Arc<Executor>) -> Self {
        let thread = thread::current().id();
        executor.tasks.lock().threads.insert(thread);
        Self { executor, thread }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.executor.finish(Some(self.thread));
    }
}

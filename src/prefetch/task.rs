//! Download tasks and the queue feeding the fetcher

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

/// How a task ended, as reported to its waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Every block in the range is present locally
    Completed,
    /// The fetcher gave up on the range (failure or shutdown)
    Aborted,
}

/// Receiving end handed to a reader blocked on a demand task
pub type Waiter = oneshot::Receiver<TaskStatus>;

/// Inclusive block range scheduled for download
#[derive(Debug)]
pub struct Task {
    pub first_block: u32,
    pub last_block: u32,
    waiter: Option<oneshot::Sender<TaskStatus>>,
}

impl Task {
    /// Background task with nobody waiting on it
    pub fn read_ahead(block: u32) -> Self {
        Self {
            first_block: block,
            last_block: block,
            waiter: None,
        }
    }

    /// Task a reader blocks on until the fetcher signals it
    pub fn demand(first_block: u32, last_block: u32) -> (Self, Waiter) {
        debug_assert!(first_block <= last_block);
        let (tx, rx) = oneshot::channel();
        let task = Self {
            first_block,
            last_block,
            waiter: Some(tx),
        };
        (task, rx)
    }

    pub fn is_demand(&self) -> bool {
        self.waiter.is_some()
    }

    pub fn blocks(&self) -> std::ops::RangeInclusive<u32> {
        self.first_block..=self.last_block
    }

    /// Wake the waiter, if any
    pub fn finish(mut self, status: TaskStatus) {
        if let Some(tx) = self.waiter.take() {
            // The reader may have given up already.
            let _ = tx.send(status);
        }
    }
}

struct QueueState {
    tasks: VecDeque<Task>,
    open: bool,
}

/// FIFO of pending tasks with its own lock, independent of the bitmap lock
pub struct TaskQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                open: true,
            }),
            cond: Condvar::new(),
        }
    }

    /// Enqueue a task; hands it back if the queue has been closed
    pub fn push(&self, task: Task) -> Result<(), Task> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(task);
        }
        state.tasks.push_back(task);
        self.cond.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<Task> {
        self.state.lock().unwrap().tasks.pop_front()
    }

    /// Block until a task is queued, the queue is notified, or `timeout` passes
    pub fn wait(&self, timeout: Duration) {
        let state = self.state.lock().unwrap();
        if state.tasks.is_empty() && state.open {
            let _ = self.cond.wait_timeout(state, timeout).unwrap();
        }
    }

    /// Wake a fetcher sleeping in [`wait`](Self::wait)
    pub fn notify(&self) {
        let _guard = self.state.lock().unwrap();
        self.cond.notify_all();
    }

    /// Close the queue if nothing is pending. Returns true if it closed.
    pub fn close_if_empty(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.tasks.is_empty() {
            state.open = false;
            true
        } else {
            false
        }
    }

    /// Close the queue and hand back everything still pending
    pub fn close(&self) -> Vec<Task> {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        self.cond.notify_all();
        state.tasks.drain(..).collect()
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().unwrap().tasks.len()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

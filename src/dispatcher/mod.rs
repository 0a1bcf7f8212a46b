use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use serde::Serialize;

use crate::config;

pub const DEFAULT_WORKER_THREADS: usize = 10;
pub const UNBOUNDED: usize = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub worker_threads: usize,
    pub max_pending: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            max_pending: UNBOUNDED,
        }
    }
}

impl From<&config::DispatcherConfig> for DispatcherConfig {
    fn from(value: &config::DispatcherConfig) -> Self {
        Self {
            worker_threads: value.worker_threads,
            max_pending: value.max_pending,
        }
    }
}

// Rejected requests are handed back so the caller can still answer them.
#[derive(Debug)]
pub enum DispatchError<T> {
    QueueFull { request: T, limit: usize },
    Closed { request: T },
}

impl<T> fmt::Display for DispatchError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { limit, .. } => {
                write!(f, "dispatch queue is full ({limit} pending requests)")
            }
            Self::Closed { .. } => write!(f, "dispatcher is closed"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for DispatchError<T> {}

#[derive(Debug)]
pub enum WorkerPoolError {
    Spawn { index: usize, source: io::Error },
    JoinFailed { failed: usize },
}

impl fmt::Display for WorkerPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn { index, source } => {
                write!(f, "failed to spawn dispatcher worker #{index}: {source}")
            }
            Self::JoinFailed { failed } => {
                write!(f, "{failed} dispatcher worker thread(s) failed to join")
            }
        }
    }
}

impl std::error::Error for WorkerPoolError {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    pub queued: usize,
    pub in_service: usize,
    pub served_total: u64,
    pub rejected_total: u64,
    pub panicked_total: u64,
    pub max_pending: usize,
    pub closed: bool,
}

struct DispatchState<T> {
    queue: VecDeque<T>,
    in_service: usize,
    served_total: u64,
    rejected_total: u64,
    panicked_total: u64,
    closed: bool,
}

/// FIFO hand-off of accepted requests to a fixed set of worker threads.
pub struct RequestDispatcher<T> {
    max_pending: usize,
    state: Mutex<DispatchState<T>>,
    available: Condvar,
}

impl<T> RequestDispatcher<T> {
    pub fn new(max_pending: usize) -> Self {
        Self {
            max_pending,
            state: Mutex::new(DispatchState {
                queue: VecDeque::new(),
                in_service: 0,
                served_total: 0,
                rejected_total: 0,
                panicked_total: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn submit(&self, request: T) -> Result<(), DispatchError<T>> {
        let mut state = self.state();
        if state.closed {
            return Err(DispatchError::Closed { request });
        }
        if self.max_pending != UNBOUNDED && state.queue.len() >= self.max_pending {
            state.rejected_total += 1;
            return Err(DispatchError::QueueFull {
                request,
                limit: self.max_pending,
            });
        }

        state.queue.push_back(request);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    // Blocks until a request is queued; `None` once closed and drained.
    pub fn take_next(&self) -> Option<T> {
        let mut state = self.state();
        loop {
            if let Some(request) = state.queue.pop_front() {
                state.in_service += 1;
                return Some(request);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .expect("dispatcher state lock poisoned");
        }
    }

    pub fn finish(&self, panicked: bool) {
        let mut state = self.state();
        state.in_service = state.in_service.saturating_sub(1);
        state.served_total += 1;
        if panicked {
            state.panicked_total += 1;
        }
    }

    pub fn close(&self) {
        self.state().closed = true;
        self.available.notify_all();
    }

    pub fn stats(&self) -> DispatcherStats {
        let state = self.state();
        DispatcherStats {
            queued: state.queue.len(),
            in_service: state.in_service,
            served_total: state.served_total,
            rejected_total: state.rejected_total,
            panicked_total: state.panicked_total,
            max_pending: self.max_pending,
            closed: state.closed,
        }
    }

    fn state(&self) -> MutexGuard<'_, DispatchState<T>> {
        self.state.lock().expect("dispatcher state lock poisoned")
    }
}

pub trait RequestHandler<T>: Send + Sync + 'static {
    fn handle(&self, worker_index: usize, request: T);
}

impl<T, F> RequestHandler<T> for F
where
    F: Fn(usize, T) + Send + Sync + 'static,
{
    fn handle(&self, worker_index: usize, request: T) {
        self(worker_index, request)
    }
}

pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<T, H>(
        worker_count: usize,
        dispatcher: Arc<RequestDispatcher<T>>,
        handler: Arc<H>,
    ) -> Result<Self, WorkerPoolError>
    where
        T: Send + 'static,
        H: RequestHandler<T>,
    {
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let queue = Arc::clone(&dispatcher);
            let handler = Arc::clone(&handler);
            let worker = thread::Builder::new()
                .name(format!("xmsgd-worker-{index}"))
                .spawn(move || {
                    while let Some(request) = queue.take_next() {
                        let outcome =
                            catch_unwind(AssertUnwindSafe(|| handler.handle(index, request)));
                        queue.finish(outcome.is_err());
                    }
                });

            match worker {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    // Threads already started exit once the dispatcher closes.
                    dispatcher.close();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(WorkerPoolError::Spawn { index, source });
                }
            }
        }

        Ok(Self { workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    // Returns once every worker has observed a closed, drained dispatcher.
    pub fn join(self) -> Result<(), WorkerPoolError> {
        let failed = self
            .workers
            .into_iter()
            .map(JoinHandle::join)
            .filter(Result::is_err)
            .count();

        if failed == 0 {
            Ok(())
        } else {
            Err(WorkerPoolError::JoinFailed { failed })
        }
    }
}

//! Request dispatcher and executor pool.
//!
//! Each executor owns a FIFO queue guarded by a mutex/condvar pair and a
//! worker thread; workers never steal. The dispatcher currently posts every
//! request to executor #0, the simplest policy that preserves
//! per-connection ordering. A later policy may parallelise reads across
//! databases while serializing writes per database.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;

use strata::error::{CResult, Error};
use strata::request::DbeRequest;

/// Outcome delivered through a request's completion promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The executor ran the request; the flag is the sink's success result.
    Completed(bool),
    /// The engine shut down before the request was executed.
    Cancelled,
}

/// Sink side of a connection handler: executes an engine request and
/// streams the response to its client.
pub trait RequestSink: Send + Sync {
    fn execute_engine_request(&self, request: &EngineRequest) -> bool;
}

static NEXT_ENGINE_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// One unit of work for the executor pool.
pub struct EngineRequest {
    id: u64,
    pub request_id: u64,
    pub response_id: u32,
    pub statement_count: usize,
    pub user_id: u32,
    pub request: DbeRequest,
    sink: Weak<dyn RequestSink>,
    promise: Mutex<Option<Sender<ExecutionOutcome>>>,
}

impl EngineRequest {
    pub fn new(
        request_id: u64,
        response_id: u32,
        statement_count: usize,
        user_id: u32,
        request: DbeRequest,
        sink: Weak<dyn RequestSink>,
    ) -> (Arc<EngineRequest>, Receiver<ExecutionOutcome>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let request = Arc::new(EngineRequest {
            id: NEXT_ENGINE_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            request_id,
            response_id,
            statement_count,
            user_id,
            request,
            sink,
            promise: Mutex::new(Some(tx)),
        });
        (request, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fulfils the promise; later calls are no-ops.
    fn fulfill(&self, outcome: ExecutionOutcome) {
        if let Some(tx) = self.promise.lock().unwrap().take() {
            // The submitter may be gone already; that is fine.
            let _ = tx.send(outcome);
        }
    }
}

struct ExecutorShared {
    queue: Mutex<VecDeque<Arc<EngineRequest>>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

/// A single-threaded request executor with its own FIFO queue.
pub struct RequestExecutor {
    id: usize,
    shared: Arc<ExecutorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RequestExecutor {
    fn new(id: usize) -> RequestExecutor {
        let shared = Arc::new(ExecutorShared {
            queue: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("executor-{}", id))
            .spawn(move || Self::worker_loop(id, worker_shared))
            .expect("cannot spawn executor thread");
        RequestExecutor { id, shared, worker: Mutex::new(Some(worker)) }
    }

    pub fn add_request(&self, request: Arc<EngineRequest>) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.push_back(request);
        self.shared.wakeup.notify_one();
    }

    fn worker_loop(id: usize, shared: Arc<ExecutorShared>) {
        log::debug!("executor #{} started", id);
        loop {
            let request = {
                let mut queue = shared.queue.lock().unwrap();
                loop {
                    if shared.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Some(request) = queue.pop_front() {
                        break request;
                    }
                    queue = shared.wakeup.wait(queue).unwrap();
                }
            };
            log::debug!("executor #{}: executing engine request #{}", id, request.id());
            match request.sink.upgrade() {
                Some(sink) => {
                    let result = sink.execute_engine_request(&request);
                    request.fulfill(ExecutionOutcome::Completed(result));
                }
                None => {
                    // The connection is gone: discard silently, but still
                    // fulfil the promise.
                    request.fulfill(ExecutionOutcome::Completed(true));
                }
            }
        }
    }

    /// Stops the worker and resolves everything still queued as cancelled.
    fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if worker.join().is_err() {
                log::error!("executor #{} worker panicked", self.id);
            }
        }
        let mut queue = self.shared.queue.lock().unwrap();
        while let Some(request) = queue.pop_front() {
            request.fulfill(ExecutionOutcome::Cancelled);
        }
    }
}

impl Drop for RequestExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Routes incoming requests to the executor pool.
pub struct RequestDispatcher {
    executors: Vec<RequestExecutor>,
}

impl RequestDispatcher {
    pub fn new(pool_size: usize) -> CResult<RequestDispatcher> {
        if pool_size == 0 {
            return Err(Error::InvalidArgument(
                "cannot create a request executor pool of size 0".into(),
            ));
        }
        log::debug!("creating request executor pool of size {}", pool_size);
        let executors = (0..pool_size).map(RequestExecutor::new).collect();
        Ok(RequestDispatcher { executors })
    }

    pub fn add_request(&self, request: Arc<EngineRequest>) {
        // Simplest dispatching policy: everything goes to the first
        // executor. Any replacement must keep per-connection ordering.
        let executor_id = 0;
        log::debug!(
            "dispatching engine request #{} to executor #{}",
            request.id(),
            executor_id
        );
        self.executors[executor_id].add_request(request);
    }

    pub fn shutdown(&self) {
        for executor in &self.executors {
            executor.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    struct RecordingSink {
        executed: Mutex<Vec<u64>>,
        result: bool,
    }

    impl RequestSink for RecordingSink {
        fn execute_engine_request(&self, request: &EngineRequest) -> bool {
            self.executed.lock().unwrap().push(request.request_id);
            self.result
        }
    }

    fn request_for(
        sink: &Arc<RecordingSink>,
        request_id: u64,
    ) -> (Arc<EngineRequest>, Receiver<ExecutionOutcome>) {
        let weak: Weak<dyn RequestSink> = Arc::downgrade(sink) as Weak<dyn RequestSink>;
        EngineRequest::new(request_id, 1, 1, 1, DbeRequest::ShowDatabases, weak)
    }

    #[test]
    fn requests_run_in_submission_order() {
        let dispatcher = RequestDispatcher::new(2).unwrap();
        let sink = Arc::new(RecordingSink { executed: Mutex::new(Vec::new()), result: true });

        let mut receivers = Vec::new();
        for request_id in 1..=16 {
            let (request, rx) = request_for(&sink, request_id);
            dispatcher.add_request(request);
            receivers.push(rx);
        }
        for rx in receivers {
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(5)).unwrap(),
                ExecutionOutcome::Completed(true)
            );
        }
        assert_eq!(*sink.executed.lock().unwrap(), (1..=16).collect::<Vec<u64>>());
    }

    #[test]
    fn failed_execution_is_reported() {
        let dispatcher = RequestDispatcher::new(1).unwrap();
        let sink = Arc::new(RecordingSink { executed: Mutex::new(Vec::new()), result: false });
        let (request, rx) = request_for(&sink, 1);
        dispatcher.add_request(request);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ExecutionOutcome::Completed(false)
        );
    }

    #[test]
    fn dropped_sink_discards_but_fulfills() {
        let dispatcher = RequestDispatcher::new(1).unwrap();
        let sink = Arc::new(RecordingSink { executed: Mutex::new(Vec::new()), result: true });
        let executed = Arc::clone(&sink);
        let (request, rx) = request_for(&sink, 7);
        drop(sink);
        drop(executed);
        dispatcher.add_request(request);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ExecutionOutcome::Completed(true)
        );
    }

    #[test]
    fn shutdown_cancels_queued_requests() {
        static BLOCK: AtomicUsize = AtomicUsize::new(0);

        struct SlowSink;
        impl RequestSink for SlowSink {
            fn execute_engine_request(&self, _request: &EngineRequest) -> bool {
                BLOCK.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(200));
                true
            }
        }

        let dispatcher = RequestDispatcher::new(1).unwrap();
        let sink: Arc<SlowSink> = Arc::new(SlowSink);
        let weak = Arc::downgrade(&sink) as Weak<dyn RequestSink>;
        let (first, first_rx) =
            EngineRequest::new(1, 1, 1, 1, DbeRequest::ShowDatabases, weak.clone());
        let (second, second_rx) = EngineRequest::new(2, 1, 1, 1, DbeRequest::ShowDatabases, weak);
        dispatcher.add_request(first);
        // Give the worker time to pick up the first request.
        while BLOCK.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        dispatcher.add_request(second);
        dispatcher.shutdown();

        assert_eq!(
            first_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ExecutionOutcome::Completed(true)
        );
        assert_eq!(
            second_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            ExecutionOutcome::Cancelled
        );
    }
}

//! Runs calls into a backend that must never be entered concurrently on a
//! single worker task, one at a time and in arrival order.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

const QUEUE_CAPACITY: usize = 64;

/// Something that is only safe to call from one place at a time.
#[async_trait]
pub trait Backend: Send + 'static {
    /// A single call.
    type Request: Send + 'static;

    /// The outcome of a call.
    type Response: Send + 'static;

    /// Executes one call. Never invoked concurrently.
    async fn call(&mut self, request: Self::Request) -> Self::Response;
}

type Job<B> = (
    <B as Backend>::Request,
    oneshot::Sender<<B as Backend>::Response>,
);

/// Handle to the worker that owns a [`Backend`]. Cheap to clone; every clone
/// feeds the same queue.
pub struct Serializer<B: Backend> {
    sender: Arc<Mutex<Option<mpsc::Sender<Job<B>>>>>,
    worker: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl<B: Backend> Clone for Serializer<B> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            worker: self.worker.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Serializer<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Serializer").finish_non_exhaustive()
    }
}

impl<B: Backend> Serializer<B> {
    /// Spawns the worker that owns `backend`.
    pub fn start(backend: B) -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let worker = tokio::spawn(run(backend, receiver));

        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            worker: Arc::new(tokio::sync::Mutex::new(Some(worker))),
        }
    }

    /// Queues `request` and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Stopped`] once [`Serializer::stop`] has been called.
    pub async fn call(&self, request: B::Request) -> Result<B::Response, Error> {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|sender| sender.clone())
            .ok_or(Error::Stopped)?;

        let (reply, response) = oneshot::channel();
        sender
            .send((request, reply))
            .await
            .map_err(|_| Error::Stopped)?;

        response.await.map_err(|_| Error::WorkerGone)
    }

    /// Closes the queue and waits for the worker to finish what was already
    /// queued.
    pub async fn stop(&self) {
        let sender = self.sender.lock().ok().and_then(|mut sender| sender.take());
        drop(sender);

        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            error!(error = %e, "serializer worker panicked");
        }
    }
}

async fn run<B: Backend>(mut backend: B, mut receiver: mpsc::Receiver<Job<B>>) {
    while let Some((request, reply)) = receiver.recv().await {
        let response = backend.call(request).await;

        if reply.send(response).is_err() {
            debug!("caller went away before its response");
        }
    }

    debug!("serializer worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;

    #[derive(Default)]
    struct Counters {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
    }

    struct Doubler {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl Backend for Doubler {
        type Request = u64;
        type Response = u64;

        async fn call(&mut self, request: u64) -> u64 {
            let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_in_flight.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(5)).await;

            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.counters.calls.fetch_add(1, Ordering::SeqCst);
            request * 2
        }
    }

    fn doubler() -> (Serializer<Doubler>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let serializer = Serializer::start(Doubler {
            counters: counters.clone(),
        });
        (serializer, counters)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_are_serialized_and_correlated() {
        let (serializer, counters) = doubler();

        let calls = (0..32u64).map(|i| {
            let serializer = serializer.clone();
            tokio::spawn(async move { (i, serializer.call(i).await) })
        });

        for call in futures::future::join_all(calls).await {
            let (i, response) = call.unwrap();
            assert_eq!(response.unwrap(), i * 2);
        }

        assert_eq!(counters.calls.load(Ordering::SeqCst), 32);
        assert_eq!(counters.max_in_flight.load(Ordering::SeqCst), 1);

        serializer.stop().await;
    }

    #[tokio::test]
    async fn test_calls_after_stop_are_rejected() {
        let (serializer, _) = doubler();
        assert_eq!(serializer.call(1).await, Ok(2));

        serializer.stop().await;

        assert_matches!(serializer.call(1).await, Err(Error::Stopped));
        assert_matches!(serializer.clone().call(1).await, Err(Error::Stopped));
    }

    #[tokio::test]
    async fn test_stop_drains_queued_work() {
        let (serializer, counters) = doubler();

        let pending: Vec<_> = (0..8u64)
            .map(|i| {
                let serializer = serializer.clone();
                tokio::spawn(async move { serializer.call(i).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(1)).await;

        serializer.stop().await;

        for call in pending {
            assert!(call.await.unwrap().is_ok());
        }
        assert_eq!(counters.calls.load(Ordering::SeqCst), 8);
    }
}

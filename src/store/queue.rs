//! The per-store FIFO queue.
//!
//! Every store operation runs as a job on a dedicated worker thread that owns
//! the backend exclusively. Jobs execute strictly in submission order, which
//! is what gives concurrent clients a total order over store mutations,
//! independent of any event-loop's incidental ordering.

use std::sync::mpsc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, SyncError};

type Job<B> = Box<dyn FnOnce(&mut B) + Send>;

/// FIFO executor owning a backend of type `B`.
pub struct SerialQueue<B> {
    tx: Mutex<Option<mpsc::Sender<Job<B>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Send + 'static> SerialQueue<B> {
    pub fn new(mut backend: B) -> Self {
        let (tx, rx) = mpsc::channel::<Job<B>>();
        let worker = std::thread::spawn(move || {
            while let Ok(job) = rx.recv() {
                job(&mut backend);
            }
        });
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Run `f` on the worker; resolves with its result in FIFO order.
    /// Fails with [`SyncError::Shutdown`] once the queue is closed.
    pub async fn run<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut B) -> R + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        {
            let guard = self.tx.lock();
            let Some(tx) = guard.as_ref() else {
                return Err(SyncError::Shutdown);
            };
            tx.send(Box::new(move |backend| {
                let _ = done_tx.send(f(backend));
            }))
            .map_err(|_| SyncError::Shutdown)?;
        }
        done_rx.await.map_err(|_| SyncError::Shutdown)
    }

    /// Stop accepting jobs, finish the ones already queued, and join the
    /// worker. Idempotent.
    pub fn close(&self) {
        let tx = self.tx.lock().take();
        drop(tx);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

impl<B> Drop for SerialQueue<B> {
    fn drop(&mut self) {
        drop(self.tx.lock().take());
        // The worker drains remaining jobs and exits on its own; joining here
        // could block an async runtime thread during drop.
    }
}

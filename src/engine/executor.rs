use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{error, warn};
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of worker threads behind a bounded queue, for batch analysis
/// that may block on AI calls.
///
/// The bounded queue is the backpressure mechanism: when it is full the
/// batch is dropped with a warning rather than ever stalling the request
/// path.
pub struct BatchExecutor {
    sender: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl BatchExecutor {
    pub fn new(worker_count: usize, queue_capacity: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<Job>(queue_capacity);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("sentinai-async-{i}"))
                .spawn(move || loop {
                    // Holding the lock only while receiving lets the other
                    // workers pick up jobs while this one is busy.
                    let job = receiver.lock().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => error!("failed to spawn async analysis worker: {}", e),
            }
        }

        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(Box::new(job)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("async analysis queue full, dropping batch");
            }
            Err(TrySendError::Disconnected(_)) => {
                error!("async analysis workers are gone, dropping batch");
            }
        }
    }
}

impl Drop for BatchExecutor {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain what is queued and exit.
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

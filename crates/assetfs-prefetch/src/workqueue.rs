//! Bounded background work queue.
//!
//! Used for fire-and-forget prefetches: the filesystem layer enqueues an
//! asset and worker threads run the handler. The queue is bounded so a
//! flood of requests degrades to dropped hints, never to unbounded
//! memory.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender, TrySendError};
use tracing::debug;

/// Buffered requests before enqueue starts reporting back-pressure.
const QUEUE_CAPACITY: usize = 128;

pub struct WorkQueue<T> {
    sender: Option<Sender<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn start<F>(worker_count: usize, handler: F) -> WorkQueue<T>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (sender, receiver) = bounded::<T>(QUEUE_CAPACITY);
        let handler = Arc::new(handler);
        let workers = (0..worker_count.max(1))
            .map(|_| {
                let receiver = receiver.clone();
                let handler = Arc::clone(&handler);
                std::thread::spawn(move || {
                    for item in receiver.iter() {
                        handler(item);
                    }
                })
            })
            .collect();
        WorkQueue {
            sender: Some(sender),
            workers,
        }
    }

    /// Enqueues without blocking. Returns false when the queue is full or
    /// already stopped; callers treat that as a dropped hint.
    pub fn enqueue(&self, item: T) -> bool {
        match &self.sender {
            Some(sender) => match sender.try_send(item) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("work queue full, dropping request");
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
            None => false,
        }
    }

    /// Closes the queue and waits for workers to drain it.
    pub fn stop(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl<T> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

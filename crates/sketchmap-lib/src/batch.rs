//! Single-producer/single-consumer batch pipeline.
//!
//! The producer fills fixed-size batches through [`BatchExecutor::next_item`];
//! full batches travel over a bounded channel to one consumer thread that
//! invokes the handler serially. The bounded channel gives backpressure:
//! the producer blocks while the queue is full, the consumer while it is
//! empty. Batches arrive FIFO and items keep their insertion order, so a
//! serial consumer sees exactly the production order.
//!
//! There is no cancellation; shutdown happens through [`BatchExecutor::finish`]
//! (or drop), which flushes the pending batch, closes the queue, joins the
//! consumer and surfaces the first error it produced.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;

use crate::constants::{DEFAULT_BATCH_SIZE, DEFAULT_QUEUE_SIZE};

/// Error raised by the consumer side of a batch executor
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The handler returned an error for some batch
    #[error("batch consumer failed: {0}")]
    Consumer(String),
    /// The handler panicked
    #[error("batch consumer panicked")]
    Panicked,
}

/// Sizing parameters for a batch executor
#[derive(Clone, Copy, Debug)]
pub struct BatchOptions {
    /// Items per batch
    pub batch_size: usize,
    /// Batches the queue holds before the producer blocks
    pub queue_size: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

/// SPSC batch executor; `T` is the work item type.
///
/// The sender sits behind a mutex only so that holders of the executor
/// stay shareable across threads; all producer-side calls go through
/// `&mut self`, so the lock is never contended.
pub struct BatchExecutor<T: Send + 'static> {
    batch: Vec<T>,
    batch_size: usize,
    tx: Option<Mutex<SyncSender<Vec<T>>>>,
    consumer: Option<JoinHandle<()>>,
    error: Arc<Mutex<Option<ExecutorError>>>,
    failed: Arc<AtomicBool>,
}

impl<T: Default + Send + 'static> BatchExecutor<T> {
    /// Spawn the consumer thread running `handler` on every batch.
    /// The handler's first error (or panic) marks the executor invalid;
    /// later batches are drained unprocessed so the producer never
    /// deadlocks on a full queue.
    pub fn new<F>(opts: BatchOptions, mut handler: F) -> Self
    where
        F: FnMut(&[T]) -> Result<(), String> + Send + 'static,
    {
        let batch_size = opts.batch_size.max(1);
        let (tx, rx) = sync_channel::<Vec<T>>(opts.queue_size.max(1));
        let error = Arc::new(Mutex::new(None));
        let failed = Arc::new(AtomicBool::new(false));

        let thread_error = Arc::clone(&error);
        let thread_failed = Arc::clone(&failed);
        let consumer = std::thread::spawn(move || {
            while let Ok(batch) = rx.recv() {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(&batch)));
                let err = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(msg)) => ExecutorError::Consumer(msg),
                    Err(_) => ExecutorError::Panicked,
                };
                if let Ok(mut slot) = thread_error.lock() {
                    slot.get_or_insert(err);
                }
                thread_failed.store(true, Ordering::SeqCst);
                break;
            }
            // drain so a blocked producer can finish
            while rx.recv().is_ok() {}
        });

        Self {
            batch: Vec::with_capacity(batch_size),
            batch_size,
            tx: Some(Mutex::new(tx)),
            consumer: Some(consumer),
            error,
            failed,
        }
    }

    /// Slot for the next work item; pushes the current batch onto the
    /// queue first when it is full (this is where the producer blocks).
    pub fn next_item(&mut self) -> &mut T {
        if self.batch.len() >= self.batch_size {
            self.push_batch();
        }
        self.batch.push(T::default());
        let last = self.batch.len() - 1;
        &mut self.batch[last]
    }

    /// False once the consumer has failed or panicked
    pub fn valid(&self) -> bool {
        !self.failed.load(Ordering::SeqCst)
    }

    /// Flush, close the queue, join the consumer and report its first error
    pub fn finish(mut self) -> Result<(), ExecutorError> {
        self.shutdown()
    }

    fn push_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        if let Some(tx) = &self.tx {
            // a send error means the consumer is gone; its own error
            // (already recorded) is the interesting one
            let _ = tx.lock().unwrap_or_else(PoisonError::into_inner).send(batch);
        }
    }

    fn shutdown(&mut self) -> Result<(), ExecutorError> {
        self.push_batch();
        drop(self.tx.take());
        if let Some(handle) = self.consumer.take() {
            if handle.join().is_err() {
                return Err(ExecutorError::Panicked);
            }
        }
        let stored = self.error.lock().ok().and_then(|mut e| e.take());
        match stored {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<T: Send + 'static> Drop for BatchExecutor<T> {
    fn drop(&mut self) {
        if let Some(tx) = &self.tx {
            if !self.batch.is_empty() {
                let batch = std::mem::take(&mut self.batch);
                let _ = tx.lock().unwrap_or_else(PoisonError::into_inner).send(batch);
            }
        }
        drop(self.tx.take());
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_arrive_in_production_order() {
        // 1000 items across several batches arrive as 0..1000
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut ex = BatchExecutor::<u32>::new(
            BatchOptions { batch_size: 400, queue_size: 3 },
            move |batch| {
                sink.lock().map_err(|e| e.to_string())?.extend_from_slice(batch);
                Ok(())
            },
        );

        for i in 0..1000u32 {
            *ex.next_item() = i;
        }
        assert!(ex.valid());
        ex.finish().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1000);
        assert!(seen.iter().copied().eq(0..1000));
    }

    #[test]
    fn test_partial_batch_flushed_on_finish() {
        let count = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&count);

        let mut ex = BatchExecutor::<u8>::new(
            BatchOptions { batch_size: 100, queue_size: 2 },
            move |batch| {
                *sink.lock().map_err(|e| e.to_string())? += batch.len();
                Ok(())
            },
        );
        for _ in 0..42 {
            ex.next_item();
        }
        ex.finish().unwrap();
        assert_eq!(*count.lock().unwrap(), 42);
    }

    #[test]
    fn test_consumer_error_is_surfaced() {
        let mut ex = BatchExecutor::<u8>::new(
            BatchOptions { batch_size: 4, queue_size: 2 },
            |_| Err("boom".to_string()),
        );
        for _ in 0..64 {
            ex.next_item();
        }
        // the error flag flips once the first batch is processed
        let err = ex.finish().unwrap_err();
        assert_eq!(err, ExecutorError::Consumer("boom".to_string()));
    }

    #[test]
    fn test_consumer_panic_is_captured() {
        let mut ex = BatchExecutor::<u8>::new(
            BatchOptions { batch_size: 2, queue_size: 2 },
            |_| panic!("kaboom"),
        );
        for _ in 0..8 {
            ex.next_item();
        }
        assert_eq!(ex.finish().unwrap_err(), ExecutorError::Panicked);
    }

    #[test]
    fn test_valid_goes_false_after_failure() {
        let mut ex = BatchExecutor::<u8>::new(
            BatchOptions { batch_size: 1, queue_size: 1 },
            |_| Err("nope".into()),
        );
        ex.next_item();
        ex.next_item(); // forces the first batch through the queue
        // give the consumer a moment to process
        for _ in 0..100 {
            if !ex.valid() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(!ex.valid());
        assert!(ex.finish().is_err());
    }
}

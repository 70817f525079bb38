/// Background input producers feeding a bounded batch queue
///
/// Producers run inside `std::thread::scope`, so every one of them has been
/// joined by the time `InputPipeline::run` returns, whichever way the
/// consumer exits.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Mutex;
use std::thread;

use candle_core::Device;

use super::{Batch, Dataset};
use crate::config::InputType;
use crate::{EvalError, Result};

/// Shared stop token for one pipeline run
///
/// Holds the stop flag, the first error reported by any thread, and the
/// number of producers that have not exited yet.
#[derive(Debug, Default)]
pub struct Coordinator {
    stop: AtomicBool,
    error: Mutex<Option<EvalError>>,
    active: AtomicUsize,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop and record `err`, keeping the first error if one is already set
    pub fn request_stop_with(&self, err: EvalError) {
        {
            let mut slot = self.error.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.request_stop();
    }

    /// Take the recorded error, if any
    pub fn take_error(&self) -> Option<EvalError> {
        self.error.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    /// Producers started and not yet exited
    pub fn active_producers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Clear the stop flag and error for a new run
    ///
    /// Only valid while no producers are running.
    pub fn reset(&self) {
        debug_assert_eq!(self.active_producers(), 0);
        self.stop.store(false, Ordering::SeqCst);
        self.take_error();
    }
}

/// Counts a producer as live until its thread drops it
struct ProducerGuard<'c> {
    coordinator: &'c Coordinator,
}

impl<'c> ProducerGuard<'c> {
    fn new(coordinator: &'c Coordinator) -> Self {
        coordinator.active.fetch_add(1, Ordering::SeqCst);
        Self { coordinator }
    }
}

impl Drop for ProducerGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Consumer side of the pipeline
///
/// Dropping the queue requests a stop, and producers blocked on a full
/// queue see their send fail and exit.
pub struct BatchQueue<'c> {
    rx: Receiver<Batch>,
    coordinator: &'c Coordinator,
}

impl BatchQueue<'_> {
    /// Block until the next batch is available
    ///
    /// Fails once every producer has exited; the error a producer recorded
    /// is returned when there is one.
    pub fn next_batch(&self) -> Result<Batch> {
        match self.rx.recv() {
            Ok(batch) => Ok(batch),
            Err(_) => Err(self.coordinator.take_error().unwrap_or_else(|| {
                EvalError::Pipeline("all input producers exited".to_string())
            })),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        self.coordinator
    }
}

impl Drop for BatchQueue<'_> {
    fn drop(&mut self) {
        self.coordinator.request_stop();
    }
}

/// Input pipeline for one split of a dataset
pub struct InputPipeline<'a> {
    dataset: &'a dyn Dataset,
    input_type: InputType,
    batch_size: usize,
    device: Device,
    num_threads: usize,
    queue_capacity: usize,
}

impl<'a> InputPipeline<'a> {
    /// Create new pipeline
    ///
    /// # Arguments
    /// * `dataset` - Dataset to read from
    /// * `input_type` - Split to read
    /// * `batch_size` - Examples per batch
    /// * `device` - Device the batches are placed on
    pub fn new(
        dataset: &'a dyn Dataset,
        input_type: InputType,
        batch_size: usize,
        device: Device,
    ) -> Self {
        Self {
            dataset,
            input_type,
            batch_size,
            device,
            num_threads: 2,
            queue_capacity: 8,
        }
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    pub fn with_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    /// Start the producers, hand the queue to `consumer`, then stop and
    /// join every producer before returning the consumer's result
    pub fn run<T, F>(&self, coordinator: &Coordinator, consumer: F) -> T
    where
        F: FnOnce(&BatchQueue<'_>) -> T,
    {
        let (tx, rx) = sync_channel(self.queue_capacity);
        let cursor = AtomicUsize::new(0);

        log::debug!(
            "Starting {} input producers for {} split of {}",
            self.num_threads,
            self.input_type,
            self.dataset.name()
        );

        let result = thread::scope(|scope| {
            let cursor = &cursor;
            for id in 0..self.num_threads {
                let tx = tx.clone();
                let guard = ProducerGuard::new(coordinator);
                scope.spawn(move || {
                    self.produce(id, cursor, coordinator, tx);
                    drop(guard);
                });
            }
            drop(tx);

            let queue = BatchQueue { rx, coordinator };
            let result = consumer(&queue);
            drop(queue);
            result
        });

        log::debug!("All input producers joined");
        result
    }

    fn produce(
        &self,
        id: usize,
        cursor: &AtomicUsize,
        coordinator: &Coordinator,
        tx: SyncSender<Batch>,
    ) {
        while !coordinator.should_stop() {
            let batch_index = cursor.fetch_add(1, Ordering::SeqCst);
            match self
                .dataset
                .read_batch(self.input_type, batch_index, self.batch_size, &self.device)
            {
                Ok(batch) => {
                    if tx.send(batch).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::error!("Producer {} failed on batch {}: {}", id, batch_index, e);
                    coordinator.request_stop_with(e);
                    break;
                }
            }
        }
        log::debug!("Producer {} exiting", id);
    }
}

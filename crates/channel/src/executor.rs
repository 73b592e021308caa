//! Explicitly owned worker pool
//!
//! Operation executions run here rather than on the async runtime: an
//! execution may park its thread for the whole prepared phase, and that must
//! never stall channel I/O for unrelated operations.

use crate::{ChannelError, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named OS threads
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` worker threads named `<name>-<n>`
    pub fn new(name: impl Into<String>, size: usize) -> std::io::Result<Self> {
        let name = name.into();
        let size = size.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();

        let mut workers = Vec::with_capacity(size);
        for n in 0..size {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, n))
                .spawn(move || run_worker(receiver))?;
            workers.push(handle);
        }

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job; fails once the pool is shut down
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(ChannelError::PoolShutdown)?;
        sender
            .send(Box::new(job))
            .map_err(|_| ChannelError::PoolShutdown)
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Stop accepting jobs, let queued jobs finish and join every worker
    ///
    /// Jobs that are parked must be released before calling this.
    pub fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }

        let current = std::thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("[{}] Worker thread panicked", self.name);
            }
        }
        tracing::debug!("[{}] Worker pool shut down", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("Worker job panicked");
        }
    }
}

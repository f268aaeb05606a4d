//! A small CPU-sized worker pool for flush jobs.
//!
//! Modeled as a task+channel pipeline rather than a dedicated `Flusher`
//! type: `submit` hands a closure to whichever worker thread is free and
//! returns a receiver the caller can either ignore (`async_close`) or block
//! on (`sync_close`), so a flush never blocks the write path that triggered
//! it.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct FlushPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl FlushPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(size);
        for _ in 0..size {
            let receiver = Arc::clone(&receiver);
            workers.push(thread::spawn(move || loop {
                let job = receiver.lock().unwrap().recv();
                match job {
                    Ok(job) => job(),
                    Err(_) => break,
                }
            }));
        }
        Self { sender: Some(sender), workers }
    }

    /// Sized by available parallelism, matching the flush pool being
    /// "CPU-sized" rather than a single background thread.
    #[must_use]
    pub fn cpu_sized() -> Self {
        Self::new(thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }

    /// Hands `job` to the pool and returns a receiver that yields its result
    /// once a worker picks it up and runs it.
    pub fn submit<F>(&self, job: F) -> Receiver<anyhow::Result<()>>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let task: Job = Box::new(move || {
            let result = job();
            let _ = tx.send(result);
        });
        if let Some(sender) = &self.sender {
            let _ = sender.send(task);
        }
        rx
    }
}

impl Drop for FlushPool {
    fn drop(&mut self) {
        // Drop the sender first so worker threads' `recv()` calls return
        // `Err` and the loop exits, then join them.
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

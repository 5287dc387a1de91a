//! Bounded worker-thread pool for blocking external calls.
//!
//! The engine's own loop must never block on a call implementation, so
//! calls that need a real OS thread run here. The pool has a fixed number
//! of workers; submitting past capacity queues the job rather than growing
//! the thread count, which is what gives callers cooperative backpressure —
//! the issuing token stays suspended until a worker frees up.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads` workers (at least one).
    pub fn new(threads: usize) -> WorkerPool {
        let (tx, rx) = unbounded::<Job>();
        let threads = threads.max(1);
        let mut handles = Vec::with_capacity(threads);
        for id in 0..threads {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("strand-worker-{id}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .unwrap_or_else(|e| panic!("failed to spawn worker thread: {e}"));
            handles.push(handle);
        }
        WorkerPool {
            tx: Some(tx),
            handles,
        }
    }

    /// A cloneable submission handle for call implementations.
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            tx: self
                .tx
                .as_ref()
                .expect("worker pool already shut down")
                .clone(),
        }
    }

    /// Stop accepting work and join the workers. Queued jobs still run.
    pub fn shutdown(&mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Submission side of the pool.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    tx: Sender<Job>,
}

impl PoolHandle {
    /// Queue a job; it runs as soon as a worker is free. Jobs submitted
    /// after shutdown are dropped.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        let _ = self.tx.send(Box::new(job));
    }
}

use std::{
    collections::BTreeMap,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{Receiver, Sender};

use crate::runner::{apply, Outcome, PoolError};

/// Fixed set of worker threads pulling from one shared queue.
///
/// The whole input is queued up front and the queue's sender is dropped, so a
/// worker never blocks on an empty queue: it either gets the next job or learns
/// that there is nothing left and exits.
pub(super) struct WorkerPool<I, O, E> {
    results: Option<Receiver<(usize, Outcome<I, O, E>)>>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    ordered: bool,
    /// Results that arrived before their turn (ordered mode only).
    pending: BTreeMap<usize, Outcome<I, O, E>>,
    next_index: usize,
    remaining: usize,
}

struct WorkerContext<I, O, E, F> {
    jobs: Receiver<(usize, I)>,
    results: Sender<(usize, Outcome<I, O, E>)>,
    stop: Arc<AtomicBool>,
    task: Arc<F>,
}

impl<I, O, E, F> WorkerContext<I, O, E, F>
where
    F: Fn(&I) -> Result<O, E>,
{
    fn work(self) {
        while !self.stop.load(Ordering::Acquire) {
            let Ok((index, input)) = self.jobs.recv() else {
                break; // queue drained
            };
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let outcome = apply(&*self.task, index, input);
            if self.results.send((index, outcome)).is_err() {
                break; // consumer gone
            }
        }
    }
}

impl<I, O, E> WorkerPool<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    pub fn spawn<F>(task: F, inputs: Vec<I>, workers: usize, ordered: bool) -> Result<Self, PoolError>
    where
        F: Fn(&I) -> Result<O, E> + Send + Sync + 'static,
    {
        Self::spawn_with(task, inputs, workers, ordered, |worker, body| {
            thread::Builder::new().name(format!("birb-pool-{worker}")).spawn(body)
        })
    }

    /// Like [`Self::spawn`], starting each worker through `spawn_thread`.
    pub(super) fn spawn_with<F, S>(
        task: F,
        inputs: Vec<I>,
        workers: usize,
        ordered: bool,
        mut spawn_thread: S,
    ) -> Result<Self, PoolError>
    where
        F: Fn(&I) -> Result<O, E> + Send + Sync + 'static,
        S: FnMut(usize, Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>,
    {
        let total = inputs.len();
        let (job_tx, job_rx) = crossbeam_channel::bounded(total);
        for job in inputs.into_iter().enumerate() {
            if job_tx.send(job).is_err() {
                break;
            }
        }
        drop(job_tx);

        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let task = Arc::new(task);

        // Dropping a half-built pool joins whatever was already spawned.
        let mut pool = WorkerPool {
            results: Some(result_rx),
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::with_capacity(workers),
            ordered,
            pending: BTreeMap::new(),
            next_index: 0,
            remaining: total,
        };

        for worker in 0..workers {
            let ctx = WorkerContext {
                jobs: job_rx.clone(),
                results: result_tx.clone(),
                stop: pool.stop.clone(),
                task: task.clone(),
            };
            let handle = spawn_thread(worker, Box::new(move || ctx.work())).map_err(|source| PoolError::Spawn {
                worker,
                workers,
                source,
            })?;
            pool.workers.push(handle);
        }

        Ok(pool)
    }
}

impl<I, O, E> WorkerPool<I, O, E> {
    pub fn live_workers(&self) -> usize {
        self.workers.len()
    }

    /// Blocks until the next due result arrives.
    pub fn next(&mut self) -> Option<Outcome<I, O, E>> {
        if self.remaining == 0 {
            return None;
        }
        let results = self.results.as_ref()?;

        let outcome = if self.ordered {
            loop {
                if let Some(outcome) = self.pending.remove(&self.next_index) {
                    self.next_index += 1;
                    break outcome;
                }
                match results.recv() {
                    Ok((index, outcome)) => {
                        self.pending.insert(index, outcome);
                    }
                    Err(_) => {
                        log::error!("worker pool stopped with {} results outstanding", self.remaining);
                        return None;
                    }
                }
            }
        } else {
            match results.recv() {
                Ok((_, outcome)) => outcome,
                Err(_) => {
                    log::error!("worker pool stopped with {} results outstanding", self.remaining);
                    return None;
                }
            }
        };

        self.remaining -= 1;
        Some(outcome)
    }

    /// Stops handing out queued jobs and joins every worker.
    ///
    /// Jobs already picked up run to completion; their results are discarded.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() && self.results.is_none() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        self.results = None;
        self.pending.clear();
        let workers = self.workers.len();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("a pool worker panicked outside of its task");
            }
        }
        log::debug!("joined {workers} pool workers");
    }
}

impl<I, O, E> Drop for WorkerPool<I, O, E> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

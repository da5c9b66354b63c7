//! Reading entries in the background.
//!
//! A [`TaskScheduler`] owns a fixed pool of worker threads.
//! Reads submitted to it run on those workers, and their results queue up
//! until the thread that owns the scheduler collects them with
//! [`poll()`](TaskScheduler::poll), [`wait_one()`](TaskScheduler::wait_one),
//! or [`run_until_idle()`](TaskScheduler::run_until_idle).
//! Only then do completion callbacks run, so user code never runs
//! on a worker or concurrently with itself.
//!
//! The scheduler isn't `Send` (callbacks needn't be),
//! which pins every callback to the thread that submitted it.
//!
//! Every method takes `&self`, and no internal borrow is held while a callback
//! runs, so a callback holding an `Rc` (or `Weak`) of the scheduler can submit
//! follow-up reads.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use camino::Utf8PathBuf;
use crossbeam_channel as mpmc;
use log::*;

use crate::handle::ArchiveHandle;
use crate::read::ReadOptions;
use crate::result::*;

/// Identifies a submitted read.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

/// Knobs for the worker pool
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// How many worker threads to spawn
    pub workers: NonZeroUsize,
    /// Workers are named `{thread_name}-{n}`
    pub thread_name: String,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            thread_name: String::from("zipread-worker"),
        }
    }
}

type Job = Box<dyn FnOnce() -> ReadResult + Send>;
type Callback = Box<dyn FnOnce(ReadResult)>;

/// A read on its way to a worker.
struct PendingRead {
    ticket: Ticket,
    archive: Utf8PathBuf,
    target_entry_name: String,
    job: Job,
}

impl PendingRead {
    fn run(self) -> Completion {
        let PendingRead {
            ticket,
            archive,
            target_entry_name,
            job,
        } = self;
        trace!("Worker reading {} from {}", target_entry_name, archive);

        let result = match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(result) => result,
            Err(payload) => {
                error!("Reading {} from {} panicked", target_entry_name, archive);
                Err(ReadError::WorkerPanicked {
                    archive,
                    name: target_entry_name,
                    message: panic_message(payload),
                })
            }
        };
        Completion { ticket, result }
    }
}

/// A read on its way back from a worker.
struct Completion {
    ticket: Ticket,
    result: ReadResult,
}

/// A read whose callback hasn't run yet.
struct Waiting {
    archive: Utf8PathBuf,
    target_entry_name: String,
    callback: Callback,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(s) => String::from(*s),
            Err(_) => String::from("(non-string panic payload)"),
        },
    }
}

/// Bookkeeping for submitted reads
struct Queue {
    injector: Option<mpmc::Sender<PendingRead>>,
    /// Completions that never made it to a worker
    ready: VecDeque<Completion>,
    waiting: HashMap<Ticket, Waiting>,
    next_ticket: u64,
}

/// Runs archive reads on a pool of worker threads,
/// delivering results back to the thread that owns it.
pub struct TaskScheduler {
    queue: RefCell<Queue>,
    collector: mpmc::Receiver<Completion>,
    threads: Box<[thread::JoinHandle<()>]>,
}

impl TaskScheduler {
    pub fn new() -> std::io::Result<Self> {
        Self::with_options(&SchedulerOptions::default())
    }

    pub fn with_options(options: &SchedulerOptions) -> std::io::Result<Self> {
        let (injector, injector_rx) = mpmc::unbounded();
        let (collector_tx, collector) = mpmc::unbounded();

        let threads = (0..options.workers.get())
            .map(|idx| {
                let injector_rx = injector_rx.clone();
                let collector_tx = collector_tx.clone();
                thread::Builder::new()
                    .name(format!("{}-{idx}", options.thread_name))
                    .spawn(|| Self::worker(injector_rx, collector_tx))
            })
            .collect::<std::io::Result<Box<[_]>>>()?;
        debug!("Started {} read workers", threads.len());

        Ok(Self {
            queue: RefCell::new(Queue {
                injector: Some(injector),
                ready: VecDeque::new(),
                waiting: HashMap::new(),
                next_ticket: 0,
            }),
            collector,
            threads,
        })
    }

    fn worker(injector: mpmc::Receiver<PendingRead>, collector: mpmc::Sender<Completion>) {
        while let Ok(pending) = injector.recv() {
            if collector.send(pending.run()).is_err() {
                break;
            }
        }
    }

    /// Reads the named entry from `handle` on a worker.
    ///
    /// Returns immediately. `on_complete` gets the entry's bytes or an error,
    /// exactly once, during a later `poll()`, `wait_one()`, or `run_until_idle()`
    /// (or when the scheduler is dropped).
    /// The scheduler holds a reference to the handle until the read finishes.
    pub fn submit_read<F>(&self, handle: &Arc<ArchiveHandle>, name: &str, on_complete: F) -> Ticket
    where
        F: FnOnce(ReadResult) + 'static,
    {
        self.submit_read_with(handle, name, ReadOptions::default(), on_complete)
    }

    pub fn submit_read_with<F>(
        &self,
        handle: &Arc<ArchiveHandle>,
        name: &str,
        options: ReadOptions,
        on_complete: F,
    ) -> Ticket
    where
        F: FnOnce(ReadResult) + 'static,
    {
        let handle = Arc::clone(handle);
        let archive = handle.path().to_owned();
        let target = name.to_owned();
        let job = Box::new(move || handle.read_with(&target, &options));
        self.submit(archive, name.to_owned(), job, Box::new(on_complete))
    }

    fn submit(
        &self,
        archive: Utf8PathBuf,
        target_entry_name: String,
        job: Job,
        callback: Callback,
    ) -> Ticket {
        let mut queue = self.queue.borrow_mut();
        let ticket = Ticket(queue.next_ticket);
        queue.next_ticket += 1;
        debug!(
            "Submitting read of {} from {} as {:?}",
            target_entry_name, archive, ticket
        );

        queue.waiting.insert(
            ticket,
            Waiting {
                archive: archive.clone(),
                target_entry_name: target_entry_name.clone(),
                callback,
            },
        );

        let pending = PendingRead {
            ticket,
            archive,
            target_entry_name,
            job,
        };
        let send_result = match &queue.injector {
            Some(injector) => injector.send(pending).map_err(|e| e.into_inner()),
            None => Err(pending),
        };
        // Only possible if every worker died; report it on the next poll.
        if let Err(pending) = send_result {
            error!("No workers left to read {}", pending.target_entry_name);
            let result = Err(ReadError::WorkerPanicked {
                archive: pending.archive,
                name: pending.target_entry_name,
                message: String::from("no worker threads available"),
            });
            queue.ready.push_back(Completion { ticket, result });
        }
        ticket
    }

    /// How many submitted reads haven't had their callbacks run yet
    pub fn outstanding(&self) -> usize {
        self.queue.borrow().waiting.len()
    }

    fn pop_ready(&self) -> Option<Completion> {
        self.queue.borrow_mut().ready.pop_front()
    }

    /// Runs callbacks for any reads that have finished, without blocking.
    ///
    /// Returns how many ran.
    pub fn poll(&self) -> usize {
        let mut ran = 0;
        while let Some(completion) = self.pop_ready() {
            self.complete(completion);
            ran += 1;
        }
        while let Ok(completion) = self.collector.try_recv() {
            self.complete(completion);
            ran += 1;
        }
        ran
    }

    /// Blocks until at least one read finishes (if any are outstanding),
    /// then runs callbacks for everything that's finished.
    ///
    /// Returns how many ran.
    pub fn wait_one(&self) -> usize {
        let ran = self.poll();
        if ran > 0 || self.outstanding() == 0 {
            return ran;
        }
        match self.collector.recv() {
            Ok(completion) => {
                self.complete(completion);
                1 + self.poll()
            }
            Err(_) => self.fail_all_waiting(),
        }
    }

    /// Blocks until every submitted read has finished and its callback has run.
    ///
    /// Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.outstanding() > 0 {
            ran += self.wait_one();
        }
        ran
    }

    fn complete(&self, completion: Completion) {
        // Release the borrow before the callback runs; it may submit more.
        let waiting = self.queue.borrow_mut().waiting.remove(&completion.ticket);
        match waiting {
            Some(waiting) => {
                trace!(
                    "Completing {:?} ({} from {})",
                    completion.ticket,
                    waiting.target_entry_name,
                    waiting.archive
                );
                (waiting.callback)(completion.result);
            }
            None => warn!("Completion for unknown {:?}", completion.ticket),
        }
    }

    /// The workers are all gone; nothing else is coming back.
    fn fail_all_waiting(&self) -> usize {
        let waiting = std::mem::take(&mut self.queue.borrow_mut().waiting);
        error!(
            "Read workers exited with {} reads outstanding",
            waiting.len()
        );
        let ran = waiting.len();
        for (_ticket, waiting) in waiting {
            (waiting.callback)(Err(ReadError::WorkerPanicked {
                archive: waiting.archive,
                name: waiting.target_entry_name,
                message: String::from("worker threads exited"),
            }));
        }
        ran
    }

    #[cfg(test)]
    fn submit_job<J, F>(&self, name: &str, job: J, on_complete: F) -> Ticket
    where
        J: FnOnce() -> ReadResult + Send + 'static,
        F: FnOnce(ReadResult) + 'static,
    {
        self.submit(
            Utf8PathBuf::from("test.zip"),
            name.to_owned(),
            Box::new(job),
            Box::new(on_complete),
        )
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        // Workers drain whatever's queued, then see the closed channel and exit.
        self.queue.get_mut().injector = None;
        if thread::panicking() {
            // A panicking callback now would abort the process.
            warn!(
                "Dropping {} callbacks while unwinding",
                self.queue.get_mut().waiting.len()
            );
        } else {
            let ran = self.run_until_idle();
            if ran > 0 {
                debug!("Ran {} callbacks while shutting down", ran);
            }
        }
        for worker in std::mem::take(&mut self.threads).into_vec() {
            if worker.join().is_err() {
                error!("Read worker panicked");
            }
        }
    }
}

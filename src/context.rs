//! Execution contexts: where submitted work and dispatched callbacks run.
//!
//! The channel-backed contexts use a multi-producer channel as their queue.
//! Any thread may enqueue; only the context's own threads receive.
use crate::deferred::panic_message;
use crate::Error;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Identity of an execution context, used to tell whether a promise already
/// dispatches onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context-{}", self.0)
    }
}

/// Something that runs jobs.
///
/// Contexts used as callback contexts must run jobs one at a time in the
/// order they were enqueued; [`SerialContext`] and [`LocalQueue`] do.
/// [`ThreadPool`] does not and is meant for running work.
pub trait Executor: Send + Sync {
    fn id(&self) -> ContextId;

    /// Enqueues `job`. Fails with [`Error::ContextClosed`] once the context
    /// stopped accepting work; the job is dropped in that case.
    fn execute(&self, job: Job) -> Result<(), Error>;
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn id(&self) -> ContextId {
        (**self).id()
    }

    fn execute(&self, job: Job) -> Result<(), Error> {
        (**self).execute(job)
    }
}

fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        warn!(panic = %panic_message(payload.as_ref()), "job panicked");
    }
}

/// Runs every job immediately on the calling thread.
#[derive(Debug)]
pub struct Inline {
    id: ContextId,
}

impl Inline {
    pub fn new() -> Self {
        Self {
            id: ContextId::next(),
        }
    }
}

impl Default for Inline {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for Inline {
    fn id(&self) -> ContextId {
        self.id
    }

    fn execute(&self, job: Job) -> Result<(), Error> {
        run_job(job);
        Ok(())
    }
}

/// A queue pumped by its owner, the way a UI event loop drains posted
/// messages.
///
/// # Examples
///
/// ```
/// use promise_deferred::{Executor, LocalQueue};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let queue = LocalQueue::new();
/// let count = Arc::new(AtomicUsize::new(0));
/// let c = count.clone();
/// queue.execute(Box::new(move || { c.fetch_add(1, Ordering::SeqCst); })).unwrap();
/// assert_eq!(count.load(Ordering::SeqCst), 0);
/// assert_eq!(queue.run_pending(), 1);
/// assert_eq!(count.load(Ordering::SeqCst), 1);
/// ```
pub struct LocalQueue {
    id: ContextId,
    jobs: Mutex<VecDeque<Job>>,
    closed: AtomicBool,
}

impl LocalQueue {
    pub fn new() -> Self {
        Self {
            id: ContextId::next(),
            jobs: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Runs queued jobs, including ones enqueued while running, until the
    /// queue is empty. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // Lock released before the job runs so it can enqueue more.
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => {
                    run_job(job);
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Stops accepting jobs. Jobs already queued can still be run.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for LocalQueue {
    fn id(&self) -> ContextId {
        self.id
    }

    fn execute(&self, job: Job) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ContextClosed);
        }
        self.jobs.lock().push_back(job);
        Ok(())
    }
}

impl fmt::Debug for LocalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalQueue")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

/// Named threads receiving jobs from one channel.
struct Workers {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Workers {
    fn spawn(name: &str, count: usize) -> Result<Self, Error> {
        let (tx, rx) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(rx));
        let workers = Workers {
            name: name.to_owned(),
            sender: Mutex::new(Some(tx)),
            threads: Mutex::new(Vec::with_capacity(count)),
        };
        for index in 0..count {
            let thread_name = if count == 1 {
                name.to_owned()
            } else {
                format!("{}-{}", name, index)
            };
            let receiver = receiver.clone();
            // On failure `workers` is dropped, which stops the threads
            // spawned so far.
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || work(receiver))
                .map_err(|e| Error::Spawn(e.to_string()))?;
            workers.threads.lock().push(handle);
        }
        debug!(name, threads = count, "execution context started");
        Ok(workers)
    }

    fn execute(&self, job: Job) -> Result<(), Error> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(job).map_err(|_| Error::ContextClosed),
            None => Err(Error::ContextClosed),
        }
    }

    /// Closes the channel and joins the threads once queued jobs ran.
    fn shutdown(&self) {
        if self.sender.lock().take().is_none() {
            return;
        }
        let current = thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            // The last handle may be dropped by one of our own jobs.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(name = %self.name, "execution context thread panicked");
            }
        }
        debug!(name = %self.name, "execution context stopped");
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(receiver: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = receiver.lock().recv();
        match job {
            Ok(job) => run_job(job),
            Err(_) => return,
        }
    }
}

/// One dedicated thread running jobs in FIFO order. Used as the designated
/// callback context.
pub struct SerialContext {
    id: ContextId,
    workers: Workers,
}

impl SerialContext {
    pub fn new(name: &str) -> Result<Self, Error> {
        Ok(Self {
            id: ContextId::next(),
            workers: Workers::spawn(name, 1)?,
        })
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    pub fn shutdown(&self) {
        self.workers.shutdown()
    }
}

impl Executor for SerialContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn execute(&self, job: Job) -> Result<(), Error> {
        self.workers.execute(job)
    }
}

impl fmt::Debug for SerialContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialContext")
            .field("id", &self.id)
            .field("name", &self.workers.name)
            .finish()
    }
}

/// A fixed set of worker threads sharing one job queue.
pub struct ThreadPool {
    id: ContextId,
    size: usize,
    workers: Workers,
}

impl ThreadPool {
    pub fn new(threads: usize, name: &str) -> Result<Self, Error> {
        if threads == 0 {
            return Err(Error::Argument("thread pool needs at least one thread"));
        }
        Ok(Self {
            id: ContextId::next(),
            size: threads,
            workers: Workers::spawn(name, threads)?,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    pub fn shutdown(&self) {
        self.workers.shutdown()
    }
}

impl Executor for ThreadPool {
    fn id(&self) -> ContextId {
        self.id
    }

    fn execute(&self, job: Job) -> Result<(), Error> {
        self.workers.execute(job)
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("id", &self.id)
            .field("name", &self.workers.name)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_context_ids_are_unique() {
        let a = Inline::new();
        let b = Inline::new();
        let q = LocalQueue::new();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), q.id());
    }

    #[test]
    fn test_serial_context_runs_in_order_on_its_thread() {
        let context = SerialContext::new("serial-test").unwrap();
        let (tx, rx) = channel();
        for i in 0..20 {
            let tx = tx.clone();
            context
                .execute(Box::new(move || {
                    let name = thread::current().name().map(str::to_owned);
                    tx.send((i, name)).unwrap();
                }))
                .unwrap();
        }
        drop(tx);
        let seen: Vec<_> = rx.iter().collect();
        assert_eq!(seen.iter().map(|(i, _)| *i).collect::<Vec<_>>(), (0..20).collect::<Vec<_>>());
        assert!(seen.iter().all(|(_, name)| name.as_deref() == Some("serial-test")));
    }

    #[test]
    fn test_thread_pool_survives_panicking_job() {
        let pool = ThreadPool::new(2, "pool-test").unwrap();
        assert_eq!(pool.size(), 2);
        pool.execute(Box::new(|| panic!("boom"))).unwrap();
        let (tx, rx) = channel();
        for i in 0..4 {
            let tx = tx.clone();
            pool.execute(Box::new(move || tx.send(i).unwrap())).unwrap();
        }
        drop(tx);
        let mut seen: Vec<_> = rx.iter().collect();
        seen.sort();
        assert_eq!(seen, [0, 1, 2, 3]);
    }

    #[test]
    fn test_closed_contexts_refuse_jobs() {
        let pool = ThreadPool::new(1, "closed-test").unwrap();
        pool.shutdown();
        assert_eq!(pool.execute(Box::new(|| {})), Err(Error::ContextClosed));

        let queue = LocalQueue::new();
        queue.close();
        assert_eq!(queue.execute(Box::new(|| {})), Err(Error::ContextClosed));
    }

    #[test]
    fn test_empty_thread_pool_is_an_error() {
        assert!(matches!(ThreadPool::new(0, "none"), Err(Error::Argument(_))));
    }

    #[test]
    fn test_local_queue_runs_nested_jobs() {
        let queue = Arc::new(LocalQueue::new());
        let (tx, rx) = channel();
        let q = queue.clone();
        queue
            .execute(Box::new(move || {
                tx.send(1).unwrap();
                let tx = tx.clone();
                q.execute(Box::new(move || tx.send(2).unwrap())).unwrap();
            }))
            .unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.run_pending(), 2);
        assert!(queue.is_empty());
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), [1, 2]);
    }
}

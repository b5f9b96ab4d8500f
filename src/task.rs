//! Units of work and how they settle their deferred.
//!
//! A [`WorkUnit`] is anything that can run once on a worker and produce a
//! `Result`. The crate ships units for closures ([`Task`], [`Call`]), futures
//! ([`FutureTask`]) and threads that are already running
//! ([`std::thread::JoinHandle`]).
use crate::deferred::panic_message;
use crate::{Deferred, Error, Executor, Job, Promise};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

/// Why a submitted unit of work was rejected.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError<E> {
    #[error("task failed: {0}")]
    Failed(E),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("worker context refused the task")]
    ExecutorClosed,
}

impl<E> TaskError<E> {
    /// The error the unit returned, if it returned one.
    pub fn failure(&self) -> Option<&E> {
        match self {
            TaskError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Whether a [`DeferredTask`] starts when it is handed to a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StartPolicy {
    /// Follow the manager's auto-submit setting.
    #[default]
    Default,
    /// Always start.
    Auto,
    /// Never start implicitly; call [`DeferredManager::start`](crate::DeferredManager::start).
    Manual,
}

impl StartPolicy {
    pub fn starts(self, auto_submit: bool) -> bool {
        match self {
            StartPolicy::Auto => true,
            StartPolicy::Manual => false,
            StartPolicy::Default => auto_submit,
        }
    }
}

/// Handle a running unit uses to report progress on its promise.
pub struct Progress<P> {
    notify: Arc<dyn Fn(P) -> Result<(), Error> + Send + Sync>,
}

impl<P: Send + 'static> Progress<P> {
    pub(crate) fn new<D, F>(deferred: Deferred<D, F, P>) -> Self
    where
        D: Send + 'static,
        F: Send + 'static,
    {
        Self {
            notify: Arc::new(move |progress| deferred.notify(progress)),
        }
    }
}

impl<P> Progress<P> {
    /// Fails with [`Error::StateViolation`] once the promise finished.
    pub fn notify(&self, progress: P) -> Result<(), Error> {
        (self.notify)(progress)
    }
}

impl<P> Clone for Progress<P> {
    fn clone(&self) -> Self {
        Self {
            notify: self.notify.clone(),
        }
    }
}

impl<P> fmt::Debug for Progress<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress").finish_non_exhaustive()
    }
}

pub trait WorkUnit: Send + 'static {
    type Output: Send + 'static;
    type Error: Send + 'static;
    type Progress: Send + 'static;

    fn run(self, progress: &Progress<Self::Progress>) -> Result<Self::Output, Self::Error>;
}

/// A closure that reports progress while it runs.
///
/// # Examples
///
/// ```
/// use promise_deferred::{Inline, DeferredManager, Task};
/// use std::sync::Arc;
///
/// let manager = DeferredManager::builder().workers(Arc::new(Inline::new())).build().unwrap();
/// let promise = manager.submit(Task::new(|progress| {
///     progress.notify(50u8).ok();
///     Ok::<_, String>("done")
/// }));
/// assert!(promise.is_resolved());
/// ```
pub struct Task<W, P = ()> {
    work: W,
    _progress: PhantomData<fn(P)>,
}

impl<W, P> Task<W, P> {
    pub fn new<D, E>(work: W) -> Self
    where
        W: FnOnce(&Progress<P>) -> Result<D, E>,
    {
        Self {
            work,
            _progress: PhantomData,
        }
    }
}

impl<W, D, E, P> WorkUnit for Task<W, P>
where
    W: FnOnce(&Progress<P>) -> Result<D, E> + Send + 'static,
    D: Send + 'static,
    E: Send + 'static,
    P: Send + 'static,
{
    type Output = D;
    type Error = E;
    type Progress = P;

    fn run(self, progress: &Progress<P>) -> Result<D, E> {
        (self.work)(progress)
    }
}

/// A blocking call without progress reporting.
pub struct Call<W> {
    work: W,
}

impl<W> Call<W> {
    pub fn new<D, E>(work: W) -> Self
    where
        W: FnOnce() -> Result<D, E>,
    {
        Self { work }
    }
}

impl<W, D, E> WorkUnit for Call<W>
where
    W: FnOnce() -> Result<D, E> + Send + 'static,
    D: Send + 'static,
    E: Send + 'static,
{
    type Output = D;
    type Error = E;
    type Progress = ();

    fn run(self, _progress: &Progress<()>) -> Result<D, E> {
        (self.work)()
    }
}

/// A future driven to completion on the worker that runs it.
pub struct FutureTask<Fut> {
    future: Fut,
}

impl<Fut> FutureTask<Fut> {
    pub fn new(future: Fut) -> Self {
        Self { future }
    }
}

impl<Fut, D, E> WorkUnit for FutureTask<Fut>
where
    Fut: Future<Output = Result<D, E>> + Send + 'static,
    D: Send + 'static,
    E: Send + 'static,
{
    type Output = D;
    type Error = E;
    type Progress = ();

    fn run(self, _progress: &Progress<()>) -> Result<D, E> {
        futures::executor::block_on(self.future)
    }
}

/// Adopts a thread that is already running; the worker waits for it.
impl<D, E> WorkUnit for JoinHandle<Result<D, E>>
where
    D: Send + 'static,
    E: Send + 'static,
{
    type Output = D;
    type Error = E;
    type Progress = ();

    fn run(self, _progress: &Progress<()>) -> Result<D, E> {
        match self.join() {
            Ok(result) => result,
            // Rejected as a panic by `settle_with`.
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

/// The deferred settled by a unit of work.
pub type TaskDeferred<W> =
    Deferred<<W as WorkUnit>::Output, TaskError<<W as WorkUnit>::Error>, <W as WorkUnit>::Progress>;

/// The promise returned for a unit of work.
pub type TaskPromise<W> =
    Promise<<W as WorkUnit>::Output, TaskError<<W as WorkUnit>::Error>, <W as WorkUnit>::Progress>;

/// Runs `unit` on `executor` and settles `deferred` with its outcome.
pub(crate) fn run_on<W: WorkUnit>(unit: W, deferred: TaskDeferred<W>, executor: &dyn Executor) {
    let producer = deferred.clone();
    let job: Job = Box::new(move || settle_with(unit, producer));
    if let Err(err) = executor.execute(job) {
        debug!(context = %executor.id(), %err, "worker context refused task");
        if let Err(err) = deferred.reject(TaskError::ExecutorClosed) {
            trace!(%err, "task already finished");
        }
    }
}

fn settle_with<W: WorkUnit>(unit: W, deferred: TaskDeferred<W>) {
    let progress = Progress::new(deferred.clone());
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unit.run(&progress)));
    drop(progress);
    let settled = match outcome {
        Ok(Ok(value)) => deferred.resolve(value),
        Ok(Err(err)) => deferred.reject(TaskError::Failed(err)),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            debug!(panic = %message, "task panicked");
            deferred.reject(TaskError::Panicked(message))
        }
    };
    if let Err(err) = settled {
        trace!(%err, "task outcome ignored");
    }
}

/// A unit of work paired with its promise and a start policy.
///
/// The promise exists before the work starts, so callbacks can be attached
/// to a task that is started later. A task starts at most once.
///
/// # Examples
///
/// ```
/// use promise_deferred::{Call, DeferredTask, Error, Inline, StartPolicy};
///
/// let task = DeferredTask::with_start_policy(Call::new(|| Ok::<_, ()>(1)), StartPolicy::Manual);
/// let promise = task.promise();
/// assert!(promise.is_pending());
///
/// let inline = Inline::new();
/// task.start_on(&inline).unwrap();
/// assert!(promise.is_resolved());
/// assert_eq!(task.start_on(&inline), Err(Error::AlreadyStarted));
/// ```
pub struct DeferredTask<W: WorkUnit> {
    inner: Arc<TaskInner<W>>,
}

struct TaskInner<W: WorkUnit> {
    unit: Mutex<Option<W>>,
    deferred: TaskDeferred<W>,
    policy: StartPolicy,
}

impl<W: WorkUnit> DeferredTask<W> {
    pub fn new(unit: W) -> Self {
        Self::with_start_policy(unit, StartPolicy::Default)
    }

    pub fn with_start_policy(unit: W, policy: StartPolicy) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                unit: Mutex::new(Some(unit)),
                deferred: Deferred::new(),
                policy,
            }),
        }
    }

    pub fn start_policy(&self) -> StartPolicy {
        self.inner.policy
    }

    pub fn promise(&self) -> TaskPromise<W> {
        self.inner.deferred.promise()
    }

    pub fn is_started(&self) -> bool {
        self.inner.unit.lock().is_none()
    }

    /// Starts the task on `executor`.
    pub fn start_on(&self, executor: &dyn Executor) -> Result<(), Error> {
        let unit = self.inner.unit.lock().take().ok_or(Error::AlreadyStarted)?;
        run_on(unit, self.inner.deferred.clone(), executor);
        Ok(())
    }
}

impl<W: WorkUnit> Clone for DeferredTask<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W: WorkUnit> fmt::Debug for DeferredTask<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredTask")
            .field("policy", &self.inner.policy)
            .field("started", &self.is_started())
            .field("state", &self.inner.deferred.state())
            .finish()
    }
}

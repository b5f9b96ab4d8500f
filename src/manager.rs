//! The deferred manager: runs work in the background and hands out promises.
//!
//! Work runs on the manager's worker context. When the manager has a callback
//! context, every promise it returns is adapted onto it with
//! [`dispatch_on`], so consumers only ever see callbacks on that context,
//! the way a UI toolkit wants them on its main thread.
use crate::task::{run_on, TaskDeferred, TaskPromise};
use crate::{
    dispatch_on, master, ContextId, Deferred, DeferredTask, Error, Executor, MasterProgress,
    MasterResult, OneReject, Promise, TaskError, ThreadPool, WorkUnit,
};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use tracing::{debug, trace};

/// Settings of a [`DeferredManager`], fixed once the manager is built.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ManagerConfig {
    /// Threads of the worker pool the manager creates.
    pub worker_threads: usize,
    /// Name prefix of the worker threads.
    pub thread_name: String,
    /// Whether tasks with [`StartPolicy::Default`](crate::StartPolicy::Default)
    /// start when handed to [`DeferredManager::when`].
    pub auto_submit: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_threads: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
            thread_name: "deferred-worker".to_owned(),
            auto_submit: true,
        }
    }
}

/// Builds a [`DeferredManager`].
///
/// # Examples
///
/// ```
/// use promise_deferred::{DeferredManager, Executor, SerialContext};
/// use std::sync::Arc;
///
/// let ui: Arc<dyn Executor> = Arc::new(SerialContext::new("ui").unwrap());
/// let manager = DeferredManager::builder()
///     .worker_threads(2)
///     .thread_name("background")
///     .auto_submit(false)
///     .callback_context(ui.clone())
///     .build()
///     .unwrap();
/// assert!(!manager.is_auto_submit());
/// assert_eq!(manager.callback_context(), Some(ui.id()));
/// ```
#[derive(Default)]
pub struct DeferredManagerBuilder {
    config: ManagerConfig,
    workers: Option<Arc<dyn Executor>>,
    callbacks: Option<Arc<dyn Executor>>,
}

impl DeferredManagerBuilder {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = threads;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    pub fn auto_submit(mut self, auto_submit: bool) -> Self {
        self.config.auto_submit = auto_submit;
        self
    }

    /// Runs work on `workers` instead of a pool built from the config.
    pub fn workers(mut self, workers: Arc<dyn Executor>) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Marshals every callback of the manager's promises onto `context`. The
    /// context must run jobs in FIFO order.
    pub fn callback_context(mut self, context: Arc<dyn Executor>) -> Self {
        self.callbacks = Some(context);
        self
    }

    pub fn build(self) -> Result<DeferredManager, Error> {
        let workers = match self.workers {
            Some(workers) => workers,
            None => Arc::new(ThreadPool::new(
                self.config.worker_threads,
                &self.config.thread_name,
            )?),
        };
        debug!(
            workers = %workers.id(),
            callbacks = ?self.callbacks.as_ref().map(|c| c.id()),
            auto_submit = self.config.auto_submit,
            "deferred manager built"
        );
        Ok(DeferredManager {
            workers,
            callbacks: self.callbacks,
            auto_submit: self.config.auto_submit,
        })
    }
}

/// Runs units of work and returns promises bound to their outcome.
///
/// # Examples
///
/// ```
/// use promise_deferred::{Call, DeferredManager};
/// use futures::executor::block_on;
///
/// let manager = DeferredManager::new().unwrap();
/// let all = manager
///     .submit_all((1..=3).map(|i| Call::new(move || Ok::<_, String>(i * i))))
///     .unwrap();
/// let values = block_on(all.wait()).unwrap().unwrap().into_values();
/// assert_eq!(values, [1, 4, 9]);
/// ```
pub struct DeferredManager {
    workers: Arc<dyn Executor>,
    callbacks: Option<Arc<dyn Executor>>,
    auto_submit: bool,
}

impl DeferredManager {
    /// A manager with the default config and no callback context.
    pub fn new() -> Result<Self, Error> {
        Self::builder().build()
    }

    pub fn with_config(config: ManagerConfig) -> Result<Self, Error> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> DeferredManagerBuilder {
        DeferredManagerBuilder::default()
    }

    pub fn is_auto_submit(&self) -> bool {
        self.auto_submit
    }

    pub fn callback_context(&self) -> Option<ContextId> {
        self.callbacks.as_ref().map(|context| context.id())
    }

    pub fn workers(&self) -> &Arc<dyn Executor> {
        &self.workers
    }

    /// Runs `unit` on the worker context.
    ///
    /// The promise resolves with the unit's value, or rejects with
    /// [`TaskError`] when the unit returns an error, panics, or the worker
    /// context is closed. It is adopted before the unit starts, so no
    /// progress is lost to a fast worker.
    pub fn submit<W>(&self, unit: W) -> TaskPromise<W>
    where
        W: WorkUnit,
        W::Output: Clone,
        W::Error: Clone,
        W::Progress: Clone,
    {
        trace!(workers = %self.workers.id(), "submitting unit of work");
        let deferred: TaskDeferred<W> = Deferred::new();
        let promise = self.adopt(deferred.promise());
        run_on(unit, deferred, &*self.workers);
        promise
    }

    /// Submits every unit and joins their promises.
    ///
    /// Fails with [`Error::Argument`] before submitting anything when
    /// `units` is empty.
    #[allow(clippy::type_complexity)]
    pub fn submit_all<W, I>(
        &self,
        units: I,
    ) -> Result<
        Promise<
            MasterResult<W::Output>,
            OneReject<TaskError<W::Error>>,
            MasterProgress<W::Progress>,
        >,
        Error,
    >
    where
        I: IntoIterator<Item = W>,
        W: WorkUnit,
        W::Output: Clone,
        W::Error: Clone,
        W::Progress: Clone,
    {
        let units: Vec<W> = units.into_iter().collect();
        if units.is_empty() {
            return Err(Error::Argument("nothing to submit"));
        }
        debug!(count = units.len(), "submitting units of work");
        let deferreds: Vec<TaskDeferred<W>> = units.iter().map(|_| Deferred::new()).collect();
        // Joined before anything runs, so the master sees every event.
        let master = self.join(deferreds.iter().map(Deferred::promise))?;
        for (unit, deferred) in units.into_iter().zip(deferreds) {
            run_on(unit, deferred, &*self.workers);
        }
        Ok(master)
    }

    /// Returns the task's promise, starting the task first if its start
    /// policy and this manager's auto-submit setting say so.
    pub fn when<W>(&self, task: &DeferredTask<W>) -> TaskPromise<W>
    where
        W: WorkUnit,
        W::Output: Clone,
        W::Error: Clone,
        W::Progress: Clone,
    {
        let promise = self.adopt(task.promise());
        self.start_if_due(task);
        promise
    }

    /// Joins the promises of `tasks`, then starts each task its start policy
    /// allows.
    ///
    /// Fails with [`Error::Argument`] before starting anything when `tasks`
    /// is empty.
    #[allow(clippy::type_complexity)]
    pub fn when_all<W>(
        &self,
        tasks: &[DeferredTask<W>],
    ) -> Result<
        Promise<
            MasterResult<W::Output>,
            OneReject<TaskError<W::Error>>,
            MasterProgress<W::Progress>,
        >,
        Error,
    >
    where
        W: WorkUnit,
        W::Output: Clone,
        W::Error: Clone,
        W::Progress: Clone,
    {
        if tasks.is_empty() {
            return Err(Error::Argument("no tasks to wait for"));
        }
        let master = self.join(tasks.iter().map(DeferredTask::promise))?;
        for task in tasks {
            self.start_if_due(task);
        }
        Ok(master)
    }

    fn start_if_due<W: WorkUnit>(&self, task: &DeferredTask<W>) {
        if task.start_policy().starts(self.auto_submit) {
            if let Err(err) = self.start(task) {
                trace!(%err, "task not started");
            }
        }
    }

    /// Starts `task` on the worker context regardless of its start policy.
    pub fn start<W: WorkUnit>(&self, task: &DeferredTask<W>) -> Result<(), Error> {
        task.start_on(&*self.workers)
    }

    /// Routes `promise` through this manager's callback context.
    ///
    /// A promise already dispatching onto that context is returned unchanged,
    /// as is every promise when the manager has no callback context.
    pub fn adopt<D, F, P>(&self, promise: Promise<D, F, P>) -> Promise<D, F, P>
    where
        D: Clone + Send + 'static,
        F: Clone + Send + 'static,
        P: Clone + Send + 'static,
    {
        match &self.callbacks {
            Some(context) => dispatch_on(promise, context),
            None => promise,
        }
    }

    /// [`join`](crate::join)s `promises` and adopts the result.
    #[allow(clippy::type_complexity)]
    pub fn join<D, F, P, I>(
        &self,
        promises: I,
    ) -> Result<Promise<MasterResult<D>, OneReject<F>, MasterProgress<P>>, Error>
    where
        I: IntoIterator<Item = Promise<D, F, P>>,
        D: Clone + Send + 'static,
        F: Clone + Send + 'static,
        P: Clone + Send + 'static,
    {
        Ok(self.adopt(master::join(promises)?))
    }
}

impl fmt::Debug for DeferredManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredManager")
            .field("workers", &self.workers.id())
            .field("callbacks", &self.callback_context())
            .field("auto_submit", &self.auto_submit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Call, Inline, LocalQueue, StartPolicy, Task};
    use futures::executor::block_on;
    use parking_lot::Mutex;

    fn inline_manager(auto_submit: bool) -> (DeferredManager, Arc<LocalQueue>) {
        let queue = Arc::new(LocalQueue::new());
        let manager = DeferredManager::builder()
            .workers(Arc::new(Inline::new()))
            .callback_context(queue.clone())
            .auto_submit(auto_submit)
            .build()
            .unwrap();
        (manager, queue)
    }

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert!(config.worker_threads >= 1);
        assert_eq!(config.thread_name, "deferred-worker");
        assert!(config.auto_submit);
    }

    #[test]
    fn test_zero_worker_threads_is_an_error() {
        let result = DeferredManager::builder().worker_threads(0).build();
        assert!(matches!(result, Err(Error::Argument(_))));
    }

    #[test]
    fn test_submit_dispatches_on_callback_context() {
        let (manager, queue) = inline_manager(true);
        let promise = manager.submit(Call::new(|| Ok::<_, String>(5)));
        assert_eq!(promise.dispatch_context(), manager.callback_context());
        // The work already ran inline; the callback context has not.
        assert!(promise.is_pending());
        assert_eq!(queue.run_pending(), 1);

        // Late callbacks are posted to the callback context too.
        let waiter = promise.wait();
        assert_eq!(queue.len(), 1);
        queue.run_pending();
        assert_eq!(block_on(waiter), Ok(Ok(5)));
    }

    #[test]
    fn test_adopt_is_idempotent() {
        let (manager, _queue) = inline_manager(true);
        let deferred = Deferred::<u8, u8, u8>::new();
        let adopted = manager.adopt(deferred.promise());
        let again = manager.adopt(adopted.clone());
        assert!(Promise::ptr_eq(&adopted, &again));

        let plain = DeferredManager::builder()
            .workers(Arc::new(Inline::new()))
            .build()
            .unwrap();
        let raw = deferred.promise();
        assert!(Promise::ptr_eq(&raw, &plain.adopt(raw.clone())));
    }

    #[test]
    fn test_sibling_failures_are_isolated() {
        let (manager, queue) = inline_manager(true);
        let ok = manager.submit(Call::new(|| Ok::<u8, String>(1)));
        let bad = manager.submit(Call::new(|| Err::<u8, String>("nope".into())));
        let waiter = bad.wait();
        queue.run_pending();
        assert!(ok.is_resolved());
        assert!(bad.is_rejected());
        assert_eq!(
            block_on(waiter),
            Ok(Err(TaskError::Failed("nope".to_owned())))
        );
    }

    #[test]
    fn test_submit_all_empty() {
        let (manager, _queue) = inline_manager(true);
        let units: Vec<Call<fn() -> Result<(), ()>>> = Vec::new();
        assert_eq!(
            manager.submit_all(units).unwrap_err(),
            Error::Argument("nothing to submit")
        );
    }

    #[test]
    fn test_when_honours_start_policy() {
        let (manager, queue) = inline_manager(false);
        let default = DeferredTask::new(Call::new(|| Ok::<_, ()>("default")));
        let auto = DeferredTask::with_start_policy(Call::new(|| Ok::<_, ()>("auto")), StartPolicy::Auto);
        let manual =
            DeferredTask::with_start_policy(Call::new(|| Ok::<_, ()>("manual")), StartPolicy::Manual);

        let p_default = manager.when(&default);
        let p_auto = manager.when(&auto);
        let p_manual = manager.when(&manual);
        queue.run_pending();

        assert!(!default.is_started());
        assert!(auto.is_started());
        assert!(!manual.is_started());
        assert!(p_auto.is_resolved());
        assert!(p_default.is_pending());

        manager.start(&manual).unwrap();
        assert_eq!(manager.start(&manual), Err(Error::AlreadyStarted));
        queue.run_pending();
        assert!(p_manual.is_resolved());
    }

    type NamedCall = Call<Box<dyn FnOnce() -> Result<&'static str, ()> + Send>>;

    fn named_task(name: &'static str, policy: StartPolicy) -> DeferredTask<NamedCall> {
        let work: Box<dyn FnOnce() -> Result<&'static str, ()> + Send> = Box::new(move || Ok(name));
        DeferredTask::with_start_policy(Call::new(work), policy)
    }

    #[test]
    fn test_when_all_starts_by_policy_and_joins() {
        let (manager, queue) = inline_manager(false);
        let tasks = [
            named_task("auto", StartPolicy::Auto),
            named_task("manual", StartPolicy::Manual),
            named_task("default", StartPolicy::Default),
        ];
        let master = manager.when_all(&tasks).unwrap();
        assert_eq!(master.dispatch_context(), manager.callback_context());
        queue.run_pending();

        assert!(tasks[0].is_started());
        assert!(!tasks[1].is_started());
        assert!(!tasks[2].is_started());
        assert!(master.is_pending());

        manager.start(&tasks[1]).unwrap();
        manager.start(&tasks[2]).unwrap();
        let waiter = master.wait();
        queue.run_pending();
        assert_eq!(
            block_on(waiter).unwrap().unwrap().into_values(),
            ["auto", "manual", "default"]
        );
    }

    #[test]
    fn test_when_all_with_auto_submit_starts_default_tasks() {
        let (manager, queue) = inline_manager(true);
        let tasks = [
            named_task("default", StartPolicy::Default),
            named_task("manual", StartPolicy::Manual),
        ];
        let master = manager.when_all(&tasks).unwrap();
        queue.run_pending();
        assert!(tasks[0].is_started());
        assert!(!tasks[1].is_started());
        assert!(master.is_pending());
    }

    #[test]
    fn test_when_all_empty() {
        let (manager, _queue) = inline_manager(true);
        let tasks: Vec<DeferredTask<NamedCall>> = Vec::new();
        assert_eq!(
            manager.when_all(&tasks).unwrap_err(),
            Error::Argument("no tasks to wait for")
        );
    }

    #[test]
    fn test_when_with_auto_submit_starts_default_tasks() {
        let (manager, queue) = inline_manager(true);
        let task = DeferredTask::new(Call::new(|| Ok::<_, ()>(1)));
        let promise = manager.when(&task);
        // A second hand-off does not start it twice.
        let again = manager.when(&task);
        queue.run_pending();
        assert!(task.is_started());
        assert!(promise.is_resolved());
        assert!(again.is_resolved());
    }

    #[test]
    fn test_progress_reaches_callback_context() {
        let (manager, queue) = inline_manager(true);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let promise = manager.submit(Task::new(|progress: &crate::Progress<u8>| {
            progress.notify(25).unwrap();
            progress.notify(75).unwrap();
            Ok::<_, ()>(())
        }));
        let s = seen.clone();
        promise.progress(move |p| s.lock().push(*p));
        let s = seen.clone();
        promise.done(move |_| s.lock().push(100));
        queue.run_pending();
        assert_eq!(*seen.lock(), [25, 75, 100]);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_config_from_json() {
        let config: ManagerConfig =
            serde_json::from_str(r#"{ "worker_threads": 3, "auto_submit": false }"#).unwrap();
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.thread_name, "deferred-worker");
        assert!(!config.auto_submit);

        let policy: StartPolicy = serde_json::from_str(r#""manual""#).unwrap();
        assert_eq!(policy, StartPolicy::Manual);
    }
}

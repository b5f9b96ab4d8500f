//! The deferred object: a single-assignment slot plus its callback lists.
//!
//! All state of one deferred lives behind a single reentrant lock. A state
//! check, the mutation that follows it and the invocation of the callbacks
//! that became due all happen inside that lock, so a callback registered
//! concurrently with `resolve` fires exactly once, either from the list or
//! immediately at registration. Reentrancy lets a callback query or register
//! on the deferred that is dispatching it.
use crate::{ContextId, Error, Executor, Job, Operation, Promise};
use parking_lot::ReentrantMutex;
use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Pending,
    Resolved,
    Rejected,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Pending => "pending",
            State::Resolved => "resolved",
            State::Rejected => "rejected",
        })
    }
}

pub(crate) type DoneCallback<D> = Box<dyn FnOnce(&D) + Send>;
pub(crate) type FailCallback<F> = Box<dyn FnOnce(&F) + Send>;
pub(crate) type ProgressCallback<P> = Box<dyn FnMut(&P) + Send>;
pub(crate) type AlwaysCallback<D, F> = Box<dyn FnOnce(&Result<D, F>) + Send>;

struct Inner<D, F, P> {
    state: State,
    result: Option<Result<D, F>>,
    done: Vec<DoneCallback<D>>,
    fail: Vec<FailCallback<F>>,
    progress: Vec<ProgressCallback<P>>,
    always: Vec<AlwaysCallback<D, F>>,
    // Set while progress callbacks run; a reentrant notify queues behind the
    // event being delivered.
    notifying: bool,
    queued: VecDeque<P>,
}

/// Shared core behind a [`Deferred`] and every [`Promise`] made from it.
pub(crate) struct DeferredCore<D, F, P> {
    inner: ReentrantMutex<RefCell<Inner<D, F, P>>>,
    dispatch: Option<Arc<dyn Executor>>,
    // Live `Deferred` handles. When the last one goes away while pending,
    // nothing can finish the deferred anymore.
    producers: AtomicUsize,
}

fn invoke(kind: &'static str, callback: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        warn!(
            callback = kind,
            panic = %panic_message(payload.as_ref()),
            "callback panicked"
        );
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

impl<D, F, P> DeferredCore<D, F, P> {
    fn new(dispatch: Option<Arc<dyn Executor>>) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(Inner {
                state: State::Pending,
                result: None,
                done: Vec::new(),
                fail: Vec::new(),
                progress: Vec::new(),
                always: Vec::new(),
                notifying: false,
                queued: VecDeque::new(),
            })),
            dispatch,
            producers: AtomicUsize::new(1),
        }
    }

    pub(crate) fn dispatch(&self) -> Option<ContextId> {
        self.dispatch.as_ref().map(|context| context.id())
    }

    pub(crate) fn state(&self) -> State {
        self.inner.lock().borrow().state
    }

    fn settle(&self, result: Result<D, F>) -> Result<(), Error> {
        let (operation, next) = match result {
            Ok(_) => (Operation::Resolve, State::Resolved),
            Err(_) => (Operation::Reject, State::Rejected),
        };
        let guard = self.inner.lock();
        let state = guard.borrow().state;
        if state != State::Pending {
            return Err(Error::StateViolation { operation, state });
        }

        let (done, fail, always) = {
            let mut inner = guard.borrow_mut();
            inner.state = next;
            inner.result = Some(result);
            inner.progress.clear();
            inner.queued.clear();
            (
                mem::take(&mut inner.done),
                mem::take(&mut inner.fail),
                mem::take(&mut inner.always),
            )
        };
        trace!(state = %next, done = done.len(), fail = fail.len(), always = always.len(), "deferred settled");

        // From here on the state is terminal, so reentrant calls only take
        // shared borrows.
        let inner = guard.borrow();
        if let Some(result) = inner.result.as_ref() {
            match result {
                Ok(value) => {
                    for callback in done {
                        invoke("done", || callback(value));
                    }
                }
                Err(reject) => {
                    for callback in fail {
                        invoke("fail", || callback(reject));
                    }
                }
            }
            for callback in always {
                invoke("always", || callback(result));
            }
        }
        Ok(())
    }

    pub(crate) fn resolve(&self, value: D) -> Result<(), Error> {
        self.settle(Ok(value))
    }

    pub(crate) fn reject(&self, reject: F) -> Result<(), Error> {
        self.settle(Err(reject))
    }

    /// Delivers `progress` to the progress callbacks.
    ///
    /// If a callback settles the deferred, the event being delivered does not
    /// reach the callbacks after it, and queued events are discarded.
    pub(crate) fn notify(&self, progress: P) -> Result<(), Error> {
        let guard = self.inner.lock();
        // Settled callbacks hold a shared borrow while they run.
        let state = guard.borrow().state;
        if state != State::Pending {
            return Err(Error::StateViolation {
                operation: Operation::Notify,
                state,
            });
        }
        {
            let mut inner = guard.borrow_mut();
            if inner.notifying {
                inner.queued.push_back(progress);
                return Ok(());
            }
            inner.notifying = true;
        }

        let mut next = Some(progress);
        while let Some(progress) = next.take() {
            let mut callbacks = mem::take(&mut guard.borrow_mut().progress);
            for callback in callbacks.iter_mut() {
                invoke("progress", || callback(&progress));
                if guard.borrow().state != State::Pending {
                    break;
                }
            }
            let mut inner = guard.borrow_mut();
            if inner.state != State::Pending {
                break;
            }
            // Keep callbacks registered while this event was delivered.
            callbacks.append(&mut inner.progress);
            inner.progress = callbacks;
            next = inner.queued.pop_front();
        }
        guard.borrow_mut().notifying = false;
        Ok(())
    }

    /// Whether every producer is gone, so the deferred can never finish.
    fn is_abandoned(&self) -> bool {
        self.producers.load(Ordering::Acquire) == 0
    }

    /// Drops every queued callback of a deferred that can no longer finish.
    fn abandon(&self) {
        let guard = self.inner.lock();
        let state = guard.borrow().state;
        if state != State::Pending {
            return;
        }
        let callbacks = {
            let mut inner = guard.borrow_mut();
            inner.queued.clear();
            (
                mem::take(&mut inner.done),
                mem::take(&mut inner.fail),
                mem::take(&mut inner.progress),
                mem::take(&mut inner.always),
            )
        };
        trace!("deferred abandoned while pending");
        drop(callbacks);
    }
}

impl<D, F, P> DeferredCore<D, F, P>
where
    D: Send + 'static,
    F: Send + 'static,
    P: Send + 'static,
{
    /// Runs `callback` against the settled result. A dispatched deferred
    /// posts it to its context; otherwise it runs on the calling thread.
    fn deliver_late(
        self: &Arc<Self>,
        kind: &'static str,
        callback: impl FnOnce(&Result<D, F>) + Send + 'static,
    ) {
        let Some(context) = self.dispatch.as_ref() else {
            let guard = self.inner.lock();
            let inner = guard.borrow();
            if let Some(result) = inner.result.as_ref() {
                invoke(kind, || callback(result));
            }
            return;
        };
        let core = self.clone();
        let job: Job = Box::new(move || {
            let guard = core.inner.lock();
            let inner = guard.borrow();
            if let Some(result) = inner.result.as_ref() {
                invoke(kind, || callback(result));
            }
        });
        if let Err(err) = context.execute(job) {
            debug!(context = %context.id(), callback = kind, %err, "late callback dropped");
        }
    }

    pub(crate) fn on_done(self: &Arc<Self>, callback: DoneCallback<D>) {
        let guard = self.inner.lock();
        let state = guard.borrow().state;
        match state {
            State::Pending if self.is_abandoned() => drop(callback),
            State::Pending => guard.borrow_mut().done.push(callback),
            State::Resolved => self.deliver_late("done", move |result| {
                if let Ok(value) = result {
                    callback(value);
                }
            }),
            State::Rejected => {}
        }
    }

    pub(crate) fn on_fail(self: &Arc<Self>, callback: FailCallback<F>) {
        let guard = self.inner.lock();
        let state = guard.borrow().state;
        match state {
            State::Pending if self.is_abandoned() => drop(callback),
            State::Pending => guard.borrow_mut().fail.push(callback),
            State::Rejected => self.deliver_late("fail", move |result| {
                if let Err(reject) = result {
                    callback(reject);
                }
            }),
            State::Resolved => {}
        }
    }

    pub(crate) fn on_progress(&self, callback: ProgressCallback<P>) {
        let guard = self.inner.lock();
        let state = guard.borrow().state;
        if state == State::Pending && !self.is_abandoned() {
            guard.borrow_mut().progress.push(callback);
        }
    }

    pub(crate) fn on_always(self: &Arc<Self>, callback: AlwaysCallback<D, F>) {
        let guard = self.inner.lock();
        let state = guard.borrow().state;
        if state == State::Pending {
            if !self.is_abandoned() {
                guard.borrow_mut().always.push(callback);
            }
        } else {
            self.deliver_late("always", callback);
        }
    }
}

/// The producer side of a promise.
///
/// A `Deferred` is resolved, rejected or notified by the code that owns the
/// work. Consumers only ever see the [`Promise`] returned by
/// [`promise`](Deferred::promise). Cloning a `Deferred` hands out another
/// producer handle of the same slot.
///
/// # Examples
///
/// ```
/// use promise_deferred::{Deferred, Error, State};
///
/// let deferred = Deferred::<String, String, ()>::new();
/// let promise = deferred.promise();
/// deferred.reject("💥".into()).unwrap();
///
/// assert_eq!(promise.state(), State::Rejected);
/// assert!(matches!(
///     deferred.resolve("🍓".into()),
///     Err(Error::StateViolation { state: State::Rejected, .. })
/// ));
/// ```
pub struct Deferred<D, F, P> {
    core: Arc<DeferredCore<D, F, P>>,
}

impl<D, F, P> Deferred<D, F, P> {
    pub fn new() -> Self {
        Self {
            core: Arc::new(DeferredCore::new(None)),
        }
    }

    /// A deferred whose late callbacks are posted to `context`.
    pub(crate) fn dispatched_on(context: Arc<dyn Executor>) -> Self {
        Self {
            core: Arc::new(DeferredCore::new(Some(context))),
        }
    }

    pub fn promise(&self) -> Promise<D, F, P> {
        Promise::from_core(self.core.clone())
    }

    pub fn state(&self) -> State {
        self.core.state()
    }

    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == State::Resolved
    }

    pub fn is_rejected(&self) -> bool {
        self.state() == State::Rejected
    }

    /// Resolves the deferred and fires the done callbacks, then the always
    /// callbacks, in registration order.
    ///
    /// Fails with [`Error::StateViolation`] if the deferred already finished.
    #[must_use = "resolving a finished deferred is an error"]
    pub fn resolve(&self, value: D) -> Result<(), Error> {
        self.core.resolve(value)
    }

    /// Rejects the deferred and fires the fail callbacks, then the always
    /// callbacks, in registration order.
    #[must_use = "rejecting a finished deferred is an error"]
    pub fn reject(&self, reject: F) -> Result<(), Error> {
        self.core.reject(reject)
    }

    /// Delivers a progress value to the progress callbacks. Only legal while
    /// the deferred is pending.
    #[must_use = "notifying a finished deferred is an error"]
    pub fn notify(&self, progress: P) -> Result<(), Error> {
        self.core.notify(progress)
    }
}

impl<D, F, P> Clone for Deferred<D, F, P> {
    fn clone(&self) -> Self {
        self.core.producers.fetch_add(1, Ordering::Relaxed);
        Self {
            core: self.core.clone(),
        }
    }
}

impl<D, F, P> Drop for Deferred<D, F, P> {
    /// If this is the last producer of an unfinished deferred, drop its
    /// callbacks so waiters learn that no value is coming.
    fn drop(&mut self) {
        if self.core.producers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.core.abandon();
        }
    }
}

impl<D, F, P> Default for Deferred<D, F, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, F, P> fmt::Debug for Deferred<D, F, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("state", &self.state())
            .field("dispatch", &self.core.dispatch())
            .finish()
    }
}

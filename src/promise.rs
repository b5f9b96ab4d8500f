use crate::deferred::DeferredCore;
use crate::{ContextId, State, Waiter};
use std::fmt;
use std::sync::Arc;

/// Read-only view of a [`Deferred`](crate::Deferred).
///
/// A promise answers what state the deferred is in and accepts callbacks. It
/// cannot resolve, reject or notify. Clones observe the same deferred.
///
/// Callbacks registered before the deferred finishes are queued and run in
/// registration order. Callbacks registered afterwards run right away on the
/// registering thread, or are posted to the dispatch context of a promise
/// made by [`dispatch_on`](crate::dispatch_on).
pub struct Promise<D, F, P> {
    core: Arc<DeferredCore<D, F, P>>,
}

impl<D, F, P> Promise<D, F, P> {
    pub(crate) fn from_core(core: Arc<DeferredCore<D, F, P>>) -> Self {
        Self { core }
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

    /// The execution context this promise's callbacks are marshaled onto, or
    /// `None` when they run on whichever thread finishes the deferred.
    pub fn dispatch_context(&self) -> Option<ContextId> {
        self.core.dispatch()
    }

    /// Whether both promises view the same deferred.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.core, &other.core)
    }
}

impl<D, F, P> Promise<D, F, P>
where
    D: Send + 'static,
    F: Send + 'static,
    P: Send + 'static,
{
    pub fn done(&self, callback: impl FnOnce(&D) + Send + 'static) -> &Self {
        self.core.on_done(Box::new(callback));
        self
    }

    pub fn fail(&self, callback: impl FnOnce(&F) + Send + 'static) -> &Self {
        self.core.on_fail(Box::new(callback));
        self
    }

    /// Registers a progress callback. It may run many times, and is dropped
    /// without being called if the deferred already finished.
    pub fn progress(&self, callback: impl FnMut(&P) + Send + 'static) -> &Self {
        self.core.on_progress(Box::new(callback));
        self
    }

    /// Registers a callback that runs once the deferred finishes either way,
    /// after the done or fail callbacks.
    pub fn always(&self, callback: impl FnOnce(&Result<D, F>) + Send + 'static) -> &Self {
        self.core.on_always(Box::new(callback));
        self
    }

    /// Registers a done and a fail callback in one call.
    pub fn then(
        &self,
        done: impl FnOnce(&D) + Send + 'static,
        fail: impl FnOnce(&F) + Send + 'static,
    ) -> &Self {
        self.done(done).fail(fail)
    }

    /// A future that completes with a copy of the outcome.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_deferred::Deferred;
    /// use futures::executor::block_on;
    /// use std::thread;
    ///
    /// let deferred = Deferred::<String, String, ()>::new();
    /// let waiter = deferred.promise().wait();
    /// let task1 = thread::spawn(move || block_on(waiter));
    /// deferred.resolve("🍓".into()).unwrap();
    /// assert_eq!(task1.join().expect("The task1 thread has panicked."), Ok(Ok("🍓".to_owned())));
    /// ```
    pub fn wait(&self) -> Waiter<D, F>
    where
        D: Clone,
        F: Clone,
    {
        Waiter::new(self)
    }
}

impl<D, F, P> Clone for Promise<D, F, P> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<D, F, P> fmt::Debug for Promise<D, F, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .field("dispatch", &self.dispatch_context())
            .finish()
    }
}

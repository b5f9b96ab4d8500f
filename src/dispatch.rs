//! Marshal promise callbacks onto a designated execution context.
//!
//! [`dispatch_on`] listens to a promise and replays each of its events on a
//! fresh deferred, but only from inside a job enqueued on the target context.
//! Callbacks registered on the returned promise therefore run on that context
//! instead of on whichever thread finished the original.
use crate::{Deferred, Error, Executor, Job, Promise};
use std::sync::Arc;
use tracing::{debug, trace};

/// Wraps `promise` so its callbacks run on `context`.
///
/// Callbacks registered on the returned promise after it finished are posted
/// to `context` as well. A promise that already dispatches onto `context` is returned unchanged.
/// Events are forwarded in the order they happened: forwarding jobs are
/// enqueued while the source deferred's lock is held, and callback contexts
/// run jobs in FIFO order.
///
/// If `context` refuses a forwarding job the event is lost; when that was the
/// final event the wrapped deferred is abandoned.
///
/// # Examples
///
/// ```
/// use promise_deferred::{dispatch_on, Deferred, Executor, LocalQueue, Promise};
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use std::thread;
///
/// let queue = Arc::new(LocalQueue::new());
/// let context: Arc<dyn Executor> = queue.clone();
///
/// let deferred = Deferred::<u32, (), ()>::new();
/// let adapted = dispatch_on(deferred.promise(), &context);
/// assert!(Promise::ptr_eq(&adapted, &dispatch_on(adapted.clone(), &context)));
///
/// let fired = Arc::new(AtomicBool::new(false));
/// let f = fired.clone();
/// adapted.done(move |v| { assert_eq!(*v, 5); f.store(true, Ordering::SeqCst); });
///
/// thread::spawn(move || deferred.resolve(5)).join().unwrap().unwrap();
/// assert!(!fired.load(Ordering::SeqCst));
/// queue.run_pending();
/// assert!(fired.load(Ordering::SeqCst));
/// ```
pub fn dispatch_on<D, F, P>(promise: Promise<D, F, P>, context: &Arc<dyn Executor>) -> Promise<D, F, P>
where
    D: Clone + Send + 'static,
    F: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    let id = context.id();
    if promise.dispatch_context() == Some(id) {
        return promise;
    }
    trace!(context = %id, "adapting promise");

    let deferred = Deferred::dispatched_on(context.clone());
    let adapted = deferred.promise();

    let target = deferred.clone();
    let progress_context = context.clone();
    promise.progress(move |progress| {
        let target = target.clone();
        let progress = progress.clone();
        forward(&progress_context, "progress", move || target.notify(progress));
    });

    let context = context.clone();
    promise.always(move |result| {
        let result = result.clone();
        forward(&context, "result", move || match result {
            Ok(value) => deferred.resolve(value),
            Err(reject) => deferred.reject(reject),
        });
    });

    adapted
}

fn forward(
    context: &Arc<dyn Executor>,
    event: &'static str,
    apply: impl FnOnce() -> Result<(), Error> + Send + 'static,
) {
    let job: Job = Box::new(move || {
        if let Err(err) = apply() {
            debug!(event, %err, "forwarded event not applied");
        }
    });
    if let Err(err) = context.execute(job) {
        debug!(context = %context.id(), event, %err, "forwarded event dropped");
    }
}

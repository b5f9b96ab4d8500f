//! A future over a promise.
//!
//! The waiter registers an always callback when it is created; the callback
//! stores a copy of the outcome and wakes the task. If every producer handle
//! of the deferred is dropped before it finishes, the callback is dropped
//! unfired and the waiter completes with [`Error::Abandoned`].
use crate::{Error, Promise};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

struct Slot<D, F> {
    value: Option<Result<Result<D, F>, Error>>,
    waker: Option<Waker>,
}

/// Completes the slot exactly once: with the outcome, or with
/// [`Error::Abandoned`] when dropped unused.
struct Completion<D, F> {
    slot: Option<Arc<Mutex<Slot<D, F>>>>,
}

impl<D, F> Completion<D, F> {
    fn complete(mut self, value: Result<Result<D, F>, Error>) {
        if let Some(slot) = self.slot.take() {
            fill(&slot, value);
        }
    }
}

impl<D, F> Drop for Completion<D, F> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            fill(&slot, Err(Error::Abandoned));
        }
    }
}

fn fill<D, F>(slot: &Mutex<Slot<D, F>>, value: Result<Result<D, F>, Error>) {
    let waker = {
        let mut slot = slot.lock();
        slot.value = Some(value);
        slot.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake()
    }
}

/// Future returned by [`Promise::wait`].
///
/// Resolves to `Ok(Ok(value))`, `Ok(Err(reject))`, or `Err(Error::Abandoned)`
/// if the deferred was dropped while still pending.
///
/// # Examples
///
/// ```
/// use promise_deferred::{Deferred, Error};
/// use futures::executor::block_on;
///
/// let deferred = Deferred::<(), String, ()>::new();
/// let waiter = deferred.promise().wait();
/// drop(deferred);
/// assert_eq!(block_on(waiter), Err(Error::Abandoned));
/// ```
pub struct Waiter<D, F> {
    slot: Arc<Mutex<Slot<D, F>>>,
}

impl<D, F> Waiter<D, F>
where
    D: Clone + Send + 'static,
    F: Clone + Send + 'static,
{
    pub(crate) fn new<P: Send + 'static>(promise: &Promise<D, F, P>) -> Self {
        let slot = Arc::new(Mutex::new(Slot {
            value: None,
            waker: None,
        }));
        let completion = Completion {
            slot: Some(slot.clone()),
        };
        promise.always(move |result| completion.complete(Ok(result.clone())));
        Self { slot }
    }
}

impl<D, F> Future for Waiter<D, F> {
    type Output = Result<Result<D, F>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.lock();
        match slot.value.take() {
            Some(value) => Poll::Ready(value),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<D, F> fmt::Debug for Waiter<D, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("ready", &self.slot.lock().value.is_some())
            .finish()
    }
}

//! Joining many promises into one.
//!
//! [`join`] creates a master deferred that resolves once every input resolved,
//! rejects on the first input that fails, and reports each input's progress
//! together with how many inputs are done.
//!
//! When several inputs fail concurrently, whichever reaches the master
//! deferred first decides [`OneReject::index`]. That choice is
//! nondeterministic.
use crate::{Deferred, Error, Promise};
use parking_lot::Mutex;
use std::fmt;
use std::slice;
use std::sync::Arc;
use std::vec;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneResult<D> {
    pub index: usize,
    pub value: D,
}

/// Values of all joined promises, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterResult<D> {
    results: Vec<OneResult<D>>,
}

impl<D> MasterResult<D> {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// The value of the input at `index`.
    pub fn get(&self, index: usize) -> Option<&D> {
        self.results.get(index).map(|one| &one.value)
    }

    pub fn iter(&self) -> slice::Iter<'_, OneResult<D>> {
        self.results.iter()
    }

    pub fn into_values(self) -> Vec<D> {
        self.results.into_iter().map(|one| one.value).collect()
    }
}

impl<D> IntoIterator for MasterResult<D> {
    type Item = OneResult<D>;
    type IntoIter = vec::IntoIter<OneResult<D>>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

impl<'a, D> IntoIterator for &'a MasterResult<D> {
    type Item = &'a OneResult<D>;
    type IntoIter = slice::Iter<'a, OneResult<D>>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.iter()
    }
}

/// The first input that was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneReject<F> {
    pub index: usize,
    pub reject: F,
}

impl<F: fmt::Display> fmt::Display for OneReject<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise {} was rejected: {}", self.index, self.reject)
    }
}

/// Progress reported by one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterProgress<P> {
    /// The input that reported progress.
    pub index: usize,
    pub progress: P,
    /// Inputs resolved when the progress was reported.
    pub done: usize,
    pub total: usize,
}

struct JoinState<D> {
    values: Vec<Option<D>>,
    done: usize,
}

impl<D> JoinState<D> {
    /// Records one value; returns every value once all inputs are in.
    fn record(&mut self, index: usize, value: D) -> Option<Vec<OneResult<D>>> {
        if self.values[index].replace(value).is_none() {
            self.done += 1;
        }
        if self.done < self.values.len() {
            return None;
        }
        Some(
            self.values
                .iter_mut()
                .enumerate()
                .filter_map(|(index, value)| value.take().map(|value| OneResult { index, value }))
                .collect(),
        )
    }
}

fn ignore_late(result: Result<(), Error>) {
    if let Err(err) = result {
        trace!(%err, "join already finished");
    }
}

/// Joins `promises` into one promise.
///
/// Fails with [`Error::Argument`] when there is nothing to join. Input
/// promises are not affected by how the master promise finishes.
///
/// # Examples
///
/// ```
/// use promise_deferred::{join, Deferred};
///
/// let a = Deferred::<u32, String, ()>::new();
/// let b = Deferred::<u32, String, ()>::new();
/// let master = join([a.promise(), b.promise()]).unwrap();
///
/// b.resolve(2).unwrap();
/// a.resolve(1).unwrap();
/// master.done(|all| assert_eq!(all.clone().into_values(), [1, 2]));
/// assert!(master.is_resolved());
/// ```
#[allow(clippy::type_complexity)]
pub fn join<D, F, P, I>(
    promises: I,
) -> Result<Promise<MasterResult<D>, OneReject<F>, MasterProgress<P>>, Error>
where
    I: IntoIterator<Item = Promise<D, F, P>>,
    D: Clone + Send + 'static,
    F: Clone + Send + 'static,
    P: Clone + Send + 'static,
{
    let promises: Vec<_> = promises.into_iter().collect();
    if promises.is_empty() {
        return Err(Error::Argument("nothing to join"));
    }
    let total = promises.len();
    trace!(total, "joining promises");

    let master = Deferred::new();
    let promise = master.promise();
    let state = Arc::new(Mutex::new(JoinState {
        values: (0..total).map(|_| None).collect(),
        done: 0,
    }));

    for (index, input) in promises.iter().enumerate() {
        let deferred = master.clone();
        let join_state = state.clone();
        input.done(move |value| {
            let finished = join_state.lock().record(index, value.clone());
            if let Some(results) = finished {
                if deferred.is_pending() {
                    ignore_late(deferred.resolve(MasterResult { results }));
                }
            }
        });

        let deferred = master.clone();
        input.fail(move |reject| {
            if deferred.is_pending() {
                ignore_late(deferred.reject(OneReject {
                    index,
                    reject: reject.clone(),
                }));
            }
        });

        let deferred = master.clone();
        let join_state = state.clone();
        input.progress(move |progress| {
            if deferred.is_pending() {
                let done = join_state.lock().done;
                ignore_late(deferred.notify(MasterProgress {
                    index,
                    progress: progress.clone(),
                    done,
                    total,
                }));
            }
        });
    }

    Ok(promise)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::State;
    use futures::executor::block_on;
    use std::thread;

    #[test]
    fn test_join_nothing() {
        let empty: Vec<Promise<(), (), ()>> = Vec::new();
        assert_eq!(
            join(empty).unwrap_err(),
            Error::Argument("nothing to join")
        );
    }

    #[test]
    fn test_join_orders_by_input() {
        let deferreds: Vec<Deferred<&'static str, (), ()>> = (0..3).map(|_| Deferred::new()).collect();
        let master = join(deferreds.iter().map(Deferred::promise)).unwrap();
        deferreds[2].resolve("c").unwrap();
        deferreds[0].resolve("a").unwrap();
        assert!(master.is_pending());
        deferreds[1].resolve("b").unwrap();

        let result = block_on(master.wait()).unwrap().unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(
            result.iter().map(|one| (one.index, one.value)).collect::<Vec<_>>(),
            [(0, "a"), (1, "b"), (2, "c")]
        );
        assert_eq!(result.get(1), Some(&"b"));
    }

    #[test]
    fn test_first_failure_wins() {
        let a = Deferred::<u32, String, ()>::new();
        let b = Deferred::<u32, String, ()>::new();
        let c = Deferred::<u32, String, ()>::new();
        let master = join([a.promise(), b.promise(), c.promise()]).unwrap();

        a.reject("first".into()).unwrap();
        c.reject("second".into()).unwrap();
        b.resolve(1).unwrap();

        assert_eq!(
            block_on(master.wait()),
            Ok(Err(OneReject {
                index: 0,
                reject: "first".to_owned()
            }))
        );
        assert_eq!(b.state(), State::Resolved);
        assert_eq!(c.state(), State::Rejected);
    }

    #[test]
    fn test_progress_carries_done_count() {
        let a = Deferred::<(), (), &'static str>::new();
        let b = Deferred::<(), (), &'static str>::new();
        let master = join([a.promise(), b.promise()]).unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        master.progress(move |p| e.lock().push(p.clone()));

        a.notify("50%").unwrap();
        a.resolve(()).unwrap();
        assert!(master.is_pending());
        b.resolve(()).unwrap();

        assert_eq!(
            *events.lock(),
            [MasterProgress {
                index: 0,
                progress: "50%",
                done: 0,
                total: 2
            }]
        );
        assert!(master.is_resolved());
    }

    #[test]
    fn test_progress_continues_after_failure_only_while_pending() {
        let a = Deferred::<(), (), u8>::new();
        let b = Deferred::<(), (), u8>::new();
        let master = join([a.promise(), b.promise()]).unwrap();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        master.progress(move |_| *c.lock() += 1);

        b.resolve(()).unwrap();
        a.notify(1).unwrap();
        a.reject(()).unwrap();
        assert!(master.is_rejected());
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_join_already_finished_inputs() {
        let a = Deferred::<u8, (), ()>::new();
        a.resolve(1).unwrap();
        let master = join([a.promise()]).unwrap();
        assert!(master.is_resolved());
    }

    #[test]
    fn test_join_concurrent_resolution() {
        let deferreds: Vec<Deferred<usize, (), ()>> = (0..32).map(|_| Deferred::new()).collect();
        let master = join(deferreds.iter().map(Deferred::promise)).unwrap();
        let waiter = master.wait();
        let handles: Vec<_> = deferreds
            .into_iter()
            .enumerate()
            .map(|(i, d)| thread::spawn(move || d.resolve(i * 10).unwrap()))
            .collect();
        for handle in handles {
            handle.join().expect("The resolver thread has panicked");
        }
        let values = block_on(waiter).unwrap().unwrap().into_values();
        assert_eq!(values, (0..32).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[test]
    fn test_one_reject_display() {
        let reject = OneReject {
            index: 3,
            reject: "timeout",
        };
        assert_eq!(reject.to_string(), "promise 3 was rejected: timeout");
    }
}

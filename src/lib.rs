//! Deferred objects and promises driven by callbacks.
//!
//! A [`Deferred`] is a single-assignment slot that is resolved, rejected or
//! notified of progress by whoever produces the value. Consumers get a
//! [`Promise`], a read-only view on which they register `done`, `fail`,
//! `progress` and `always` callbacks.
//!
//! [`DeferredManager`] runs units of work on a worker context and hands back
//! promises bound to their outcome, optionally marshaling every callback onto
//! one designated context (see [`dispatch`]). [`join`] folds many promises into
//! one.
//!
//! # Examples
//!
//! ```
//! use promise_deferred::{Deferred, State};
//! use std::sync::{Arc, Mutex};
//!
//! let deferred = Deferred::<u32, String, u8>::new();
//! let seen = Arc::new(Mutex::new(Vec::new()));
//!
//! let log = seen.clone();
//! deferred
//!     .promise()
//!     .progress(move |p| log.lock().unwrap().push(format!("progress {p}")));
//! let log = seen.clone();
//! deferred
//!     .promise()
//!     .done(move |v| log.lock().unwrap().push(format!("done {v}")));
//!
//! deferred.notify(50).unwrap();
//! deferred.resolve(7).unwrap();
//! assert!(deferred.resolve(8).is_err());
//!
//! assert_eq!(deferred.state(), State::Resolved);
//! assert_eq!(*seen.lock().unwrap(), ["progress 50", "done 7"]);
//! ```

pub mod context;
pub mod deferred;
pub mod dispatch;
pub mod manager;
pub mod master;
pub mod promise;
pub mod task;
pub mod waiter;

pub use context::{ContextId, Executor, Inline, Job, LocalQueue, SerialContext, ThreadPool};
pub use deferred::{Deferred, State};
pub use dispatch::dispatch_on;
pub use manager::{DeferredManager, DeferredManagerBuilder, ManagerConfig};
pub use master::{join, MasterProgress, MasterResult, OneReject, OneResult};
pub use promise::Promise;
pub use task::{
    Call, DeferredTask, FutureTask, Progress, StartPolicy, Task, TaskDeferred, TaskError,
    TaskPromise, WorkUnit,
};
pub use waiter::Waiter;

use std::fmt;

/// Operation that was attempted on a deferred object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Resolve,
    Reject,
    Notify,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Resolve => "resolve",
            Operation::Reject => "reject",
            Operation::Notify => "notify",
        })
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A deferred object that already finished cannot be resolved, rejected
    /// or notified again.
    #[error("cannot {operation} a deferred object that is already {state}")]
    StateViolation { operation: Operation, state: State },
    #[error("invalid argument: {0}")]
    Argument(&'static str),
    /// Every producer of a deferred was dropped before it finished.
    #[error("deferred object was dropped before it finished")]
    Abandoned,
    #[error("task has already been started")]
    AlreadyStarted,
    #[error("execution context is closed")]
    ContextClosed,
    #[error("failed to spawn execution context thread: {0}")]
    Spawn(String),
}

//! Single assignment result cell shared between the thread that produces a reply
//! and the threads that wait for it.

use crate::{lock, Error, Result};
use std::{
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

struct Slot<T> {
    outcome: Option<Result<T>>,
    callbacks: Vec<Callback<T>>,
}

/// Outcome of an asynchronous operation. The first outcome set wins; later ones
/// are ignored.
pub struct Promise<T> {
    shared: Arc<(Mutex<Slot<T>>, Condvar)>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Promise::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Unresolved promise.
    pub fn new() -> Self {
        Promise {
            shared: Arc::new((
                Mutex::new(Slot {
                    outcome: None,
                    callbacks: vec![],
                }),
                Condvar::new(),
            )),
        }
    }

    /// Promise already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        let promise = Promise::new();
        promise.set_result(value);
        promise
    }

    /// Promise already failed with `error`.
    pub fn failed(error: Error) -> Self {
        let promise = Promise::new();
        promise.set_exception(error);
        promise
    }

    /// Resolves with a value. Returns false if an outcome was already set.
    pub fn set_result(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    /// Resolves with an error. Returns false if an outcome was already set.
    pub fn set_exception(&self, error: Error) -> bool {
        self.complete(Err(error))
    }

    /// Sets either outcome.
    pub fn complete(&self, outcome: Result<T>) -> bool {
        let (slot, cvar) = &*self.shared;
        let callbacks = {
            let mut slot = lock(slot);
            if slot.outcome.is_some() {
                return false;
            }
            slot.outcome = Some(outcome.clone());
            std::mem::take(&mut slot.callbacks)
        };
        cvar.notify_all();
        for callback in callbacks {
            callback(&outcome);
        }
        true
    }

    /// Whether an outcome was set.
    pub fn is_done(&self) -> bool {
        lock(&self.shared.0).outcome.is_some()
    }

    /// Blocks until resolved.
    pub fn result(&self) -> Result<T> {
        let (slot, cvar) = &*self.shared;
        let mut slot = lock(slot);
        loop {
            if let Some(outcome) = &slot.outcome {
                return outcome.clone();
            }
            slot = cvar.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until resolved or `timeout` elapsed; `None` on timeout.
    pub fn result_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let (slot, cvar) = &*self.shared;
        let mut slot = lock(slot);
        loop {
            if let Some(outcome) = &slot.outcome {
                return Some(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = cvar
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Runs `callback` with the outcome on the resolving thread, or right away if
    /// already resolved.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let outcome = {
            let mut slot = lock(&self.shared.0);
            match &slot.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    slot.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }

    /// Promise resolving to `f` applied to this promise's value.
    pub fn map<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let mapped = Promise::new();
        let target = mapped.clone();
        self.add_done_callback(move |outcome| {
            target.complete(outcome.clone().and_then(f));
        });
        mapped
    }
}

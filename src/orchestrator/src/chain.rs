//! Continuations that let a file's work span several worker calls without blocking
//! the consumer thread.

use crate::{lock, session::Event};
use crossbeam::channel;
use std::{
    path::Path,
    sync::{Arc, Mutex},
};
use worker_proc::{Handle, Promise};
use wire::Value;

/// Work sent to a host for one file. Runs on the host's queue thread; it should
/// issue its calls and return without waiting for them.
pub type Task = Box<dyn FnOnce(&Handle) -> worker_proc::Result<Calls> + Send>;

/// Second-stage check run on the host a file is already assigned to.
pub type CheckFn = Box<dyn FnOnce(&Path, &Handle) -> Check + Send>;

/// Continuation receiving the results of a task's calls.
pub type ResultFn = Box<dyn FnOnce(Vec<Value>) -> InferenceChain + Send>;

/// What to do with a file.
pub enum Check {
    /// Nothing to do.
    Skip,
    /// Send a task to the host.
    Run(Task),
    /// Continue with a chain step without calling the worker.
    Chain(InferenceChain),
}

/// Next step of a file's work.
pub enum InferenceChain {
    /// Done; these are the file's results.
    Result(Vec<Value>),
    /// Check the file again on the same host.
    Queue(CheckFn),
    /// Continue with the callback's chain. Given no values when used directly.
    ResultCallback(ResultFn),
    /// Run the callback on the given values.
    ForwardResult(ResultFn, Vec<Value>),
}

impl InferenceChain {
    /// [`InferenceChain::Queue`] from a closure.
    pub fn queue<F>(check: F) -> Self
    where
        F: FnOnce(&Path, &Handle) -> Check + Send + 'static,
    {
        InferenceChain::Queue(Box::new(check))
    }
}

impl Check {
    /// [`Check::Run`] from a closure.
    pub fn run<F>(task: F) -> Self
    where
        F: FnOnce(&Handle) -> worker_proc::Result<Calls> + Send + 'static,
    {
        Check::Run(Box::new(task))
    }
}

/// Promises issued by a task, and optionally what to do with their values.
pub struct Calls {
    promises: Vec<Promise<Value>>,
    next: Option<ResultFn>,
}

impl Calls {
    /// The file is done once all of `promises` resolved; their values, in order,
    /// are its results.
    pub fn wait(promises: Vec<Promise<Value>>) -> Self {
        Calls {
            promises,
            next: None,
        }
    }

    /// Instead of finishing, hand the values to `callback` and continue with the
    /// chain it returns.
    pub fn then<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Vec<Value>) -> InferenceChain + Send + 'static,
    {
        self.next = Some(Box::new(callback));
        self
    }

    /// Reports the outcome of `job` on `events` once every promise resolved, or as
    /// soon as one fails.
    pub(crate) fn gather(self, job: u64, events: channel::Sender<Event>) {
        let Calls { promises, next } = self;
        if promises.is_empty() {
            let _ = events.send(Event::outcome(job, next, vec![]));
            return;
        }
        let gather = Arc::new(Mutex::new(Gather {
            values: vec![None; promises.len()],
            remaining: promises.len(),
            next,
            events: Some(events),
        }));
        for (index, promise) in promises.iter().enumerate() {
            let gather = Arc::clone(&gather);
            promise.add_done_callback(move |outcome| lock(&gather).resolve(job, index, outcome));
        }
    }
}

struct Gather {
    values: Vec<Option<Value>>,
    remaining: usize,
    next: Option<ResultFn>,
    // Taken once the outcome was reported.
    events: Option<channel::Sender<Event>>,
}

impl Gather {
    fn resolve(&mut self, job: u64, index: usize, outcome: &worker_proc::Result<Value>) {
        if self.events.is_none() {
            return;
        }
        let value = match outcome {
            Ok(value) => value.clone(),
            Err(error) => {
                if let Some(events) = self.events.take() {
                    let _ = events.send(Event::Failed {
                        job,
                        error: error.clone().into(),
                    });
                }
                return;
            }
        };
        self.values[index] = Some(value);
        self.remaining -= 1;
        if self.remaining > 0 {
            return;
        }
        let values = self.values.drain(..).flatten().collect();
        if let Some(events) = self.events.take() {
            let _ = events.send(Event::outcome(job, self.next.take(), values));
        }
    }
}

//! Session: exclusive use of a set of hosts for one batch of files.
//!
//! Worker threads never touch scheduling state. They report on one channel and the
//! consumer thread, inside [`QueueFiles::next`], updates host load, dispatches waiting
//! tasks and runs chain continuations.

use crate::{
    chain::ResultFn, lock, pool::PoolInner, Check, Error, InferenceChain, ProcState, Result,
    Task,
};
use crossbeam::channel::{self, RecvTimeoutError};
use std::{
    collections::{BTreeMap, VecDeque},
    panic::{self, AssertUnwindSafe},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    time::Duration,
};
use wire::Value;
use worker_proc::Handle;

pub(crate) enum Event {
    Dispatched {
        proc: usize,
    },
    Completed {
        job: u64,
        results: Vec<Value>,
    },
    Forward {
        job: u64,
        callback: ResultFn,
        values: Vec<Value>,
    },
    Failed {
        job: u64,
        error: Error,
    },
}

impl Event {
    pub(crate) fn outcome(job: u64, next: Option<ResultFn>, values: Vec<Value>) -> Self {
        match next {
            Some(callback) => Event::Forward {
                job,
                callback,
                values,
            },
            None => Event::Completed {
                job,
                results: values,
            },
        }
    }
}

#[derive(Debug, Clone)]
enum Readiness {
    Pending,
    Ready,
    Failed(worker_proc::Error),
}

/// Cloneable switch that aborts a session from another thread.
///
/// The abort is cooperative: it is noticed the next time the consumer polls for
/// results, and files already running on a worker are not interrupted there.
#[derive(Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Requests the abort.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether an abort was requested.
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Hosts reserved for one caller. Released when dropped.
pub struct Session {
    pool: Arc<PoolInner>,
    procs: Vec<ProcState>,
    readiness: Arc<(Mutex<Vec<Readiness>>, Condvar)>,
    events: channel::Sender<Event>,
    event_rx: channel::Receiver<Event>,
    abort: AbortHandle,
    poll_interval: Duration,
    next_job: u64,
}

impl Session {
    pub(crate) fn new(pool: Arc<PoolInner>, procs: Vec<ProcState>, poll_interval: Duration) -> Self {
        let (events, event_rx) = channel::unbounded();
        let readiness = Arc::new((
            Mutex::new(vec![Readiness::Ready; procs.len()]),
            Condvar::new(),
        ));
        // A host whose worker dies takes no further files in this session.
        for (index, proc) in procs.iter().enumerate() {
            let readiness = Arc::downgrade(&readiness);
            pool.watch(
                proc.handle.host(),
                Arc::new(move || {
                    if let Some(readiness) = readiness.upgrade() {
                        let (states, cvar) = &*readiness;
                        lock(states)[index] = Readiness::Failed(worker_proc::Error::Terminated);
                        cvar.notify_all();
                    }
                }),
            );
        }
        Session {
            pool,
            procs,
            readiness,
            events,
            event_rx,
            abort: AbortHandle::default(),
            poll_interval,
            next_job: 0,
        }
    }

    /// Names of the reserved hosts, highest priority first.
    pub fn hosts(&self) -> Vec<&str> {
        self.procs.iter().map(|p| p.handle.host()).collect()
    }

    /// Scheduling state of the reserved hosts, highest priority first.
    pub fn procs(&self) -> &[ProcState] {
        &self.procs
    }

    /// Starts every host's process and runs `prepare_fn` on it, typically a setup.
    ///
    /// Runs on each host's queue thread, so this returns immediately; the host takes
    /// work once its preparation succeeded. `ready_callback` is called per host with
    /// the preparation error, if any.
    pub fn prepare<P, C>(&self, prepare_fn: P, ready_callback: C)
    where
        P: Fn(&Handle) -> worker_proc::Result<()> + Send + Sync + 'static,
        C: Fn(&str, Option<&worker_proc::Error>) + Send + Sync + 'static,
    {
        let prepare_fn = Arc::new(prepare_fn);
        let ready_callback = Arc::new(ready_callback);
        {
            let mut readiness = lock(&self.readiness.0);
            for state in readiness.iter_mut() {
                *state = Readiness::Pending;
            }
        }
        for (index, proc) in self.procs.iter().enumerate() {
            let prepare_fn = Arc::clone(&prepare_fn);
            let ready_callback = Arc::clone(&ready_callback);
            let readiness = Arc::clone(&self.readiness);
            proc.handle.execute(move |handle| {
                let outcome = handle.start().and_then(|_| prepare_fn(handle));
                match &outcome {
                    Ok(()) => log::info!("{}: ready", handle.host()),
                    Err(e) => log::warn!("{}: preparation failed: {}", handle.host(), e),
                }
                {
                    let (states, cvar) = &*readiness;
                    lock(states)[index] = match &outcome {
                        Ok(()) => Readiness::Ready,
                        Err(e) => Readiness::Failed(e.clone()),
                    };
                    cvar.notify_all();
                }
                ready_callback(handle.host(), outcome.as_ref().err());
            });
        }
    }

    /// Blocks until a host is ready and returns the best one.
    ///
    /// Fails only when every host failed its preparation, with the first failure, or
    /// with [`Error::Timeout`] if the session is aborted meanwhile.
    pub fn get_free_proc(&self) -> Result<&Handle> {
        let index = self.wait_ready()?;
        Ok(&self.procs[index].handle)
    }

    fn wait_ready(&self) -> Result<usize> {
        let (states, cvar) = &*self.readiness;
        let mut states = lock(states);
        loop {
            if let Some(index) = states.iter().position(|s| matches!(s, Readiness::Ready)) {
                return Ok(index);
            }
            if states.iter().all(|s| matches!(s, Readiness::Failed(_))) {
                let first = states.iter().find_map(|s| match s {
                    Readiness::Failed(e) => Some(Error::Worker(e.clone())),
                    _ => None,
                });
                return Err(first.unwrap_or(Error::NoFreeHosts));
            }
            if self.abort.is_aborted() {
                return Err(Error::Timeout);
            }
            states = cvar
                .wait_timeout(states, self.poll_interval)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn is_ready(&self, index: usize) -> bool {
        matches!(lock(&self.readiness.0).get(index), Some(Readiness::Ready))
    }

    /// Aborts the session.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// A handle to abort the session from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Whether the session was aborted.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Schedules `files` over the ready hosts and iterates over their results in
    /// completion order.
    ///
    /// `check_fn` decides per file, on the host chosen for it, what to run. Skipped
    /// files are only reported if `all` is set. Waits for a ready host first.
    pub fn queue_files<I, F>(
        &mut self,
        files: I,
        check_fn: F,
        all: bool,
    ) -> Result<QueueFiles<'_, I::IntoIter, F>>
    where
        I: IntoIterator,
        I::Item: Into<PathBuf>,
        F: FnMut(&Path, &Handle) -> Check,
    {
        self.wait_ready()?;
        Ok(QueueFiles {
            session: self,
            files: files.into_iter(),
            check_fn,
            all,
            in_flight: BTreeMap::new(),
            ready: VecDeque::new(),
            exhausted: false,
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for proc in &mut self.procs {
            if let Some(uploader) = proc.uploader.take() {
                for file in proc.queued_files.values() {
                    uploader.image_done(file);
                }
            }
            proc.queued_files.clear();
            proc.waiting.clear();
        }
        self.pool.release(self.procs.iter().map(|p| p.handle.host()));
    }
}

/// Outcome for one file.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedResult {
    /// The file.
    pub file: PathBuf,
    /// Its results; empty for skipped or failed files.
    pub results: Vec<Value>,
    /// Why it failed.
    pub error: Option<Error>,
}

impl QueuedResult {
    fn new(file: PathBuf, outcome: Result<Vec<Value>>) -> Self {
        match outcome {
            Ok(results) => QueuedResult {
                file,
                results,
                error: None,
            },
            Err(error) => QueuedResult {
                file,
                results: vec![],
                error: Some(error),
            },
        }
    }
}

struct InFlight {
    file: PathBuf,
    proc: usize,
    uploaded: bool,
}

/// Iterator returned by [`Session::queue_files`]. Dropping it cancels files still in
/// flight.
pub struct QueueFiles<'a, I, F> {
    session: &'a mut Session,
    files: I,
    check_fn: F,
    all: bool,
    // Job ids grow, so the first entry is the oldest.
    in_flight: BTreeMap<u64, InFlight>,
    ready: VecDeque<QueuedResult>,
    exhausted: bool,
}

impl<'a, I, F> QueueFiles<'a, I, F>
where
    I: Iterator,
    I::Item: Into<PathBuf>,
    F: FnMut(&Path, &Handle) -> Check,
{
    /// Files currently between queuing and completion.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn pick_proc(&self) -> Option<usize> {
        self.session
            .procs
            .iter()
            .enumerate()
            .filter(|(index, proc)| proc.has_capacity() && self.session.is_ready(*index))
            .min_by(|(_, a), (_, b)| {
                a.queued_files.len().cmp(&b.queued_files.len()).then(
                    b.priority
                        .partial_cmp(&a.priority)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
            })
            .map(|(index, _)| index)
    }

    fn fill(&mut self) {
        while !self.exhausted && !self.session.is_aborted() {
            let proc = match self.pick_proc() {
                Some(proc) => proc,
                None => return,
            };
            let file: PathBuf = match self.files.next() {
                Some(file) => file.into(),
                None => {
                    self.exhausted = true;
                    return;
                }
            };
            let handle = self.session.procs[proc].handle.clone();
            let check = (self.check_fn)(&file, &handle);
            if let Check::Skip = check {
                if self.all {
                    self.ready.push_back(QueuedResult::new(file, Ok(vec![])));
                }
                continue;
            }
            let job = self.session.next_job;
            self.session.next_job += 1;
            log::debug!("{}: queued {}", handle.host(), file.display());
            self.session.procs[proc].queued_files.insert(job, file.clone());
            self.in_flight.insert(
                job,
                InFlight {
                    file,
                    proc,
                    uploaded: false,
                },
            );
            self.process(job, check);
        }
    }

    fn process(&mut self, job: u64, check: Check) {
        match check {
            Check::Skip => self.finish(job, Ok(vec![])),
            Check::Run(task) => {
                let proc = match self.in_flight.get(&job) {
                    Some(flight) => flight.proc,
                    None => return,
                };
                let state = &mut self.session.procs[proc];
                if state.busy {
                    state.waiting.push_back((job, task));
                } else {
                    self.dispatch(job, task);
                }
            }
            Check::Chain(chain) => self.run_chain(job, chain),
        }
    }

    fn run_chain(&mut self, job: u64, chain: InferenceChain) {
        match chain {
            InferenceChain::Result(values) => self.finish(job, Ok(values)),
            InferenceChain::Queue(check_fn) => {
                let (file, handle) = match self.in_flight.get(&job) {
                    Some(flight) => (
                        flight.file.clone(),
                        self.session.procs[flight.proc].handle.clone(),
                    ),
                    None => return,
                };
                let check = check_fn(&file, &handle);
                self.process(job, check);
            }
            InferenceChain::ResultCallback(callback) => self.run_chain(job, callback(vec![])),
            InferenceChain::ForwardResult(callback, values) => {
                self.run_chain(job, callback(values))
            }
        }
    }

    // False if the file failed before reaching the host, leaving it idle.
    fn dispatch(&mut self, job: u64, task: Task) -> bool {
        let flight = match self.in_flight.get_mut(&job) {
            Some(flight) => flight,
            None => return false,
        };
        let proc = flight.proc;
        let state = &mut self.session.procs[proc];
        let upload = match &state.uploader {
            Some(uploader) if !flight.uploaded => {
                let events = self.session.events.clone();
                Some(uploader.queue_file(&flight.file, move |error| {
                    let _ = events.send(Event::Failed { job, error });
                }))
            }
            _ => None,
        };
        match upload {
            Some(Err(e)) => {
                log::warn!("{}: {}", state.handle.host(), e);
                self.finish(job, Err(e));
                return false;
            }
            Some(Ok(())) => flight.uploaded = true,
            None => {}
        }
        state.busy = true;
        let events = self.session.events.clone();
        state.handle.execute(move |handle| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(handle)))
                .unwrap_or_else(|_| {
                    log::error!("{}: task panicked", handle.host());
                    Err(worker_proc::Error::Task("task panicked".into()))
                });
            let _ = events.send(Event::Dispatched { proc });
            match outcome {
                Ok(calls) => calls.gather(job, events),
                Err(error) => {
                    let _ = events.send(Event::Failed {
                        job,
                        error: error.into(),
                    });
                }
            }
        });
        true
    }

    fn finish(&mut self, job: u64, outcome: Result<Vec<Value>>) {
        let flight = match self.in_flight.remove(&job) {
            Some(flight) => flight,
            None => return,
        };
        let state = &mut self.session.procs[flight.proc];
        state.queued_files.remove(&job);
        if flight.uploaded {
            if let Some(uploader) = &state.uploader {
                uploader.image_done(&flight.file);
            }
        }
        if let Err(e) = &outcome {
            log::debug!("{}: {} failed: {}", state.handle.host(), flight.file.display(), e);
        }
        self.ready.push_back(QueuedResult::new(flight.file, outcome));
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Dispatched { proc } => {
                self.session.procs[proc].busy = false;
                while let Some((job, task)) = self.session.procs[proc].waiting.pop_front() {
                    if self.dispatch(job, task) {
                        break;
                    }
                }
            }
            Event::Completed { job, results } => self.finish(job, Ok(results)),
            Event::Failed { job, error } => self.finish(job, Err(error)),
            Event::Forward {
                job,
                callback,
                values,
            } => {
                if self.in_flight.contains_key(&job) {
                    self.run_chain(job, InferenceChain::ForwardResult(callback, values));
                }
            }
        }
    }

    fn expire(&mut self) {
        let jobs: Vec<u64> = self.in_flight.keys().copied().collect();
        log::info!("session aborted, dropping {} file(s) in flight", jobs.len());
        for job in jobs {
            self.finish(job, Err(Error::Timeout));
        }
        for proc in &mut self.session.procs {
            proc.waiting.clear();
        }
    }
}

impl<'a, I, F> Iterator for QueueFiles<'a, I, F>
where
    I: Iterator,
    I::Item: Into<PathBuf>,
    F: FnMut(&Path, &Handle) -> Check,
{
    type Item = QueuedResult;

    fn next(&mut self) -> Option<QueuedResult> {
        loop {
            if let Some(result) = self.ready.pop_front() {
                return Some(result);
            }
            self.fill();
            if !self.ready.is_empty() {
                continue;
            }
            if self.in_flight.is_empty() {
                if self.exhausted || self.session.is_aborted() {
                    return None;
                }
                // No host can take a file yet: wait until one is ready.
                match self.session.wait_ready() {
                    Ok(_) | Err(Error::Timeout) => {}
                    Err(error) => match self.files.next() {
                        Some(file) => self.ready.push_back(QueuedResult::new(file.into(), Err(error))),
                        None => self.exhausted = true,
                    },
                }
                continue;
            }
            match self.session.event_rx.recv_timeout(self.session.poll_interval) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {
                    if self.session.is_aborted() {
                        self.expire();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl<'a, I, F> Drop for QueueFiles<'a, I, F> {
    fn drop(&mut self) {
        for (job, flight) in std::mem::take(&mut self.in_flight) {
            let state = &mut self.session.procs[flight.proc];
            state.queued_files.remove(&job);
            if flight.uploaded {
                if let Some(uploader) = &state.uploader {
                    uploader.image_done(&flight.file);
                }
            }
        }
        for proc in &mut self.session.procs {
            proc.waiting.clear();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Builder, Calls, HostConfig, HostPool};
    use serial_test::serial;
    use std::{collections::HashMap, thread, time::Instant};
    use worker_proc::{Launcher, Promise};

    fn pool(hosts: &[(&str, f32, usize)]) -> HostPool {
        let mut builder = Builder::new().poll_interval(Duration::from_millis(20));
        for &(name, priority, queue_size) in hosts {
            let launcher = Launcher::local("cat", Vec::<String>::new());
            let host = HostConfig::new(name, launcher)
                .priority(priority)
                .queue_size(queue_size);
            builder = builder.host(host);
        }
        builder.build()
    }

    fn later(value: Value, delay: Duration) -> Promise<Value> {
        let promise = Promise::new();
        let target = promise.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            target.set_result(value);
        });
        promise
    }

    fn files(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("{}.png", i))).collect()
    }

    #[test]
    fn test_skipped_files() {
        let pool = pool(&[("a", 1.0, 1)]);
        let mut session = pool.create_session(1).unwrap();
        let all: Vec<_> = session
            .queue_files(files(3), |_, _| Check::Skip, true)
            .unwrap()
            .collect();
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|r| r.results.is_empty() && r.error.is_none()));
        let some = session.queue_files(files(3), |_, _| Check::Skip, false).unwrap();
        assert_eq!(some.count(), 0);
    }

    #[test]
    fn test_backpressure_and_priority() {
        let pool = pool(&[("b", 1.0, 1), ("a", 2.0, 2)]);
        let mut session = pool.create_session(2).unwrap();
        let load = Arc::new(Mutex::new(HashMap::<String, usize>::new()));
        let peak = Arc::new(Mutex::new(HashMap::<String, usize>::new()));
        let owner = Arc::new(Mutex::new(HashMap::<PathBuf, String>::new()));
        let check = {
            let (load, peak, owner) = (load.clone(), peak.clone(), owner.clone());
            move |file: &Path, handle: &Handle| {
                let host = handle.host().to_owned();
                let mut load = load.lock().unwrap();
                let current = load.entry(host.clone()).or_insert(0);
                *current += 1;
                let mut peak = peak.lock().unwrap();
                let max = peak.entry(host.clone()).or_insert(0);
                *max = (*max).max(*current);
                owner.lock().unwrap().insert(file.to_owned(), host);
                Check::run(|_| Ok(Calls::wait(vec![later(Value::from(1), Duration::from_millis(30))])))
            }
        };
        let mut first = None;
        let mut done = 0;
        for result in session.queue_files(files(9), check, false).unwrap() {
            assert_eq!(result.results, vec![Value::from(1)]);
            let host = owner.lock().unwrap()[&result.file].clone();
            first.get_or_insert_with(|| owner.lock().unwrap()[&PathBuf::from("0.png")].clone());
            *load.lock().unwrap().get_mut(&host).unwrap() -= 1;
            done += 1;
        }
        assert_eq!(done, 9);
        assert_eq!(first.as_deref(), Some("a"));
        let peak = peak.lock().unwrap();
        assert_eq!(peak["a"], 2);
        assert_eq!(peak["b"], 1);
        assert!(session.procs().iter().all(|p| p.queued() == 0));
    }

    #[test]
    fn test_idle_hosts_are_taken_by_priority() {
        let pool = pool(&[("low", 1.0, 1), ("high", 2.0, 1)]);
        let mut session = pool.create_session(2).unwrap();
        let check = |_: &Path, _: &Handle| {
            Check::run(|handle| {
                let host = Value::from(handle.host());
                Ok(Calls::wait(vec![later(host, Duration::from_millis(50))]))
            })
        };
        let hosts: HashMap<PathBuf, Vec<Value>> = session
            .queue_files(files(2), check, false)
            .unwrap()
            .map(|r| (r.file, r.results))
            .collect();
        assert_eq!(hosts[Path::new("0.png")], vec![Value::from("high")]);
        assert_eq!(hosts[Path::new("1.png")], vec![Value::from("low")]);
    }

    #[test]
    fn test_panicking_task_fails_only_its_file() {
        let pool = pool(&[("a", 1.0, 1)]);
        let mut session = pool.create_session(1).unwrap();
        let check = |file: &Path, _: &Handle| {
            let explode = file == Path::new("1.png");
            Check::run(move |_| {
                if explode {
                    panic!("bad task");
                }
                Ok(Calls::wait(vec![Promise::resolved(Value::from(1))]))
            })
        };
        let started = Instant::now();
        let results: HashMap<_, _> = session
            .queue_files(files(3), check, false)
            .unwrap()
            .map(|r| (r.file, r.error))
            .collect();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(results.len(), 3);
        assert!(matches!(
            results[Path::new("1.png")],
            Some(Error::Worker(worker_proc::Error::Task(_)))
        ));
        assert_eq!(results[Path::new("0.png")], None);
        assert_eq!(results[Path::new("2.png")], None);
    }

    #[test]
    #[serial]
    fn test_dead_host_takes_no_more_files() {
        let fragile = HostConfig::new("fragile", Launcher::remote("head -c 1 >/dev/null"))
            .priority(2.0)
            .queue_size(1)
            .upload_images(false);
        let good = HostConfig::new("good", Launcher::local("cat", Vec::<String>::new()))
            .queue_size(1);
        let pool = Builder::new()
            .poll_interval(Duration::from_millis(20))
            .host(fragile)
            .host(good)
            .build();
        let mut session = pool.create_session(2).unwrap();
        let check = |_: &Path, _: &Handle| {
            Check::run(|handle| Ok(Calls::wait(vec![handle.echo(Value::from(handle.host()))])))
        };
        let results: HashMap<_, _> = session
            .queue_files(files(4), check, false)
            .unwrap()
            .map(|r| (r.file.clone(), r))
            .collect();
        assert_eq!(
            results[Path::new("0.png")].error,
            Some(Error::Worker(worker_proc::Error::Terminated))
        );
        for file in &files(4)[1..] {
            assert_eq!(results[file].results, vec![Value::from("good")]);
        }
        assert_eq!(session.get_free_proc().unwrap().host(), "good");
    }

    #[test]
    fn test_chain_counts_file_once() {
        let pool = pool(&[("a", 1.0, 1)]);
        let mut session = pool.create_session(1).unwrap();
        let check = |file: &Path, _: &Handle| {
            if file == Path::new("cached.png") {
                return Check::Chain(InferenceChain::Result(vec![Value::from("cached")]));
            }
            if file == Path::new("callback.png") {
                return Check::Chain(InferenceChain::ResultCallback(Box::new(|values: Vec<Value>| {
                    InferenceChain::Result(vec![Value::from(values.len() as u64)])
                })));
            }
            Check::run(|_| {
                let first = later(Value::from(2), Duration::from_millis(10));
                Ok(Calls::wait(vec![first]).then(|values| {
                    let base = values[0].as_u64().unwrap_or(0);
                    InferenceChain::queue(move |_, _| {
                        Check::run(move |_| {
                            let second = later(Value::from(base * 10), Duration::from_millis(10));
                            Ok(Calls::wait(vec![second]))
                        })
                    })
                }))
            })
        };
        let names = vec!["x.png", "cached.png", "callback.png", "y.png"];
        let mut queue = session.queue_files(names, check, false).unwrap();
        let mut results = HashMap::new();
        while let Some(result) = queue.next() {
            assert!(queue.in_flight() <= 1);
            results.insert(result.file, result.results);
        }
        drop(queue);
        assert_eq!(results[Path::new("x.png")], vec![Value::from(20)]);
        assert_eq!(results[Path::new("y.png")], vec![Value::from(20)]);
        assert_eq!(results[Path::new("cached.png")], vec![Value::from("cached")]);
        assert_eq!(results[Path::new("callback.png")], vec![Value::from(0)]);
        assert_eq!(session.procs()[0].queued(), 0);
    }

    #[test]
    fn test_errors_are_per_file() {
        let pool = pool(&[("a", 1.0, 2)]);
        let mut session = pool.create_session(1).unwrap();
        let check = |file: &Path, _: &Handle| {
            let name = file.to_string_lossy().into_owned();
            Check::run(move |_| match name.as_str() {
                "task.png" => Err(worker_proc::Error::Task("bad input".into())),
                "call.png" => Ok(Calls::wait(vec![
                    later(Value::from(1), Duration::from_millis(5)),
                    Promise::failed(worker_proc::Error::Terminated),
                ])),
                _ => Ok(Calls::wait(vec![later(Value::from(1), Duration::from_millis(5))])),
            })
        };
        let results: HashMap<_, _> = session
            .queue_files(vec!["task.png", "call.png", "ok.png"], check, false)
            .unwrap()
            .map(|r| (r.file, r.error))
            .collect();
        assert_eq!(
            results[Path::new("task.png")],
            Some(Error::Worker(worker_proc::Error::Task("bad input".into())))
        );
        assert_eq!(
            results[Path::new("call.png")],
            Some(Error::Worker(worker_proc::Error::Terminated))
        );
        assert_eq!(results[Path::new("ok.png")], None);
    }

    #[test]
    fn test_abort_times_out_files_in_flight() {
        let pool = pool(&[("a", 1.0, 2)]);
        let mut session = pool.create_session(1).unwrap();
        let abort = session.abort_handle();
        let stuck = Promise::new();
        let check = {
            let stuck = stuck.clone();
            move |_: &Path, _: &Handle| {
                let stuck = stuck.clone();
                Check::run(move |_| Ok(Calls::wait(vec![stuck])))
            }
        };
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            abort.abort();
        });
        let started = Instant::now();
        let results: Vec<_> = session.queue_files(files(5), check, false).unwrap().collect();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.error == Some(Error::Timeout)));
        assert!(session.is_aborted());
        // Late completions are ignored.
        stuck.set_result(Value::Nil);
        assert!(session.procs().iter().all(|p| p.queued() == 0));
    }

    #[test]
    #[serial]
    fn test_setup_failure_isolation() {
        let pool = pool(&[("bad", 2.0, 1), ("good", 1.0, 1)]);
        let mut session = pool.create_session(2).unwrap();
        let reported = Arc::new(Mutex::new(vec![]));
        {
            let reported = reported.clone();
            session.prepare(
                |handle| match handle.host() {
                    "bad" => Err(worker_proc::Error::Task("model missing".into())),
                    _ => Ok(()),
                },
                move |host, error| {
                    reported.lock().unwrap().push((host.to_owned(), error.is_some()));
                },
            );
        }
        assert_eq!(session.get_free_proc().unwrap().host(), "good");
        let hosts: Vec<String> = session
            .queue_files(
                files(3),
                |_, _| {
                    Check::run(|handle| {
                        let host = Value::from(handle.host());
                        Ok(Calls::wait(vec![Promise::resolved(host)]))
                    })
                },
                false,
            )
            .unwrap()
            .map(|r| r.results[0].as_str().unwrap_or_default().to_owned())
            .collect();
        assert_eq!(hosts, vec!["good"; 3]);
        let deadline = Instant::now() + Duration::from_secs(5);
        while reported.lock().unwrap().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let mut reported = reported.lock().unwrap().clone();
        reported.sort();
        assert_eq!(
            reported,
            vec![("bad".to_owned(), true), ("good".to_owned(), false)]
        );
    }

    #[test]
    #[serial]
    fn test_all_hosts_failing_raises() {
        let pool = pool(&[("a", 1.0, 1), ("b", 1.0, 1)]);
        let mut session = pool.create_session(2).unwrap();
        session.prepare(|_| Err(worker_proc::Error::Terminated), |_, _| {});
        assert_eq!(
            session.get_free_proc().err(),
            Some(Error::Worker(worker_proc::Error::Terminated))
        );
        assert!(session.queue_files(files(1), |_, _| Check::Skip, true).is_err());
    }
}

//! Hosts known to the application and which of them are reserved.

use crate::{lock, Error, HostConfig, ProcState, Result, Session};
use std::{
    cmp::Ordering,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use worker_proc::Handle;

pub(crate) type DeathWatch = Arc<dyn Fn() + Send + Sync>;

/// Shared registry of hosts. A host is reserved by at most one live [`Session`].
#[derive(Clone)]
pub struct HostPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    hosts: Mutex<Vec<PoolEntry>>,
    poll_interval: Duration,
    stop_timeout: Duration,
}

struct PoolEntry {
    config: HostConfig,
    handle: Option<Handle>,
    in_use: bool,
    // Called when the worker dies while the host is reserved.
    watch: Option<DeathWatch>,
}

impl HostPool {
    pub(crate) fn new(poll_interval: Duration, stop_timeout: Duration) -> Self {
        HostPool {
            inner: Arc::new(PoolInner {
                hosts: Mutex::new(vec![]),
                poll_interval,
                stop_timeout,
            }),
        }
    }

    /// Adds a host, replacing the config of a host with the same name. A replaced
    /// host's idle worker is dropped.
    pub fn add_host(&self, config: HostConfig) {
        let mut hosts = lock(&self.inner.hosts);
        match hosts.iter_mut().find(|e| e.config.name == config.name) {
            Some(entry) => {
                entry.config = config;
                if !entry.in_use {
                    entry.handle = None;
                }
            }
            None => hosts.push(PoolEntry {
                config,
                handle: None,
                in_use: false,
                watch: None,
            }),
        }
    }

    /// Enables or disables a host for future sessions. Returns false for an unknown
    /// host.
    pub fn set_active(&self, name: &str, active: bool) -> bool {
        let mut hosts = lock(&self.inner.hosts);
        match hosts.iter_mut().find(|e| e.config.name == name) {
            Some(entry) => {
                entry.config.active = active;
                true
            }
            None => false,
        }
    }

    /// Names of all hosts, in registration order.
    pub fn host_names(&self) -> Vec<String> {
        lock(&self.inner.hosts)
            .iter()
            .map(|e| e.config.name.clone())
            .collect()
    }

    /// Whether a worker process is kept for `name`.
    pub fn has_worker(&self, name: &str) -> bool {
        lock(&self.inner.hosts)
            .iter()
            .any(|e| e.config.name == name && e.handle.is_some())
    }

    /// Reserves up to `max_hosts` free active hosts, highest priority first.
    pub fn create_session(&self, max_hosts: usize) -> Result<Session> {
        let mut hosts = lock(&self.inner.hosts);
        let mut order: Vec<usize> = (0..hosts.len()).filter(|&i| hosts[i].config.active).collect();
        order.sort_by(|&a, &b| {
            hosts[b]
                .config
                .priority
                .partial_cmp(&hosts[a].config.priority)
                .unwrap_or(Ordering::Equal)
        });
        let mut procs = vec![];
        for index in order {
            if procs.len() >= max_hosts {
                break;
            }
            let entry = &mut hosts[index];
            if entry.in_use {
                log::debug!("host {} is reserved by another session", entry.config.name);
                continue;
            }
            let handle = match &entry.handle {
                Some(handle) => handle.clone(),
                None => {
                    let handle = self.new_handle(&entry.config);
                    entry.handle = Some(handle.clone());
                    handle
                }
            };
            entry.in_use = true;
            procs.push(ProcState::new(&entry.config, handle));
        }
        if procs.is_empty() {
            return Err(Error::NoFreeHosts);
        }
        log::debug!("session reserved {} host(s)", procs.len());
        drop(hosts);
        Ok(Session::new(
            Arc::clone(&self.inner),
            procs,
            self.inner.poll_interval,
        ))
    }

    fn new_handle(&self, config: &HostConfig) -> Handle {
        let handle = Handle::with_stop_timeout(
            config.name.clone(),
            config.launcher.clone(),
            self.inner.stop_timeout,
        );
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        handle.on_death(move |host| {
            if let Some(pool) = pool.upgrade() {
                pool.worker_died(host);
            }
        });
        handle
    }
}

impl PoolInner {
    pub(crate) fn release<'a>(&self, names: impl Iterator<Item = &'a str>) {
        let mut hosts = lock(&self.hosts);
        for name in names {
            if let Some(entry) = hosts.iter_mut().find(|e| e.config.name == name) {
                entry.in_use = false;
                entry.watch = None;
            }
        }
    }

    /// Calls `watch` if the worker of the reserved `host` dies before release.
    pub(crate) fn watch(&self, host: &str, watch: DeathWatch) {
        let mut hosts = lock(&self.hosts);
        if let Some(entry) = hosts.iter_mut().find(|e| e.config.name == host && e.in_use) {
            entry.watch = Some(watch);
        }
    }

    // An idle host loses its handle; a reserved one tells its session.
    fn worker_died(&self, host: &str) {
        let (evicted, watch) = {
            let mut hosts = lock(&self.hosts);
            match hosts.iter_mut().find(|e| e.config.name == host) {
                Some(entry) if entry.in_use => (None, entry.watch.clone()),
                Some(entry) => (entry.handle.take(), None),
                None => (None, None),
            }
        };
        if evicted.is_some() {
            log::info!("worker of idle host {} died, dropped from the pool", host);
        }
        if let Some(watch) = watch {
            log::warn!("worker of reserved host {} died", host);
            watch();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Builder;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use worker_proc::Launcher;

    fn host(name: &str, priority: f32) -> HostConfig {
        HostConfig::new(name, Launcher::local("true", Vec::<String>::new())).priority(priority)
    }

    fn names(session: &Session) -> Vec<String> {
        session.hosts().iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_reservation_is_exclusive() {
        let pool = Builder::new()
            .host(host("low", 1.0))
            .host(host("high", 2.0))
            .build();
        let first = pool.create_session(1).unwrap();
        assert_eq!(names(&first), vec!["high"]);
        let second = pool.create_session(5).unwrap();
        assert_eq!(names(&second), vec!["low"]);
        assert!(matches!(pool.create_session(5), Err(Error::NoFreeHosts)));
        drop(first);
        assert_eq!(names(&pool.create_session(5).unwrap()), vec!["high"]);
    }

    #[test]
    fn test_priority_order_and_inactive_hosts() {
        let pool = Builder::new()
            .host(host("a", 1.0))
            .host(host("b", 3.0))
            .host(host("c", 1.0))
            .host(host("off", 9.0).active(false))
            .build();
        let session = pool.create_session(usize::MAX).unwrap();
        assert_eq!(names(&session), vec!["b", "a", "c"]);
        drop(session);
        assert!(pool.set_active("off", true));
        assert!(!pool.set_active("missing", true));
        assert_eq!(names(&pool.create_session(1).unwrap()), vec!["off"]);
    }

    #[test]
    fn test_workers_are_reused_across_sessions() {
        let pool = Builder::new().host(host("a", 1.0)).build();
        assert!(!pool.has_worker("a"));
        let first = pool.create_session(1).unwrap();
        let handle = first.procs()[0].handle().clone();
        drop(first);
        assert!(pool.has_worker("a"));
        let second = pool.create_session(1).unwrap();
        assert_eq!(second.procs()[0].handle().host(), handle.host());
        let watched = Arc::new(AtomicUsize::new(0));
        {
            let watched = Arc::clone(&watched);
            pool.inner.watch("a", Arc::new(move || {
                watched.fetch_add(1, SeqCst);
            }));
        }
        pool.inner.worker_died("a");
        assert!(pool.has_worker("a"));
        assert_eq!(watched.load(SeqCst), 1);
        drop(second);
        pool.inner.worker_died("a");
        assert!(!pool.has_worker("a"));
        assert_eq!(watched.load(SeqCst), 1);
    }
}

//! Builder for HostPool, caller should provide the hosts
use crate::HostPool;
use std::time::Duration;
use worker_proc::Launcher;

macro_rules! config {
    ($name:ident, $t: ty, $comment: literal) => {
        #[doc=$comment]
        pub fn $name(mut self, $name: $t) -> Self {
            self.$name = $name;
            self
        }
    };
}

/// One worker host as configured by the user.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub(crate) name: String,
    pub(crate) launcher: Launcher,
    pub(crate) priority: f32,
    pub(crate) queue_size: usize,
    pub(crate) active: bool,
    pub(crate) upload_images: bool,
}

impl HostConfig {
    /// Host `name` started by `launcher`. Remote hosts get images uploaded.
    pub fn new(name: impl Into<String>, launcher: Launcher) -> Self {
        HostConfig {
            name: name.into(),
            upload_images: launcher.is_remote(),
            launcher,
            priority: 1.0,
            queue_size: 1,
            active: true,
        }
    }

    config!(priority, f32, "Hosts with higher priority get files first");
    config!(active, bool, "Inactive hosts are never reserved");
    config!(upload_images, bool, "Stream image files to the host's cache before inference");

    /// Files in flight on this host at most, at least one.
    pub fn queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(1);
        self
    }

    /// Host name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Builder for the host pool
pub struct Builder {
    poll_interval: Duration,
    stop_timeout: Duration,
    hosts: Vec<HostConfig>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            poll_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            hosts: vec![],
        }
    }
}

impl Builder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Builder::default()
    }

    config!(poll_interval, Duration, "How often sessions check for an abort while waiting");
    config!(stop_timeout, Duration, "Grace period for a worker to exit after quit");

    /// host register
    pub fn host(mut self, host: HostConfig) -> Self {
        self.hosts.push(host);
        self
    }

    /// Build the pool. No process is started until a session uses it.
    pub fn build(self) -> HostPool {
        let pool = HostPool::new(self.poll_interval, self.stop_timeout);
        for host in self.hosts {
            log::info!("host {} registered, priority {}", host.name, host.priority);
            pool.add_host(host);
        }
        pool
    }
}

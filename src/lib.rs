//! CDN-accelerating forward proxy.
//!
//! Keeps a probed pool of edge IPs per configured CDN domain and routes
//! proxied requests for those domains to the lowest-latency edge, while
//! passing every other request through untouched.

pub mod common;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod inbound;
pub mod mapper;
pub mod pool;
pub mod probe;

pub use common::{Error, Result};

use crate::config::Config;
use crate::discovery::DiscoveryRunner;
use crate::domain::DomainManager;
use crate::inbound::ProxyListener;
use crate::probe::{ProbeOptions, Prober};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Delay before the first discovery pass when none ran at startup
const DISCOVERY_STARTUP_DELAY: Duration = Duration::from_secs(30);

/// Runs periodic background jobs until shutdown.
///
/// Stopping signals every task and waits for it to observe the signal; a
/// job already in flight finishes its current pass first.
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Scheduler {
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// Spawn a job that runs every `period` after an `initial_delay`.
    pub fn spawn_periodic<F, Fut>(
        &mut self,
        name: &'static str,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut delay = initial_delay;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        info!("{} scheduler stopped", name);
                        return;
                    }
                }
                job().await;
                delay = period;
            }
        });
        self.tasks.push(handle);
    }

    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled proxy: pools, listener, and background schedulers.
pub struct Server {
    config: Config,
    manager: Arc<DomainManager>,
    listener: ProxyListener,
    scheduler: Scheduler,
}

impl Server {
    pub async fn new(config: Config) -> Result<Self> {
        let prober = Prober::new(ProbeOptions::from(&config.probe))?;
        let manager = Arc::new(DomainManager::new(
            config.domain_targets(),
            prober,
            config.max_failures,
            config.discovery.max_ips,
            config.discovery.save_to_file,
        )?);
        manager.rebuild_routes().await;

        let listener =
            ProxyListener::bind(&format!("0.0.0.0:{}", config.port), manager.routing()).await?;

        Ok(Server {
            config,
            manager,
            listener,
            scheduler: Scheduler::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start everything and serve until Ctrl-C.
    pub async fn run(&mut self) -> Result<()> {
        info!("akam-proxy v{} starting", VERSION);

        let runner = self.config.discovery.enabled.then(|| {
            Arc::new(DiscoveryRunner::new(
                self.config.discovery.clone(),
                Arc::clone(&self.manager),
            ))
        });

        if let Some(runner) = &runner {
            if self.config.discovery.validate_on_startup {
                info!("running startup discovery pass");
                if let Err(e) = runner.run_once().await {
                    warn!("startup discovery failed: {}", e);
                }
            }
        }

        // First probe cycle before accepting traffic, so managed domains
        // start on a measured edge instead of the canonical fallback.
        self.manager.refresh_all().await;
        for domain in self.manager.summary().await {
            info!(
                pattern = %domain.pattern,
                target = %domain.target_host,
                candidates = domain.ip_count,
                best = domain.best_host.as_deref().unwrap_or("-"),
                "domain ready"
            );
        }

        let refresh_period = Duration::from_secs(self.config.refresh_interval);
        let manager = Arc::clone(&self.manager);
        self.scheduler
            .spawn_periodic("refresh", refresh_period, refresh_period, move || {
                let manager = Arc::clone(&manager);
                async move {
                    manager.refresh_all().await;
                }
            });

        if let Some(runner) = runner {
            let period = Duration::from_secs(self.config.discovery.interval);
            let initial = if self.config.discovery.validate_on_startup {
                period
            } else {
                DISCOVERY_STARTUP_DELAY
            };
            self.scheduler
                .spawn_periodic("discovery", initial, period, move || {
                    let runner = Arc::clone(&runner);
                    async move {
                        if let Err(e) = runner.run_once().await {
                            error!("discovery pass failed: {}", e);
                        }
                    }
                });
        }

        tokio::select! {
            result = self.listener.serve() => result,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                self.listener.stop();
                self.scheduler.stop().await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_scheduler_runs_job_and_stops() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut scheduler = Scheduler::new();

        let c = Arc::clone(&counter);
        scheduler.spawn_periodic(
            "test",
            Duration::from_millis(10),
            Duration::from_millis(10),
            move || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.stop().await;
        let runs = counter.load(Ordering::SeqCst);
        assert!(runs >= 2);

        // no more runs after stop
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(counter.load(Ordering::SeqCst), runs);
    }

    #[tokio::test]
    async fn test_scheduler_stop_without_tasks() {
        let mut scheduler = Scheduler::new();
        scheduler.stop().await;
    }
}

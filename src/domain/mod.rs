//! Domain management.
//!
//! One [`IpPool`] per configured CDN domain, plus the shared routing table
//! the proxy reads on every request. Pools sit behind an async mutex because
//! refresh and discovery both mutate them; the routing table is a rebuilt
//! snapshot behind a sync `RwLock` so the request path never waits on a
//! probe cycle.

use crate::config::DomainTarget;
use crate::pool::IpPool;
use crate::probe::Prober;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// One row of the routing snapshot
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// Domain-suffix pattern, e.g. `akamaized.net`
    pub pattern: String,
    /// Current best edge IP; `None` until a cycle has scored one, in which
    /// case matching requests pass through on their original hostname
    pub host: Option<String>,
}

/// Routing snapshot shared with the proxy. Entries keep configuration
/// order; the first matching pattern wins.
pub type SharedRoutes = Arc<RwLock<Vec<RouteEntry>>>;

struct DomainRoute {
    pattern: String,
    pool: Mutex<IpPool>,
}

/// Owns the pools and keeps the routing snapshot current
pub struct DomainManager {
    routes: Vec<DomainRoute>,
    prober: Prober,
    routing: SharedRoutes,
    save_to_file: bool,
}

impl DomainManager {
    pub fn new(
        targets: Vec<DomainTarget>,
        prober: Prober,
        max_failures: u32,
        max_ips: usize,
        save_to_file: bool,
    ) -> Result<Self> {
        let mut routes = Vec::with_capacity(targets.len());
        for target in targets {
            let mut pool = IpPool::new(
                target.target_host,
                target.list_path,
                max_failures,
                max_ips,
            );
            pool.load()?;
            routes.push(DomainRoute {
                pattern: target.pattern,
                pool: Mutex::new(pool),
            });
        }

        let manager = DomainManager {
            routes,
            prober,
            routing: Arc::new(RwLock::new(Vec::new())),
            save_to_file,
        };
        Ok(manager)
    }

    /// Handle to the routing snapshot for the proxy.
    pub fn routing(&self) -> SharedRoutes {
        Arc::clone(&self.routing)
    }

    /// Rebuild the routing snapshot from the current pool state.
    pub async fn rebuild_routes(&self) {
        let mut entries = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            let pool = route.pool.lock().await;
            entries.push(RouteEntry {
                pattern: route.pattern.clone(),
                host: pool.best_host().map(String::from),
            });
        }
        *self.routing.write() = entries;
    }

    /// Run one probe cycle over every domain, in configuration order.
    ///
    /// Candidates within a domain are probed concurrently, domains one
    /// after another so a large pool cannot starve the others of sockets.
    pub async fn refresh_all(&self) {
        for route in &self.routes {
            let candidates = {
                let pool = route.pool.lock().await;
                pool.candidates()
            };
            if candidates.is_empty() {
                warn!(pattern = %route.pattern, "pool has no candidates, skipping probe cycle");
                continue;
            }

            // pool stays unlocked while probes are in flight
            let results = self.prober.probe_and_rank(&candidates).await;

            let mut pool = route.pool.lock().await;
            let outcome = pool.apply_probe_results(&results);
            if outcome.frozen {
                warn!(
                    pattern = %route.pattern,
                    probed = candidates.len(),
                    "no candidate answered, keeping previous selection"
                );
            } else {
                info!(
                    pattern = %route.pattern,
                    alive = outcome.alive,
                    probed = candidates.len(),
                    evicted = outcome.evicted.len(),
                    best = pool.best_host().unwrap_or("-"),
                    "probe cycle complete"
                );
                if self.save_to_file && !outcome.evicted.is_empty() {
                    if let Err(e) = pool.save() {
                        warn!(pattern = %route.pattern, error = %e, "failed to save candidate list");
                    }
                }
            }
        }
        self.rebuild_routes().await;
    }

    /// Feed a discovery result into the pool for `target_host`.
    ///
    /// Returns how many candidates the pool gained, or `None` when no
    /// configured domain matches the host.
    pub async fn update_candidates(
        &self,
        target_host: &str,
        ips: Vec<String>,
        replace: bool,
    ) -> Option<usize> {
        for route in &self.routes {
            let mut pool = route.pool.lock().await;
            if pool.target_host() != target_host {
                continue;
            }
            let added = if replace {
                let count = ips.len();
                pool.replace_ips(ips);
                count.min(pool.len())
            } else {
                pool.merge_new_ips(ips)
            };
            info!(
                pattern = %route.pattern,
                host = %target_host,
                added,
                total = pool.len(),
                replace,
                "candidate list updated from discovery"
            );
            if self.save_to_file {
                if let Err(e) = pool.save() {
                    warn!(pattern = %route.pattern, error = %e, "failed to save candidate list");
                }
            }
            drop(pool);
            // a replace drops the best selection, re-point the proxy now
            self.rebuild_routes().await;
            return Some(added);
        }
        warn!(host = %target_host, "discovery produced results for an unconfigured host");
        None
    }

    /// Replace the candidate list of the domain matching `pattern`.
    pub async fn replace_ips(&self, pattern: &str, ips: Vec<String>) -> Result<usize> {
        let route = self.route_by_pattern(pattern)?;
        let mut pool = route.pool.lock().await;
        pool.replace_ips(ips);
        let count = pool.len();
        drop(pool);
        self.rebuild_routes().await;
        Ok(count)
    }

    /// Merge candidates into the domain matching `pattern`.
    pub async fn merge_new_ips(&self, pattern: &str, ips: Vec<String>) -> Result<usize> {
        let route = self.route_by_pattern(pattern)?;
        let added = route.pool.lock().await.merge_new_ips(ips);
        Ok(added)
    }

    /// Persist every pool's candidate list.
    pub async fn save_all(&self) -> Result<()> {
        for route in &self.routes {
            route.pool.lock().await.save()?;
        }
        Ok(())
    }

    /// Candidates across all pools.
    pub async fn total_ip_count(&self) -> usize {
        let mut total = 0;
        for route in &self.routes {
            total += route.pool.lock().await.len();
        }
        total
    }

    /// Per-domain state for logging and inspection.
    pub async fn summary(&self) -> Vec<DomainSummary> {
        let mut out = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            let pool = route.pool.lock().await;
            out.push(DomainSummary {
                pattern: route.pattern.clone(),
                target_host: pool.target_host().to_string(),
                ip_count: pool.len(),
                best_host: pool.best().map(|b| b.host.clone()),
                best_score: pool.best().map(|b| b.score),
            });
        }
        out
    }

    /// Canonical hostnames of every managed domain, for discovery.
    pub async fn target_hosts(&self) -> Vec<String> {
        let mut hosts = Vec::with_capacity(self.routes.len());
        for route in &self.routes {
            hosts.push(route.pool.lock().await.target_host().to_string());
        }
        hosts
    }

    fn route_by_pattern(&self, pattern: &str) -> Result<&DomainRoute> {
        self.routes
            .iter()
            .find(|r| r.pattern == pattern)
            .ok_or_else(|| Error::config(format!("no domain configured for pattern {}", pattern)))
    }
}

/// Snapshot of one domain's pool state
#[derive(Debug, Clone)]
pub struct DomainSummary {
    pub pattern: String,
    pub target_host: String,
    pub ip_count: usize,
    pub best_host: Option<String>,
    pub best_score: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeOptions;
    use std::path::PathBuf;
    use std::time::Duration;

    fn targets() -> Vec<DomainTarget> {
        vec![
            DomainTarget {
                pattern: "akamaized.net".into(),
                target_host: "upos-hz-mirrorakam.akamaized.net".into(),
                list_path: PathBuf::from("/tmp/akam-proxy-missing-a.txt"),
            },
            DomainTarget {
                pattern: "bilivideo.com".into(),
                target_host: "upos-sz-mirroraliov.bilivideo.com".into(),
                list_path: PathBuf::from("/tmp/akam-proxy-missing-b.txt"),
            },
        ]
    }

    fn manager() -> DomainManager {
        let prober = Prober::new(ProbeOptions {
            attempts: 1,
            timeout: Duration::from_millis(200),
            port: 1,
            use_tls: false,
        })
        .unwrap();
        DomainManager::new(targets(), prober, 3, 10, false).unwrap()
    }

    #[tokio::test]
    async fn test_routes_carry_no_host_before_first_selection() {
        let m = manager();
        m.rebuild_routes().await;
        let routing = m.routing();
        let routes = routing.read();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].pattern, "akamaized.net");
        assert_eq!(routes[0].host, None);
        assert_eq!(routes[1].host, None);
    }

    #[tokio::test]
    async fn test_update_candidates_merge_and_replace() {
        let m = manager();
        let added = m
            .update_candidates(
                "upos-hz-mirrorakam.akamaized.net",
                vec!["1.1.1.1".into(), "2.2.2.2".into()],
                false,
            )
            .await;
        assert_eq!(added, Some(2));

        // merging the same set again adds nothing
        let added = m
            .update_candidates(
                "upos-hz-mirrorakam.akamaized.net",
                vec!["1.1.1.1".into(), "2.2.2.2".into()],
                false,
            )
            .await;
        assert_eq!(added, Some(0));

        let added = m
            .update_candidates("upos-hz-mirrorakam.akamaized.net", vec!["3.3.3.3".into()], true)
            .await;
        assert_eq!(added, Some(1));
    }

    #[tokio::test]
    async fn test_update_candidates_unknown_host() {
        let m = manager();
        let added = m
            .update_candidates("nobody.example.com", vec!["1.1.1.1".into()], false)
            .await;
        assert_eq!(added, None);
    }

    #[tokio::test]
    async fn test_pattern_keyed_mutations() {
        let m = manager();
        let count = m
            .replace_ips("akamaized.net", vec!["1.1.1.1".into(), "1.1.1.1".into()])
            .await
            .unwrap();
        assert_eq!(count, 1);

        let added = m
            .merge_new_ips("akamaized.net", vec!["1.1.1.1".into(), "2.2.2.2".into()])
            .await
            .unwrap();
        assert_eq!(added, 1);

        assert!(m.replace_ips("unknown.net", vec![]).await.is_err());
        assert_eq!(m.total_ip_count().await, 2);

        let summary = m.summary().await;
        assert_eq!(summary[0].ip_count, 2);
        assert!(summary[0].best_host.is_none());
    }

    #[tokio::test]
    async fn test_refresh_with_empty_pools_is_noop() {
        let m = manager();
        m.refresh_all().await;
        let routing = m.routing();
        assert_eq!(routing.read().len(), 2);
    }
}

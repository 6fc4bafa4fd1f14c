//! Per-domain candidate IP pools.
//!
//! A pool owns the enrolled edge IPs for one CDN domain, the current best
//! selection, and the absence counters that drive eviction. Probing happens
//! outside the pool; the pool only interprets the ranked results.

use crate::probe::ProbeResult;
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Current lowest-latency pick for a domain
#[derive(Debug, Clone)]
pub struct Best {
    pub host: String,
    pub score: f64,
}

/// What a probe cycle did to the pool
#[derive(Debug, Default)]
pub struct CycleOutcome {
    /// Hosts that answered this cycle
    pub alive: usize,
    /// Hosts removed after reaching the absence limit
    pub evicted: Vec<String>,
    /// Whether the cycle produced no results and was ignored
    pub frozen: bool,
}

/// Candidate pool for one CDN domain
pub struct IpPool {
    /// Canonical upstream hostname, used as the routing fallback
    target_host: String,
    list_path: PathBuf,
    hosts: Vec<String>,
    best: Option<Best>,
    /// Consecutive absent cycles per host. An entry exists only while the
    /// host has missed at least one cycle.
    failures: HashMap<String, u32>,
    max_failures: u32,
    max_size: usize,
}

impl IpPool {
    pub fn new(
        target_host: impl Into<String>,
        list_path: impl Into<PathBuf>,
        max_failures: u32,
        max_size: usize,
    ) -> Self {
        IpPool {
            target_host: target_host.into(),
            list_path: list_path.into(),
            hosts: Vec::new(),
            best: None,
            failures: HashMap::new(),
            max_failures,
            max_size,
        }
    }

    pub fn target_host(&self) -> &str {
        &self.target_host
    }

    pub fn list_path(&self) -> &Path {
        &self.list_path
    }

    pub fn candidates(&self) -> Vec<String> {
        self.hosts.clone()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn best(&self) -> Option<&Best> {
        self.best.as_ref()
    }

    /// Load the candidate list from disk.
    ///
    /// A missing file is not an error: the pool starts empty and the next
    /// discovery run or manual edit fills it.
    pub fn load(&mut self) -> Result<()> {
        let content = match std::fs::read_to_string(&self.list_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    path = %self.list_path.display(),
                    host = %self.target_host,
                    "candidate list not found, starting with an empty pool"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // annotated lines (anything with a `:`) never enter the pool
        let hosts: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.contains(':'))
            .map(String::from)
            .collect();
        self.replace_ips(hosts);
        // until the first cycle scores anyone, the first listed candidate
        // is a better guess than the canonical hostname
        if let Some(first) = self.hosts.first() {
            self.best = Some(Best {
                host: first.clone(),
                score: f64::MAX,
            });
        }
        info!(
            host = %self.target_host,
            count = self.hosts.len(),
            path = %self.list_path.display(),
            "loaded candidate list"
        );
        Ok(())
    }

    /// Persist the current candidate list.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.list_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut content = self.hosts.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        std::fs::write(&self.list_path, content).map_err(Error::from)?;
        debug!(
            host = %self.target_host,
            count = self.hosts.len(),
            path = %self.list_path.display(),
            "saved candidate list"
        );
        Ok(())
    }

    /// Replace the whole candidate list.
    ///
    /// Deduplicates preserving input order and hard-truncates at the size
    /// cap. All absence counters are cleared and the previous best selection
    /// is dropped as stale.
    pub fn replace_ips(&mut self, new_ips: Vec<String>) {
        let mut seen = std::collections::HashSet::new();
        let mut hosts: Vec<String> = new_ips
            .into_iter()
            .filter(|h| seen.insert(h.clone()))
            .collect();
        if hosts.len() > self.max_size {
            warn!(
                host = %self.target_host,
                count = hosts.len(),
                max = self.max_size,
                "candidate list exceeds cap, truncating"
            );
            hosts.truncate(self.max_size);
        }
        self.hosts = hosts;
        self.failures.clear();
        self.best = None;
    }

    /// Merge newly discovered candidates into the pool.
    ///
    /// Returns how many were genuinely new. Unlike [`replace_ips`] this never
    /// truncates: an over-cap pool after a merge is logged and left for the
    /// next replace to trim.
    ///
    /// [`replace_ips`]: IpPool::replace_ips
    pub fn merge_new_ips(&mut self, new_ips: Vec<String>) -> usize {
        let mut added = 0;
        for ip in new_ips {
            if !ip.is_empty() && !self.hosts.contains(&ip) {
                self.hosts.push(ip);
                added += 1;
            }
        }
        if self.hosts.len() > self.max_size {
            warn!(
                host = %self.target_host,
                count = self.hosts.len(),
                max = self.max_size,
                "pool over size cap after merge"
            );
        }
        added
    }

    /// Fold a cycle's ranked probe results into the pool state.
    ///
    /// `results` must already be alive-only and sorted best-first. An empty
    /// cycle freezes the pool: counters, membership, and the best selection
    /// all stay as they were, since a total blackout is far more likely a
    /// local network problem than every edge dying at once.
    pub fn apply_probe_results(&mut self, results: &[ProbeResult]) -> CycleOutcome {
        if results.is_empty() {
            debug!(host = %self.target_host, "empty probe cycle, pool frozen");
            return CycleOutcome {
                frozen: true,
                ..CycleOutcome::default()
            };
        }

        let alive: std::collections::HashSet<&str> =
            results.iter().map(|r| r.host.as_str()).collect();

        let mut evicted = Vec::new();
        let mut kept = Vec::with_capacity(self.hosts.len());
        for host in std::mem::take(&mut self.hosts) {
            if alive.contains(host.as_str()) {
                self.failures.remove(&host);
                kept.push(host);
                continue;
            }
            let count = self.failures.entry(host.clone()).or_insert(0);
            *count += 1;
            if *count >= self.max_failures {
                evicted.push(host);
            } else {
                kept.push(host);
            }
        }
        self.hosts = kept;
        for host in &evicted {
            self.failures.remove(host);
            info!(
                host = %self.target_host,
                candidate = %host,
                limit = self.max_failures,
                "evicted candidate after repeated absence"
            );
        }

        let top = &results[0];
        let changed = self
            .best
            .as_ref()
            .map(|b| b.host != top.host)
            .unwrap_or(true);
        if changed {
            info!(
                host = %self.target_host,
                candidate = %top.host,
                score = top.score,
                "best candidate updated"
            );
        }
        self.best = Some(Best {
            host: top.host.clone(),
            score: top.score,
        });

        CycleOutcome {
            alive: alive.len(),
            evicted,
            frozen: false,
        }
    }

    /// Edge host the proxy should dial for this domain, if one is selected.
    ///
    /// `None` means requests pass through on their original hostname; the
    /// canonical upstream is never substituted in.
    pub fn best_host(&self) -> Option<&str> {
        self.best.as_ref().map(|b| b.host.as_str())
    }

    #[cfg(test)]
    pub fn failure_count(&self, host: &str) -> Option<u32> {
        self.failures.get(host).copied()
    }
}

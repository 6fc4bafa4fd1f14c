//! External IP discovery.
//!
//! Periodically runs an external scanner subprocess that writes one
//! `<host>_iplist.txt` file per target host, then feeds the parsed results
//! into the pools. The runner never lets two scans overlap and kills a
//! scan that outlives its timeout.

use crate::config::DiscoveryConfig;
use crate::domain::DomainManager;
use crate::{Error, Result};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct DiscoveryRunner {
    config: DiscoveryConfig,
    manager: Arc<DomainManager>,
    running: AtomicBool,
}

impl DiscoveryRunner {
    pub fn new(config: DiscoveryConfig, manager: Arc<DomainManager>) -> Self {
        DiscoveryRunner {
            config,
            manager,
            running: AtomicBool::new(false),
        }
    }

    /// Run one discovery pass end to end.
    ///
    /// Returns without doing anything if a previous pass is still running.
    pub async fn run_once(&self) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("discovery still running, skipping this pass");
            return Ok(());
        }

        let result = self.run_inner().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(&self) -> Result<()> {
        let hosts = self.manager.target_hosts().await;
        if hosts.is_empty() {
            return Ok(());
        }

        self.spawn_scanner(&hosts).await?;

        let mut updated = 0;
        for host in &hosts {
            let path = self
                .config
                .output_dir
                .join(format!("{}_iplist.txt", host));
            let ips = match parse_ip_list(&path) {
                Ok(ips) => ips,
                Err(e) => {
                    warn!(host = %host, path = %path.display(), error = %e, "no discovery output for host");
                    continue;
                }
            };
            if ips.is_empty() {
                warn!(host = %host, "discovery output was empty, pool unchanged");
                continue;
            }
            if self
                .manager
                .update_candidates(host, ips, self.config.replace_mode)
                .await
                .is_some()
            {
                updated += 1;
            }
        }
        info!(updated, total = hosts.len(), "discovery pass complete");
        Ok(())
    }

    async fn spawn_scanner(&self, hosts: &[String]) -> Result<()> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .args(hosts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.work_dir {
            cmd.current_dir(dir);
        }

        info!(
            command = %self.config.command,
            hosts = hosts.len(),
            "starting discovery scan"
        );
        let child = cmd
            .spawn()
            .map_err(|e| Error::discovery(format!("spawn {}: {}", self.config.command, e)))?;

        let timeout = Duration::from_millis(self.config.timeout_ms);
        // dropping the future on timeout kills the child via kill_on_drop
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::discovery(format!(
                    "scan exceeded {}ms and was killed",
                    self.config.timeout_ms
                ))
            })??;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            debug!(target: "akam_proxy::discovery", "scanner: {}", line);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::discovery(format!(
                "scanner exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        debug!("discovery scan finished cleanly");
        Ok(())
    }
}

/// Parse a scanner output file into candidate IPs.
///
/// Lines carrying latency annotations (anything with a `:`) are skipped;
/// only bare addresses enter the pool.
fn parse_ip_list(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.contains(':'))
        .map(String::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_list_filters_annotations() {
        let dir = std::env::temp_dir().join("akam-proxy-discovery-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("host_iplist.txt");
        std::fs::write(
            &path,
            "# scan results\n1.1.1.1\n2.2.2.2: 34ms\n\n 3.3.3.3 \n",
        )
        .unwrap();

        let ips = parse_ip_list(&path).unwrap();
        assert_eq!(ips, vec!["1.1.1.1", "3.3.3.3"]);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_parse_ip_list_missing_file() {
        let path = Path::new("/tmp/akam-proxy-missing-discovery.txt");
        assert!(parse_ip_list(path).is_err());
    }
}

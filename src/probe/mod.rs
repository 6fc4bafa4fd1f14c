//! Dual-layer latency probing.
//!
//! Each candidate edge IP is measured on two layers: raw TCP connect time
//! and an HTTPS HEAD round trip. The application layer is weighted heavier
//! because a fast handshake to an edge that stalls on requests is useless.

use crate::config::ProbeConfig;
use crate::Result;
use futures::future::join_all;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// TCP connect weight in the combined score
const TCP_WEIGHT: f64 = 0.4;
/// HTTP round-trip weight in the combined score
const HTTP_WEIGHT: f64 = 0.6;

/// Probe parameters for one cycle
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Attempts per layer per candidate
    pub attempts: u32,
    /// Timeout per attempt
    pub timeout: Duration,
    /// Port probed on each candidate
    pub port: u16,
    /// Probe the application layer over TLS
    pub use_tls: bool,
}

impl From<&ProbeConfig> for ProbeOptions {
    fn from(c: &ProbeConfig) -> Self {
        ProbeOptions {
            attempts: c.attempts,
            timeout: Duration::from_millis(c.timeout_ms),
            port: c.port,
            use_tls: c.use_tls,
        }
    }
}

/// Latency statistics for one probe layer
#[derive(Debug, Clone)]
pub struct LayerStats {
    pub alive: bool,
    /// Milliseconds; the timeout sentinel when the layer is dead
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation of the successful samples
    pub jitter: f64,
    /// Failed attempts as a percentage of attempts on this layer
    pub loss: f64,
}

impl LayerStats {
    /// Build stats from successful samples and a failure count.
    ///
    /// A layer with no successful samples is dead; its latency fields are
    /// pinned to the timeout so a dead layer always scores worse than any
    /// live one.
    pub fn from_samples(samples: &[f64], failures: u32, timeout_ms: f64) -> Self {
        let total = samples.len() as u32 + failures;
        let loss = if total == 0 {
            0.0
        } else {
            failures as f64 / total as f64 * 100.0
        };

        if samples.is_empty() {
            return LayerStats {
                alive: false,
                avg: timeout_ms,
                min: timeout_ms,
                max: timeout_ms,
                jitter: 0.0,
                loss,
            };
        }

        let avg = samples.iter().sum::<f64>() / samples.len() as f64;
        let min = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let jitter = if samples.len() < 2 {
            0.0
        } else {
            let variance =
                samples.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / samples.len() as f64;
            variance.sqrt()
        };

        LayerStats {
            alive: true,
            avg,
            min,
            max,
            jitter,
            loss,
        }
    }
}

/// Combined probe result for one candidate
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub host: String,
    pub tcp: LayerStats,
    pub http: LayerStats,
    /// Failed attempts across both layers as a percentage
    pub packet_loss: f64,
    /// Lower is better; dead-layer sentinels keep partially dead hosts ranked last
    pub score: f64,
    /// A candidate is alive if either layer answered at least once
    pub alive: bool,
}

impl ProbeResult {
    pub fn new(host: String, tcp: LayerStats, http: LayerStats) -> Self {
        let packet_loss = (tcp.loss + http.loss) / 2.0;
        let alive = tcp.alive || http.alive;
        let score = if alive {
            (tcp.avg * TCP_WEIGHT + http.avg * HTTP_WEIGHT) * (1.0 + packet_loss / 100.0)
        } else {
            f64::MAX
        };
        ProbeResult {
            host,
            tcp,
            http,
            packet_loss,
            score,
            alive,
        }
    }
}

/// Measures candidate latencies for the pools
pub struct Prober {
    options: ProbeOptions,
    client: reqwest::Client,
}

impl Prober {
    pub fn new(options: ProbeOptions) -> Result<Self> {
        // Candidates are bare IPs, so the certificate can never match the
        // requested name. The probe only cares about round-trip time.
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(options.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| crate::Error::internal(format!("http probe client: {}", e)))?;
        Ok(Prober { options, client })
    }

    /// Probe every candidate concurrently, then drop dead hosts and sort the
    /// survivors by score, lowest first.
    pub async fn probe_and_rank(&self, hosts: &[String]) -> Vec<ProbeResult> {
        let futures: Vec<_> = hosts.iter().map(|h| self.probe_host(h)).collect();
        let mut results: Vec<ProbeResult> = join_all(futures)
            .await
            .into_iter()
            .filter(|r| r.alive)
            .collect();
        results.sort_by(|a, b| a.score.total_cmp(&b.score));
        results
    }

    /// Probe one candidate. Attempts within a host run sequentially so the
    /// host's own samples do not contend with each other.
    pub async fn probe_host(&self, host: &str) -> ProbeResult {
        let timeout_ms = self.options.timeout.as_millis() as f64;

        let mut tcp_samples = Vec::with_capacity(self.options.attempts as usize);
        let mut tcp_failures = 0u32;
        for _ in 0..self.options.attempts {
            match self.probe_tcp_once(host).await {
                Some(ms) => tcp_samples.push(ms),
                None => tcp_failures += 1,
            }
        }

        let mut http_samples = Vec::with_capacity(self.options.attempts as usize);
        let mut http_failures = 0u32;
        for _ in 0..self.options.attempts {
            match self.probe_http_once(host).await {
                Some(ms) => http_samples.push(ms),
                None => http_failures += 1,
            }
        }

        let tcp = LayerStats::from_samples(&tcp_samples, tcp_failures, timeout_ms);
        let http = LayerStats::from_samples(&http_samples, http_failures, timeout_ms);
        let result = ProbeResult::new(host.to_string(), tcp, http);
        debug!(
            host = %result.host,
            score = result.score,
            tcp_avg = result.tcp.avg,
            http_avg = result.http.avg,
            loss = result.packet_loss,
            alive = result.alive,
            "probed candidate"
        );
        result
    }

    async fn probe_tcp_once(&self, host: &str) -> Option<f64> {
        let addr = format!("{}:{}", host, self.options.port);
        let start = Instant::now();
        match tokio::time::timeout(self.options.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => Some(start.elapsed().as_secs_f64() * 1000.0),
            _ => None,
        }
    }

    async fn probe_http_once(&self, host: &str) -> Option<f64> {
        let scheme = if self.options.use_tls { "https" } else { "http" };
        let url = format!("{}://{}:{}/", scheme, host, self.options.port);
        let start = Instant::now();
        // Any HTTP status counts as a successful round trip; edges commonly
        // answer 403 or 404 to a bare HEAD.
        match self.client.head(&url).send().await {
            Ok(_resp) => Some(start.elapsed().as_secs_f64() * 1000.0),
            Err(_) => None,
        }
    }
}

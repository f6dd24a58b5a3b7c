//! Userspace type definitions
//!
//! Defines the data structures used by the daemon for metrics
//! aggregation and export.
//!
//! ## Organization
//!
//! - **Kernel types**: shared with the eBPF programs (from probe_common)
//! - **Userspace types**: aggregation and export structures that live
//!   only here

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Kernel types (from eBPF programs)
// ============================================================================

pub mod kernel {
    //! Types shared between kernel eBPF programs and userspace.
    //!
    //! Re-exported from probe_common; must stay binary-compatible with
    //! the eBPF object.

    pub use probe_common::constants;
    pub use probe_common::types::{ConnectionKey, FlowKey, LatencyEvent, PacketDropEvent, ConnectionState};
}

pub use kernel::{ConnectionKey, FlowKey, LatencyEvent};

/// Aggregated metrics for export.
///
/// This is the exact exported shape: timestamp, duration, totals,
/// per-flow table, histogram, percentiles, event-kind breakdown.
/// Ambient telemetry (packet drops, connection-state churn, self
/// health) is tracked internally but surfaces only in the stdout
/// summary and progress reporter, not in this struct.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LatencyMetrics {
    /// ISO 8601 timestamp when metrics were collected
    pub timestamp: String,
    /// Duration of the collection period in seconds
    pub duration_seconds: u64,
    /// Total number of events observed (post-sampling)
    pub total_events: u64,
    /// Per-flow metrics, keyed by `"<source> -> <destination>"`
    pub connections: HashMap<String, ConnectionMetrics>,
    /// Coarse latency histogram across all flows
    pub histogram: LatencyHistogram,
    /// Latency percentiles reconstructed from the fine histogram
    pub percentiles: Percentiles,
    /// Breakdown by event kind
    pub event_type_breakdown: EventTypeBreakdown,
}

/// Aggregated metrics for a single flow.
///
/// Tracked with running sums rather than a raw sample vector so
/// memory use stays bounded regardless of how long the probe runs.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ConnectionMetrics {
    pub source: String,
    pub destination: String,
    pub events: u64,
    pub min_latency_us: f64,
    pub max_latency_us: f64,
    pub avg_latency_us: f64,
    pub std_dev_us: f64,
    #[serde(skip)]
    pub sum_us: f64,
    #[serde(skip)]
    pub sum_sq_us: f64,
}

impl ConnectionMetrics {
    pub fn new(source: String, destination: String) -> Self {
        ConnectionMetrics { source, destination, ..Default::default() }
    }

    /// 99th-percentile estimate assuming a roughly normal latency
    /// distribution for this single flow. Per-flow raw samples aren't
    /// retained (see the module doc), so this is a moment-based
    /// approximation rather than a true order statistic.
    pub fn p99_estimate_us(&self) -> f64 {
        (self.avg_latency_us + 2.326 * self.std_dev_us).max(0.0)
    }

    pub fn record(&mut self, latency_us: f64) {
        if self.events == 0 || latency_us < self.min_latency_us {
            self.min_latency_us = latency_us;
        }
        if latency_us > self.max_latency_us {
            self.max_latency_us = latency_us;
        }
        self.sum_us += latency_us;
        self.sum_sq_us += latency_us * latency_us;
        self.events += 1;
        self.avg_latency_us = self.sum_us / self.events as f64;
        self.std_dev_us = std_dev_from_sums(self.sum_us, self.sum_sq_us, self.events);
    }

    pub fn merge(&mut self, other: &ConnectionMetrics) {
        if other.events == 0 {
            return;
        }
        if self.events == 0 || other.min_latency_us < self.min_latency_us {
            self.min_latency_us = other.min_latency_us;
        }
        if other.max_latency_us > self.max_latency_us {
            self.max_latency_us = other.max_latency_us;
        }
        self.sum_us += other.sum_us;
        self.sum_sq_us += other.sum_sq_us;
        self.events += other.events;
        self.avg_latency_us = self.sum_us / self.events as f64;
        self.std_dev_us = std_dev_from_sums(self.sum_us, self.sum_sq_us, self.events);
    }
}

fn std_dev_from_sums(sum: f64, sum_sq: f64, count: u64) -> f64 {
    if count <= 1 {
        return 0.0;
    }
    let n = count as f64;
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    variance.sqrt()
}

/// Coarse latency histogram, six fixed buckets.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct LatencyHistogram {
    #[serde(rename = "0-1ms")]
    pub bucket_0_1ms: u64,
    #[serde(rename = "1-5ms")]
    pub bucket_1_5ms: u64,
    #[serde(rename = "5-10ms")]
    pub bucket_5_10ms: u64,
    #[serde(rename = "10-50ms")]
    pub bucket_10_50ms: u64,
    #[serde(rename = "50-100ms")]
    pub bucket_50_100ms: u64,
    #[serde(rename = "100ms+")]
    pub bucket_100ms_plus: u64,
}

impl LatencyHistogram {
    pub fn add_sample(&mut self, latency_us: f64) {
        match latency_us {
            l if l < 1000.0 => self.bucket_0_1ms += 1,
            l if l < 5000.0 => self.bucket_1_5ms += 1,
            l if l < 10000.0 => self.bucket_5_10ms += 1,
            l if l < 50000.0 => self.bucket_10_50ms += 1,
            l if l < 100000.0 => self.bucket_50_100ms += 1,
            _ => self.bucket_100ms_plus += 1,
        }
    }

    pub fn total_count(&self) -> u64 {
        self.bucket_0_1ms
            + self.bucket_1_5ms
            + self.bucket_5_10ms
            + self.bucket_10_50ms
            + self.bucket_50_100ms
            + self.bucket_100ms_plus
    }

    pub fn merge(&mut self, other: &LatencyHistogram) {
        self.bucket_0_1ms += other.bucket_0_1ms;
        self.bucket_1_5ms += other.bucket_1_5ms;
        self.bucket_5_10ms += other.bucket_5_10ms;
        self.bucket_10_50ms += other.bucket_10_50ms;
        self.bucket_50_100ms += other.bucket_50_100ms;
        self.bucket_100ms_plus += other.bucket_100ms_plus;
    }
}

/// Log-spaced histogram used to reconstruct percentiles without
/// keeping every raw sample in memory.
///
/// `FINE_HISTOGRAM_BUCKETS` buckets span
/// `[FINE_HISTOGRAM_MIN_NS, MAX_LATENCY_NS]` nanoseconds with a fixed
/// per-bucket growth factor; this bounds the worst-case percentile
/// reconstruction error to the target stated alongside the constants.
#[derive(Debug, Clone)]
pub struct FineHistogram {
    buckets: Vec<u64>,
    count: u64,
}

impl FineHistogram {
    fn bucket_upper_bound_ns(index: usize) -> f64 {
        use probe_common::constants::{FINE_HISTOGRAM_GROWTH, FINE_HISTOGRAM_MIN_NS};
        FINE_HISTOGRAM_MIN_NS * FINE_HISTOGRAM_GROWTH.powi(index as i32 + 1)
    }

    fn bucket_index(latency_ns: u64) -> usize {
        use probe_common::constants::{FINE_HISTOGRAM_BUCKETS, FINE_HISTOGRAM_GROWTH, FINE_HISTOGRAM_MIN_NS};

        if (latency_ns as f64) <= FINE_HISTOGRAM_MIN_NS {
            return 0;
        }
        let idx = ((latency_ns as f64 / FINE_HISTOGRAM_MIN_NS).ln() / FINE_HISTOGRAM_GROWTH.ln()).floor();
        (idx.max(0.0) as usize).min(FINE_HISTOGRAM_BUCKETS - 1)
    }

    pub fn add_sample(&mut self, latency_ns: u64) {
        let idx = Self::bucket_index(latency_ns);
        self.buckets[idx] += 1;
        self.count += 1;
    }

    pub fn merge(&mut self, other: &FineHistogram) {
        for (a, b) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *a += b;
        }
        self.count += other.count;
    }

    /// Linear interpolation within the bucket straddling rank `p` (0.0..1.0).
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target = ((self.count as f64) * p).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, &count) in self.buckets.iter().enumerate() {
            cumulative += count;
            if cumulative >= target.max(1) {
                let upper_ns = Self::bucket_upper_bound_ns(i);
                let lower_ns = if i == 0 {
                    0.0
                } else {
                    Self::bucket_upper_bound_ns(i - 1)
                };
                return (lower_ns + upper_ns) / 2.0 / 1000.0; // ns -> us
            }
        }
        Self::bucket_upper_bound_ns(self.buckets.len() - 1) / 1000.0
    }

    pub fn to_percentiles(&self) -> Percentiles {
        Percentiles {
            p50: self.percentile(0.50),
            p75: self.percentile(0.75),
            p90: self.percentile(0.90),
            p95: self.percentile(0.95),
            p99: self.percentile(0.99),
            p999: self.percentile(0.999),
        }
    }
}

impl Default for FineHistogram {
    fn default() -> Self {
        FineHistogram {
            buckets: vec![0; probe_common::constants::FINE_HISTOGRAM_BUCKETS],
            count: 0,
        }
    }
}

/// Latency percentiles, in microseconds.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
}

/// Event kind breakdown.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct EventTypeBreakdown {
    pub send: u64,
    pub recv: u64,
    pub cleanup: u64,
}

impl EventTypeBreakdown {
    pub fn merge(&mut self, other: &EventTypeBreakdown) {
        self.send += other.send;
        self.recv += other.recv;
        self.cleanup += other.cleanup;
    }
}

/// Packet drop statistics (ambient telemetry).
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct PacketDropStats {
    pub total_drops: u64,
    pub drops_by_location: HashMap<String, u64>,
    pub drops_by_protocol: HashMap<String, u64>,
}

/// Connection state statistics (ambient telemetry).
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct ConnectionStateStats {
    pub total_opened: u64,
    pub total_closed: u64,
    pub active_connections: u64,
    pub avg_duration_seconds: f64,
    pub states_breakdown: HashMap<String, u64>,
}

/// Probe self-health, read back from the kernel's per-CPU SelfStats.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct ProbeHealth {
    pub events_dropped: u64,
    pub lookup_misses: u64,
    pub elapsed_anomalies: u64,
    pub invalid_sockets: u64,
}

/// Formats a flow key as `saddr:sport -> daddr:dport (pid N)`, used for
/// verbose per-event logging where the pid disambiguates.
pub fn flow_key_to_string(key: &FlowKey) -> String {
    let (source, destination) = flow_key_source_dest(key);
    format!("{} -> {} (pid {})", source, destination, key.pid)
}

/// Splits a flow key into its `saddr:sport`/`daddr:dport` endpoints,
/// the form used for the exported per-connection table key and fields.
/// PID is tracked in-kernel to disambiguate the send/recv pairing but
/// is not part of the reported connection identity.
pub fn flow_key_source_dest(key: &FlowKey) -> (String, String) {
    use std::net::Ipv4Addr;

    let saddr = Ipv4Addr::from(u32::from_be(key.saddr));
    let daddr = Ipv4Addr::from(u32::from_be(key.daddr));

    (
        format!("{}:{}", saddr, u16::from_be(key.sport)),
        format!("{}:{}", daddr, u16::from_be(key.dport)),
    )
}

/// Formats a connection key (no PID) the same way, for ambient tables
/// keyed at the XDP/state layer.
pub fn connection_key_to_string(key: &ConnectionKey) -> String {
    use std::net::Ipv4Addr;

    let saddr = Ipv4Addr::from(u32::from_be(key.saddr));
    let daddr = Ipv4Addr::from(u32::from_be(key.daddr));

    format!("{}:{} -> {}:{}", saddr, u16::from_be(key.sport), daddr, u16::from_be(key.dport))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coarse_histogram_buckets_samples_correctly() {
        let mut hist = LatencyHistogram::default();
        hist.add_sample(500.0);
        hist.add_sample(2_000.0);
        hist.add_sample(150_000.0);
        assert_eq!(hist.total_count(), 3);
        assert_eq!(hist.bucket_0_1ms, 1);
        assert_eq!(hist.bucket_1_5ms, 1);
        assert_eq!(hist.bucket_100ms_plus, 1);
    }

    #[test]
    fn fine_histogram_percentile_monotonic() {
        let mut hist = FineHistogram::default();
        for ns in [1_000u64, 10_000, 100_000, 1_000_000, 10_000_000] {
            hist.add_sample(ns);
        }
        let pct = hist.to_percentiles();
        assert!(pct.p50 <= pct.p90);
        assert!(pct.p90 <= pct.p99);
        assert!(pct.p99 <= pct.p999);
    }

    #[test]
    fn connection_metrics_merge_matches_sequential_record() {
        let mut a = ConnectionMetrics::default();
        a.record(10.0);
        a.record(20.0);

        let mut b = ConnectionMetrics::default();
        b.record(30.0);

        let mut merged = a.clone();
        merged.merge(&b);

        let mut sequential = ConnectionMetrics::default();
        sequential.record(10.0);
        sequential.record(20.0);
        sequential.record(30.0);

        assert_eq!(merged.events, sequential.events);
        assert!((merged.avg_latency_us - sequential.avg_latency_us).abs() < 1e-9);
    }

    #[test]
    fn flow_key_to_string_includes_pid() {
        let key = FlowKey {
            saddr: u32::from(std::net::Ipv4Addr::new(10, 0, 0, 1)).to_be(),
            daddr: u32::from(std::net::Ipv4Addr::new(10, 0, 0, 2)).to_be(),
            sport: 1234u16.to_be(),
            dport: 80u16.to_be(),
            pid: 42,
        };
        let s = flow_key_to_string(&key);
        assert!(s.contains("pid 42"));
        assert!(s.contains("10.0.0.1:1234"));
    }
}

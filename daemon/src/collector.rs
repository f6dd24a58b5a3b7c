//! Metrics collection and aggregation
//!
//! Aggregates latency events from the kernel and computes statistics.
//!
//! Events arrive from several per-CPU perf buffer readers running
//! concurrently, so each reader owns a private `CollectorShard` with no
//! shared locking; shards are merged into one `LatencyMetrics` snapshot
//! only when the daemon is ready to report or export, which keeps the
//! hot path lock-free.

use crate::types::*;
use probe_common::constants::*;
use std::collections::HashMap;

/// Per-CPU collection state, owned by a single reader task.
pub struct CollectorShard {
    connection_latencies: HashMap<String, ConnectionMetrics>,
    histogram: LatencyHistogram,
    fine_histogram: FineHistogram,
    event_types: EventTypeBreakdown,
    total_events: u64,
    events_sampled_out: u64,
    packet_drops: PacketDropStats,
    connection_states: ConnectionStateStats,
    connection_durations_sum: f64,
    connection_durations_count: u64,
    sample_counter: u32,
    sample_rate: u32,
}

impl CollectorShard {
    pub fn new(sample_rate: u32) -> Self {
        CollectorShard {
            connection_latencies: HashMap::new(),
            histogram: LatencyHistogram::default(),
            fine_histogram: FineHistogram::default(),
            event_types: EventTypeBreakdown::default(),
            total_events: 0,
            events_sampled_out: 0,
            packet_drops: PacketDropStats::default(),
            connection_states: ConnectionStateStats::default(),
            connection_durations_sum: 0.0,
            connection_durations_count: 0,
            sample_counter: 0,
            sample_rate: sample_rate.max(1),
        }
    }

    /// Deterministic 1-in-N sampling: every Nth event (by arrival order
    /// on this shard) is kept. Deterministic rather than random so a
    /// fixed `--sample-rate` gives a reproducible kept-event count,
    /// which matters for comparing runs.
    fn should_sample(&mut self) -> bool {
        let keep = self.sample_counter % self.sample_rate == 0;
        self.sample_counter = self.sample_counter.wrapping_add(1);
        keep
    }

    pub fn add_event(&mut self, event: &LatencyEvent) {
        if !self.should_sample() {
            self.events_sampled_out += 1;
            return;
        }

        self.total_events += 1;

        match event.kind {
            probe_common::types::event_kind::SEND => self.event_types.send += 1,
            probe_common::types::event_kind::RECV => self.event_types.recv += 1,
            probe_common::types::event_kind::CLEANUP => self.event_types.cleanup += 1,
            _ => {}
        }

        // SEND carries no latency measurement; CLEANUP is a best-effort,
        // usually-absent signal (recvmsg already consumed FlowStart in
        // the common case) kept for accounting only. Neither feeds the
        // primary latency histogram or per-connection metrics.
        if event.kind != probe_common::types::event_kind::RECV {
            return;
        }

        let latency_us = event.latency_ns as f64 / 1000.0;

        let (source, destination) = flow_key_source_dest(&event.key());
        let conn_key = format!("{} -> {}", source, destination);
        self.connection_latencies
            .entry(conn_key)
            .or_insert_with(|| ConnectionMetrics::new(source, destination))
            .record(latency_us);

        self.histogram.add_sample(latency_us);
        self.fine_histogram.add_sample(event.latency_ns);
    }

    pub fn add_packet_drop(&mut self, event: &kernel::PacketDropEvent) {
        self.packet_drops.total_drops += 1;

        let location = match event.drop_location {
            DROP_LOCATION_TC => "tc",
            DROP_LOCATION_XDP => "xdp",
            DROP_LOCATION_NETFILTER => "netfilter",
            DROP_LOCATION_STACK => "stack",
            DROP_LOCATION_APP => "app",
            _ => "unknown",
        };
        *self.packet_drops.drops_by_location.entry(location.to_string()).or_insert(0) += 1;

        let protocol = match event.protocol {
            IPPROTO_TCP => "tcp",
            IPPROTO_UDP => "udp",
            IPPROTO_ICMP => "icmp",
            _ => "other",
        };
        *self.packet_drops.drops_by_protocol.entry(protocol.to_string()).or_insert(0) += 1;
    }

    pub fn add_connection_state(&mut self, event: &kernel::ConnectionState) {
        let state_name = match event.state {
            CONN_STATE_CONNECTING => "connecting",
            CONN_STATE_ESTABLISHED => "established",
            CONN_STATE_CLOSING => "closing",
            CONN_STATE_CLOSED => "closed",
            _ => "unknown",
        };
        *self.connection_states.states_breakdown.entry(state_name.to_string()).or_insert(0) += 1;

        match event.state {
            CONN_STATE_ESTABLISHED if event.start_time_ns > 0 => {
                self.connection_states.total_opened += 1;
            }
            CONN_STATE_CLOSED => {
                self.connection_states.total_closed += 1;
                if event.close_time_ns > event.start_time_ns && event.start_time_ns > 0 {
                    let duration_secs =
                        (event.close_time_ns - event.start_time_ns) as f64 / 1_000_000_000.0;
                    self.connection_durations_sum += duration_secs;
                    self.connection_durations_count += 1;
                }
            }
            _ => {}
        }
    }

    pub fn event_count(&self) -> u64 {
        self.total_events
    }
}

/// Merges shards from every CPU reader into one reportable snapshot.
///
/// Built fresh each time metrics are needed (progress tick or final
/// export) rather than kept as a running total, so merging is O(shards)
/// and never touches the hot per-event path.
#[derive(Default)]
pub struct Aggregate {
    connections: HashMap<String, ConnectionMetrics>,
    histogram: LatencyHistogram,
    fine_histogram: FineHistogram,
    event_types: EventTypeBreakdown,
    total_events: u64,
    events_sampled_out: u64,
    packet_drops: PacketDropStats,
    connection_states: ConnectionStateStats,
    connection_durations_sum: f64,
    connection_durations_count: u64,
}

impl Aggregate {
    pub fn merge_shard(&mut self, shard: &CollectorShard) {
        for (key, metrics) in &shard.connection_latencies {
            self.connections.entry(key.clone()).or_default().merge(metrics);
        }
        self.histogram.merge(&shard.histogram);
        self.fine_histogram.merge(&shard.fine_histogram);
        self.event_types.merge(&shard.event_types);
        self.total_events += shard.total_events;
        self.events_sampled_out += shard.events_sampled_out;

        self.packet_drops.total_drops += shard.packet_drops.total_drops;
        for (k, v) in &shard.packet_drops.drops_by_location {
            *self.packet_drops.drops_by_location.entry(k.clone()).or_insert(0) += v;
        }
        for (k, v) in &shard.packet_drops.drops_by_protocol {
            *self.packet_drops.drops_by_protocol.entry(k.clone()).or_insert(0) += v;
        }

        self.connection_states.total_opened += shard.connection_states.total_opened;
        self.connection_states.total_closed += shard.connection_states.total_closed;
        for (k, v) in &shard.connection_states.states_breakdown {
            *self.connection_states.states_breakdown.entry(k.clone()).or_insert(0) += v;
        }
        self.connection_durations_sum += shard.connection_durations_sum;
        self.connection_durations_count += shard.connection_durations_count;
    }

    pub fn generate_metrics(&self, elapsed_secs: u64) -> LatencyMetrics {
        LatencyMetrics {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_seconds: elapsed_secs,
            total_events: self.total_events,
            connections: self.connections.clone(),
            histogram: self.histogram.clone(),
            percentiles: self.fine_histogram.to_percentiles(),
            event_type_breakdown: self.event_types.clone(),
        }
    }

    pub fn event_count(&self) -> u64 {
        self.total_events
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn histogram(&self) -> &LatencyHistogram {
        &self.histogram
    }

    pub fn packet_drops(&self) -> &PacketDropStats {
        &self.packet_drops
    }

    /// Connection-state churn, as ambient telemetry for the stdout
    /// summary (not part of the exported metrics shape).
    pub fn connection_state_stats(&self) -> ConnectionStateStats {
        let avg_duration_seconds = if self.connection_durations_count > 0 {
            self.connection_durations_sum / self.connection_durations_count as f64
        } else {
            0.0
        };

        let mut states = self.connection_states.clone();
        states.avg_duration_seconds = avg_duration_seconds;
        states.active_connections = self.connections.len() as u64;
        states
    }

    /// Folds in a kernel-side per-flow rollup entry (populated only in
    /// rollup mode, where individual RECV events never reach the ring).
    ///
    /// Rollup entries carry count/sum/min/max but not a sum of squares,
    /// so the merged flow's standard deviation stays at zero and the
    /// fine histogram gets no new samples — percentile reconstruction
    /// only reflects non-rollup flows measured in the same run.
    pub fn merge_per_flow_agg(&mut self, key: &probe_common::types::FlowKey, agg: &probe_common::types::PerFlowAgg) {
        if agg.count == 0 {
            return;
        }

        let (source, destination) = flow_key_source_dest(key);
        let conn_key = format!("{} -> {}", source, destination);
        let entry = self
            .connections
            .entry(conn_key)
            .or_insert_with(|| ConnectionMetrics::new(source, destination));

        let sum_us = agg.sum_ns as f64 / 1000.0;
        let min_us = agg.min_ns as f64 / 1000.0;
        let max_us = agg.max_ns as f64 / 1000.0;

        if entry.events == 0 || min_us < entry.min_latency_us {
            entry.min_latency_us = min_us;
        }
        if max_us > entry.max_latency_us {
            entry.max_latency_us = max_us;
        }
        entry.sum_us += sum_us;
        entry.events += agg.count;
        entry.avg_latency_us = entry.sum_us / entry.events as f64;

        self.total_events += agg.count;
        self.event_types.recv += agg.count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_common::types::FlowKey;

    fn make_event(latency_ns: u64, kind: u8) -> LatencyEvent {
        let key = FlowKey {
            saddr: 0x0100007f,
            daddr: 0x0100007f,
            sport: 0x5000,
            dport: 0x5000,
            pid: 1234,
        };
        let mut event = probe_common::types::LatencyEvent::zeroed(kind);
        event.saddr = key.saddr;
        event.daddr = key.daddr;
        event.sport = key.sport;
        event.dport = key.dport;
        event.pid = key.pid;
        event.latency_ns = latency_ns;
        event
    }

    #[test]
    fn shard_tracks_single_event() {
        let mut shard = CollectorShard::new(1);
        shard.add_event(&make_event(500_000, probe_common::types::event_kind::RECV));
        assert_eq!(shard.event_count(), 1);
        assert_eq!(shard.connection_latencies.len(), 1);
    }

    #[test]
    fn sample_rate_keeps_one_in_n() {
        let mut shard = CollectorShard::new(4);
        for _ in 0..8 {
            shard.add_event(&make_event(1_000, probe_common::types::event_kind::RECV));
        }
        assert_eq!(shard.event_count(), 8);
        assert_eq!(shard.connection_latencies.values().next().unwrap().events, 2);
    }

    #[test]
    fn histogram_bucketing_matches_expected_ranges() {
        let mut shard = CollectorShard::new(1);
        let latencies_us = [500u64, 2_000, 7_000, 30_000, 75_000, 150_000];
        for &us in &latencies_us {
            shard.add_event(&make_event(us * 1000, probe_common::types::event_kind::RECV));
        }
        assert_eq!(shard.histogram.bucket_0_1ms, 1);
        assert_eq!(shard.histogram.bucket_1_5ms, 1);
        assert_eq!(shard.histogram.bucket_5_10ms, 1);
        assert_eq!(shard.histogram.bucket_10_50ms, 1);
        assert_eq!(shard.histogram.bucket_50_100ms, 1);
        assert_eq!(shard.histogram.bucket_100ms_plus, 1);
    }

    #[test]
    fn aggregate_merges_multiple_shards() {
        let mut shard_a = CollectorShard::new(1);
        shard_a.add_event(&make_event(1_000_000, probe_common::types::event_kind::RECV));
        let mut shard_b = CollectorShard::new(1);
        shard_b.add_event(&make_event(2_000_000, probe_common::types::event_kind::RECV));

        let mut agg = Aggregate::default();
        agg.merge_shard(&shard_a);
        agg.merge_shard(&shard_b);

        assert_eq!(agg.event_count(), 2);
        assert_eq!(agg.connection_count(), 1);
        let conn = agg.connections.values().next().unwrap();
        assert_eq!(conn.events, 2);
    }
}

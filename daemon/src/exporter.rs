//! Metrics exporters
//!
//! Each exporter writes to a temp file next to the destination, flushes
//! it to disk, then renames it into place. A reader polling the output
//! path never observes a partially-written file, even if the process is
//! killed mid-write.

use crate::error::ProbeError;
use crate::types::LatencyMetrics;
use anyhow::{Context, Result};
use std::{fs::File, io::Write, path::Path, path::PathBuf};

pub trait MetricsExporter {
    fn export(&self, metrics: &LatencyMetrics) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub enum ExporterType {
    Json,
    Prometheus,
    Influx,
}

impl ExporterType {
    pub fn parse(format: &str) -> Result<Self> {
        match format.to_lowercase().as_str() {
            "json" => Ok(ExporterType::Json),
            "prometheus" | "prom" => Ok(ExporterType::Prometheus),
            "influx" | "influxdb" => Ok(ExporterType::Influx),
            other => Err(ProbeError::UnsupportedFormat(other.to_string()).into()),
        }
    }
}

/// Writes `contents` atomically to `path`: a tmp file in the same
/// directory, `sync_all`, then `rename` over the destination.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = tmp_path_for(path);

    let result: Result<()> = (|| {
        let mut file = File::create(&tmp_path)
            .map_err(|source| ProbeError::ExportWrite { path: tmp_path.clone(), source })
            .with_context(|| format!("creating temp file for {:?}", path))?;

        file.write_all(contents)
            .map_err(|source| ProbeError::ExportWrite { path: tmp_path.clone(), source })?;

        file.sync_all()
            .map_err(|source| ProbeError::ExportWrite { path: tmp_path.clone(), source })?;

        drop(file);

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming {:?} to {:?}", tmp_path, path))?;

        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }

    result
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self { output_path, pretty }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, metrics: &LatencyMetrics) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(metrics).map_err(ProbeError::Serialize)?
        } else {
            serde_json::to_string(metrics).map_err(ProbeError::Serialize)?
        };

        write_atomic(&self.output_path, json.as_bytes())
    }
}

pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    fn to_prometheus_format(metrics: &LatencyMetrics) -> String {
        let mut output = String::new();

        output.push_str("# HELP ebpf_latency_events_total Total number of latency events by kind\n");
        output.push_str("# TYPE ebpf_latency_events_total counter\n");
        output.push_str(&format!("ebpf_latency_events_total{{kind=\"send\"}} {}\n", metrics.event_type_breakdown.send));
        output.push_str(&format!("ebpf_latency_events_total{{kind=\"recv\"}} {}\n", metrics.event_type_breakdown.recv));
        output.push_str(&format!("ebpf_latency_events_total{{kind=\"cleanup\"}} {}\n\n", metrics.event_type_breakdown.cleanup));

        output.push_str("# HELP ebpf_latency_bucket Cumulative latency histogram, microseconds upper bound\n");
        output.push_str("# TYPE ebpf_latency_bucket histogram\n");
        let h = &metrics.histogram;
        let mut cumulative = 0u64;
        for (le, count) in [
            ("1000", h.bucket_0_1ms),
            ("5000", h.bucket_1_5ms),
            ("10000", h.bucket_5_10ms),
            ("50000", h.bucket_10_50ms),
            ("100000", h.bucket_50_100ms),
            ("+Inf", h.bucket_100ms_plus),
        ] {
            cumulative += count;
            output.push_str(&format!("ebpf_latency_bucket{{le=\"{}\"}} {}\n", le, cumulative));
        }
        output.push('\n');

        let (sum_us, count): (f64, u64) =
            metrics.connections.values().fold((0.0, 0u64), |(s, c), conn| (s + conn.sum_us, c + conn.events));

        output.push_str("# HELP ebpf_latency_sum_us Sum of observed latencies, in microseconds\n");
        output.push_str("# TYPE ebpf_latency_sum_us gauge\n");
        output.push_str(&format!("ebpf_latency_sum_us {}\n\n", sum_us));

        output.push_str("# HELP ebpf_latency_count Count of latency samples backing ebpf_latency_sum_us\n");
        output.push_str("# TYPE ebpf_latency_count gauge\n");
        output.push_str(&format!("ebpf_latency_count {}\n\n", count));

        output.push_str("# HELP ebpf_flow_latency_avg_us Average latency per flow, in microseconds\n");
        output.push_str("# TYPE ebpf_flow_latency_avg_us gauge\n");
        for conn in metrics.connections.values() {
            output.push_str(&format!(
                "ebpf_flow_latency_avg_us{{src=\"{}\",dst=\"{}\"}} {}\n",
                conn.source, conn.destination, conn.avg_latency_us
            ));
        }

        output
    }
}

impl MetricsExporter for PrometheusExporter {
    fn export(&self, metrics: &LatencyMetrics) -> Result<()> {
        let data = Self::to_prometheus_format(metrics);
        write_atomic(&self.output_path, data.as_bytes())
    }
}

/// Writes one InfluxDB line-protocol point per connection, measurement
/// `ebpf_latency`.
pub struct InfluxExporter {
    output_path: PathBuf,
}

impl InfluxExporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    fn to_influx_format(metrics: &LatencyMetrics) -> String {
        let mut output = String::new();
        let timestamp = chrono::DateTime::parse_from_rfc3339(&metrics.timestamp)
            .map(|dt| dt.timestamp_nanos_opt().unwrap_or(0))
            .unwrap_or(0);

        for conn in metrics.connections.values() {
            output.push_str(&format!(
                "ebpf_latency,src={},dst={} count={}i,min_us={},max_us={},avg_us={},stddev_us={},p99_us={} {}\n",
                conn.source,
                conn.destination,
                conn.events,
                conn.min_latency_us,
                conn.max_latency_us,
                conn.avg_latency_us,
                conn.std_dev_us,
                conn.p99_estimate_us(),
                timestamp
            ));
        }

        output
    }
}

impl MetricsExporter for InfluxExporter {
    fn export(&self, metrics: &LatencyMetrics) -> Result<()> {
        let data = Self::to_influx_format(metrics);
        write_atomic(&self.output_path, data.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use std::collections::HashMap;

    fn sample_metrics() -> LatencyMetrics {
        let mut connections = HashMap::new();
        let mut conn = ConnectionMetrics::new("10.0.0.1:1234".to_string(), "10.0.0.2:80".to_string());
        conn.record(100.0);
        conn.record(300.0);
        connections.insert("10.0.0.1:1234 -> 10.0.0.2:80".to_string(), conn);

        LatencyMetrics {
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            duration_seconds: 60,
            total_events: 1000,
            connections,
            histogram: LatencyHistogram::default(),
            percentiles: Percentiles {
                p50: 100.0,
                p75: 200.0,
                p90: 300.0,
                p95: 400.0,
                p99: 500.0,
                p999: 600.0,
            },
            event_type_breakdown: EventTypeBreakdown { send: 500, recv: 500, cleanup: 0 },
        }
    }

    #[test]
    fn prometheus_format_includes_expected_series() {
        let metrics = sample_metrics();
        let text = PrometheusExporter::to_prometheus_format(&metrics);
        assert!(text.contains("ebpf_latency_events_total{kind=\"recv\"} 500"));
        assert!(text.contains("ebpf_latency_bucket{le=\"+Inf\"}"));
        assert!(text.contains("ebpf_flow_latency_avg_us{src=\"10.0.0.1:1234\",dst=\"10.0.0.2:80\"}"));
    }

    #[test]
    fn influx_format_includes_expected_fields() {
        let metrics = sample_metrics();
        let text = InfluxExporter::to_influx_format(&metrics);
        assert!(text.contains("ebpf_latency,src=10.0.0.1:1234,dst=10.0.0.2:80"));
        assert!(text.contains("count=2i"));
        assert!(text.contains("p99_us="));
    }

    #[test]
    fn json_export_writes_atomically_via_rename() {
        let dir = std::env::temp_dir().join(format!("latency-probe-export-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let out = dir.join("metrics.json");

        let exporter = JsonExporter::new(out.clone(), false);
        exporter.export(&sample_metrics()).unwrap();

        assert!(out.exists());
        assert!(!tmp_path_for(&out).exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unsupported_format_is_rejected() {
        assert!(ExporterType::parse("xml").is_err());
    }
}

//! TCP latency probe - userspace daemon
//!
//! Loads the eBPF latency tracker, attaches its hooks, collects and
//! aggregates events, and exports a metrics report.
//!
//! ## Usage
//!
//! ```bash
//! # Run for 60 seconds and export JSON
//! sudo ./latency-probe --duration 60 --output metrics.json
//!
//! # Keep 1 in 100 events
//! sudo ./latency-probe --duration 60 --sample-rate 100
//!
//! # Kernel-side per-flow rollup instead of per-event records
//! sudo ./latency-probe --duration 60 --rollup
//!
//! # Prometheus text format
//! sudo ./latency-probe --duration 60 --format prometheus --output metrics.prom
//! ```

use anyhow::Result;
use clap::Parser;
use latency_probe_userspace::{
    exporter::{ExporterType, InfluxExporter, JsonExporter, MetricsExporter, PrometheusExporter},
    Config, EventProcessor, ExitCode, LatencyMetrics, ProbeLoader,
};
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::{signal, time::Instant};

#[tokio::main]
async fn main() {
    match run().await {
        Ok(cancelled) => {
            std::process::exit(if cancelled { ExitCode::Cancelled.code() } else { ExitCode::Success.code() })
        }
        Err(e) => {
            eprintln!("error: {:?}", e);
            std::process::exit(
                e.downcast_ref::<latency_probe_userspace::ProbeError>()
                    .map(exit_code_for)
                    .unwrap_or(ExitCode::GenericError)
                    .code(),
            );
        }
    }
}

/// Classifies a leaf error into the documented exit-code groups. Attach
/// failures whose underlying cause looks like a capability problem are
/// reported as a permission failure rather than a generic load failure,
/// since the fix (run with CAP_BPF/CAP_NET_ADMIN) is different.
fn exit_code_for(err: &latency_probe_userspace::ProbeError) -> ExitCode {
    use latency_probe_userspace::ProbeError::*;
    match err {
        InvalidSampleRate(_) | UnsupportedFormat(_) | ExportWrite { .. } | Serialize(_) => {
            ExitCode::GenericError
        }
        EbpfObjectRead { .. } | EbpfLoad(_) | ProgramNotFound(_) => ExitCode::LoadFailure,
        RequiredHookAttach { source, .. } => {
            let msg = source.to_string().to_lowercase();
            if msg.contains("permission denied") || msg.contains("operation not permitted") {
                ExitCode::PermissionFailure
            } else {
                ExitCode::LoadFailure
            }
        }
    }
}

async fn run() -> Result<bool> {
    let config = Config::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if config.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info })
        .init();

    print_banner();

    if config.sample_rate == 0 {
        return Err(latency_probe_userspace::ProbeError::InvalidSampleRate(0).into());
    }
    let export_format = ExporterType::parse(&config.format)?;

    info!("starting TCP latency probe");
    info!("  duration: {}", if config.duration == 0 { "infinite".to_string() } else { format!("{}s", config.duration) });
    info!("  sample rate: 1 in {}", config.sample_rate);
    info!("  rollup mode: {}", config.rollup);
    info!("  output: {:?} ({})", config.output, config.format);

    let mut loader = ProbeLoader::load(config.ebpf_object.clone())?;
    loader.push_config(config.rollup)?;
    loader.init_logger();

    loader.attach_required_hooks()?;
    loader.attach_soft_hooks()?;
    loader.attach_tracepoints()?;
    loader.attach_xdp(&config.interface)?;

    let latency_events = loader.get_latency_events()?;
    let packet_drop_events = loader.get_packet_drop_events()?;

    info!("collecting...");

    let processor = Arc::new(EventProcessor::new(config.sample_rate, config.verbose)?);
    processor.spawn_latency_readers(latency_events).await?;
    processor.spawn_packet_drop_readers(packet_drop_events).await?;
    processor.spawn_progress_reporter(config.progress_interval);

    let start = Instant::now();
    let cancelled = wait_for_completion(config.duration).await;
    let elapsed = start.elapsed().as_secs();

    info!("shutting down readers...");
    processor.shutdown();
    // Bounded grace period so in-flight ring reads finish before we snapshot.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut aggregate = processor.aggregate().await;

    if config.rollup {
        for (key, agg) in loader.read_per_flow_agg()? {
            aggregate.merge_per_flow_agg(&key, &agg);
        }
    }

    let probe_health = loader.read_self_stats()?;
    let (parse_errors, ring_errors) = processor.error_counts();
    let packet_drops = aggregate.packet_drops().clone();
    let connection_states = aggregate.connection_state_stats();
    let metrics = aggregate.generate_metrics(elapsed);

    export_metrics(export_format, &config.output, &metrics)?;
    info!("metrics written to {:?}", config.output);

    print_summary(&metrics, &probe_health, parse_errors, ring_errors, &packet_drops, &connection_states);

    Ok(cancelled)
}

/// Races the configured duration against Ctrl-C. A second Ctrl-C during
/// the drain/export tail is ignored rather than re-triggering shutdown.
/// Returns `true` if the signal, not the timer, ended the wait, so the
/// caller can report exit code 130 once the (still well-formed) output
/// has been written.
async fn wait_for_completion(duration_secs: u64) -> bool {
    let shutting_down = AtomicBool::new(false);

    let wait_ctrl_c = || async {
        loop {
            let _ = signal::ctrl_c().await;
            if !shutting_down.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    };

    if duration_secs > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(duration_secs)) => {
                info!("duration reached, shutting down");
                false
            }
            _ = wait_ctrl_c() => {
                info!("interrupted, shutting down");
                true
            }
        }
    } else {
        wait_ctrl_c().await;
        info!("interrupted, shutting down");
        true
    }
}

fn export_metrics(format: ExporterType, output: &std::path::Path, metrics: &LatencyMetrics) -> Result<()> {
    match format {
        ExporterType::Json => JsonExporter::new(output.to_path_buf(), true).export(metrics),
        ExporterType::Prometheus => PrometheusExporter::new(output.to_path_buf()).export(metrics),
        ExporterType::Influx => InfluxExporter::new(output.to_path_buf()).export(metrics),
    }
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║       Kernel-Assisted TCP Latency Probe           ║
╚═══════════════════════════════════════════════════╝
"#
    );
}

fn print_summary(
    metrics: &LatencyMetrics,
    probe_health: &latency_probe_userspace::ProbeHealth,
    parse_errors: u64,
    ring_errors: u64,
    packet_drops: &latency_probe_userspace::PacketDropStats,
    connection_states: &latency_probe_userspace::ConnectionStateStats,
) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("  Total events:       {}", metrics.total_events);
    info!("  Unique flows:       {}", metrics.connections.len());
    info!("  Duration:           {} seconds", metrics.duration_seconds);
    info!("");
    info!("  Latency percentiles (us):");
    info!("    p50:  {:>10.2}", metrics.percentiles.p50);
    info!("    p75:  {:>10.2}", metrics.percentiles.p75);
    info!("    p90:  {:>10.2}", metrics.percentiles.p90);
    info!("    p95:  {:>10.2}", metrics.percentiles.p95);
    info!("    p99:  {:>10.2}", metrics.percentiles.p99);
    info!("    p999: {:>10.2}", metrics.percentiles.p999);
    info!("");
    info!("  Histogram:");
    info!("    0-1ms:    {:>8}", metrics.histogram.bucket_0_1ms);
    info!("    1-5ms:    {:>8}", metrics.histogram.bucket_1_5ms);
    info!("    5-10ms:   {:>8}", metrics.histogram.bucket_5_10ms);
    info!("    10-50ms:  {:>8}", metrics.histogram.bucket_10_50ms);
    info!("    50-100ms: {:>8}", metrics.histogram.bucket_50_100ms);
    info!("    100ms+:   {:>8}", metrics.histogram.bucket_100ms_plus);
    info!("");
    info!("  Probe health:");
    info!("    events dropped (kernel ring): {:>8}", probe_health.events_dropped);
    info!("    lookup misses:                {:>8}", probe_health.lookup_misses);
    info!("    elapsed anomalies:            {:>8}", probe_health.elapsed_anomalies);
    info!("    invalid sockets:              {:>8}", probe_health.invalid_sockets);
    info!("    parse errors (userspace):     {:>8}", parse_errors);
    info!("    ring read errors:             {:>8}", ring_errors);
    info!("");
    info!("  Packet drops: {} (tracked by location/protocol: {:?}/{:?})",
        packet_drops.total_drops, packet_drops.drops_by_location, packet_drops.drops_by_protocol);
    info!("  Connections opened/closed: {}/{}, active: {}, avg duration: {:.2}s",
        connection_states.total_opened,
        connection_states.total_closed,
        connection_states.active_connections,
        connection_states.avg_duration_seconds);
    info!("============================================");
}

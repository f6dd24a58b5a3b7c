//! CLI configuration
//!
//! Every flag has a matching environment variable fallback (`clap`'s
//! `env` feature) so the probe can be configured the same way whether
//! it's invoked directly or launched from a unit file / container
//! entrypoint that sets env vars instead of building an argv.

use clap::Parser;
use std::path::PathBuf;

/// Kernel-assisted TCP latency observability probe.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Config {
    /// Duration to run the probe, in seconds (0 = run until interrupted)
    #[clap(short, long, env = "EBPF_PROBE_DURATION", default_value_t = 60)]
    pub duration: u64,

    /// Output file for the final metrics report
    #[clap(short, long, env = "EBPF_PROBE_OUTPUT", default_value = "latency-metrics.json")]
    pub output: PathBuf,

    /// Output format: json, prometheus, or influx
    #[clap(short, long, env = "EBPF_PROBE_FORMAT", default_value = "json")]
    pub format: String,

    /// Sampling rate (1 = capture all events, N = keep 1 in N)
    #[clap(short, long, env = "EBPF_PROBE_SAMPLE_RATE", default_value_t = 1)]
    pub sample_rate: u32,

    /// Network interface to attach the XDP monitor to (optional hook)
    #[clap(long, env = "EBPF_PROBE_INTERFACE", default_value = "eth0")]
    pub interface: String,

    /// Enable kernel-side per-flow rollup instead of per-event RECV records
    #[clap(long, env = "EBPF_PROBE_ROLLUP")]
    pub rollup: bool,

    /// Verbose (debug-level) logging
    #[clap(short, long, env = "EBPF_PROBE_VERBOSE")]
    pub verbose: bool,

    /// Path to a prebuilt eBPF object file (falls back to the embedded
    /// bytecode built via the `embedded` feature if omitted)
    #[clap(long, env = "EBPF_PROBE_EBPF_OBJECT")]
    pub ebpf_object: Option<PathBuf>,

    /// Progress reporting interval, in seconds
    #[clap(long, env = "EBPF_PROBE_PROGRESS_INTERVAL", default_value_t = 10)]
    pub progress_interval: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_with_no_args() {
        let cfg = Config::parse_from(["latency-probe"]);
        assert_eq!(cfg.duration, 60);
        assert_eq!(cfg.sample_rate, 1);
        assert_eq!(cfg.format, "json");
        assert!(!cfg.rollup);
    }

    #[test]
    fn explicit_flags_override_defaults() {
        let cfg = Config::parse_from([
            "latency-probe",
            "--duration",
            "30",
            "--sample-rate",
            "10",
            "--rollup",
        ]);
        assert_eq!(cfg.duration, 30);
        assert_eq!(cfg.sample_rate, 10);
        assert!(cfg.rollup);
    }
}

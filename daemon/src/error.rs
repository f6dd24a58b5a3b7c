//! Error types for the latency probe daemon
//!
//! Leaf errors are typed with `thiserror` so callers can match on them;
//! everything else threads through as `anyhow::Error` with `.context()`
//! added at each call site.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to read eBPF object file {path:?}")]
    EbpfObjectRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to load eBPF program")]
    EbpfLoad(#[source] aya::EbpfError),

    #[error("required program {0} not found in eBPF object")]
    ProgramNotFound(&'static str),

    #[error("failed to attach required hook {hook}")]
    RequiredHookAttach {
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("sample rate must be >= 1, got {0}")]
    InvalidSampleRate(u32),

    #[error("unsupported export format '{0}', use json, prometheus, or influx")]
    UnsupportedFormat(String),

    #[error("failed to write metrics to {path:?}")]
    ExportWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize metrics")]
    Serialize(#[source] serde_json::Error),
}

/// Process exit codes, distinct from panics or untyped failures.
///
/// A caller scripting around this binary can distinguish "ran fine",
/// "bad arguments or I/O", "kernel object or attach failure", "missing
/// capabilities", and "cancelled by signal" without parsing log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    GenericError = 1,
    LoadFailure = 2,
    PermissionFailure = 3,
    Cancelled = 130,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

//! Shared types and constants for the TCP latency probe
//!
//! This crate provides the common data structures, constants, and
//! utilities shared between the `kernel` eBPF programs and the
//! `daemon` userspace loader/collector/exporter.

#![no_std]

pub mod types;
pub mod constants;

pub use types::{ConnectionKey, FlowKey, LatencyEvent, PerFlowAgg, ProbeConfig, XdpConnStats};
pub use constants::*;

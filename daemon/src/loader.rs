//! eBPF program loader
//!
//! Loads the compiled object, attaches kprobes/tracepoints/XDP, and
//! gives the rest of the daemon typed access to the maps. Hooks are
//! split into hard-required (send/recv — without them there is no
//! probe) and soft/optional (cleanup, drop, state, XDP) which degrade
//! to a logged warning instead of a startup failure.

use crate::error::ProbeError;
use crate::types::{kernel::ConnectionState, ProbeHealth};
use anyhow::{Context, Result};
use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::{Array, HashMap as AyaHashMap, MapData, PerCpuArray};
use aya::programs::{KProbe, TracePoint, Xdp, XdpFlags};
use aya::Bpf;
use log::{info, warn};
use probe_common::constants::*;
use probe_common::types::{FlowKey, PerFlowAgg, ProbeConfig};
use std::path::PathBuf;

/// Result of attaching an optional eBPF program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachResult {
    Attached,
    /// The symbol is genuinely absent from the compiled object.
    NotFound,
    /// The symbol exists but is the wrong program type, or failed to
    /// load/attach once found — distinct from a simply-missing symbol.
    IncompatibleTarget,
}

pub struct ProbeLoader {
    ebpf: Bpf,
}

impl ProbeLoader {
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        info!("loading eBPF program");

        let ebpf = if let Some(obj_path) = path {
            info!("loading eBPF object from {:?}", obj_path);
            let data = std::fs::read(&obj_path).map_err(|source| ProbeError::EbpfObjectRead {
                path: obj_path.clone(),
                source,
            })?;
            Bpf::load(&data).map_err(ProbeError::EbpfLoad)?
        } else {
            #[cfg(feature = "embedded")]
            {
                info!("loading embedded eBPF program");
                let data = include_bytes!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../target/bpfel-unknown-none/release/latency-probe"
                ));
                Bpf::load(data).map_err(ProbeError::EbpfLoad)?
            }
            #[cfg(not(feature = "embedded"))]
            {
                anyhow::bail!(
                    "no eBPF object file provided; pass --ebpf-object or build with the 'embedded' feature"
                );
            }
        };

        info!("eBPF program loaded");
        Ok(Self { ebpf })
    }

    /// Pushes the single-entry runtime configuration into the kernel's
    /// CONFIG map. Must run before the hooks that read it are attached.
    pub fn push_config(&mut self, rollup_mode: bool) -> Result<()> {
        let map = self.ebpf.map_mut("CONFIG").context("CONFIG map not found in eBPF object")?;
        let mut config_map: Array<&mut MapData, ProbeConfig> =
            Array::try_from(map).context("failed to open CONFIG as Array")?;
        config_map
            .set(0, ProbeConfig { rollup_mode: rollup_mode as u32, _padding: 0 }, 0)
            .context("failed to write probe configuration")?;
        Ok(())
    }

    pub fn init_logger(&mut self) {
        warn!("eBPF logger not wired up for aya 0.12 in this build; kernel-side log! calls are dropped");
    }

    /// Attaches tcp_sendmsg and tcp_recvmsg. Failure here is fatal: the
    /// daemon cannot measure anything without both sides of the pairing.
    pub fn attach_required_hooks(&mut self) -> Result<()> {
        info!("attaching required hooks");
        self.attach_kprobe_required("tcp_sendmsg")?;
        self.attach_kprobe_required("tcp_recvmsg")?;
        Ok(())
    }

    fn attach_kprobe_required(&mut self, name: &'static str) -> Result<()> {
        let program: &mut KProbe = self
            .ebpf
            .program_mut(name)
            .ok_or(ProbeError::ProgramNotFound(name))?
            .try_into()
            .with_context(|| format!("{} is not a KProbe program", name))?;
        program.load().with_context(|| format!("failed to load {}", name))?;
        program
            .attach(name, 0)
            .map_err(|source| ProbeError::RequiredHookAttach { hook: name, source: source.into() })?;
        info!("  attached {}", name);
        Ok(())
    }

    /// Attaches cleanup/drop/state/connect/close kprobes. Each one
    /// missing or failing to attach is logged and skipped rather than
    /// treated as a startup failure.
    pub fn attach_soft_hooks(&mut self) -> Result<()> {
        info!("attaching soft hooks");
        for name in ["tcp_cleanup_rbuf", "tcp_drop", "tcp_set_state", "tcp_v4_connect", "tcp_close"] {
            self.attach_kprobe_soft(name);
        }
        Ok(())
    }

    fn attach_kprobe_soft(&mut self, name: &'static str) -> AttachResult {
        let prog = match self.ebpf.program_mut(name) {
            Some(prog) => prog,
            None => {
                warn!("  {} not present in eBPF object (optional)", name);
                return AttachResult::NotFound;
            }
        };

        let program: &mut KProbe = match prog.try_into() {
            Ok(program) => program,
            Err(e) => {
                warn!("  {} is not a KProbe, skipping (optional): {}", name, e);
                return AttachResult::IncompatibleTarget;
            }
        };

        let result: Result<()> = (|| {
            program.load().with_context(|| format!("failed to load {}", name))?;
            program.attach(name, 0).with_context(|| format!("failed to attach {}", name))?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                info!("  attached {}", name);
                AttachResult::Attached
            }
            Err(e) => {
                warn!("  could not attach {} (optional): {}", name, e);
                AttachResult::IncompatibleTarget
            }
        }
    }

    /// Attaches the skb:kfree_skb tracepoint for ambient drop tracking.
    pub fn attach_tracepoints(&mut self) -> Result<AttachResult> {
        info!("attaching tracepoints");

        match self.ebpf.program_mut("kfree_skb_tracepoint") {
            Some(prog) => {
                let program: &mut TracePoint =
                    prog.try_into().context("kfree_skb_tracepoint is not a TracePoint")?;
                program.load().context("failed to load kfree_skb_tracepoint")?;
                match program.attach("skb", "kfree_skb") {
                    Ok(_) => {
                        info!("  attached skb:kfree_skb");
                        Ok(AttachResult::Attached)
                    }
                    Err(e) => {
                        warn!("  could not attach skb:kfree_skb (optional): {}", e);
                        Ok(AttachResult::NotFound)
                    }
                }
            }
            None => {
                warn!("  kfree_skb_tracepoint not present (optional)");
                Ok(AttachResult::NotFound)
            }
        }
    }

    /// Attaches the XDP monitor, falling back through attach modes:
    /// driver (native) -> generic (SKB) -> offload (hardware).
    pub fn attach_xdp(&mut self, interface: &str) -> Result<AttachResult> {
        info!("attaching XDP monitor to {}", interface);

        let program: &mut Xdp = match self.ebpf.program_mut("xdp_packet_monitor") {
            Some(prog) => prog.try_into().context("xdp_packet_monitor is not an Xdp program")?,
            None => {
                warn!("  xdp_packet_monitor not present (optional)");
                return Ok(AttachResult::NotFound);
            }
        };
        program.load().context("failed to load xdp_packet_monitor")?;

        for (mode_name, mode) in [
            ("native", XdpFlags::default()),
            ("generic (SKB_MODE)", XdpFlags::SKB_MODE),
            ("hardware offload", XdpFlags::HW_MODE),
        ] {
            match program.attach(interface, mode) {
                Ok(_) => {
                    info!("  attached XDP to {} in {} mode", interface, mode_name);
                    return Ok(AttachResult::Attached);
                }
                Err(e) => {
                    warn!("  XDP attach in {} mode failed: {}", mode_name, e);
                }
            }
        }

        warn!("  all XDP attach modes failed; continuing without NIC-level packet counters");
        Ok(AttachResult::NotFound)
    }

    pub fn get_latency_events(&mut self) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self.ebpf.take_map("EVENTS").context("EVENTS map not found in eBPF object")?;
        AsyncPerfEventArray::try_from(map).context("failed to open EVENTS as AsyncPerfEventArray")
    }

    pub fn get_packet_drop_events(&mut self) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self.ebpf.take_map("PACKET_DROPS").context("PACKET_DROPS map not found in eBPF object")?;
        AsyncPerfEventArray::try_from(map).context("failed to open PACKET_DROPS as AsyncPerfEventArray")
    }

    /// Sums the per-CPU SelfStats counters into a userspace-facing
    /// health summary.
    pub fn read_self_stats(&self) -> Result<ProbeHealth> {
        let map = self.ebpf.map("STATS").context("STATS map not found in eBPF object")?;
        let stats: PerCpuArray<&MapData, u64> =
            PerCpuArray::try_from(map).context("failed to open STATS as PerCpuArray")?;

        let sum_slot = |slot: u32| -> u64 {
            stats
                .get(&slot, 0)
                .map(|values| values.iter().sum())
                .unwrap_or(0)
        };

        Ok(ProbeHealth {
            events_dropped: sum_slot(STAT_EVENTS_DROPPED),
            lookup_misses: sum_slot(STAT_LOOKUP_MISSES),
            elapsed_anomalies: sum_slot(STAT_ELAPSED_ANOMALIES),
            invalid_sockets: sum_slot(STAT_INVALID_SOCKETS),
        })
    }

    /// Snapshots the kernel-side per-flow rollup (only populated in
    /// rollup mode).
    pub fn read_per_flow_agg(&self) -> Result<Vec<(FlowKey, PerFlowAgg)>> {
        let map = self.ebpf.map("PER_FLOW_AGG").context("PER_FLOW_AGG map not found in eBPF object")?;
        let agg: AyaHashMap<&MapData, FlowKey, PerFlowAgg> =
            AyaHashMap::try_from(map).context("failed to open PER_FLOW_AGG as HashMap")?;

        agg.iter()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to iterate PER_FLOW_AGG")
    }

    /// Snapshots ambient connection lifecycle state.
    pub fn read_connection_states(&self) -> Result<Vec<ConnectionState>> {
        let map = self
            .ebpf
            .map("CONNECTION_STATES")
            .context("CONNECTION_STATES map not found in eBPF object")?;
        let states: AyaHashMap<&MapData, probe_common::types::ConnectionKey, ConnectionState> =
            AyaHashMap::try_from(map).context("failed to open CONNECTION_STATES as HashMap")?;

        states
            .iter()
            .map(|entry| entry.map(|(_, state)| state))
            .collect::<Result<Vec<_>, _>>()
            .context("failed to iterate CONNECTION_STATES")
    }

    pub fn ebpf(&mut self) -> &mut Bpf {
        &mut self.ebpf
    }
}

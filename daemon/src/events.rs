//! Event processing from eBPF perf buffers
//!
//! Spawns one reader task per CPU, each owning a private `CollectorShard`
//! so readers never contend with each other. Readers stop as soon as
//! the shutdown watch fires; callers give them a bounded grace period
//! to drain whatever is already sitting in the ring before snapshotting.

use crate::collector::{Aggregate, CollectorShard};
use crate::types::{self, kernel::PacketDropEvent, LatencyEvent};
use anyhow::Result;
use aya::maps::perf::AsyncPerfEventArray;
use aya::util::online_cpus;
use bytes::BytesMut;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, Duration};

const BUFFERS_PER_CPU: usize = 10;

/// A ring read error is retried once; a second consecutive failure
/// gives up on that ring for the remainder of the run.
const MAX_CONSECUTIVE_RING_ERRORS: u32 = 2;

/// Drives per-CPU perf buffer readers and periodic progress reporting.
pub struct EventProcessor {
    shards: Vec<Arc<Mutex<CollectorShard>>>,
    verbose: bool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    parse_errors: Arc<AtomicU64>,
    ring_errors: Arc<AtomicU64>,
}

impl EventProcessor {
    pub fn new(sample_rate: u32, verbose: bool) -> Result<Self> {
        let cpu_count = online_cpus()?.len();
        let shards = (0..cpu_count)
            .map(|_| Arc::new(Mutex::new(CollectorShard::new(sample_rate))))
            .collect();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(EventProcessor {
            shards,
            verbose,
            shutdown_tx,
            shutdown_rx,
            parse_errors: Arc::new(AtomicU64::new(0)),
            ring_errors: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Total (deserialization-skip, ring-read) error counts accumulated
    /// across all readers so far.
    pub fn error_counts(&self) -> (u64, u64) {
        (self.parse_errors.load(Ordering::Relaxed), self.ring_errors.load(Ordering::Relaxed))
    }

    /// Spawns one task per CPU reading LatencyEvents into that CPU's shard.
    pub async fn spawn_latency_readers(&self, mut perf_array: AsyncPerfEventArray<aya::maps::MapData>) -> Result<()> {
        let cpus = online_cpus()?;
        info!("Spawning latency readers for {} CPUs", cpus.len());

        for cpu_id in cpus {
            let mut buf = perf_array.open(cpu_id, None)?;
            let shard = Arc::clone(&self.shards[cpu_id as usize]);
            let verbose = self.verbose;
            let mut shutdown_rx = self.shutdown_rx.clone();
            let parse_errors = Arc::clone(&self.parse_errors);
            let ring_errors = Arc::clone(&self.ring_errors);

            tokio::spawn(async move {
                let event_size = std::mem::size_of::<LatencyEvent>();
                let mut buffers =
                    (0..BUFFERS_PER_CPU).map(|_| BytesMut::with_capacity(event_size)).collect::<Vec<_>>();
                let mut consecutive_errors = 0u32;

                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                debug!("CPU {} latency reader stopping", cpu_id);
                                break;
                            }
                        }
                        result = buf.read_events(&mut buffers) => {
                            let events = match result {
                                Ok(events) => {
                                    consecutive_errors = 0;
                                    events
                                }
                                Err(e) => {
                                    ring_errors.fetch_add(1, Ordering::Relaxed);
                                    consecutive_errors += 1;
                                    if consecutive_errors >= MAX_CONSECUTIVE_RING_ERRORS {
                                        error!(
                                            "CPU {} latency ring failed twice in a row ({}), giving up on this ring",
                                            cpu_id, e
                                        );
                                        break;
                                    }
                                    warn!("error reading latency events from CPU {}: {}, retrying once", cpu_id, e);
                                    continue;
                                }
                            };

                            for b in buffers.iter_mut().take(events.read) {
                                if b.len() < event_size {
                                    parse_errors.fetch_add(1, Ordering::Relaxed);
                                    continue;
                                }
                                let ptr = b.as_ptr() as *const LatencyEvent;
                                let event = unsafe { ptr.read_unaligned() };

                                if verbose {
                                    debug!(
                                        "event kind={} latency_us={:.2} flow={}",
                                        event.kind,
                                        event.latency_ns as f64 / 1000.0,
                                        types::flow_key_to_string(&event.key()),
                                    );
                                }

                                shard.lock().await.add_event(&event);
                            }
                        }
                    }
                }
            });
        }

        Ok(())
    }

    /// Spawns one task per CPU reading PacketDropEvents into that CPU's shard.
    pub async fn spawn_packet_drop_readers(
        &self,
        mut perf_array: AsyncPerfEventArray<aya::maps::MapData>,
    ) -> Result<()> {
        let cpus = online_cpus()?;

        for cpu_id in cpus {
            let mut buf = perf_array.open(cpu_id, None)?;
            let shard = Arc::clone(&self.shards[cpu_id as usize]);
            let mut shutdown_rx = self.shutdown_rx.clone();
            let parse_errors = Arc::clone(&self.parse_errors);
            let ring_errors = Arc::clone(&self.ring_errors);

            tokio::spawn(async move {
                let event_size = std::mem::size_of::<PacketDropEvent>();
                let mut buffers =
                    (0..BUFFERS_PER_CPU).map(|_| BytesMut::with_capacity(event_size)).collect::<Vec<_>>();
                let mut consecutive_errors = 0u32;

                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                        result = buf.read_events(&mut buffers) => {
                            let events = match result {
                                Ok(events) => {
                                    consecutive_errors = 0;
                                    events
                                }
                                Err(e) => {
                                    ring_errors.fetch_add(1, Ordering::Relaxed);
                                    consecutive_errors += 1;
                                    if consecutive_errors >= MAX_CONSECUTIVE_RING_ERRORS {
                                        error!(
                                            "CPU {} packet-drop ring failed twice in a row ({}), giving up on this ring",
                                            cpu_id, e
                                        );
                                        break;
                                    }
                                    warn!("error reading packet drop events from CPU {}: {}, retrying once", cpu_id, e);
                                    continue;
                                }
                            };

                            for b in buffers.iter_mut().take(events.read) {
                                if b.len() < event_size {
                                    parse_errors.fetch_add(1, Ordering::Relaxed);
                                    continue;
                                }
                                let ptr = b.as_ptr() as *const PacketDropEvent;
                                let event = unsafe { ptr.read_unaligned() };
                                shard.lock().await.add_packet_drop(&event);
                            }
                        }
                    }
                }
            });
        }

        Ok(())
    }

    /// Spawns a task that logs a merged progress snapshot on an interval.
    pub fn spawn_progress_reporter(&self, interval_secs: u64) {
        let shards = self.shards.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let aggregate = Self::snapshot(&shards).await;
                        let percentiles = aggregate.generate_metrics(0).percentiles;
                        info!(
                            "progress: {} events, {} flows, p50={:.1}us p95={:.1}us p99={:.1}us, drops={}",
                            aggregate.event_count(),
                            aggregate.connection_count(),
                            percentiles.p50,
                            percentiles.p95,
                            percentiles.p99,
                            aggregate.packet_drops().total_drops,
                        );
                    }
                }
            }
        });
    }

    /// Signals every reader/reporter task to stop at its next poll.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Merges all per-CPU shards into one snapshot.
    pub async fn snapshot(shards: &[Arc<Mutex<CollectorShard>>]) -> Aggregate {
        let mut aggregate = Aggregate::default();
        for shard in shards {
            let guard = shard.lock().await;
            aggregate.merge_shard(&guard);
        }
        aggregate
    }

    pub async fn aggregate(&self) -> Aggregate {
        Self::snapshot(&self.shards).await
    }
}

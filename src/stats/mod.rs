//! Per-channel counters shared between workers and the immutable snapshots taken from them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::channel::ChannelKind;

/// Counters for one channel. Written by the channel's owning worker, read by everyone else.
///
/// All counters only ever increase for the lifetime of the channel.
#[derive(Debug)]
pub struct ChannelCounters {
    kind: ChannelKind,
    origin: Instant,
    packets: AtomicU64,
    bytes: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
    // Milliseconds since `origin` plus one; zero means no activity yet.
    last_activity: AtomicU64,
    degraded: AtomicBool,
    failed: AtomicBool,
}

impl ChannelCounters {
    fn new(kind: ChannelKind, origin: Instant) -> Self {
        Self {
            kind,
            origin,
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            last_activity: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn touch(&self) {
        let since_origin = self.origin.elapsed().as_millis() as u64 + 1;
        self.last_activity.fetch_max(since_origin, Ordering::Relaxed);
    }

    /// One datagram of `len` bytes was delivered to its destination.
    pub fn record_forwarded(&self, len: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Process-level traffic approximation for channels whose transport is owned elsewhere.
    pub fn record_progress(&self, packets: u64, bytes: u64) {
        if packets == 0 && bytes == 0 {
            return;
        }
        self.packets.fetch_add(packets, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A datagram was received but had nowhere to go or was refused.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the previous value so callers can log only on change.
    pub fn set_degraded(&self, degraded: bool) -> bool {
        self.degraded.swap(degraded, Ordering::Relaxed)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Relaxed);
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn snapshot(&self, now: Instant) -> ChannelSnapshot {
        let last_activity = self.last_activity.load(Ordering::Relaxed);
        let idle_ms = (last_activity > 0).then(|| {
            let since_origin = now.saturating_duration_since(self.origin).as_millis() as u64;
            since_origin.saturating_sub(last_activity - 1)
        });

        ChannelSnapshot {
            channel: self.kind,
            packets: self.packets(),
            bytes: self.bytes(),
            errors: self.errors(),
            dropped: self.dropped(),
            degraded: self.is_degraded(),
            failed: self.is_failed(),
            idle_ms,
        }
    }
}

/// Statistics shared by every worker of one relay run.
#[derive(Debug)]
pub struct StatsAggregator {
    started_at: Instant,
    started_wall: DateTime<Utc>,
    channels: DashMap<ChannelKind, Arc<ChannelCounters>, ahash::RandomState>,
    heartbeats_sent: AtomicU64,
    heartbeat_errors: AtomicU64,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            started_wall: Utc::now(),
            channels: DashMap::default(),
            heartbeats_sent: AtomicU64::new(0),
            heartbeat_errors: AtomicU64::new(0),
        }
    }

    /// Counters for `kind`, created on first use. Repeated calls return the same counters.
    pub fn register(&self, kind: ChannelKind) -> Arc<ChannelCounters> {
        self.channels
            .entry(kind)
            .or_insert_with(|| Arc::new(ChannelCounters::new(kind, self.started_at)))
            .clone()
    }

    pub fn channel(&self, kind: ChannelKind) -> Option<Arc<ChannelCounters>> {
        self.channels.get(&kind).map(|entry| Arc::clone(entry.value()))
    }

    pub fn record_heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heartbeat_error(&self) {
        self.heartbeat_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// A point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let now = Instant::now();
        let mut channels: Vec<ChannelSnapshot> = self
            .channels
            .iter()
            .map(|entry| entry.value().snapshot(now))
            .collect();
        channels.sort_by_key(|channel| channel.channel);

        StatisticsSnapshot {
            captured_at: Utc::now(),
            started_at: self.started_wall,
            uptime_secs: now.saturating_duration_since(self.started_at).as_secs(),
            channels,
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeat_errors: self.heartbeat_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub channel: ChannelKind,
    pub packets: u64,
    pub bytes: u64,
    pub errors: u64,
    pub dropped: u64,
    pub degraded: bool,
    pub failed: bool,
    /// Milliseconds since the last forwarded datagram, absent if nothing was forwarded yet.
    pub idle_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub channels: Vec<ChannelSnapshot>,
    pub heartbeats_sent: u64,
    pub heartbeat_errors: u64,
}

impl StatisticsSnapshot {
    pub fn channel(&self, kind: ChannelKind) -> Option<&ChannelSnapshot> {
        self.channels.iter().find(|channel| channel.channel == kind)
    }

    pub fn total_errors(&self) -> u64 {
        self.channels.iter().map(|channel| channel.errors).sum::<u64>() + self.heartbeat_errors
    }
}

fn format_uptime(secs: u64) -> String {
    let (hours, rest) = (secs / 3600, secs % 3600);
    format!("{hours}h{:02}m{:02}s", rest / 60, rest % 60)
}

impl fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uptime={}", format_uptime(self.uptime_secs))?;
        for channel in &self.channels {
            write!(
                f,
                " {}[pkts={} bytes={} errs={} dropped={}",
                channel.channel, channel.packets, channel.bytes, channel.errors, channel.dropped
            )?;
            if channel.failed {
                f.write_str(" FAILED")?;
            } else if channel.degraded {
                f.write_str(" DEGRADED")?;
            }
            f.write_str("]")?;
        }
        write!(
            f,
            " heartbeats={} heartbeat_errs={}",
            self.heartbeats_sent, self.heartbeat_errors
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let stats = StatsAggregator::new();
        let a = stats.register(ChannelKind::Command);
        let b = stats.register(ChannelKind::Command);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(stats.channel(ChannelKind::Video).is_none());
    }

    #[test]
    fn test_snapshot_copies_counters() {
        let stats = StatsAggregator::new();
        let telemetry = stats.register(ChannelKind::Telemetry);
        let command = stats.register(ChannelKind::Command);

        telemetry.record_forwarded(10);
        telemetry.record_forwarded(5);
        command.record_error();
        command.record_dropped();
        stats.record_heartbeat_sent();

        let snapshot = stats.snapshot();

        // Later updates are not visible in an already taken snapshot
        telemetry.record_forwarded(100);

        let channels: Vec<_> = snapshot.channels.iter().map(|c| c.channel).collect();
        assert_eq!(channels, vec![ChannelKind::Command, ChannelKind::Telemetry]);

        let telemetry_snapshot = snapshot.channel(ChannelKind::Telemetry).unwrap();
        assert_eq!(telemetry_snapshot.packets, 2);
        assert_eq!(telemetry_snapshot.bytes, 15);
        assert!(telemetry_snapshot.idle_ms.is_some());

        let command_snapshot = snapshot.channel(ChannelKind::Command).unwrap();
        assert_eq!(command_snapshot.errors, 1);
        assert_eq!(command_snapshot.dropped, 1);
        assert!(command_snapshot.idle_ms.is_none());

        assert_eq!(snapshot.heartbeats_sent, 1);
        assert_eq!(snapshot.total_errors(), 1);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let stats = Arc::new(StatsAggregator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counters = stats.register(ChannelKind::Telemetry);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.record_forwarded(3);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = stats.snapshot();
        let telemetry = snapshot.channel(ChannelKind::Telemetry).unwrap();
        assert_eq!(telemetry.packets, 8000);
        assert_eq!(telemetry.bytes, 24000);
    }

    #[test]
    fn test_degraded_flag_reports_previous() {
        let stats = StatsAggregator::new();
        let counters = stats.register(ChannelKind::Command);
        assert!(!counters.set_degraded(true));
        assert!(counters.set_degraded(true));
        assert!(counters.set_degraded(false));
    }

    #[test]
    fn test_summary_line() {
        let stats = StatsAggregator::new();
        let video = stats.register(ChannelKind::Video);
        video.record_progress(3, 4096);
        video.mark_failed();

        let line = stats.snapshot().to_string();
        assert!(line.starts_with("uptime=0h00m"));
        assert!(line.contains("video[pkts=3 bytes=4096 errs=0 dropped=0 FAILED]"));
    }
}

//! Per-path counters and the atomically-written JSON snapshot.
//!
//! Counters are written only by their owning task and read by the
//! supervisor for export; torn reads are acceptable for best-effort
//! monotonic counters. `AtomicU64` with `Relaxed` ordering gives that
//! at the same cost as a plain integer, without the undefined behavior
//! of racily reading/writing a non-atomic value across threads.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Default)]
pub struct PathStats {
    pub goose_to_ip: AtomicU64,
    pub ip_to_goose: AtomicU64,
    pub goose_received: AtomicU64,
    pub vlan_goose_received: AtomicU64,
    pub goose_sent: AtomicU64,
    pub raw_frames: AtomicU64,
    pub errors: AtomicU64,
}

impl PathStats {
    pub fn snapshot(&self) -> PathStatsSnapshot {
        PathStatsSnapshot {
            goose_to_ip: self.goose_to_ip.load(Ordering::Relaxed),
            ip_to_goose: self.ip_to_goose.load(Ordering::Relaxed),
            goose_received: self.goose_received.load(Ordering::Relaxed),
            vlan_goose_received: self.vlan_goose_received.load(Ordering::Relaxed),
            goose_sent: self.goose_sent.load(Ordering::Relaxed),
            raw_frames: self.raw_frames.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

}

#[derive(Debug, Clone, Serialize)]
pub struct PathStatsSnapshot {
    pub goose_to_ip: u64,
    pub ip_to_goose: u64,
    pub goose_received: u64,
    pub vlan_goose_received: u64,
    pub goose_sent: u64,
    pub raw_frames: u64,
    pub errors: u64,
}

/// Liveness counters owned by the IGMP controller.
#[derive(Default)]
pub struct IgmpStats {
    pub keepalive_count: AtomicU64,
    pub reregister_count: AtomicU64,
    pub monitor_checks: AtomicU64,
    pub tgw_missing_count: AtomicU64,
    pub local_missing_count: AtomicU64,
    pub consecutive_missing: AtomicU64,
    pub last_tgw_check_success: AtomicBool,
}

impl IgmpStats {
    pub fn snapshot(&self) -> IgmpStatsSnapshot {
        IgmpStatsSnapshot {
            keepalive_count: self.keepalive_count.load(Ordering::Relaxed),
            reregister_count: self.reregister_count.load(Ordering::Relaxed),
            monitor_checks: self.monitor_checks.load(Ordering::Relaxed),
            tgw_missing_count: self.tgw_missing_count.load(Ordering::Relaxed),
            local_missing_count: self.local_missing_count.load(Ordering::Relaxed),
            consecutive_missing: self.consecutive_missing.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IgmpStatsSnapshot {
    pub keepalive_count: u64,
    pub reregister_count: u64,
    pub monitor_checks: u64,
    pub tgw_missing_count: u64,
    pub local_missing_count: u64,
    pub consecutive_missing: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PathSnapshot {
    pub name: &'static str,
    pub dataplane: PathStatsSnapshot,
    pub igmp: IgmpStatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub timestamp: u64,
    pub service: &'static str,
    pub paths: Vec<PathSnapshot>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl StatsSnapshot {
    pub fn new(paths: Vec<PathSnapshot>) -> Self {
        StatsSnapshot {
            timestamp: unix_now(),
            service: "goose-bridge",
            paths,
        }
    }

    /// Atomic write: serialize to `<file>.tmp`, then rename over `file`.
    /// A rename is atomic on the same filesystem, so readers of `file`
    /// never observe a half-written snapshot.
    pub async fn write_atomic(&self, file: &std::path::Path) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(self).expect("StatsSnapshot always serializes");
        let tmp = file.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, file).await
    }
}

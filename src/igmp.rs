//! IGMP liveness controller: periodically refreshes group membership
//! and reconciles two independent oracles (the kernel's local IGMP
//! table and the cloud provider's multicast-domain registry) behind a
//! `LivenessOracle` seam (`local_has_group` / `remote_has_group`) so a
//! non-AWS backend can plug in without touching the state machine.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::stats::IgmpStats;

const KEEPALIVE_DROP_REJOIN_DELAY: Duration = Duration::from_millis(100);
const REMOTE_CHECK_TIMEOUT: Duration = Duration::from_secs(15);
const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Healthy,
    Warning,
    Reregistering,
}

#[derive(Debug)]
pub struct OracleError(pub String);

impl std::fmt::Display for OracleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for OracleError {}

/// The two oracles the monitor loop reconciles: the kernel's local IGMP
/// table and the cloud provider's multicast-domain registry.
pub trait LivenessOracle: Send + Sync {
    fn local_has_group(
        &self,
        group: Ipv4Addr,
    ) -> impl std::future::Future<Output = bool> + Send;

    fn remote_has_group(
        &self,
        domain_id: &str,
        group: Ipv4Addr,
    ) -> impl std::future::Future<Output = Result<bool, OracleError>> + Send;
}

/// Converts a dotted-quad multicast IP into the little-endian hex form
/// the kernel prints in `/proc/net/igmp`. `224.0.1.100` -> `"640100E0"`:
/// take the network-order octets and read them back in host
/// (little-endian) byte order, i.e. reverse the octet order, not the
/// digits within an octet.
pub fn igmp_hex_form(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("{:02X}{:02X}{:02X}{:02X}", o[3], o[2], o[1], o[0])
}

/// Default oracle: `/proc/net/igmp` for the local check, the `aws ec2
/// search-transit-gateway-multicast-groups` CLI for the remote check.
pub struct ProcfsAwsOracle {
    pub procfs_path: String,
}

impl Default for ProcfsAwsOracle {
    fn default() -> Self {
        ProcfsAwsOracle {
            procfs_path: "/proc/net/igmp".to_string(),
        }
    }
}

impl LivenessOracle for ProcfsAwsOracle {
    async fn local_has_group(&self, group: Ipv4Addr) -> bool {
        let target_hex = igmp_hex_form(group);
        match tokio::fs::read_to_string(&self.procfs_path).await {
            Ok(content) => content.contains(&target_hex),
            Err(e) => {
                tracing::error!(error = %e, path = %self.procfs_path, "failed to read local IGMP table");
                false
            }
        }
    }

    async fn remote_has_group(&self, domain_id: &str, group: Ipv4Addr) -> Result<bool, OracleError> {
        let group_str = group.to_string();
        let run = tokio::process::Command::new("aws")
            .args([
                "ec2",
                "search-transit-gateway-multicast-groups",
                "--transit-gateway-multicast-domain-id",
                domain_id,
                "--filters",
                &format!("Name=group-ip-address,Values={group_str}"),
                "--output",
                "json",
            ])
            .output();

        let output = timeout(REMOTE_CHECK_TIMEOUT, run)
            .await
            .map_err(|_| OracleError("timed out querying transit gateway multicast groups".into()))?
            .map_err(|e| OracleError(e.to_string()))?;

        if !output.status.success() {
            return Err(OracleError(String::from_utf8_lossy(&output.stderr).into_owned()));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| OracleError(format!("invalid JSON from aws cli: {e}")))?;
        let groups_len = parsed
            .get("MulticastGroups")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        Ok(groups_len > 0)
    }
}

fn new_joined_aux_socket(group: Ipv4Addr) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    Ok(socket)
}

pub struct IgmpController<O: LivenessOracle> {
    path_name: &'static str,
    group: Ipv4Addr,
    domain_id: String,
    oracle: O,
    keepalive_interval: Duration,
    monitor_interval: Duration,
    reregister_threshold: u32,
    enable_tgw_monitoring: bool,
    running: Arc<AtomicBool>,
    aux_socket: Mutex<Socket>,
    stats: Arc<IgmpStats>,
    state: Mutex<LivenessState>,
}

impl<O: LivenessOracle> IgmpController<O> {
    pub fn new(
        path_name: &'static str,
        group: Ipv4Addr,
        domain_id: String,
        oracle: O,
        keepalive_interval: Duration,
        monitor_interval: Duration,
        reregister_threshold: u32,
        enable_tgw_monitoring: bool,
        running: Arc<AtomicBool>,
        stats: Arc<IgmpStats>,
    ) -> std::io::Result<Self> {
        let aux_socket = new_joined_aux_socket(group)?;
        stats.last_tgw_check_success.store(true, Ordering::Relaxed);
        Ok(IgmpController {
            path_name,
            group,
            domain_id,
            oracle,
            keepalive_interval,
            monitor_interval,
            reregister_threshold,
            enable_tgw_monitoring,
            running,
            aux_socket: Mutex::new(aux_socket),
            stats,
            state: Mutex::new(LivenessState::Healthy),
        })
    }

    pub fn state(&self) -> LivenessState {
        // best-effort snapshot; only used for observability/tests
        self.state.try_lock().map(|s| *s).unwrap_or(LivenessState::Healthy)
    }

    async fn sleep_in_ticks(&self, total: Duration) {
        let mut remaining = total;
        while remaining > Duration::ZERO && self.running.load(Ordering::Relaxed) {
            let step = remaining.min(TICK);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }

    /// Keepalive loop: drop and rejoin every `keepalive_interval`.
    pub async fn run_keepalive(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            self.perform_keepalive().await;
            self.sleep_in_ticks(self.keepalive_interval).await;
        }
    }

    async fn perform_keepalive(&self) {
        let guard = self.aux_socket.lock().await;
        if let Err(e) = guard.leave_multicast_v4(&self.group, &Ipv4Addr::UNSPECIFIED) {
            tracing::warn!(path = self.path_name, error = %e, "IGMP keepalive: leave failed");
        }
        drop(guard);
        tokio::time::sleep(KEEPALIVE_DROP_REJOIN_DELAY).await;
        let guard = self.aux_socket.lock().await;
        if let Err(e) = guard.join_multicast_v4(&self.group, &Ipv4Addr::UNSPECIFIED) {
            tracing::warn!(path = self.path_name, error = %e, "IGMP keepalive: rejoin failed");
        }
        self.stats.keepalive_count.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(path = self.path_name, "IGMP keepalive refreshed");
    }

    /// Monitor loop: dual-oracle check, forced re-register on sustained
    /// absence.
    pub async fn run_monitor(self: Arc<Self>) {
        while self.running.load(Ordering::Relaxed) {
            self.perform_monitoring().await;
            self.sleep_in_ticks(self.monitor_interval).await;
        }
    }

    async fn perform_monitoring(&self) {
        self.stats.monitor_checks.fetch_add(1, Ordering::Relaxed);

        let local_registered = self.oracle.local_has_group(self.group).await;
        if !local_registered {
            self.stats.local_missing_count.fetch_add(1, Ordering::Relaxed);
        }

        let remote_registered = if self.enable_tgw_monitoring {
            match self.oracle.remote_has_group(&self.domain_id, self.group).await {
                Ok(present) => {
                    self.stats.last_tgw_check_success.store(present, Ordering::Relaxed);
                    if !present {
                        self.stats.tgw_missing_count.fetch_add(1, Ordering::Relaxed);
                    }
                    present
                }
                Err(e) => {
                    tracing::error!(path = self.path_name, error = %e, "remote oracle check failed, keeping previous verdict");
                    self.stats.last_tgw_check_success.load(Ordering::Relaxed)
                }
            }
        } else {
            true
        };

        if !local_registered || !remote_registered {
            let missing = self.stats.consecutive_missing.fetch_add(1, Ordering::Relaxed) + 1;
            *self.state.lock().await = if missing >= self.reregister_threshold as u64 {
                LivenessState::Reregistering
            } else {
                LivenessState::Warning
            };

            if missing >= self.reregister_threshold as u64 {
                tracing::warn!(
                    path = self.path_name,
                    consecutive_missing = missing,
                    "IGMP membership missing for threshold consecutive checks, forcing re-register"
                );
                self.force_reregister().await;
                self.stats.consecutive_missing.store(0, Ordering::Relaxed);
                *self.state.lock().await = LivenessState::Healthy;
            }
        } else {
            if self.stats.consecutive_missing.swap(0, Ordering::Relaxed) > 0 {
                tracing::info!(path = self.path_name, "IGMP registration recovered");
            }
            *self.state.lock().await = LivenessState::Healthy;
        }
    }

    async fn force_reregister(&self) {
        match new_joined_aux_socket(self.group) {
            Ok(new_socket) => {
                let mut guard = self.aux_socket.lock().await;
                *guard = new_socket;
                self.stats.reregister_count.fetch_add(1, Ordering::Relaxed);
                tracing::info!(path = self.path_name, "IGMP membership forcibly re-registered");
            }
            Err(e) => {
                tracing::error!(path = self.path_name, error = %e, "failed to build replacement IGMP socket");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_form_matches_spec_example() {
        assert_eq!(igmp_hex_form("224.0.1.100".parse().unwrap()), "640100E0");
    }

    #[test]
    fn hex_form_is_not_naive_digit_reversal() {
        // A naive "reverse the string" would produce "001.0.001.422"
        // nonsense; the correct transform reverses octet order only.
        let hex = igmp_hex_form("10.20.30.40".parse().unwrap());
        assert_eq!(hex, "281E140A");
    }

    struct ScriptedOracle {
        local: Vec<bool>,
        remote: Vec<Result<bool, ()>>,
        idx: std::sync::atomic::AtomicUsize,
    }

    impl LivenessOracle for ScriptedOracle {
        async fn local_has_group(&self, _group: Ipv4Addr) -> bool {
            let i = self.idx.load(Ordering::Relaxed);
            *self.local.get(i).unwrap_or(&true)
        }

        async fn remote_has_group(&self, _domain_id: &str, _group: Ipv4Addr) -> Result<bool, OracleError> {
            let i = self.idx.fetch_add(1, Ordering::Relaxed);
            match self.remote.get(i).unwrap_or(&Ok(true)) {
                Ok(b) => Ok(*b),
                Err(_) => Err(OracleError("boom".into())),
            }
        }
    }

    #[tokio::test]
    async fn forces_reregister_after_threshold_consecutive_misses() {
        let oracle = ScriptedOracle {
            local: vec![false, false, true],
            remote: vec![Ok(false), Ok(false), Ok(true)],
            idx: std::sync::atomic::AtomicUsize::new(0),
        };
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(IgmpStats::default());
        let controller = IgmpController::new(
            "primary",
            "224.0.1.100".parse().unwrap(),
            "tgw-mcast-domain-test".into(),
            oracle,
            Duration::from_secs(90),
            Duration::from_secs(120),
            2,
            true,
            running,
            stats.clone(),
        )
        .unwrap();

        controller.perform_monitoring().await; // miss #1 -> Warning
        assert_eq!(stats.reregister_count.load(Ordering::Relaxed), 0);
        assert_eq!(stats.consecutive_missing.load(Ordering::Relaxed), 1);

        controller.perform_monitoring().await; // miss #2 -> reregister
        assert_eq!(stats.reregister_count.load(Ordering::Relaxed), 1);
        assert_eq!(stats.consecutive_missing.load(Ordering::Relaxed), 0);

        controller.perform_monitoring().await; // both present -> unchanged
        assert_eq!(stats.reregister_count.load(Ordering::Relaxed), 1);
        assert_eq!(stats.consecutive_missing.load(Ordering::Relaxed), 0);
    }
}

//! Supervisor: instantiates the two independent (TAP + multicast +
//! relay) stacks and one IGMP controller per path, starts/stops them,
//! and aggregates stats.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::BridgeError;
use crate::igmp::{IgmpController, ProcfsAwsOracle};
use crate::mcast::{self, MulticastEndpoint};
use crate::relay::PathRelay;
use crate::stats::{IgmpStats, PathSnapshot, PathStats, StatsSnapshot};
use crate::tap::{self, TapEndpoint};

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const RESOURCE_CREATE_RETRIES: u32 = 3;
const RESOURCE_CREATE_BACKOFF: Duration = Duration::from_millis(500);

/// Retry a resource-creation step (TAP open, multicast join) up to
/// `RESOURCE_CREATE_RETRIES` times with a short fixed backoff between
/// attempts; fatal only once all attempts are exhausted.
async fn create_with_retry<T, F, Fut>(what: &str, mut attempt: F) -> Result<T, BridgeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, BridgeError>>,
{
    let mut last_err = None;
    for n in 1..=RESOURCE_CREATE_RETRIES {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                tracing::warn!(resource = what, attempt = n, error = %e, "resource creation failed, retrying");
                last_err = Some(e);
                if n < RESOURCE_CREATE_RETRIES {
                    tokio::time::sleep(RESOURCE_CREATE_BACKOFF).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt was made"))
}

/// One pump task's liveness flag, set false by the task itself on exit.
/// Polled by the health-check sweep to surface a dead pump (spec §7,
/// "I/O sustained ... supervisor detects via thread liveness") since
/// the supervisor otherwise never looks at a pump again until shutdown.
struct PumpWatch {
    path_name: &'static str,
    direction: &'static str,
    alive: Arc<AtomicBool>,
}

struct Path {
    name: &'static str,
    tap: Arc<TapEndpoint>,
    mcast: Arc<MulticastEndpoint>,
    group: Ipv4Addr,
    dataplane_stats: Arc<PathStats>,
    igmp_stats: Arc<IgmpStats>,
    igmp: Arc<IgmpController<ProcfsAwsOracle>>,
}

impl Path {
    async fn build(
        name: &'static str,
        tap_name: &str,
        tap_ip_template: &str,
        group: Ipv4Addr,
        port: u16,
        domain_id: String,
        local_ip: Ipv4Addr,
        cfg: &Config,
        running: Arc<AtomicBool>,
    ) -> Result<Path, BridgeError> {
        let tap_cidr = tap::derive_tap_cidr(tap_ip_template, local_ip);
        let tap = Arc::new(
            create_with_retry("TAP device", || TapEndpoint::create(tap_name, &tap_cidr)).await?,
        );
        let mcast = Arc::new(
            create_with_retry("multicast endpoint", || async {
                MulticastEndpoint::create(group, port)
            })
            .await?,
        );

        let dataplane_stats = Arc::new(PathStats::default());
        let igmp_stats = Arc::new(IgmpStats::default());

        let igmp = Arc::new(
            IgmpController::new(
                name,
                group,
                domain_id,
                ProcfsAwsOracle::default(),
                Duration::from_secs(cfg.igmp_keepalive_interval),
                Duration::from_secs(cfg.igmp_monitor_interval),
                cfg.igmp_reregister_threshold,
                cfg.enable_tgw_monitoring,
                running,
                igmp_stats.clone(),
            )
            .map_err(|source| BridgeError::MulticastJoin {
                group,
                port,
                source,
            })?,
        );

        Ok(Path {
            name,
            tap,
            mcast,
            group,
            dataplane_stats,
            igmp_stats,
            igmp,
        })
    }

    fn relay(&self, buffer_size: usize, batch_size: usize, local_ip: Ipv4Addr) -> PathRelay {
        PathRelay {
            path_name: self.name,
            tap: self.tap.clone(),
            mcast: self.mcast.clone(),
            stats: self.dataplane_stats.clone(),
            buffer_size,
            batch_size,
            local_ip,
        }
    }

    fn snapshot(&self) -> PathSnapshot {
        PathSnapshot {
            name: self.name,
            dataplane: self.dataplane_stats.snapshot(),
            igmp: self.igmp_stats.snapshot(),
        }
    }
}

pub struct Supervisor {
    cfg: Config,
    running: Arc<AtomicBool>,
    local_ip: Ipv4Addr,
    primary: Path,
    backup: Path,
    handles: Vec<JoinHandle<()>>,
}

fn check_privilege() -> bool {
    unsafe { libc::geteuid() == 0 }
}

impl Supervisor {
    pub async fn new(cfg: Config) -> Result<Supervisor, BridgeError> {
        if !check_privilege() {
            return Err(BridgeError::InsufficientPrivilege);
        }

        let local_ip = mcast::local_outbound_ip().unwrap_or_else(|e| {
            tracing::warn!(
                error = %e,
                "failed to determine outbound source IP; falling back to 0.0.0.0, \
                 which disables the self-loop filter and derives a .0 TAP host octet"
            );
            Ipv4Addr::UNSPECIFIED
        });
        let running = Arc::new(AtomicBool::new(true));

        let primary_group: Ipv4Addr = cfg
            .primary_multicast_ip
            .parse()
            .map_err(|_| BridgeError::Config(format!("invalid primary_multicast_ip: {}", cfg.primary_multicast_ip)))?;
        let backup_group: Ipv4Addr = cfg
            .backup_multicast_ip
            .parse()
            .map_err(|_| BridgeError::Config(format!("invalid backup_multicast_ip: {}", cfg.backup_multicast_ip)))?;

        let primary = Path::build(
            "primary",
            &cfg.primary_interface,
            &cfg.primary_tun_ip,
            primary_group,
            cfg.multicast_port,
            cfg.primary_tgw_multicast_domain_id.clone(),
            local_ip,
            &cfg,
            running.clone(),
        )
        .await?;

        let backup = Path::build(
            "backup",
            &cfg.backup_interface,
            &cfg.backup_tun_ip,
            backup_group,
            cfg.multicast_port,
            cfg.backup_tgw_multicast_domain_id.clone(),
            local_ip,
            &cfg,
            running.clone(),
        )
        .await?;

        Ok(Supervisor {
            cfg,
            running,
            local_ip,
            primary,
            backup,
            handles: Vec::new(),
        })
    }

    /// Spawn all per-path tasks plus the stats-export/health-check
    /// tasks, then block until `shutdown()` clears the running flag.
    pub async fn run(mut self) {
        let mut pump_watch = Vec::new();

        for path in [&self.primary, &self.backup] {
            let relay = path.relay(self.cfg.buffer_size, self.cfg.batch_size, self.local_ip);
            let running = self.running.clone();
            let relay = Arc::new(relay);

            let alive1 = Arc::new(AtomicBool::new(true));
            let r1 = relay.clone();
            let run1 = running.clone();
            let alive1_task = alive1.clone();
            self.handles.push(tokio::spawn(async move {
                r1.run_tap_to_multicast(run1).await;
                alive1_task.store(false, Ordering::Relaxed);
            }));
            pump_watch.push(PumpWatch {
                path_name: path.name,
                direction: "tap->multicast",
                alive: alive1,
            });

            let alive2 = Arc::new(AtomicBool::new(true));
            let r2 = relay.clone();
            let run2 = running.clone();
            let alive2_task = alive2.clone();
            self.handles.push(tokio::spawn(async move {
                r2.run_multicast_to_tap(run2).await;
                alive2_task.store(false, Ordering::Relaxed);
            }));
            pump_watch.push(PumpWatch {
                path_name: path.name,
                direction: "multicast->tap",
                alive: alive2,
            });

            if self.cfg.enable_igmp_keepalive {
                let igmp1 = path.igmp.clone();
                self.handles.push(tokio::spawn(async move { igmp1.run_keepalive().await }));
                let igmp2 = path.igmp.clone();
                self.handles.push(tokio::spawn(async move { igmp2.run_monitor().await }));
            }
        }

        self.handles.push(self.spawn_stats_export());
        self.handles.push(self.spawn_health_check(pump_watch));

        while self.running.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        self.shutdown().await;
    }

    fn spawn_stats_export(&self) -> JoinHandle<()> {
        let running = self.running.clone();
        let interval = Duration::from_secs(self.cfg.stats_export_interval.max(1));
        let stats_file = std::path::PathBuf::from(self.cfg.stats_file.clone());
        let primary = (self.primary.dataplane_stats.clone(), self.primary.igmp_stats.clone(), self.primary.name);
        let backup = (self.backup.dataplane_stats.clone(), self.backup.igmp_stats.clone(), self.backup.name);

        tokio::spawn(async move {
            while running.load(Ordering::Relaxed) {
                tokio::time::sleep(interval).await;
                if !running.load(Ordering::Relaxed) {
                    break;
                }
                let snapshot = StatsSnapshot::new(vec![
                    PathSnapshot {
                        name: primary.2,
                        dataplane: primary.0.snapshot(),
                        igmp: primary.1.snapshot(),
                    },
                    PathSnapshot {
                        name: backup.2,
                        dataplane: backup.0.snapshot(),
                        igmp: backup.1.snapshot(),
                    },
                ]);
                if let Some(parent) = stats_file.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                if let Err(e) = snapshot.write_atomic(&stats_file).await {
                    tracing::warn!(error = %e, path = %stats_file.display(), "failed to export stats snapshot");
                }
            }
        })
    }

    /// Poll each pump's liveness flag and log once when a pump has
    /// exited. This does not restart anything: a pump that exits stays
    /// exited (daemon semantics), but its death is now observable in
    /// the logs instead of silently leaving a path's dataplane dead
    /// while the process keeps running and exporting stale counters.
    fn spawn_health_check(&self, watch: Vec<PumpWatch>) -> JoinHandle<()> {
        let running = self.running.clone();
        let interval = Duration::from_secs(self.cfg.health_check_interval.max(1));
        tokio::spawn(async move {
            let mut reported_dead = vec![false; watch.len()];
            while running.load(Ordering::Relaxed) {
                tokio::time::sleep(interval).await;
                for (i, pump) in watch.iter().enumerate() {
                    if !pump.alive.load(Ordering::Relaxed) && !reported_dead[i] {
                        reported_dead[i] = true;
                        tracing::error!(
                            path = pump.path_name,
                            direction = pump.direction,
                            "pump task has exited; this path's dataplane is down in that direction"
                        );
                    }
                }
            }
        })
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot::new(vec![self.primary.snapshot(), self.backup.snapshot()])
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    async fn shutdown(mut self) {
        tracing::info!("shutting down supervisor");
        for handle in self.handles.drain(..) {
            if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("task did not exit within shutdown timeout, abandoning (daemon semantics)");
            }
        }

        let primary_name = self.primary.group;
        let backup_name = self.backup.group;
        tracing::debug!(primary_group = %primary_name, backup_group = %backup_name, "dropping multicast memberships");
        drop(self.primary.mcast);
        drop(self.backup.mcast);

        if let Ok(tap) = Arc::try_unwrap(self.primary.tap) {
            tap.destroy().await;
        }
        if let Ok(tap) = Arc::try_unwrap(self.backup.tap) {
            tap.destroy().await;
        }
    }
}

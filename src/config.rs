//! Configuration loading: topology, batching, IGMP liveness tuning, and
//! the ambient keys the bridge actually consumes (stats export,
//! health-check cadence, log settings).

use serde::Deserialize;
use std::path::Path;

fn default_true() -> bool {
    true
}

fn default_primary_interface() -> String {
    "goose0".into()
}
fn default_backup_interface() -> String {
    "goose1".into()
}
fn default_primary_tun_ip() -> String {
    "192.168.100.1/24".into()
}
fn default_backup_tun_ip() -> String {
    "192.168.101.1/24".into()
}
fn default_primary_multicast_ip() -> String {
    "224.0.1.100".into()
}
fn default_backup_multicast_ip() -> String {
    "224.0.1.101".into()
}
fn default_multicast_port() -> u16 {
    61850
}
fn default_buffer_size() -> usize {
    2048
}
fn default_batch_size() -> usize {
    10
}
fn default_igmp_keepalive_interval() -> u64 {
    90
}
fn default_igmp_monitor_interval() -> u64 {
    120
}
fn default_igmp_reregister_threshold() -> u32 {
    2
}
fn default_tgw_domain_id() -> String {
    "tgw-mcast-domain-00000000000000000".into()
}
fn default_stats_export_interval() -> u64 {
    60
}
fn default_stats_file() -> String {
    "/var/log/goose-bridge/stats.json".into()
}
fn default_health_check_interval() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub primary_interface: String,
    pub backup_interface: String,
    pub primary_tun_ip: String,
    pub backup_tun_ip: String,
    pub primary_multicast_ip: String,
    pub backup_multicast_ip: String,
    pub multicast_port: u16,
    pub buffer_size: usize,
    pub batch_size: usize,

    pub enable_igmp_keepalive: bool,
    pub igmp_keepalive_interval: u64,
    pub igmp_monitor_interval: u64,
    pub igmp_reregister_threshold: u32,
    pub enable_tgw_monitoring: bool,
    pub primary_tgw_multicast_domain_id: String,
    pub backup_tgw_multicast_domain_id: String,

    pub stats_export_interval: u64,
    pub stats_file: String,
    pub health_check_interval: u64,

    pub log_level: String,
    pub log_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            primary_interface: default_primary_interface(),
            backup_interface: default_backup_interface(),
            primary_tun_ip: default_primary_tun_ip(),
            backup_tun_ip: default_backup_tun_ip(),
            primary_multicast_ip: default_primary_multicast_ip(),
            backup_multicast_ip: default_backup_multicast_ip(),
            multicast_port: default_multicast_port(),
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            enable_igmp_keepalive: default_true(),
            igmp_keepalive_interval: default_igmp_keepalive_interval(),
            igmp_monitor_interval: default_igmp_monitor_interval(),
            igmp_reregister_threshold: default_igmp_reregister_threshold(),
            enable_tgw_monitoring: default_true(),
            primary_tgw_multicast_domain_id: default_tgw_domain_id(),
            backup_tgw_multicast_domain_id: default_tgw_domain_id(),
            stats_export_interval: default_stats_export_interval(),
            stats_file: default_stats_file(),
            health_check_interval: default_health_check_interval(),
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load from a TOML file. A missing file is not fatal: fall back to
    /// built-in defaults and log a warning.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let cfg: Config = toml::from_str(&text)
                    .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
                Ok(cfg)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.primary_interface, "goose0");
        assert_eq!(cfg.backup_interface, "goose1");
        assert_eq!(cfg.multicast_port, 61850);
        assert_eq!(cfg.igmp_keepalive_interval, 90);
        assert_eq!(cfg.igmp_monitor_interval, 120);
        assert_eq!(cfg.igmp_reregister_threshold, 2);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let toml_text = "multicast_port = 12345\n";
        let cfg: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(cfg.multicast_port, 12345);
        assert_eq!(cfg.primary_interface, "goose0");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/goose-bridge.toml")).unwrap();
        assert_eq!(cfg.primary_interface, "goose0");
    }
}

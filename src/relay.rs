//! Path relay: the bidirectional, batched pumps between one TAP
//! endpoint and one multicast endpoint.
//!
//! Expressed as tokio tasks using `timeout`/readiness awaits rather
//! than OS threads blocked in `select()`; the fairness and bounded
//! shutdown-latency properties are the same either way.

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::codec;
use crate::mcast::MulticastEndpoint;
use crate::stats::PathStats;
use crate::tap::TapEndpoint;

const READINESS_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 100;
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

pub struct PathRelay {
    pub path_name: &'static str,
    pub tap: Arc<TapEndpoint>,
    pub mcast: Arc<MulticastEndpoint>,
    pub stats: Arc<PathStats>,
    pub buffer_size: usize,
    pub batch_size: usize,
    pub local_ip: Ipv4Addr,
}

/// True if `sender` is this instance's own outbound address: the
/// self-loop filter that keeps a bridge from re-injecting its own
/// egress traffic back onto its TAP.
fn is_self_sourced(sender: std::net::SocketAddr, local_ip: Ipv4Addr) -> bool {
    match sender {
        std::net::SocketAddr::V4(v4) => *v4.ip() == local_ip,
        std::net::SocketAddr::V6(_) => false,
    }
}

impl PathRelay {
    /// TAP -> multicast pump.
    pub async fn run_tap_to_multicast(&self, running: Arc<std::sync::atomic::AtomicBool>) {
        let mut buf = vec![0u8; self.buffer_size];
        let mut consecutive_timeouts: u32 = 0;
        let mut consecutive_errors: u32 = 0;

        while running.load(Ordering::Relaxed) {
            match timeout(READINESS_TIMEOUT, self.tap.read_frame(&mut buf)).await {
                Err(_elapsed) => {
                    consecutive_timeouts += 1;
                    if consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                        tracing::warn!(
                            path = self.path_name,
                            "no TAP traffic for {} consecutive timeouts",
                            MAX_CONSECUTIVE_TIMEOUTS
                        );
                        consecutive_timeouts = 0;
                    }
                    continue;
                }
                Ok(Err(e)) => {
                    consecutive_errors += 1;
                    tracing::error!(path = self.path_name, error = %e, "TAP read failed");
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        tracing::error!(path = self.path_name, "too many consecutive TAP read errors, stopping pump");
                        return;
                    }
                    continue;
                }
                Ok(Ok(n)) => {
                    consecutive_timeouts = 0;
                    consecutive_errors = 0;
                    self.handle_tap_frame(&buf[..n]).await;

                    for _ in 1..self.batch_size {
                        match self.tap.try_read_frame(&mut buf) {
                            Ok(n) => self.handle_tap_frame(&buf[..n]).await,
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(e) => {
                                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                tracing::error!(path = self.path_name, error = %e, "TAP batch read failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_tap_frame(&self, raw: &[u8]) {
        self.stats.raw_frames.fetch_add(1, Ordering::Relaxed);

        let frame = match codec::parse_ethernet(raw) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(path = self.path_name, error = %e, "dropping unparseable frame");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if !frame.is_goose() {
            return;
        }

        if frame.has_vlan {
            self.stats.vlan_goose_received.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.goose_received.fetch_add(1, Ordering::Relaxed);
        }

        let tunnel_bytes = codec::encode_tunnel(&frame, codec::now_micros());
        match self.mcast.send(&tunnel_bytes).await {
            Ok(_) => {
                self.stats.goose_to_ip.fetch_add(1, Ordering::Relaxed);
                self.stats.goose_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(path = self.path_name, error = %e, "multicast send failed");
            }
        }
    }

    /// Multicast -> TAP pump.
    pub async fn run_multicast_to_tap(&self, running: Arc<std::sync::atomic::AtomicBool>) {
        let mut buf = vec![0u8; self.buffer_size];
        let mut consecutive_timeouts: u32 = 0;
        let mut consecutive_errors: u32 = 0;

        while running.load(Ordering::Relaxed) {
            match timeout(READINESS_TIMEOUT, self.mcast.recv(&mut buf)).await {
                Err(_elapsed) => {
                    consecutive_timeouts += 1;
                    if consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                        tracing::warn!(
                            path = self.path_name,
                            "no multicast traffic for {} consecutive timeouts",
                            MAX_CONSECUTIVE_TIMEOUTS
                        );
                        consecutive_timeouts = 0;
                    }
                    continue;
                }
                Ok(Err(e)) => {
                    consecutive_errors += 1;
                    tracing::error!(path = self.path_name, error = %e, "multicast recv failed");
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        tracing::error!(path = self.path_name, "too many consecutive multicast recv errors, stopping pump");
                        return;
                    }
                    continue;
                }
                Ok(Ok((n, sender))) => {
                    consecutive_timeouts = 0;
                    consecutive_errors = 0;
                    self.handle_datagram(&buf[..n], sender).await;

                    for _ in 1..self.batch_size {
                        match self.mcast.try_recv(&mut buf) {
                            Ok((n, sender)) => self.handle_datagram(&buf[..n], sender).await,
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                            Err(e) => {
                                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                                tracing::error!(path = self.path_name, error = %e, "multicast batch recv failed");
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, raw: &[u8], sender: std::net::SocketAddr) {
        if is_self_sourced(sender, self.local_ip) {
            return;
        }

        let tunnel = match codec::decode_tunnel(raw) {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(path = self.path_name, error = %e, "dropping undersized tunnel datagram");
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let frame = codec::reconstruct_ethernet(&tunnel);
        match self.tap.write_frame(&frame).await {
            Ok(()) => {
                self.stats.ip_to_goose.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(path = self.path_name, error = %e, "TAP write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    #[test]
    fn filters_own_outbound_address() {
        let local = Ipv4Addr::new(10, 0, 0, 5);
        let from_self: SocketAddr = (local, 61850).into();
        assert!(is_self_sourced(from_self, local));
    }

    #[test]
    fn does_not_filter_other_senders() {
        let local = Ipv4Addr::new(10, 0, 0, 5);
        let other: SocketAddr = (Ipv4Addr::new(10, 0, 0, 6), 61850).into();
        assert!(!is_self_sourced(other, local));
    }

    #[test]
    fn path_stats_are_independent_instances() {
        // Per-path counters live behind separate `Arc<PathStats>`
        // handles; bumping one path's counters must never touch the
        // other's, regardless of what happens to its endpoints.
        let primary = Arc::new(crate::stats::PathStats::default());
        let backup = Arc::new(crate::stats::PathStats::default());

        primary.goose_to_ip.fetch_add(5, Ordering::Relaxed);
        drop(backup.clone());

        assert_eq!(primary.goose_to_ip.load(Ordering::Relaxed), 5);
        assert_eq!(backup.goose_to_ip.load(Ordering::Relaxed), 0);
    }
}

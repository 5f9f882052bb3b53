//! Structural/fatal error taxonomy. Per-frame faults inside the
//! dataplane pumps are logged and counted, never turned into one of
//! these: see `relay.rs`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("insufficient privilege: CAP_NET_ADMIN (or root) is required to create TAP devices")]
    InsufficientPrivilege,

    #[error("failed to create TAP device {name}: {source}")]
    TapCreate {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to join multicast group {group}:{port}: {source}")]
    MulticastJoin {
        group: std::net::Ipv4Addr,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

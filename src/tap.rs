//! TAP endpoint: create, configure, and pump raw Ethernet frames
//! through a Linux TAP device.
//!
//! The fd is obtained with the standard `open("/dev/net/tun")` +
//! `TUNSETIFF` ioctl dance, not a hand-rolled netlink stack. Interface
//! configuration (address, link state, MTU, ...) shells out to `ip`
//! rather than linking against netlink directly.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::process::Command;

use crate::error::BridgeError;

// linux/if_tun.h constants; not exposed by the `libc` crate.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFNAMSIZ: usize = 16;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

struct OwnedFd(RawFd);

impl AsRawFd for OwnedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

pub struct TapEndpoint {
    name: String,
    inner: AsyncFd<OwnedFd>,
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn open_tap_fd(name: &str) -> io::Result<RawFd> {
    if name.len() >= IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name too long",
        ));
    }

    let path = CString::new("/dev/net/tun").unwrap();
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut req: IfReq = unsafe { mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    req.ifr_flags = IFF_TAP | IFF_NO_PI;

    let rc = unsafe { libc::ioctl(fd, TUNSETIFF as _, &mut req as *mut IfReq) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    set_nonblocking(fd)?;
    Ok(fd)
}

/// Run `ip <args>`, logging but not propagating failure: an individual
/// configuration command failing should not abort device creation, since
/// the interface may already be partially configured from prior steps.
async fn run_ip(args: &[&str]) {
    match Command::new("ip").args(args).output().await {
        Ok(out) if out.status.success() => {}
        Ok(out) => tracing::warn!(
            args = ?args,
            stderr = %String::from_utf8_lossy(&out.stderr),
            "ip command failed"
        ),
        Err(e) => tracing::warn!(args = ?args, error = %e, "failed to spawn ip command"),
    }
}

impl TapEndpoint {
    /// Create and bring up a TAP device named `name` with `ip_cidr`
    /// (e.g. "192.168.100.5/24") assigned.
    pub async fn create(name: &str, ip_cidr: &str) -> Result<TapEndpoint, BridgeError> {
        let fd = open_tap_fd(name).map_err(|source| BridgeError::TapCreate {
            name: name.to_string(),
            source,
        })?;

        run_ip(&["addr", "add", ip_cidr, "dev", name]).await;
        run_ip(&["link", "set", name, "up"]).await;
        run_ip(&["link", "set", name, "multicast", "on"]).await;
        run_ip(&["link", "set", name, "promisc", "on"]).await;
        run_ip(&["link", "set", name, "mtu", "1500"]).await;
        run_ip(&["link", "set", name, "txqueuelen", "1000"]).await;

        let inner = AsyncFd::new(OwnedFd(fd)).map_err(|source| BridgeError::TapCreate {
            name: name.to_string(),
            source,
        })?;

        tracing::info!(interface = name, ip = ip_cidr, "TAP endpoint created");
        Ok(TapEndpoint {
            name: name.to_string(),
            inner,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read up to `buf.len()` bytes of one Ethernet frame, or block
    /// (await) until the fd is readable.
    pub async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            let fd = self.inner.get_ref().as_raw_fd();
            let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                guard.clear_ready();
                continue;
            }
            return Err(err);
        }
    }

    /// Non-blocking attempt to read one frame without awaiting
    /// readiness; used by the relay's inner batch-drain loop, which
    /// must stop on `WouldBlock` rather than suspend.
    pub fn try_read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.inner.get_ref().as_raw_fd();
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if rc >= 0 {
            Ok(rc as usize)
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Write exactly one frame; does not fragment.
    pub async fn write_frame(&self, bytes: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.inner.writable().await?;
            let fd = self.inner.get_ref().as_raw_fd();
            let rc = unsafe { libc::write(fd, bytes.as_ptr() as *const _, bytes.len()) };
            if rc >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                guard.clear_ready();
                continue;
            }
            return Err(err);
        }
    }

    /// Delete the backing interface. The fd itself closes via `Drop`.
    pub async fn destroy(self) {
        let name = self.name.clone();
        drop(self);
        run_ip(&["link", "delete", &name]).await;
        tracing::info!(interface = name, "TAP endpoint destroyed");
    }
}

/// Derive a unique TAP address for this instance from its own public
/// IPv4, reusing the last octet inside a fixed /24 per path.
pub fn derive_tap_cidr(base_network: &str, local_ip: std::net::Ipv4Addr) -> String {
    // base_network e.g. "192.168.100.1/24": keep the network/prefix,
    // substitute the host octet with this instance's last octet.
    let (network, prefix) = base_network
        .split_once('/')
        .unwrap_or((base_network, "24"));
    let mut octets: Vec<&str> = network.split('.').collect();
    let last_octet = local_ip.octets()[3].to_string();
    if octets.len() == 4 {
        octets[3] = &last_octet;
    }
    format!("{}/{}", octets.join("."), prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_host_octet_from_local_ip() {
        let cidr = derive_tap_cidr("192.168.100.1/24", "10.0.0.42".parse().unwrap());
        assert_eq!(cidr, "192.168.100.42/24");
    }

    #[test]
    fn preserves_prefix_length() {
        let cidr = derive_tap_cidr("192.168.101.1/25", "10.0.0.7".parse().unwrap());
        assert_eq!(cidr, "192.168.101.7/25");
    }
}

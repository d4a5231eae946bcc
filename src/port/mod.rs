//! Port allocation.
//!
//! Bindability is decided by a real bind probe that is released right away.
//! The service binds the port later, so another process can take it in
//! between. That window is accepted: holding the socket would require
//! handing an already-bound descriptor to the child.

pub mod owner;

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};

use crate::supervisor::error::{Result, SupervisorError};

pub use owner::listening_pids;

/// A (host, port) pair requested by a service and where it landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortBinding {
    pub host: String,
    pub preferred_port: u16,
    pub resolved_port: u16,
}

impl PortBinding {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.resolved_port)
    }

    pub fn moved(&self) -> bool {
        self.preferred_port != self.resolved_port
    }
}

fn resolve(host: &str, port: u16) -> Vec<SocketAddr> {
    match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(e) => {
            tracing::debug!("Cannot resolve {}:{}: {}", host, port, e);
            Vec::new()
        }
    }
}

fn probe_bind(addr: &SocketAddr) -> std::io::Result<()> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    // Linux refuses the bind while any socket listens on the port, so this
    // only ignores TIME_WAIT leftovers. BSD and macOS let a specific address
    // share a port with a wildcard listener, and Windows allows stealing.
    #[cfg(target_os = "linux")]
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.bind(&(*addr).into())?;
    Ok(())
}

/// Whether the OS would currently grant a bind on every address `host`
/// resolves to. An unresolvable host is never free.
pub fn is_port_free(host: &str, port: u16) -> bool {
    let addrs = resolve(host, port);
    if addrs.is_empty() {
        return false;
    }
    addrs.iter().all(|addr| match probe_bind(addr) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("Port probe {} failed: {}", addr, e);
            false
        }
    })
}

/// First free port in `preferred, preferred+1, …`, trying at most
/// `max_attempts` ports and never past 65535. Ports in `taken` were already
/// handed to another service and are skipped without probing.
pub fn allocate(host: &str, preferred: u16, max_attempts: u16, taken: &[u16]) -> Result<PortBinding> {
    let attempts = max_attempts.max(1);
    let mut last = preferred;
    for offset in 0..attempts {
        let Some(port) = preferred.checked_add(offset) else {
            break;
        };
        last = port;
        if taken.contains(&port) {
            tracing::debug!("Port {} is already assigned, skipping", port);
            continue;
        }
        if is_port_free(host, port) {
            if port != preferred {
                tracing::warn!(
                    "Port {} on {} is in use, using {} instead",
                    preferred,
                    host,
                    port
                );
            } else {
                tracing::debug!("Port {} on {} is free", port, host);
            }
            return Ok(PortBinding {
                host: host.to_string(),
                preferred_port: preferred,
                resolved_port: port,
            });
        }
    }

    Err(SupervisorError::PortExhaustion {
        host: host.to_string(),
        first: preferred,
        last,
    })
}

/// Whether something accepts TCP connections on `host:port`.
pub fn is_listening(host: &str, port: u16, timeout: Duration) -> bool {
    resolve(host, port)
        .iter()
        .any(|addr| TcpStream::connect_timeout(addr, timeout).is_ok())
}

//! Which processes listen on a TCP port.

/// Pids with a listening TCP socket on `port` (any address). Empty when the
/// owner cannot be determined.
pub fn listening_pids(port: u16) -> Vec<u32> {
    let mut pids = platform::listening_pids(port);
    pids.sort_unstable();
    pids.dedup();
    pids
}

#[cfg(target_os = "linux")]
mod platform {
    use std::collections::HashSet;

    use procfs::net::TcpState;
    use procfs::process::FDTarget;

    /// LISTEN socket inodes from `/proc/net/tcp{,6}`, then the processes
    /// holding a descriptor to one of them.
    pub fn listening_pids(port: u16) -> Vec<u32> {
        let mut inodes = HashSet::new();
        for table in [procfs::net::tcp(), procfs::net::tcp6()] {
            match table {
                Ok(entries) => inodes.extend(
                    entries
                        .into_iter()
                        .filter(|e| e.state == TcpState::Listen && e.local_address.port() == port)
                        .map(|e| e.inode),
                ),
                Err(e) => tracing::debug!("Cannot read TCP table: {}", e),
            }
        }
        if inodes.is_empty() {
            return Vec::new();
        }

        let processes = match procfs::process::all_processes() {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("Cannot enumerate /proc: {}", e);
                return Vec::new();
            }
        };

        let mut pids = Vec::new();
        for proc in processes.flatten() {
            // other users' fds are unreadable without privileges
            let Ok(fds) = proc.fd() else { continue };
            let owns = fds.flatten().any(|fd| match fd.target {
                FDTarget::Socket(inode) => inodes.contains(&inode),
                _ => false,
            });
            if owns {
                pids.push(proc.pid as u32);
            }
        }
        pids
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
mod platform {
    use std::process::Command;

    /// No native socket table here; ask `lsof`.
    pub fn listening_pids(port: u16) -> Vec<u32> {
        let output = Command::new("lsof")
            .args(["-nP", &format!("-iTCP:{}", port), "-sTCP:LISTEN", "-t"])
            .output();
        match output {
            Ok(out) => String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter_map(|l| l.trim().parse::<u32>().ok())
                .collect(),
            Err(e) => {
                tracing::debug!("lsof unavailable: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(not(unix))]
mod platform {
    pub fn listening_pids(_port: u16) -> Vec<u32> {
        Vec::new()
    }
}

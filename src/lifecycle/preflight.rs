//! Pre-flight port-conflict resolution.
//!
//! Before the relay binds anything, every claimed local port is test-bound. A port that is held
//! by another process (typically a relay or transcoder left over from an earlier run) gets its
//! holders signalled, first with the configured signal and then with SIGKILL.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use super::error::PreflightError;
use crate::config::{ConfigError, PortConflictConfig};
use crate::endpoint::PortClaim;
use crate::net::bind_reusable;
use crate::sys::{parse_signal, send_signal};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A conflict that was resolved by signalling the port's holders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConflict {
    pub port: u16,
    pub pids: Vec<u32>,
    /// Whether SIGKILL was needed.
    pub escalated: bool,
}

#[derive(Debug, Clone)]
pub struct PortPreflight {
    signal: i32,
    release_timeout: Duration,
    own_pid: u32,
}

impl PortPreflight {
    pub fn new(config: &PortConflictConfig) -> Result<Self, ConfigError> {
        let signal = parse_signal(&config.signal)
            .ok_or_else(|| ConfigError::UnknownSignal(config.signal.clone()))?;

        Ok(Self {
            signal,
            release_timeout: config.release_timeout(),
            own_pid: std::process::id(),
        })
    }

    /// Make every claimed port exclusively ours, signalling foreign holders as needed.
    ///
    /// A holder is found even when it shares the address through `SO_REUSEADDR` and a test
    /// bind succeeds.
    pub async fn resolve(&self, claims: &[PortClaim]) -> Result<Vec<ResolvedConflict>, PreflightError> {
        let mut resolved = Vec::new();

        for claim in claims {
            let port = claim.bind.port();
            if port == 0 {
                continue;
            }

            let bindable = try_bind(claim.bind);
            let holders = self.holders(claim.bind)?;
            if holders.is_empty() {
                match bindable {
                    Ok(()) => continue,
                    Err(source) => return Err(PreflightError::Unavailable { port, source }),
                }
            }

            warn!(
                port,
                owner = %claim.owner,
                pids = ?holders,
                shared = bindable.is_ok(),
                signal = self.signal,
                "Port held by another process, signalling holders"
            );
            self.signal_all(&holders, self.signal);

            if self.wait_released(claim.bind).await? {
                info!(port, "Port released");
                resolved.push(ResolvedConflict {
                    port,
                    pids: holders,
                    escalated: false,
                });
                continue;
            }

            let remaining = self.holders(claim.bind)?;
            warn!(port, pids = ?remaining, "Port still held, sending SIGKILL");
            self.signal_all(&remaining, libc::SIGKILL);

            if !self.wait_released(claim.bind).await? {
                return Err(PreflightError::PortStillHeld {
                    port,
                    pids: self.holders(claim.bind)?,
                });
            }

            info!(port, "Port released after SIGKILL");
            let mut pids = holders;
            pids.extend(remaining);
            pids.sort_unstable();
            pids.dedup();
            resolved.push(ResolvedConflict {
                port,
                pids,
                escalated: true,
            });
        }

        Ok(resolved)
    }

    fn holders(&self, bind: SocketAddr) -> Result<Vec<u32>, PreflightError> {
        let mut pids = find_port_holders(Path::new("/proc"), bind).map_err(PreflightError::Proc)?;
        pids.retain(|pid| *pid != self.own_pid);
        Ok(pids)
    }

    fn signal_all(&self, pids: &[u32], signal: i32) {
        for &pid in pids {
            if let Err(e) = send_signal(pid, signal) {
                // The holder may have exited on its own.
                if e.raw_os_error() != Some(libc::ESRCH) {
                    warn!(pid, signal, error = %e, "Failed to signal port holder");
                }
            }
        }
    }

    /// Wait until `bind` can be bound and no foreign process holds it.
    async fn wait_released(&self, bind: SocketAddr) -> Result<bool, PreflightError> {
        let deadline = tokio::time::Instant::now() + self.release_timeout;
        loop {
            if try_bind(bind).is_ok() && self.holders(bind)?.is_empty() {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn try_bind(bind: SocketAddr) -> io::Result<()> {
    bind_reusable(bind).map(drop)
}

/// Parse a `/proc/net/udp{,6}` local address such as `0100007F:22B9`.
///
/// The kernel prints the address as 32-bit words in host byte order.
fn parse_proc_addr(field: &str) -> Option<SocketAddr> {
    let (hex_ip, hex_port) = field.rsplit_once(':')?;
    let port = u16::from_str_radix(hex_port, 16).ok()?;

    let mut bytes = Vec::with_capacity(16);
    for chunk in hex_ip.as_bytes().chunks(8) {
        let word = u32::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
        bytes.extend_from_slice(&word.to_ne_bytes());
    }

    let ip = match bytes.len() {
        4 => IpAddr::from(<[u8; 4]>::try_from(bytes.as_slice()).ok()?),
        16 => IpAddr::from(<[u8; 16]>::try_from(bytes.as_slice()).ok()?),
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Whether sockets bound to `a` and `b` compete for the same datagrams.
fn overlaps(a: SocketAddr, b: SocketAddr) -> bool {
    a.port() == b.port()
        && (a.ip().is_unspecified()
            || b.ip().is_unspecified()
            || a.ip().to_canonical() == b.ip().to_canonical())
}

/// Socket inodes in a `/proc/net/udp` or `/proc/net/udp6` table whose local address overlaps `bind`.
fn socket_inodes(table: &str, bind: SocketAddr) -> Vec<u64> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = parse_proc_addr(fields.get(1)?)?;
            if !overlaps(local, bind) {
                return None;
            }
            fields.get(9)?.parse::<u64>().ok().filter(|inode| *inode != 0)
        })
        .collect()
}

/// Pids of processes with an open UDP socket whose local address overlaps `bind`.
pub fn find_port_holders(proc_root: &Path, bind: SocketAddr) -> io::Result<Vec<u32>> {
    let mut inodes = BTreeSet::new();
    for table in ["net/udp", "net/udp6"] {
        match fs::read_to_string(proc_root.join(table)) {
            Ok(contents) => inodes.extend(socket_inodes(&contents, bind)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    if inodes.is_empty() {
        return Ok(Vec::new());
    }

    let targets: BTreeSet<String> = inodes.iter().map(|inode| format!("socket:[{inode}]")).collect();
    let mut pids = BTreeSet::new();

    for entry in fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse::<u32>().ok()) else {
            continue;
        };

        // Processes can exit, or belong to other users, while being scanned.
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };

        for fd in fds.flatten() {
            let Ok(link) = fs::read_link(fd.path()) else {
                continue;
            };
            if link.to_str().is_some_and(|link| targets.contains(link)) {
                pids.insert(pid);
                break;
            }
        }
    }

    Ok(pids.into_iter().collect())
}

//! Free-port discovery.
//!
//! The allocator reads the host's listener tables (TCP listeners and bound
//! UDP sockets) and returns the lowest port at or above a floor that nobody
//! holds. Nothing is reserved: another process may still bind the port
//! before the resolver does.

use crate::error::{Result, SupervisorError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Address family of a listener table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    /// IPv4 sockets.
    Ipv4,
    /// IPv6 sockets.
    Ipv6,
}

impl From<IpAddr> for AddressFamily {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }
}

/// Source of currently bound local ports.
#[async_trait]
pub trait ListenerTable: Send + Sync {
    /// Ports held by TCP listeners or UDP sockets of the given family.
    async fn occupied_ports(&self, family: AddressFamily) -> Result<HashSet<u16>>;
}

/// Reads the operating system's socket tables.
///
/// Linux parses `/proc/net/{tcp,udp}{,6}`; other platforms parse
/// `netstat -an`.
pub struct SystemListeners {
    source: Source,
}

enum Source {
    ProcNet(PathBuf),
    Netstat,
}

impl SystemListeners {
    /// Creates a reader for the live system tables.
    #[must_use]
    pub fn new() -> Self {
        let source = if cfg!(target_os = "linux") {
            Source::ProcNet(PathBuf::from("/proc/net"))
        } else {
            Source::Netstat
        };
        Self { source }
    }

    /// Reads `/proc/net`-style tables from another directory (useful for
    /// testing).
    #[must_use]
    pub fn with_proc_net(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::ProcNet(dir.into()),
        }
    }

    async fn read_proc_net(dir: &Path, family: AddressFamily) -> Result<HashSet<u16>> {
        let suffix = match family {
            AddressFamily::Ipv4 => "",
            AddressFamily::Ipv6 => "6",
        };
        let mut ports = HashSet::new();
        for (proto, listening_only) in [("tcp", true), ("udp", false)] {
            let path = dir.join(format!("{proto}{suffix}"));
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => ports.extend(parse_proc_net(&content, listening_only)),
                // IPv6 may be disabled; a missing table has no listeners.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Socket table missing, skipping");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(ports)
    }

    async fn read_netstat(family: AddressFamily) -> Result<HashSet<u16>> {
        let out = tokio::process::Command::new("netstat")
            .arg("-an")
            .kill_on_drop(true)
            .output()
            .await?;
        if !out.status.success() {
            return Err(SupervisorError::Io(std::io::Error::other(format!(
                "netstat exited with {}",
                out.status
            ))));
        }
        Ok(parse_netstat(&String::from_utf8_lossy(&out.stdout), family))
    }
}

impl Default for SystemListeners {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ListenerTable for SystemListeners {
    async fn occupied_ports(&self, family: AddressFamily) -> Result<HashSet<u16>> {
        let ports = match &self.source {
            Source::ProcNet(dir) => Self::read_proc_net(dir, family).await?,
            Source::Netstat => Self::read_netstat(family).await?,
        };
        debug!(?family, occupied = ports.len(), "Listener table read");
        Ok(ports)
    }
}

/// Returns the lowest port in `[floor, 65535]` not contained in `occupied`.
///
/// Port 0 is never returned; a floor of 0 scans from 1.
///
/// # Errors
///
/// Returns [`SupervisorError::ResourceExhausted`] if every port in range is
/// occupied.
pub fn first_free_port(occupied: &HashSet<u16>, floor: u16) -> Result<u16> {
    (floor.max(1)..=u16::MAX)
        .find(|port| !occupied.contains(port))
        .ok_or(SupervisorError::ResourceExhausted { floor })
}

/// Picks a free port of `family` at or above `floor`.
///
/// # Errors
///
/// Propagates listener-table failures and
/// [`SupervisorError::ResourceExhausted`].
pub async fn allocate(
    listeners: &dyn ListenerTable,
    family: AddressFamily,
    floor: u16,
) -> Result<u16> {
    let occupied = listeners.occupied_ports(family).await?;
    first_free_port(&occupied, floor)
}

/// TCP state `0A` in `/proc/net/tcp*` is `LISTEN`.
const PROC_TCP_LISTEN: &str = "0A";

/// Extracts local ports from a `/proc/net/{tcp,udp}*` table.
///
/// ```text
///   sl  local_address rem_address   st tx_queue rx_queue ...
///    0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 ...
/// ```
fn parse_proc_net(content: &str, listening_only: bool) -> impl Iterator<Item = u16> + '_ {
    content.lines().skip(1).filter_map(move |line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return None;
        }
        if listening_only && fields[3] != PROC_TCP_LISTEN {
            return None;
        }
        let (_, port) = fields[1].rsplit_once(':')?;
        u16::from_str_radix(port, 16).ok()
    })
}

/// Extracts listening ports of `family` from `netstat -an` output.
///
/// Handles the BSD layout (`proto recv-q send-q local foreign state`, port
/// after the last `.`) and the Windows layout (`proto local foreign state`,
/// port after the last `:`).
fn parse_netstat(content: &str, family: AddressFamily) -> HashSet<u16> {
    let mut ports = HashSet::new();
    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(proto) = fields.first().map(|p| p.to_ascii_lowercase()) else {
            continue;
        };
        let is_tcp = proto.starts_with("tcp");
        if !is_tcp && !proto.starts_with("udp") {
            continue;
        }

        let bsd = fields.get(1).is_some_and(|f| f.parse::<u64>().is_ok());
        let (local_idx, state_idx) = if bsd { (3, 5) } else { (1, 3) };
        let Some(local) = fields.get(local_idx) else {
            continue;
        };
        if is_tcp && !fields.get(state_idx).is_some_and(|s| s.starts_with("LISTEN")) {
            continue;
        }

        let split = if bsd {
            local.rsplit_once('.')
        } else {
            local.rsplit_once(':')
        };
        let Some((host, port)) = split else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };

        let (v4, v6) = if bsd {
            match &proto[3..] {
                "4" => (true, false),
                "6" => (false, true),
                "46" => (true, true),
                _ => (!host.contains(':'), host.contains(':')),
            }
        } else {
            let v6 = host.starts_with('[');
            (!v6, v6)
        };
        let wanted = match family {
            AddressFamily::Ipv4 => v4,
            AddressFamily::Ipv6 => v6,
        };
        if wanted {
            ports.insert(port);
        }
    }
    ports
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:159D 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 1 1
   1: 00000000:159E 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 2 1
   2: 0100007F:9C40 0100007F:159D 01 00000000:00000000 00:00000000 00000000     0        0 3 1
";

    const PROC_UDP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops
  100: 00000000:159F 00000000:0000 07 00000000:00000000 00:00000000 00000000     0        0 4 2 0 0
";

    #[test]
    fn scenario_skips_occupied_run() {
        let occupied: HashSet<u16> = [5533, 5534, 5535].into_iter().collect();
        assert_eq!(first_free_port(&occupied, 5533).unwrap(), 5536);
    }

    #[test]
    fn floor_itself_is_a_candidate() {
        assert_eq!(first_free_port(&HashSet::new(), 5533).unwrap(), 5533);
    }

    #[test]
    fn ports_below_floor_are_ignored() {
        let occupied: HashSet<u16> = [100, 101].into_iter().collect();
        assert_eq!(first_free_port(&occupied, 100).unwrap(), 102);
        assert_eq!(first_free_port(&occupied, 50).unwrap(), 50);
    }

    #[test]
    fn top_port_is_reachable() {
        let occupied: HashSet<u16> = (65_000..u16::MAX).collect();
        assert_eq!(first_free_port(&occupied, 65_000).unwrap(), u16::MAX);
    }

    #[test]
    fn exhausted_range_fails() {
        let occupied: HashSet<u16> = (65_530..=u16::MAX).collect();
        let err = first_free_port(&occupied, 65_530).unwrap_err();
        assert!(err.is_resource_exhausted());
    }

    #[test]
    fn zero_floor_never_yields_zero() {
        assert_eq!(first_free_port(&HashSet::new(), 0).unwrap(), 1);
    }

    #[test]
    fn proc_tcp_keeps_only_listeners() {
        let ports: Vec<u16> = parse_proc_net(PROC_TCP, true).collect();
        assert_eq!(ports, vec![5533, 5534]);
    }

    #[test]
    fn proc_udp_keeps_all_sockets() {
        let ports: Vec<u16> = parse_proc_net(PROC_UDP, false).collect();
        assert_eq!(ports, vec![5535]);
    }

    #[test]
    fn netstat_windows_layout() {
        let out = "\
Active Connections

  Proto  Local Address          Foreign Address        State
  TCP    0.0.0.0:135            0.0.0.0:0              LISTENING
  TCP    127.0.0.1:5533         0.0.0.0:0              LISTENING
  TCP    127.0.0.1:50000        127.0.0.1:5533         ESTABLISHED
  TCP    [::]:5540              [::]:0                 LISTENING
  UDP    0.0.0.0:5534           *:*
  UDP    [::]:5541              *:*
";
        let v4 = parse_netstat(out, AddressFamily::Ipv4);
        assert_eq!(v4, [135, 5533, 5534].into_iter().collect());
        let v6 = parse_netstat(out, AddressFamily::Ipv6);
        assert_eq!(v6, [5540, 5541].into_iter().collect());
    }

    #[test]
    fn netstat_bsd_layout() {
        let out = "\
Active Internet connections (including servers)
Proto Recv-Q Send-Q  Local Address          Foreign Address        (state)
tcp4       0      0  127.0.0.1.5533         *.*                    LISTEN
tcp46      0      0  *.5534                 *.*                    LISTEN
tcp4       0      0  192.168.1.2.50000      1.1.1.1.443            ESTABLISHED
tcp6       0      0  ::1.5540               *.*                    LISTEN
udp4       0      0  *.5535                 *.*
";
        let v4 = parse_netstat(out, AddressFamily::Ipv4);
        assert_eq!(v4, [5533, 5534, 5535].into_iter().collect());
        let v6 = parse_netstat(out, AddressFamily::Ipv6);
        assert_eq!(v6, [5534, 5540].into_iter().collect());
    }

    #[tokio::test]
    async fn allocate_reads_proc_tables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tcp"), PROC_TCP).unwrap();
        std::fs::write(dir.path().join("udp"), PROC_UDP).unwrap();

        let listeners = SystemListeners::with_proc_net(dir.path());
        let port = allocate(&listeners, AddressFamily::Ipv4, 5533).await.unwrap();
        assert_eq!(port, 5536);

        // No tcp6/udp6 tables: nothing occupied.
        let port = allocate(&listeners, AddressFamily::Ipv6, 5533).await.unwrap();
        assert_eq!(port, 5533);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn allocate_skips_bound_socket() {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let bound = socket.local_addr().unwrap().port();

        let port = allocate(&SystemListeners::new(), AddressFamily::Ipv4, bound)
            .await
            .unwrap();
        assert_ne!(port, bound);
        assert!(port > bound);
    }
}

use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::Path;

use tracing::trace;

use crate::utils::{is_unconnected, local_matches, normalize_addr};
use crate::{ProcessInfo, Protocol, Sock2ProcError, SocketOwner};

/// One row of `/proc/net/{tcp,udp}{,6}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub uid: u32,
    pub inode: u64,
}

/// Convert hex string to IPv4 address.
///
/// The kernel prints the address as a native-endian `u32`.
fn hex_to_ipv4(hex: &str) -> Result<Ipv4Addr, Sock2ProcError> {
    if hex.len() != 8 {
        return Err(Sock2ProcError::InvalidSocketAddr);
    }
    let word = u32::from_str_radix(hex, 16).map_err(|_| Sock2ProcError::InvalidSocketAddr)?;
    Ok(Ipv4Addr::from(word.to_ne_bytes()))
}

/// Convert hex string to IPv6 address (four native-endian words)
fn hex_to_ipv6(hex: &str) -> Result<Ipv6Addr, Sock2ProcError> {
    if hex.len() != 32 {
        return Err(Sock2ProcError::InvalidSocketAddr);
    }

    let mut bytes = [0u8; 16];
    for (i, chunk) in bytes.chunks_mut(4).enumerate() {
        let word = u32::from_str_radix(&hex[i * 8..i * 8 + 8], 16)
            .map_err(|_| Sock2ProcError::InvalidSocketAddr)?;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }

    Ok(Ipv6Addr::from(bytes))
}

fn hex_to_port(hex: &str) -> Result<u16, Sock2ProcError> {
    u16::from_str_radix(hex, 16).map_err(|_| Sock2ProcError::InvalidSocketAddr)
}

fn parse_addr(field: &str, is_ipv6: bool) -> Result<SocketAddr, Sock2ProcError> {
    let (addr, port) = field.split_once(':').ok_or(Sock2ProcError::InvalidSocketAddr)?;
    let port = hex_to_port(port)?;

    if is_ipv6 {
        Ok(SocketAddr::V6(SocketAddrV6::new(hex_to_ipv6(addr)?, port, 0, 0)))
    } else {
        Ok(SocketAddr::V4(SocketAddrV4::new(hex_to_ipv4(addr)?, port)))
    }
}

/// Parse a single table row: `sl local rem st tx:rx tr:when retrnsmt uid timeout inode ...`
pub fn parse_socket_line(line: &str, is_ipv6: bool) -> Result<SocketEntry, Sock2ProcError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return Err(Sock2ProcError::Malformed(format!(
            "expected at least 10 columns, got {}",
            parts.len()
        )));
    }

    let uid = parts[7]
        .parse::<u32>()
        .map_err(|_| Sock2ProcError::Malformed(format!("bad uid column: {}", parts[7])))?;
    let inode = parts[9]
        .parse::<u64>()
        .map_err(|_| Sock2ProcError::Malformed(format!("bad inode column: {}", parts[9])))?;

    Ok(SocketEntry {
        local: normalize_addr(parse_addr(parts[1], is_ipv6)?),
        remote: normalize_addr(parse_addr(parts[2], is_ipv6)?),
        uid,
        inode,
    })
}

/// Parse a whole table, skipping the header and any malformed rows
pub fn parse_socket_table(content: &str, is_ipv6: bool) -> Vec<SocketEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| parse_socket_line(line, is_ipv6).ok())
        .collect()
}

/// Pick the owner of `local -> remote` out of parsed entries.
///
/// A fully connected match wins. Otherwise a socket bound to the local
/// endpoint with no peer (unconnected UDP, listeners) is accepted.
pub fn match_owner(
    entries: &[SocketEntry],
    local: SocketAddr,
    remote: SocketAddr,
) -> Option<SocketOwner> {
    let local = normalize_addr(local);
    let remote = normalize_addr(remote);

    let exact = entries
        .iter()
        .find(|e| e.remote == remote && local_matches(&e.local, &local));
    if let Some(e) = exact {
        return Some(SocketOwner { uid: e.uid, inode: e.inode });
    }

    entries
        .iter()
        .find(|e| is_unconnected(&e.remote) && local_matches(&e.local, &local))
        .map(|e| SocketOwner { uid: e.uid, inode: e.inode })
}

fn table_paths(protocol: Protocol) -> [(&'static str, bool); 2] {
    match protocol {
        Protocol::Tcp => [("/proc/net/tcp", false), ("/proc/net/tcp6", true)],
        Protocol::Udp => [("/proc/net/udp", false), ("/proc/net/udp6", true)],
    }
}

pub fn find_socket_owner(
    protocol: Protocol,
    local: SocketAddr,
    remote: SocketAddr,
) -> Result<SocketOwner, Sock2ProcError> {
    let mut entries = Vec::new();
    let mut last_err = None;

    for (path, is_ipv6) in table_paths(protocol) {
        match fs::read_to_string(path) {
            Ok(content) => entries.extend(parse_socket_table(&content, is_ipv6)),
            Err(e) => {
                trace!("Cannot read {}: {}", path, e);
                last_err = Some(e);
            }
        }
    }

    if entries.is_empty() {
        if let Some(e) = last_err {
            return Err(e.into());
        }
    }

    match_owner(&entries, local, remote).ok_or(Sock2ProcError::SocketNotFound)
}

/// Scan `/proc/*/fd` for `socket:[inode]`
pub fn find_process_by_inode(inode: u64) -> Result<ProcessInfo, Sock2ProcError> {
    let needle = format!("socket:[{}]", inode);
    let entries = fs::read_dir(Path::new("/proc"))?;

    for entry in entries.flatten() {
        let path = entry.path();
        let pid = match path.file_name().and_then(|n| n.to_str()).and_then(|n| n.parse::<u32>().ok()) {
            Some(pid) => pid,
            None => continue,
        };

        let fd_entries = match fs::read_dir(path.join("fd")) {
            Ok(entries) => entries,
            Err(_) => continue,
        };

        for fd_entry in fd_entries.flatten() {
            if let Ok(link) = fs::read_link(fd_entry.path()) {
                if link.to_str() == Some(needle.as_str()) {
                    return get_process_info(pid);
                }
            }
        }
    }

    Err(Sock2ProcError::ProcessNotFound)
}

fn get_process_info(pid: u32) -> Result<ProcessInfo, Sock2ProcError> {
    let proc_path = format!("/proc/{}", pid);

    let cmdline = fs::read_to_string(format!("{}/cmdline", proc_path))
        .ok()
        .map(|s| s.replace('\0', " ").trim().to_string());

    let exe_path = fs::read_link(format!("{}/exe", proc_path))
        .ok()
        .and_then(|p| p.to_str().map(|s| s.to_string()));

    let status = fs::read_to_string(format!("{}/status", proc_path))
        .map_err(|_| Sock2ProcError::ProcessNotFound)?;

    let name = status
        .lines()
        .find(|line| line.starts_with("Name:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("unknown")
        .to_string();

    Ok(ProcessInfo {
        pid,
        name,
        exe_path,
        cmdline,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // 10.0.0.2:41000 -> 93.184.216.34:443, uid 10123, inode 98765
    fn tcp_table() -> String {
        let local = format!("{:08X}:{:04X}", u32::from_ne_bytes([10, 0, 0, 2]), 41000);
        let remote = format!("{:08X}:{:04X}", u32::from_ne_bytes([93, 184, 216, 34]), 443);
        format!(
            "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n   \
             0: {} {} 01 00000000:00000000 00:00000000 00000000 10123        0 98765 1 0000000000000000 20 4 30 10 -1\n",
            local, remote
        )
    }

    #[test]
    fn test_hex_to_ipv4() {
        let hex = format!("{:08X}", u32::from_ne_bytes([127, 0, 0, 1]));
        assert_eq!(hex_to_ipv4(&hex).unwrap(), Ipv4Addr::LOCALHOST);
        assert!(hex_to_ipv4("0100007").is_err());
    }

    #[test]
    fn test_hex_to_ipv6_mapped() {
        let addr: Ipv6Addr = "::ffff:10.0.0.2".parse().unwrap();
        let hex: String = addr
            .octets()
            .chunks(4)
            .map(|c| format!("{:08X}", u32::from_ne_bytes([c[0], c[1], c[2], c[3]])))
            .collect();
        assert_eq!(hex_to_ipv6(&hex).unwrap(), addr);
    }

    #[test]
    fn test_parse_socket_line() {
        let table = tcp_table();
        let entries = parse_socket_table(&table, false);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].local, "10.0.0.2:41000".parse().unwrap());
        assert_eq!(entries[0].remote, "93.184.216.34:443".parse().unwrap());
        assert_eq!(entries[0].uid, 10123);
        assert_eq!(entries[0].inode, 98765);
    }

    #[test]
    fn test_parse_short_line() {
        assert!(matches!(
            parse_socket_line("0: 0100007F:0035 00000000:0000 07", false),
            Err(Sock2ProcError::Malformed(_))
        ));
    }

    #[test]
    fn test_match_owner_exact() {
        let entries = parse_socket_table(&tcp_table(), false);
        let owner = match_owner(
            &entries,
            "10.0.0.2:41000".parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
        );
        assert_eq!(owner, Some(SocketOwner { uid: 10123, inode: 98765 }));

        let other = match_owner(
            &entries,
            "10.0.0.2:41001".parse().unwrap(),
            "93.184.216.34:443".parse().unwrap(),
        );
        assert_eq!(other, None);
    }

    #[test]
    fn test_match_owner_unconnected_udp() {
        let entries = vec![SocketEntry {
            local: "0.0.0.0:5353".parse().unwrap(),
            remote: "0.0.0.0:0".parse().unwrap(),
            uid: 10200,
            inode: 1,
        }];
        let owner = match_owner(
            &entries,
            "10.0.0.2:5353".parse().unwrap(),
            "224.0.0.251:5353".parse().unwrap(),
        );
        assert_eq!(owner.map(|o| o.uid), Some(10200));
    }
}

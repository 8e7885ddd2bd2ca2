//! IP packet classification and reply construction.
//!
//! `classify` only looks at the fields needed to identify a flow: addresses,
//! the transport protocol and, for TCP/UDP, the two port words right after the
//! IP header. Deeper parsing of TCP segments goes through smoltcp wire types.

use crate::error::ClassifyError;
use smoltcp::wire::{TcpPacket, UdpPacket};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

pub const IPV4_MIN_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;
const TCP_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

static IP_ID: AtomicU16 = AtomicU16::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Other(u8),
}

impl TransportProtocol {
    pub fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
            Self::Icmpv6 => 58,
            Self::Other(n) => n,
        }
    }

    pub fn has_ports(self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

impl From<u8> for TransportProtocol {
    fn from(n: u8) -> Self {
        match n {
            6 => Self::Tcp,
            17 => Self::Udp,
            1 => Self::Icmp,
            58 => Self::Icmpv6,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Icmp => write!(f, "icmp"),
            Self::Icmpv6 => write!(f, "icmpv6"),
            Self::Other(n) => write!(f, "proto-{}", n),
        }
    }
}

/// Flow identity used for affinity. Ports are zero for portless protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    pub protocol: TransportProtocol,
}

impl FlowKey {
    pub fn new(src: SocketAddr, dst: SocketAddr, protocol: TransportProtocol) -> Self {
        Self {
            src_addr: src.ip(),
            src_port: src.port(),
            dst_addr: dst.ip(),
            dst_port: dst.port(),
            protocol,
        }
    }

    pub fn src(&self) -> SocketAddr {
        SocketAddr::new(self.src_addr, self.src_port)
    }

    pub fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.dst_addr, self.dst_port)
    }

    /// The same flow seen from the other end
    pub fn reversed(&self) -> Self {
        Self::new(self.dst(), self.src(), self.protocol)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.src(), self.dst())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPacket {
    pub version: IpVersion,
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub protocol: TransportProtocol,
    /// IP header length in bytes; the transport header starts here
    pub header_len: usize,
    /// Declared total length, clamped to the buffer
    pub total_len: usize,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    /// IPv4 fragment other than the first. Its payload carries no transport
    /// header, so ports stay unset.
    pub trailing_fragment: bool,
}

impl ParsedPacket {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            src_addr: self.src_addr,
            src_port: self.src_port.unwrap_or(0),
            dst_addr: self.dst_addr,
            dst_port: self.dst_port.unwrap_or(0),
            protocol: self.protocol,
        }
    }

    pub fn src_socket(&self) -> Option<SocketAddr> {
        self.src_port.map(|p| SocketAddr::new(self.src_addr, p))
    }

    pub fn dst_socket(&self) -> Option<SocketAddr> {
        self.dst_port.map(|p| SocketAddr::new(self.dst_addr, p))
    }

    /// Bytes following the IP header, up to the declared total length
    pub fn transport<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        let end = self.total_len.min(raw.len());
        if self.header_len >= end {
            return &[];
        }
        &raw[self.header_len..end]
    }
}

/// Parse the flow-identifying fields of a raw IP datagram
pub fn classify(raw: &[u8]) -> Result<ParsedPacket, ClassifyError> {
    if raw.len() < IPV4_MIN_HEADER_LEN {
        return Err(ClassifyError::Truncated {
            expected: IPV4_MIN_HEADER_LEN,
            actual: raw.len(),
        });
    }

    let version = raw[0] >> 4;
    let mut parsed = match version {
        4 => classify_ipv4(raw)?,
        6 => classify_ipv6(raw)?,
        v => return Err(ClassifyError::UnsupportedVersion(v)),
    };

    if parsed.protocol.has_ports() && !parsed.trailing_fragment {
        let needed = parsed.header_len + 4;
        if raw.len() < needed {
            return Err(ClassifyError::Truncated {
                expected: needed,
                actual: raw.len(),
            });
        }
        let h = parsed.header_len;
        parsed.src_port = Some(u16::from_be_bytes([raw[h], raw[h + 1]]));
        parsed.dst_port = Some(u16::from_be_bytes([raw[h + 2], raw[h + 3]]));
    }

    Ok(parsed)
}

fn classify_ipv4(raw: &[u8]) -> Result<ParsedPacket, ClassifyError> {
    let ihl = raw[0] & 0x0F;
    if ihl < 5 {
        return Err(ClassifyError::InvalidHeader(ihl));
    }
    let header_len = ihl as usize * 4;
    if raw.len() < header_len {
        return Err(ClassifyError::Truncated {
            expected: header_len,
            actual: raw.len(),
        });
    }

    let declared = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    let total_len = if declared >= header_len { declared.min(raw.len()) } else { raw.len() };
    let fragment_offset = u16::from_be_bytes([raw[6], raw[7]]) & 0x1FFF;

    Ok(ParsedPacket {
        version: IpVersion::V4,
        src_addr: IpAddr::V4(Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15])),
        dst_addr: IpAddr::V4(Ipv4Addr::new(raw[16], raw[17], raw[18], raw[19])),
        protocol: TransportProtocol::from(raw[9]),
        header_len,
        total_len,
        src_port: None,
        dst_port: None,
        trailing_fragment: fragment_offset != 0,
    })
}

fn classify_ipv6(raw: &[u8]) -> Result<ParsedPacket, ClassifyError> {
    if raw.len() < IPV6_HEADER_LEN {
        return Err(ClassifyError::Truncated {
            expected: IPV6_HEADER_LEN,
            actual: raw.len(),
        });
    }

    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&raw[8..24]);
    dst.copy_from_slice(&raw[24..40]);

    let payload_len = u16::from_be_bytes([raw[4], raw[5]]) as usize;
    let total_len = (IPV6_HEADER_LEN + payload_len).min(raw.len());

    Ok(ParsedPacket {
        version: IpVersion::V6,
        src_addr: IpAddr::V6(Ipv6Addr::from(src)),
        dst_addr: IpAddr::V6(Ipv6Addr::from(dst)),
        protocol: TransportProtocol::from(raw[6]),
        header_len: IPV6_HEADER_LEN,
        total_len,
        src_port: None,
        dst_port: None,
        trailing_fragment: false,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
}

impl TcpFlags {
    pub fn syn_ack() -> Self {
        Self { syn: true, ack: true, ..Default::default() }
    }
    pub fn ack_only() -> Self {
        Self { ack: true, ..Default::default() }
    }
    pub fn fin_ack() -> Self {
        Self { fin: true, ack: true, ..Default::default() }
    }
    pub fn rst_ack() -> Self {
        Self { rst: true, ack: true, ..Default::default() }
    }
    pub fn psh_ack() -> Self {
        Self { psh: true, ack: true, ..Default::default() }
    }

    pub fn to_byte(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        flags
    }
}

#[derive(Debug, Clone)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

/// Parse the TCP header of an already classified packet
pub fn parse_tcp_segment<'a>(
    parsed: &ParsedPacket,
    raw: &'a [u8],
) -> Result<TcpSegment<'a>, ClassifyError> {
    let data = parsed.transport(raw);
    let truncated = ClassifyError::Truncated {
        expected: parsed.header_len + TCP_MIN_HEADER_LEN,
        actual: raw.len(),
    };
    let pkt = TcpPacket::new_checked(data).map_err(|_| truncated)?;

    let header_len = pkt.header_len() as usize;
    let mss = if header_len > TCP_MIN_HEADER_LEN {
        parse_mss_option(&data[TCP_MIN_HEADER_LEN..header_len])
    } else {
        None
    };

    Ok(TcpSegment {
        src_port: pkt.src_port(),
        dst_port: pkt.dst_port(),
        seq: pkt.seq_number().0 as u32,
        ack: pkt.ack_number().0 as u32,
        flags: TcpFlags {
            fin: pkt.fin(),
            syn: pkt.syn(),
            rst: pkt.rst(),
            psh: pkt.psh(),
            ack: pkt.ack(),
        },
        window: pkt.window_len(),
        mss,
        payload: &data[header_len..],
    })
}

fn parse_mss_option(opts: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            0 => break,
            1 => i += 1,
            2 if i + 4 <= opts.len() => {
                return Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]));
            }
            _ => {
                let len = *opts.get(i + 1)? as usize;
                if len < 2 {
                    break;
                }
                i += len;
            }
        }
    }
    None
}

/// UDP payload of an already classified packet
pub fn udp_payload<'a>(parsed: &ParsedPacket, raw: &'a [u8]) -> Result<&'a [u8], ClassifyError> {
    let data = parsed.transport(raw);
    let pkt = UdpPacket::new_checked(data).map_err(|_| ClassifyError::Truncated {
        expected: parsed.header_len + UDP_HEADER_LEN,
        actual: raw.len(),
    })?;
    let len = pkt.payload().len();
    Ok(&data[UDP_HEADER_LEN..UDP_HEADER_LEN + len])
}

/// Largest TCP payload that fits the interface MTU
pub fn mss_for_mtu(mtu: u16, version: IpVersion) -> u16 {
    let overhead = match version {
        IpVersion::V4 => IPV4_MIN_HEADER_LEN + TCP_MIN_HEADER_LEN,
        IpVersion::V6 => IPV6_HEADER_LEN + TCP_MIN_HEADER_LEN,
    };
    mtu.saturating_sub(overhead as u16)
}

/// Parameters for a TCP segment written back into the interface
#[derive(Debug, Clone, Copy)]
pub struct TcpReply<'a> {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

/// Build an IP/TCP packet. Returns `None` when the address families differ.
pub fn build_tcp(reply: &TcpReply<'_>) -> Option<Vec<u8>> {
    let opts_len = if reply.flags.syn && reply.mss.is_some() { 4 } else { 0 };
    let tcp_len = TCP_MIN_HEADER_LEN + opts_len + reply.payload.len();

    let mut tcp = vec![0u8; tcp_len];
    tcp[0..2].copy_from_slice(&reply.src.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&reply.dst.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&reply.seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&reply.ack.to_be_bytes());
    tcp[12] = (((TCP_MIN_HEADER_LEN + opts_len) / 4) as u8) << 4;
    tcp[13] = reply.flags.to_byte();
    tcp[14..16].copy_from_slice(&reply.window.to_be_bytes());
    if let (true, Some(mss)) = (opts_len > 0, reply.mss) {
        tcp[20] = 2;
        tcp[21] = 4;
        tcp[22..24].copy_from_slice(&mss.to_be_bytes());
    }
    tcp[TCP_MIN_HEADER_LEN + opts_len..].copy_from_slice(reply.payload);

    wrap_transport(reply.src.ip(), reply.dst.ip(), TransportProtocol::Tcp, tcp, 16)
}

/// Build an IP/UDP packet. Returns `None` when the address families differ
/// or the datagram does not fit the UDP and IP length fields.
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let ip_header = if src.is_ipv4() { IPV4_MIN_HEADER_LEN } else { 0 };
    if udp_len + ip_header > u16::MAX as usize {
        return None;
    }
    let mut udp = vec![0u8; udp_len];
    udp[0..2].copy_from_slice(&src.port().to_be_bytes());
    udp[2..4].copy_from_slice(&dst.port().to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[UDP_HEADER_LEN..].copy_from_slice(payload);

    wrap_transport(src.ip(), dst.ip(), TransportProtocol::Udp, udp, 6)
}

/// Prepend an IP header and fill in the transport checksum at `cksum_at`
fn wrap_transport(
    src: IpAddr,
    dst: IpAddr,
    protocol: TransportProtocol,
    mut segment: Vec<u8>,
    cksum_at: usize,
) -> Option<Vec<u8>> {
    let proto = protocol.number();
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let mut cksum = transport_checksum(&s.octets(), &d.octets(), proto, &segment);
            if protocol == TransportProtocol::Udp && cksum == 0 {
                cksum = 0xFFFF;
            }
            segment[cksum_at..cksum_at + 2].copy_from_slice(&cksum.to_be_bytes());
            Some(ipv4_packet(s, d, proto, &segment))
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let mut cksum = transport_checksum(&s.octets(), &d.octets(), proto, &segment);
            if protocol == TransportProtocol::Udp && cksum == 0 {
                cksum = 0xFFFF;
            }
            segment[cksum_at..cksum_at + 2].copy_from_slice(&cksum.to_be_bytes());
            Some(ipv6_packet(s, d, proto, &segment))
        }
        _ => None,
    }
}

fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, segment: &[u8]) -> Vec<u8> {
    let total_len = IPV4_MIN_HEADER_LEN + segment.len();
    let mut pkt = vec![0u8; total_len];

    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    let ip_id = IP_ID.fetch_add(1, Ordering::Relaxed);
    pkt[4..6].copy_from_slice(&ip_id.to_be_bytes());
    pkt[6..8].copy_from_slice(&0x4000u16.to_be_bytes());
    pkt[8] = 64;
    pkt[9] = proto;
    pkt[12..16].copy_from_slice(&src.octets());
    pkt[16..20].copy_from_slice(&dst.octets());

    let ip_cksum = checksum(&pkt[..IPV4_MIN_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&ip_cksum.to_be_bytes());

    pkt[IPV4_MIN_HEADER_LEN..].copy_from_slice(segment);
    pkt
}

fn ipv6_packet(src: Ipv6Addr, dst: Ipv6Addr, proto: u8, segment: &[u8]) -> Vec<u8> {
    let mut pkt = vec![0u8; IPV6_HEADER_LEN + segment.len()];

    pkt[0] = 0x60;
    pkt[4..6].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    pkt[6] = proto;
    pkt[7] = 64;
    pkt[8..24].copy_from_slice(&src.octets());
    pkt[24..40].copy_from_slice(&dst.octets());
    pkt[IPV6_HEADER_LEN..].copy_from_slice(segment);
    pkt
}

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(0, data))
}

/// RFC 768/793/8200 pseudo-header checksum; `src`/`dst` are 4 or 16 bytes
fn transport_checksum(src: &[u8], dst: &[u8], proto: u8, data: &[u8]) -> u16 {
    let mut sum = sum_words(0, src);
    sum = sum_words(sum, dst);
    sum = sum.wrapping_add(proto as u32);
    let len = data.len() as u32;
    sum = sum.wrapping_add(len >> 16).wrapping_add(len & 0xFFFF);
    fold(sum_words(sum, data))
}

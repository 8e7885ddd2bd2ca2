//! Moves captured packets onto the selected uplink and writes the replies
//! back into the virtual interface.
//!
//! Every flow gets its own long-lived socket, protected from capture and bound
//! to the uplink's current network. UDP flows are relayed over a connected
//! datagram socket; TCP flows are terminated locally and relayed over a stream.

mod socket;
mod tcp;
mod udp;

use crate::config::ForwarderConfig;
use crate::connection_tracker::{ConnectionTracker, FlowRecord};
use crate::error::ForwardError;
use crate::policy::Uplink;
use crate::stats::EngineStats;
use crate::uplink::Uplinks;
use bytes::BytesMut;
use dashmap::DashMap;
use splitlink_netstack::packet::{mss_for_mtu, parse_tcp_segment, udp_payload};
use splitlink_netstack::{FlowKey, ParsedPacket, SocketProtector, TransportProtocol};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use tcp::{TcpSession, TcpSessions};
use udp::UdpRelay;

/// What relay tasks need to reach the interface
#[derive(Clone)]
pub(crate) struct RelayContext {
    pub protector: Arc<dyn SocketProtector>,
    pub tun_tx: mpsc::Sender<BytesMut>,
    pub tracker: Arc<ConnectionTracker>,
    pub stats: Arc<EngineStats>,
    pub config: ForwarderConfig,
}

impl RelayContext {
    /// Queue a reply for the interface; false once the interface is gone
    pub async fn write_back(&self, packet: Vec<u8>, record: Option<&FlowRecord>) -> bool {
        self.stats.reply();
        if let Some(record) = record {
            record.record_inbound(packet.len());
        }
        if self.tun_tx.send(BytesMut::from(&packet[..])).await.is_err() {
            trace!("Virtual interface closed, reply dropped");
            return false;
        }
        true
    }
}

pub struct Forwarder {
    ctx: RelayContext,
    uplinks: Arc<Uplinks>,
    mtu: u16,
    udp: DashMap<FlowKey, UdpRelay>,
    tcp: TcpSessions,
}

impl Forwarder {
    pub fn new(
        config: ForwarderConfig,
        mtu: u16,
        protector: Arc<dyn SocketProtector>,
        uplinks: Arc<Uplinks>,
        tun_tx: mpsc::Sender<BytesMut>,
        tracker: Arc<ConnectionTracker>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            ctx: RelayContext {
                protector,
                tun_tx,
                tracker,
                stats,
                config,
            },
            uplinks,
            mtu,
            udp: DashMap::new(),
            tcp: Arc::new(DashMap::new()),
        }
    }

    /// Send one captured packet over `uplink`
    pub async fn forward(&self, packet: &ParsedPacket, raw: &[u8], uplink: Uplink) -> Result<(), ForwardError> {
        if packet.trailing_fragment {
            return Err(ForwardError::Fragment(packet.protocol));
        }
        match packet.protocol {
            TransportProtocol::Udp => self.forward_udp(packet, raw, uplink),
            TransportProtocol::Tcp => self.forward_tcp(packet, raw, uplink).await,
            other => Err(ForwardError::UnsupportedProtocol(other)),
        }
    }

    fn forward_udp(&self, packet: &ParsedPacket, raw: &[u8], uplink: Uplink) -> Result<(), ForwardError> {
        let network = self
            .uplinks
            .get(uplink)
            .current_handle()
            .ok_or(ForwardError::UplinkUnavailable(uplink))?;
        let payload = udp_payload(packet, raw)?;
        let key = packet.flow_key();

        if let Some(relay) = self.udp.get(&key) {
            if relay.network() == &network && relay.is_alive() {
                return relay.send(payload);
            }
        }
        if let Some((_, stale)) = self.udp.remove(&key) {
            if stale.network() != &network {
                debug!("Uplink {} network changed, reopening {}", uplink, key);
            } else {
                debug!("UDP relay {} lost its reader, reopening", key);
            }
        }

        let relay = UdpRelay::open(&self.ctx, key, network)?;
        relay.send(payload)?;
        self.udp.insert(key, relay);
        Ok(())
    }

    async fn forward_tcp(&self, packet: &ParsedPacket, raw: &[u8], uplink: Uplink) -> Result<(), ForwardError> {
        let seg = parse_tcp_segment(packet, raw)?;
        let key = packet.flow_key();
        let network = self.uplinks.get(uplink).current_handle();

        let existing = self.tcp.get(&key).map(|s| Arc::clone(s.value()));
        if let Some(session) = existing {
            let Some(network) = network else {
                return Err(ForwardError::UplinkUnavailable(uplink));
            };
            if session.network() != &network {
                // The bound network is gone; the stream cannot follow
                debug!("Uplink {} network changed, resetting {}", uplink, key);
                session.abort(&self.ctx, &self.tcp).await;
                return Ok(());
            }
            session.on_client_segment(&self.ctx, &self.tcp, &seg).await;
            return Ok(());
        }

        if seg.flags.rst {
            return Ok(());
        }
        if !seg.flags.syn || seg.flags.ack {
            trace!("Segment for unknown TCP flow {}, resetting", key);
            if let Some(rst) = tcp::reset_for(key, &seg) {
                self.ctx.write_back(rst, None).await;
            }
            return Ok(());
        }

        let network = network.ok_or(ForwardError::UplinkUnavailable(uplink))?;
        let mss = mss_for_mtu(self.mtu, packet.version);
        TcpSession::open(&self.ctx, &self.tcp, &seg, key, network, mss)?;
        Ok(())
    }

    /// Close the relay of one flow, e.g. after idle eviction
    pub fn close_flow(&self, key: &FlowKey) {
        if self.udp.remove(key).is_some() {
            trace!("Closed UDP relay {}", key);
        }
        let session = self.tcp.get(key).map(|s| Arc::clone(s.value()));
        if let Some(session) = session {
            session.close(&self.ctx, &self.tcp);
        }
    }

    /// Close every relay
    pub fn close_all(&self) {
        let udp = self.udp.len();
        self.udp.clear();
        let sessions: Vec<Arc<TcpSession>> = self.tcp.iter().map(|s| Arc::clone(s.value())).collect();
        for session in &sessions {
            session.close(&self.ctx, &self.tcp);
        }
        debug!("Closed {} UDP relays and {} TCP sessions", udp, sessions.len());
    }

    pub fn udp_relays(&self) -> usize {
        self.udp.len()
    }

    pub fn tcp_sessions(&self) -> usize {
        self.tcp.len()
    }

    #[cfg(test)]
    pub(crate) fn udp_relay_alive(&self, key: &FlowKey) -> Option<bool> {
        self.udp.get(key).map(|r| r.is_alive())
    }

    #[cfg(test)]
    pub(crate) fn stop_udp_reader(&self, key: &FlowKey) {
        if let Some(relay) = self.udp.get(key) {
            relay.stop_reader();
        }
    }

    #[cfg(test)]
    pub(crate) fn tcp_state(&self, key: &FlowKey) -> Option<tcp::TcpState> {
        self.tcp.get(key).map(|s| s.state())
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::tcp::TcpState;
    use super::*;
    use crate::policy::{ApplicationId, ApplicationSet, RoutingPolicy};
    use crate::uplink::UplinkManager;
    use splitlink_netstack::packet::{build_tcp, build_udp, TcpFlags, TcpReply};
    use splitlink_netstack::{
        classify, CallbackProtector, ManualMonitor, NetworkEvent, NetworkHandle, NetworkIdentity,
    };
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};

    const CLIENT: &str = "10.0.0.2:40000";

    struct Harness {
        forwarder: Forwarder,
        uplinks: Arc<Uplinks>,
        tracker: Arc<ConnectionTracker>,
        stats: Arc<EngineStats>,
        from_forwarder: mpsc::Receiver<BytesMut>,
        protected: Arc<AtomicUsize>,
    }

    fn harness(protect_ok: bool) -> Harness {
        let monitor = Arc::new(ManualMonitor::new());
        let uplinks = Arc::new(Uplinks::new(
            UplinkManager::new(Uplink::A, monitor.clone()),
            UplinkManager::new(Uplink::B, monitor),
        ));
        let protected = Arc::new(AtomicUsize::new(0));
        let counter = protected.clone();
        let protector = Arc::new(CallbackProtector::new(
            move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
                protect_ok
            },
            |_, _| true,
        ));
        let tracker = Arc::new(ConnectionTracker::new());
        let stats = Arc::new(EngineStats::new());
        let (tx, rx) = mpsc::channel(64);
        let forwarder = Forwarder::new(
            ForwarderConfig::default(),
            1500,
            protector,
            uplinks.clone(),
            tx,
            tracker.clone(),
            stats.clone(),
        );
        Harness {
            forwarder,
            uplinks,
            tracker,
            stats,
            from_forwarder: rx,
            protected,
        }
    }

    impl Harness {
        fn bring_up(&self, uplink: Uplink, id: u64) {
            self.uplinks.get(uplink).apply(NetworkEvent::Available(NetworkHandle::new(id)));
        }

        async fn send(&self, raw: Vec<u8>, uplink: Uplink) -> Result<(), ForwardError> {
            let parsed = classify(&raw).unwrap();
            let policy = RoutingPolicy::new(
                ApplicationSet::default(),
                NetworkIdentity::new("a"),
                NetworkIdentity::new("b"),
            );
            self.tracker.assign(parsed.flow_key(), ApplicationId::Unknown, &policy);
            self.forwarder.forward(&parsed, &raw, uplink).await
        }

        async fn next_reply(&mut self) -> Vec<u8> {
            let reply = tokio::time::timeout(Duration::from_secs(5), self.from_forwarder.recv())
                .await
                .expect("reply timed out")
                .expect("channel closed");
            reply.to_vec()
        }
    }

    fn tcp_packet(dst: SocketAddr, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
        build_tcp(&TcpReply {
            src: CLIENT.parse().unwrap(),
            dst,
            seq,
            ack,
            flags,
            window: 65535,
            mss: flags.syn.then_some(1460),
            payload,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let mut h = harness(true);
        h.bring_up(Uplink::B, 1);

        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            let (n, peer) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], peer).await.unwrap();
        });

        let raw = build_udp(CLIENT.parse().unwrap(), server, b"ping").unwrap();
        h.send(raw, Uplink::B).await.unwrap();
        assert_eq!(h.forwarder.udp_relays(), 1);
        assert_eq!(h.protected.load(Ordering::Relaxed), 1);

        let reply = h.next_reply().await;
        let parsed = classify(&reply).unwrap();
        assert_eq!(parsed.src_socket(), Some(server));
        assert_eq!(parsed.dst_socket(), Some(CLIENT.parse().unwrap()));
        assert_eq!(udp_payload(&parsed, &reply).unwrap(), b"ping");

        let record = h.tracker.get(&parsed.flow_key().reversed()).unwrap();
        assert_eq!(record.snapshot().packets_in, 1);
        assert_eq!(h.stats.snapshot().replies, 1);
    }

    #[tokio::test]
    async fn test_udp_reuses_flow_socket() {
        let h = harness(true);
        h.bring_up(Uplink::A, 1);
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = sink.local_addr().unwrap();

        for _ in 0..3 {
            let raw = build_udp(CLIENT.parse().unwrap(), server, b"x").unwrap();
            h.send(raw, Uplink::A).await.unwrap();
        }
        assert_eq!(h.protected.load(Ordering::Relaxed), 1);

        // A different network for the uplink means a fresh socket
        h.bring_up(Uplink::A, 2);
        let raw = build_udp(CLIENT.parse().unwrap(), server, b"x").unwrap();
        h.send(raw, Uplink::A).await.unwrap();
        assert_eq!(h.protected.load(Ordering::Relaxed), 2);
        assert_eq!(h.forwarder.udp_relays(), 1);
    }

    #[tokio::test]
    async fn test_udp_relay_reopens_after_reader_exit() {
        let mut h = harness(true);
        h.bring_up(Uplink::B, 1);

        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, peer)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], peer).await;
            }
        });

        let raw = build_udp(CLIENT.parse().unwrap(), server, b"one").unwrap();
        let key = classify(&raw).unwrap().flow_key();
        h.send(raw, Uplink::B).await.unwrap();
        h.next_reply().await;

        h.forwarder.stop_udp_reader(&key);
        for _ in 0..100 {
            if h.forwarder.udp_relay_alive(&key) == Some(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.forwarder.udp_relay_alive(&key), Some(false));

        let raw = build_udp(CLIENT.parse().unwrap(), server, b"two").unwrap();
        h.send(raw, Uplink::B).await.unwrap();
        assert_eq!(h.protected.load(Ordering::Relaxed), 2);
        assert_eq!(h.forwarder.udp_relay_alive(&key), Some(true));

        let reply = h.next_reply().await;
        let parsed = classify(&reply).unwrap();
        assert_eq!(udp_payload(&parsed, &reply).unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_unavailable_uplink_drops() {
        let h = harness(true);
        let raw = build_udp(CLIENT.parse().unwrap(), "127.0.0.1:9".parse().unwrap(), b"x").unwrap();
        let err = h.send(raw, Uplink::A).await.unwrap_err();
        assert!(matches!(err, ForwardError::UplinkUnavailable(Uplink::A)));
        assert_eq!(h.protected.load(Ordering::Relaxed), 0);
        assert_eq!(h.forwarder.udp_relays(), 0);
    }

    #[tokio::test]
    async fn test_protect_failure() {
        let h = harness(false);
        h.bring_up(Uplink::B, 1);
        let raw = build_udp(CLIENT.parse().unwrap(), "127.0.0.1:9".parse().unwrap(), b"x").unwrap();
        let err = h.send(raw, Uplink::B).await.unwrap_err();
        assert!(matches!(err, ForwardError::ProtectFailed(_)));
        assert_eq!(h.forwarder.udp_relays(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_protocol() {
        let h = harness(true);
        h.bring_up(Uplink::B, 1);
        let mut raw = vec![0u8; 28];
        raw[0] = 0x45;
        raw[3] = 28;
        raw[9] = 1;
        raw[12..16].copy_from_slice(&[10, 0, 0, 2]);
        raw[16..20].copy_from_slice(&[1, 1, 1, 1]);
        let err = h.send(raw, Uplink::B).await.unwrap_err();
        assert!(matches!(err, ForwardError::UnsupportedProtocol(TransportProtocol::Icmp)));
    }

    #[tokio::test]
    async fn test_tcp_relay() {
        let mut h = harness(true);
        h.bring_up(Uplink::A, 1);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
        });

        // SYN is answered only after the upstream connect
        let syn = TcpFlags { syn: true, ..Default::default() };
        h.send(tcp_packet(server, 100, 0, syn, &[]), Uplink::A).await.unwrap();
        let syn_ack = h.next_reply().await;
        let parsed = classify(&syn_ack).unwrap();
        let seg = parse_tcp_segment(&parsed, &syn_ack).unwrap();
        assert!(seg.flags.syn && seg.flags.ack);
        assert_eq!(seg.ack, 101);
        let server_seq = seg.seq.wrapping_add(1);

        h.send(tcp_packet(server, 101, server_seq, TcpFlags::ack_only(), &[]), Uplink::A)
            .await
            .unwrap();
        let key = parsed.flow_key().reversed();
        assert_eq!(h.forwarder.tcp_state(&key), Some(TcpState::Established));

        h.send(tcp_packet(server, 101, server_seq, TcpFlags::psh_ack(), b"hello"), Uplink::A)
            .await
            .unwrap();
        let ack = h.next_reply().await;
        let parsed_ack = classify(&ack).unwrap();
        assert_eq!(parse_tcp_segment(&parsed_ack, &ack).unwrap().ack, 106);

        // Upstream answers, then closes
        let data = h.next_reply().await;
        let parsed_data = classify(&data).unwrap();
        let seg = parse_tcp_segment(&parsed_data, &data).unwrap();
        assert_eq!(seg.payload, b"world");
        assert_eq!(seg.seq, server_seq);

        let fin = h.next_reply().await;
        let parsed_fin = classify(&fin).unwrap();
        assert!(parse_tcp_segment(&parsed_fin, &fin).unwrap().flags.fin);
        assert!(h.stats.snapshot().replies >= 4);
    }

    #[tokio::test]
    async fn test_tcp_connect_failure_resets_client() {
        let mut h = harness(true);
        h.bring_up(Uplink::B, 1);

        // Bind then drop to get a closed port
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let syn = TcpFlags { syn: true, ..Default::default() };
        h.send(tcp_packet(closed, 100, 0, syn, &[]), Uplink::B).await.unwrap();

        let rst = h.next_reply().await;
        let parsed = classify(&rst).unwrap();
        let seg = parse_tcp_segment(&parsed, &rst).unwrap();
        assert!(seg.flags.rst);
        assert_eq!(seg.ack, 101);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.forwarder.tcp_sessions(), 0);
    }

    #[tokio::test]
    async fn test_stray_tcp_segment_is_reset() {
        let mut h = harness(true);
        h.bring_up(Uplink::B, 1);
        let server: SocketAddr = "127.0.0.1:9".parse().unwrap();
        h.send(tcp_packet(server, 500, 42, TcpFlags::psh_ack(), b"data"), Uplink::B)
            .await
            .unwrap();

        let rst = h.next_reply().await;
        let parsed = classify(&rst).unwrap();
        assert!(parse_tcp_segment(&parsed, &rst).unwrap().flags.rst);
        assert_eq!(h.forwarder.tcp_sessions(), 0);
        assert_eq!(h.protected.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_close_flow() {
        let h = harness(true);
        h.bring_up(Uplink::A, 1);
        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let raw = build_udp(CLIENT.parse().unwrap(), sink.local_addr().unwrap(), b"x").unwrap();
        let key = classify(&raw).unwrap().flow_key();
        h.send(raw, Uplink::A).await.unwrap();

        h.forwarder.close_flow(&key);
        assert_eq!(h.forwarder.udp_relays(), 0);
        h.forwarder.close_all();
    }
}

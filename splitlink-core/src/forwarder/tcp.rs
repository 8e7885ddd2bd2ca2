//! Local termination of captured TCP flows.
//!
//! The client's handshake is answered here only after the upstream connect on
//! the flow's uplink succeeds; a failed connect is answered with RST. Payload
//! is then relayed between the client segments and the upstream stream.

use super::{socket, RelayContext};
use crate::error::ForwardError;
use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::Socket;
use splitlink_netstack::packet::{build_tcp, TcpFlags, TcpReply, TcpSegment};
use splitlink_netstack::{FlowKey, NetworkHandle};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Client segments buffered toward a slow upstream before new ones are dropped
const CLIENT_QUEUE: usize = 256;

/// Upstream bytes held for a client with a closed window before the relay
/// stops reading
const UPSTREAM_BUFFER: usize = 256 * 1024;

/// TCP state (RFC 793), without TIME_WAIT: nothing here reuses ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TcpState {
    SynReceived,
    Established,
    CloseWait,
    FinWait1,
    FinWait2,
    Closing,
    LastAck,
    Closed,
}

impl std::fmt::Display for TcpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What a client segment asks for
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Outcome {
    /// In-order payload for the upstream
    pub data: Vec<u8>,
    pub ack: bool,
    /// Retransmitted SYN; answer with the SYN-ACK again
    pub resend_syn_ack: bool,
    /// Client finished sending
    pub fin: bool,
    /// Connection is over
    pub closed: bool,
}

/// Sequence-number bookkeeping for one terminated flow
pub(crate) struct TcpConnection {
    key: FlowKey,
    state: TcpState,
    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,
    mss: u16,
    /// Receive window we advertise
    window: u16,
    /// Latest receive window the client advertised. No window scaling is
    /// negotiated, so this is the raw header value.
    peer_window: u32,
    syn_ack_sent: bool,
    /// Upstream bytes the client has no window for yet
    unsent: VecDeque<u8>,
    /// Upstream closed; FIN the client once `unsent` drains
    fin_queued: bool,
}

impl TcpConnection {
    /// Passive open from the client's SYN
    pub(crate) fn new_passive(key: FlowKey, syn: &TcpSegment<'_>, mss_limit: u16, window: u16) -> Self {
        let iss: u32 = rand::random();
        let mss = syn.mss.unwrap_or(mss_limit).min(mss_limit).max(1);
        Self {
            key,
            state: TcpState::SynReceived,
            iss,
            snd_una: iss,
            snd_nxt: iss.wrapping_add(1),
            rcv_nxt: syn.seq.wrapping_add(1),
            mss,
            window,
            peer_window: u32::from(syn.window),
            syn_ack_sent: false,
            unsent: VecDeque::new(),
            fin_queued: false,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> TcpState {
        self.state
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == TcpState::Closed
    }

    /// Upstream bytes still waiting for client window
    pub(crate) fn unsent_len(&self) -> usize {
        self.unsent.len()
    }

    pub(crate) fn on_segment(&mut self, seg: &TcpSegment<'_>) -> Outcome {
        let mut out = Outcome::default();
        if seg.flags.rst {
            debug!("TCP RST from client: {}", self.key);
            self.state = TcpState::Closed;
            out.closed = true;
            return out;
        }

        match self.state {
            TcpState::SynReceived => {
                if seg.flags.syn && !seg.flags.ack {
                    out.resend_syn_ack = self.syn_ack_sent;
                    return out;
                }
                if !(seg.flags.ack && self.syn_ack_sent && self.valid_ack(seg.ack)) {
                    return out;
                }
                self.snd_una = seg.ack;
                self.peer_window = u32::from(seg.window);
                self.state = TcpState::Established;
                info!("TCP ESTABLISHED: {}", self.key);
                self.on_data(seg, &mut out);
            }
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2 => {
                if seg.flags.ack {
                    self.process_ack(seg);
                }
                if self.state == TcpState::FinWait1 && self.snd_una == self.snd_nxt {
                    self.state = TcpState::FinWait2;
                }
                self.on_data(seg, &mut out);
            }
            TcpState::CloseWait => {
                if seg.flags.ack {
                    self.process_ack(seg);
                }
            }
            TcpState::Closing | TcpState::LastAck => {
                if seg.flags.ack {
                    self.process_ack(seg);
                }
                if self.snd_una == self.snd_nxt {
                    self.state = TcpState::Closed;
                    out.closed = true;
                }
            }
            TcpState::Closed => out.closed = true,
        }
        out
    }

    fn on_data(&mut self, seg: &TcpSegment<'_>, out: &mut Outcome) {
        let payload = seg.payload;
        let seq_end = seg.seq.wrapping_add(payload.len() as u32);

        if !payload.is_empty() {
            if seq_le(seq_end, self.rcv_nxt) {
                trace!("Retransmission on {}: seq={}", self.key, seg.seq);
                out.ack = true;
            } else if seq_le(seg.seq, self.rcv_nxt) {
                let skip = self.rcv_nxt.wrapping_sub(seg.seq) as usize;
                out.data.extend_from_slice(&payload[skip..]);
                self.rcv_nxt = seq_end;
                out.ack = true;
            } else {
                // Out of order: drop and re-ACK so the client retransmits
                trace!("Out-of-order segment on {}: seq={} expected={}", self.key, seg.seq, self.rcv_nxt);
                out.ack = true;
                return;
            }
        }

        if seg.flags.fin && seq_end == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            out.ack = true;
            out.fin = true;
            self.state = match self.state {
                TcpState::Established => TcpState::CloseWait,
                TcpState::FinWait1 => TcpState::Closing,
                _ => {
                    out.closed = true;
                    TcpState::Closed
                }
            };
            debug!("TCP FIN from client -> {}: {}", self.state, self.key);
        }
    }

    fn valid_ack(&self, ack: u32) -> bool {
        seq_lt(self.snd_una, ack) && seq_le(ack, self.snd_nxt)
    }

    /// Advance `snd_una` and take the advertised window. Duplicate ACKs still
    /// carry window updates.
    fn process_ack(&mut self, seg: &TcpSegment<'_>) {
        if !(seq_le(self.snd_una, seg.ack) && seq_le(seg.ack, self.snd_nxt)) {
            return;
        }
        self.snd_una = seg.ack;
        self.peer_window = u32::from(seg.window);
    }

    /// Room left in the client's window
    fn send_window(&self) -> u32 {
        let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
        self.peer_window.saturating_sub(in_flight)
    }

    fn packet(&self, seq: u32, flags: TcpFlags, mss: Option<u16>, payload: &[u8]) -> Option<Vec<u8>> {
        build_tcp(&TcpReply {
            src: self.key.dst(),
            dst: self.key.src(),
            seq,
            ack: self.rcv_nxt,
            flags,
            window: self.window,
            mss,
            payload,
        })
    }

    pub(crate) fn syn_ack(&mut self) -> Option<Vec<u8>> {
        self.syn_ack_sent = true;
        self.packet(self.iss, TcpFlags::syn_ack(), Some(self.mss), &[])
    }

    pub(crate) fn ack(&self) -> Option<Vec<u8>> {
        self.packet(self.snd_nxt, TcpFlags::ack_only(), None, &[])
    }

    pub(crate) fn reset(&mut self) -> Option<Vec<u8>> {
        self.state = TcpState::Closed;
        self.unsent.clear();
        self.packet(self.snd_nxt, TcpFlags::rst_ack(), None, &[])
    }

    /// Queue upstream bytes and emit whatever the client window allows
    pub(crate) fn on_upstream_data(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        let accepting = matches!(
            self.state,
            TcpState::SynReceived | TcpState::Established | TcpState::CloseWait
        );
        if !accepting || self.fin_queued {
            return Vec::new();
        }
        self.unsent.extend(data);
        self.flush()
    }

    /// Upstream closed its side; FIN the client after the queued bytes
    pub(crate) fn on_upstream_fin(&mut self) -> Vec<Vec<u8>> {
        if matches!(
            self.state,
            TcpState::SynReceived | TcpState::Established | TcpState::CloseWait
        ) {
            self.fin_queued = true;
        }
        self.flush()
    }

    /// Segments of queued upstream data that fit the client window, at most
    /// one MSS each, then the FIN once everything is out
    pub(crate) fn flush(&mut self) -> Vec<Vec<u8>> {
        if !matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            return Vec::new();
        }

        let mut packets = Vec::new();
        loop {
            let len = self
                .unsent
                .len()
                .min(self.mss as usize)
                .min(self.send_window() as usize);
            if len == 0 {
                break;
            }
            let chunk: Vec<u8> = self.unsent.drain(..len).collect();
            packets.extend(self.packet(self.snd_nxt, TcpFlags::psh_ack(), None, &chunk));
            self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
        }

        if self.fin_queued && self.unsent.is_empty() {
            self.fin_queued = false;
            self.state = match self.state {
                TcpState::Established => TcpState::FinWait1,
                _ => TcpState::LastAck,
            };
            packets.extend(self.packet(self.snd_nxt, TcpFlags::fin_ack(), None, &[]));
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
        }
        packets
    }
}

/// RST for a segment that matches no session
pub(crate) fn reset_for(key: FlowKey, seg: &TcpSegment<'_>) -> Option<Vec<u8>> {
    let mut len = seg.payload.len() as u32;
    if seg.flags.syn {
        len += 1;
    }
    if seg.flags.fin {
        len += 1;
    }
    build_tcp(&TcpReply {
        src: key.dst(),
        dst: key.src(),
        seq: if seg.flags.ack { seg.ack } else { 0 },
        ack: seg.seq.wrapping_add(len),
        flags: TcpFlags::rst_ack(),
        window: 0,
        mss: None,
        payload: &[],
    })
}

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// Client bytes for the upstream
struct ClientData {
    data: Vec<u8>,
    fin: bool,
}

pub(crate) type TcpSessions = Arc<DashMap<FlowKey, Arc<TcpSession>>>;

/// A terminated TCP flow and its upstream relay task
pub(crate) struct TcpSession {
    key: FlowKey,
    network: NetworkHandle,
    conn: Mutex<TcpConnection>,
    to_upstream: mpsc::Sender<ClientData>,
    /// Signalled when client ACKs may have opened the window
    acked: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpSession {
    /// Register a session for the client's SYN and start connecting upstream.
    /// The socket is protected and bound before this returns.
    pub(crate) fn open(
        ctx: &RelayContext,
        sessions: &TcpSessions,
        syn: &TcpSegment<'_>,
        key: FlowKey,
        network: NetworkHandle,
        mss_limit: u16,
    ) -> Result<Arc<Self>, ForwardError> {
        let socket = socket::protected_socket(
            ctx.protector.as_ref(),
            &network,
            key.dst(),
            socket2::Type::STREAM,
            socket2::Protocol::TCP,
        )?;

        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let conn = TcpConnection::new_passive(key, syn, mss_limit, ctx.config.tcp_window);
        let session = Arc::new(Self {
            key,
            network,
            conn: Mutex::new(conn),
            to_upstream: tx,
            acked: Notify::new(),
            task: Mutex::new(None),
        });
        sessions.insert(key, session.clone());

        let task = tokio::spawn(session.clone().relay(socket, rx, ctx.clone(), sessions.clone()));
        *session.task.lock() = Some(task);
        debug!("TCP session {} connecting on {}", key, session.network);
        Ok(session)
    }

    pub(crate) fn network(&self) -> &NetworkHandle {
        &self.network
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> TcpState {
        self.conn.lock().state()
    }

    /// Feed one client segment
    pub(crate) async fn on_client_segment(&self, ctx: &RelayContext, sessions: &TcpSessions, seg: &TcpSegment<'_>) {
        let permit = match self.to_upstream.try_reserve() {
            Ok(permit) => Some(permit),
            // Unprocessed and unacknowledged, so the client will retransmit
            Err(TrySendError::Full(())) => {
                trace!("Upstream queue full for {}, segment dropped", self.key);
                return;
            }
            Err(TrySendError::Closed(())) => None,
        };

        let (outcome, replies) = {
            let mut conn = self.conn.lock();
            let outcome = conn.on_segment(seg);
            let mut replies = Vec::new();
            if permit.is_none() && !outcome.closed {
                // Relay already gone
                replies.extend(conn.reset());
            } else {
                if outcome.resend_syn_ack {
                    replies.extend(conn.syn_ack());
                }
                if outcome.ack {
                    replies.extend(conn.ack());
                }
                replies.extend(conn.flush());
            }
            (outcome, replies)
        };
        self.acked.notify_one();

        let record = ctx.tracker.get(&self.key);
        for packet in replies {
            ctx.write_back(packet, record.as_deref()).await;
        }

        if let Some(permit) = permit {
            if !outcome.data.is_empty() || outcome.fin {
                permit.send(ClientData {
                    data: outcome.data,
                    fin: outcome.fin,
                });
            }
        }

        if self.conn.lock().is_closed() {
            self.close(ctx, sessions);
        }
    }

    /// Reset the client and drop the session
    pub(crate) async fn abort(&self, ctx: &RelayContext, sessions: &TcpSessions) {
        let rst = self.conn.lock().reset();
        if let Some(rst) = rst {
            ctx.write_back(rst, None).await;
        }
        self.close(ctx, sessions);
    }

    /// Forget the session and stop its relay
    pub(crate) fn close(&self, ctx: &RelayContext, sessions: &TcpSessions) {
        self.unregister(ctx, sessions);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn unregister(&self, ctx: &RelayContext, sessions: &TcpSessions) {
        let removed = sessions.remove_if(&self.key, |_, s| std::ptr::eq(Arc::as_ptr(s), self));
        if removed.is_some() {
            ctx.tracker.remove(&self.key);
            debug!("TCP session {} closed", self.key);
        }
    }

    async fn relay(
        self: Arc<Self>,
        socket: Socket,
        mut from_client: mpsc::Receiver<ClientData>,
        ctx: RelayContext,
        sessions: TcpSessions,
    ) {
        let key = self.key;
        let record = ctx.tracker.get(&key);

        let connected = tokio::time::timeout(ctx.config.connect_timeout(), socket::connect_stream(socket, key.dst())).await;
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Upstream connect for {} failed: {}", key, e);
                self.reset_and_unregister(&ctx, &sessions).await;
                return;
            }
            Err(_) => {
                debug!("Upstream connect for {} timed out", key);
                self.reset_and_unregister(&ctx, &sessions).await;
                return;
            }
        };

        let syn_ack = self.conn.lock().syn_ack();
        if let Some(packet) = syn_ack {
            ctx.write_back(packet, record.as_deref()).await;
        }

        let (mut reader, mut writer) = stream.into_split();
        let mut buf = vec![0u8; ctx.config.relay_buffer_size];
        let mut upstream_eof = false;

        'relay: loop {
            let paused = self.conn.lock().unsent_len() >= UPSTREAM_BUFFER;
            tokio::select! {
                read = reader.read(&mut buf), if !upstream_eof && !paused => match read {
                    Ok(0) => {
                        upstream_eof = true;
                        let packets = self.conn.lock().on_upstream_fin();
                        for packet in packets {
                            if !ctx.write_back(packet, record.as_deref()).await {
                                break 'relay;
                            }
                        }
                    }
                    Ok(n) => {
                        let packets = self.conn.lock().on_upstream_data(&buf[..n]);
                        for packet in packets {
                            if !ctx.write_back(packet, record.as_deref()).await {
                                break 'relay;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Upstream read for {} failed: {}", key, e);
                        self.reset_and_unregister(&ctx, &sessions).await;
                        return;
                    }
                },
                client = from_client.recv() => match client {
                    Some(ClientData { data, fin }) => {
                        if !data.is_empty() {
                            if let Err(e) = writer.write_all(&data).await {
                                debug!("Upstream write for {} failed: {}", key, e);
                                self.reset_and_unregister(&ctx, &sessions).await;
                                return;
                            }
                        }
                        if fin {
                            let _ = writer.shutdown().await;
                        }
                    }
                    None => break 'relay,
                },
                _ = self.acked.notified(), if paused => {}
            }

            if self.conn.lock().is_closed() {
                break;
            }
        }

        self.unregister(&ctx, &sessions);
    }

    async fn reset_and_unregister(&self, ctx: &RelayContext, sessions: &TcpSessions) {
        let rst = self.conn.lock().reset();
        if let Some(rst) = rst {
            ctx.write_back(rst, None).await;
        }
        self.unregister(ctx, sessions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use splitlink_netstack::packet::parse_tcp_segment;
    use splitlink_netstack::{classify, TransportProtocol};

    fn key() -> FlowKey {
        FlowKey::new(
            "10.0.0.2:40000".parse().unwrap(),
            "93.184.216.34:80".parse().unwrap(),
            TransportProtocol::Tcp,
        )
    }

    fn segment(seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> TcpSegment<'_> {
        TcpSegment {
            src_port: 40000,
            dst_port: 80,
            seq,
            ack,
            flags,
            window: 65535,
            mss: None,
            payload,
        }
    }

    fn syn() -> TcpSegment<'static> {
        let mut syn = segment(1000, 0, TcpFlags { syn: true, ..Default::default() }, &[]);
        syn.mss = Some(1460);
        syn
    }

    fn established() -> (TcpConnection, u32) {
        let mut conn = TcpConnection::new_passive(key(), &syn(), 1460, 65535);
        let syn_ack = conn.syn_ack().unwrap();
        let parsed = classify(&syn_ack).unwrap();
        let reply = parse_tcp_segment(&parsed, &syn_ack).unwrap();
        let server_seq = reply.seq.wrapping_add(1);

        let out = conn.on_segment(&segment(1001, server_seq, TcpFlags::ack_only(), &[]));
        assert_eq!(out, Outcome::default());
        assert_eq!(conn.state(), TcpState::Established);
        (conn, server_seq)
    }

    #[test]
    fn test_syn_ack_acknowledges_client_syn() {
        let mut conn = TcpConnection::new_passive(key(), &syn(), 1400, 65535);
        let packet = conn.syn_ack().unwrap();
        let parsed = classify(&packet).unwrap();
        assert_eq!(parsed.src_socket(), Some(key().dst()));
        assert_eq!(parsed.dst_socket(), Some(key().src()));

        let seg = parse_tcp_segment(&parsed, &packet).unwrap();
        assert!(seg.flags.syn && seg.flags.ack);
        assert_eq!(seg.ack, 1001);
        assert_eq!(seg.mss, Some(1400));
    }

    #[test]
    fn test_retransmitted_syn() {
        let mut conn = TcpConnection::new_passive(key(), &syn(), 1460, 65535);
        // Still connecting upstream: nothing to resend yet
        assert!(!conn.on_segment(&syn()).resend_syn_ack);
        conn.syn_ack();
        assert!(conn.on_segment(&syn()).resend_syn_ack);
    }

    #[test]
    fn test_in_order_and_retransmitted_data() {
        let (mut conn, server_seq) = established();

        let out = conn.on_segment(&segment(1001, server_seq, TcpFlags::psh_ack(), b"GET /"));
        assert_eq!(out.data, b"GET /");
        assert!(out.ack);

        // Full retransmission is only re-acknowledged
        let out = conn.on_segment(&segment(1001, server_seq, TcpFlags::psh_ack(), b"GET /"));
        assert!(out.data.is_empty());
        assert!(out.ack);

        // Partial overlap delivers only the new bytes
        let out = conn.on_segment(&segment(1004, server_seq, TcpFlags::psh_ack(), b" / HTTP"));
        assert_eq!(out.data, b" HTTP");

        // A gap is not delivered
        let out = conn.on_segment(&segment(2000, server_seq, TcpFlags::psh_ack(), b"later"));
        assert!(out.data.is_empty());
        assert!(out.ack);
    }

    #[test]
    fn test_upstream_data_is_segmented_by_mss() {
        let mut conn = TcpConnection::new_passive(key(), &syn(), 100, 65535);
        conn.syn_ack();
        let server_seq = conn.iss.wrapping_add(1);
        conn.on_segment(&segment(1001, server_seq, TcpFlags::ack_only(), &[]));

        let packets = conn.on_upstream_data(&[7u8; 250]);
        assert_eq!(packets.len(), 3);

        let mut expected_seq = server_seq;
        for (packet, len) in packets.iter().zip([100usize, 100, 50]) {
            let parsed = classify(packet).unwrap();
            let seg = parse_tcp_segment(&parsed, packet).unwrap();
            assert_eq!(seg.seq, expected_seq);
            assert_eq!(seg.payload.len(), len);
            expected_seq = expected_seq.wrapping_add(len as u32);
        }
    }

    #[test]
    fn test_upstream_data_before_handshake_completes() {
        let mut conn = TcpConnection::new_passive(key(), &syn(), 1460, 65535);
        conn.syn_ack();
        assert!(conn.on_upstream_data(b"220 smtp ready").is_empty());
        assert!(conn.on_upstream_fin().is_empty());
        assert!(conn.flush().is_empty());

        let server_seq = conn.iss.wrapping_add(1);
        conn.on_segment(&segment(1001, server_seq, TcpFlags::ack_only(), &[]));
        let packets = conn.flush();
        assert_eq!(packets.len(), 2);

        let parsed = classify(&packets[0]).unwrap();
        let seg = parse_tcp_segment(&parsed, &packets[0]).unwrap();
        assert_eq!(seg.payload, b"220 smtp ready");
        assert_eq!(seg.seq, server_seq);
        assert_eq!(conn.state(), TcpState::FinWait1);
        assert!(conn.flush().is_empty());
    }

    #[test]
    fn test_client_closes_first() {
        let (mut conn, server_seq) = established();

        let out = conn.on_segment(&segment(1001, server_seq, TcpFlags::fin_ack(), &[]));
        assert!(out.fin && out.ack && !out.closed);
        assert_eq!(conn.state(), TcpState::CloseWait);

        assert_eq!(conn.on_upstream_fin().len(), 1);
        assert_eq!(conn.state(), TcpState::LastAck);

        let out = conn.on_segment(&segment(1002, server_seq.wrapping_add(1), TcpFlags::ack_only(), &[]));
        assert!(out.closed);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_upstream_closes_first() {
        let (mut conn, server_seq) = established();

        assert_eq!(conn.on_upstream_fin().len(), 1);
        assert_eq!(conn.state(), TcpState::FinWait1);

        conn.on_segment(&segment(1001, server_seq.wrapping_add(1), TcpFlags::ack_only(), &[]));
        assert_eq!(conn.state(), TcpState::FinWait2);

        let out = conn.on_segment(&segment(1001, server_seq.wrapping_add(1), TcpFlags::fin_ack(), &[]));
        assert!(out.fin && out.closed);
    }

    fn payload_bytes(packets: &[Vec<u8>]) -> usize {
        packets
            .iter()
            .map(|packet| {
                let parsed = classify(packet).unwrap();
                parse_tcp_segment(&parsed, packet).unwrap().payload.len()
            })
            .sum()
    }

    #[test]
    fn test_upstream_data_respects_client_window() {
        let mut conn = TcpConnection::new_passive(key(), &syn(), 1460, 65535);
        conn.syn_ack();
        let server_seq = conn.iss.wrapping_add(1);
        let mut ack = segment(1001, server_seq, TcpFlags::ack_only(), &[]);
        ack.window = 1000;
        conn.on_segment(&ack);

        let packets = conn.on_upstream_data(&[7u8; 100_000]);
        assert_eq!(payload_bytes(&packets), 1000);
        assert_eq!(conn.unsent_len(), 99_000);

        // Nothing more until the client acknowledges
        assert!(conn.flush().is_empty());
        assert!(conn.on_upstream_data(&[8u8; 10]).is_empty());
        assert_eq!(conn.unsent_len(), 99_010);

        // 600 acknowledged with the same window frees 600 bytes
        let mut ack = segment(1001, server_seq.wrapping_add(600), TcpFlags::ack_only(), &[]);
        ack.window = 1000;
        conn.on_segment(&ack);
        assert_eq!(payload_bytes(&conn.flush()), 600);

        // Everything acknowledged but a zero window
        let mut ack = segment(1001, server_seq.wrapping_add(1600), TcpFlags::ack_only(), &[]);
        ack.window = 0;
        conn.on_segment(&ack);
        assert!(conn.flush().is_empty());

        // A window update on a duplicate ACK reopens the flow
        ack.window = 2000;
        conn.on_segment(&ack);
        assert_eq!(payload_bytes(&conn.flush()), 2000);
        assert_eq!(conn.unsent_len(), 99_010 - 2600);
    }

    #[test]
    fn test_upstream_fin_waits_for_buffered_data() {
        let mut conn = TcpConnection::new_passive(key(), &syn(), 1460, 65535);
        conn.syn_ack();
        let server_seq = conn.iss.wrapping_add(1);
        let mut ack = segment(1001, server_seq, TcpFlags::ack_only(), &[]);
        ack.window = 500;
        conn.on_segment(&ack);

        assert_eq!(payload_bytes(&conn.on_upstream_data(&[1u8; 800])), 500);
        assert!(conn.on_upstream_fin().is_empty());
        assert_eq!(conn.state(), TcpState::Established);

        let mut ack = segment(1001, server_seq.wrapping_add(500), TcpFlags::ack_only(), &[]);
        ack.window = 500;
        conn.on_segment(&ack);
        let packets = conn.flush();
        assert_eq!(packets.len(), 2);
        assert_eq!(payload_bytes(&packets), 300);

        let parsed = classify(&packets[1]).unwrap();
        let fin = parse_tcp_segment(&parsed, &packets[1]).unwrap();
        assert!(fin.flags.fin);
        assert_eq!(fin.seq, server_seq.wrapping_add(800));
        assert_eq!(conn.state(), TcpState::FinWait1);
    }

    #[test]
    fn test_client_reset() {
        let (mut conn, server_seq) = established();
        let rst = TcpFlags { rst: true, ..Default::default() };
        assert!(conn.on_segment(&segment(1001, server_seq, rst, &[])).closed);
        assert!(conn.on_upstream_data(b"late").is_empty());
    }

    #[test]
    fn test_reset_for_stray_segment() {
        let stray = segment(5000, 77, TcpFlags::psh_ack(), b"abc");
        let packet = reset_for(key(), &stray).unwrap();
        let parsed = classify(&packet).unwrap();
        let seg = parse_tcp_segment(&parsed, &packet).unwrap();
        assert!(seg.flags.rst);
        assert_eq!(seg.seq, 77);
        assert_eq!(seg.ack, 5003);
    }

    #[test]
    fn test_sequence_wraparound() {
        assert!(seq_lt(u32::MAX - 1, 2));
        assert!(!seq_lt(2, u32::MAX - 1));
        assert!(seq_le(5, 5));
    }
}

use super::{socket, RelayContext};
use crate::error::ForwardError;
use splitlink_netstack::packet::build_udp;
use splitlink_netstack::{FlowKey, NetworkHandle};
use std::io;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// One UDP flow relayed over a connected socket on its uplink
pub(crate) struct UdpRelay {
    socket: Arc<UdpSocket>,
    network: NetworkHandle,
    task: JoinHandle<()>,
}

impl UdpRelay {
    pub(crate) fn open(ctx: &RelayContext, key: FlowKey, network: NetworkHandle) -> Result<Self, ForwardError> {
        let socket = Arc::new(socket::connected_udp(ctx.protector.as_ref(), &network, key.dst())?);
        debug!("UDP relay {} opened on {}", key, network);

        let reader = socket.clone();
        let ctx = ctx.clone();
        let task = tokio::spawn(async move {
            let record = ctx.tracker.get(&key);
            let mut buf = vec![0u8; ctx.config.relay_buffer_size];
            loop {
                let n = match reader.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("UDP relay {} receive failed: {}", key, e);
                        break;
                    }
                };
                // Replies come from the flow's destination back to its source
                let Some(packet) = build_udp(key.dst(), key.src(), &buf[..n]) else {
                    break;
                };
                if !ctx.write_back(packet, record.as_deref()).await {
                    break;
                }
            }
            trace!("UDP relay {} reader finished", key);
        });

        Ok(Self { socket, network, task })
    }

    pub(crate) fn network(&self) -> &NetworkHandle {
        &self.network
    }

    /// Whether replies still reach the client. A relay whose reader ended is
    /// replaced on the next datagram.
    pub(crate) fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    #[cfg(test)]
    pub(crate) fn stop_reader(&self) {
        self.task.abort();
    }

    /// Send one datagram. A full socket buffer drops it, as the network would.
    pub(crate) fn send(&self, payload: &[u8]) -> Result<(), ForwardError> {
        match self.socket.try_send(payload) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("UDP socket busy, datagram dropped");
                Ok(())
            }
            Err(e) => Err(ForwardError::Io(e)),
        }
    }
}

impl Drop for UdpRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

//! UDP stand-in for the radio: multicast group = broadcast channel, direct datagram = unicast.
//!
//! Every datagram is wrapped in a 5-byte envelope: channel (1), sender address (2),
//! recipient address (2, zero on broadcast), then the routing payload.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use meshroute_core::NodeAddress;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

const CHANNEL_BROADCAST: u8 = 1;
const CHANNEL_UNICAST: u8 = 2;
const ENVELOPE_LEN: usize = 5;
const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Broadcast { from: NodeAddress, payload: Vec<u8> },
    Unicast { from: NodeAddress, payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Envelope {
    channel: u8,
    sender: NodeAddress,
    recipient: NodeAddress,
}

fn encode_envelope(env: &Envelope, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENVELOPE_LEN + payload.len());
    out.push(env.channel);
    out.extend_from_slice(env.sender.as_bytes());
    out.extend_from_slice(env.recipient.as_bytes());
    out.extend_from_slice(payload);
    out
}

fn decode_envelope(buf: &[u8]) -> Option<(Envelope, &[u8])> {
    if buf.len() < ENVELOPE_LEN {
        return None;
    }
    let channel = buf[0];
    if channel != CHANNEL_BROADCAST && channel != CHANNEL_UNICAST {
        return None;
    }
    let env = Envelope {
        channel,
        sender: NodeAddress::from_bytes([buf[1], buf[2]]),
        recipient: NodeAddress::from_bytes([buf[3], buf[4]]),
    };
    Some((env, &buf[ENVELOPE_LEN..]))
}

/// One node's radio. Learns each neighbor's socket address from the datagrams it hears.
pub struct Radio {
    socket: Arc<UdpSocket>,
    me: NodeAddress,
    group: SocketAddr,
    port: u16,
    /// Empty: hear everyone.
    in_range: HashSet<NodeAddress>,
    peers: HashMap<NodeAddress, SocketAddr>,
    buf: Vec<u8>,
}

impl Radio {
    pub async fn open(
        me: NodeAddress,
        group: Ipv4Addr,
        port: u16,
        in_range: impl IntoIterator<Item = NodeAddress>,
    ) -> std::io::Result<Self> {
        let socket = make_multicast_socket(group, port)?;
        Ok(Self {
            socket: Arc::new(socket),
            me,
            group: SocketAddr::V4(SocketAddrV4::new(group, port)),
            port,
            in_range: in_range.into_iter().collect(),
            peers: HashMap::new(),
            buf: vec![0u8; MAX_DATAGRAM],
        })
    }

    /// Next datagram for this node. `None` for datagrams that are dropped: malformed,
    /// our own, out of range, or unicast to someone else.
    pub async fn recv(&mut self) -> std::io::Result<Option<Received>> {
        let (n, from_addr) = self.socket.recv_from(&mut self.buf).await?;
        let Some((env, payload)) = decode_envelope(&self.buf[..n]) else {
            trace!(%from_addr, "dropping malformed datagram");
            return Ok(None);
        };
        if env.sender == self.me {
            return Ok(None);
        }
        if !self.in_range.is_empty() && !self.in_range.contains(&env.sender) {
            trace!(sender = %env.sender, "out of range");
            return Ok(None);
        }
        if self.peers.insert(env.sender, from_addr) != Some(from_addr) {
            debug!(peer = %env.sender, %from_addr, "neighbor heard");
        }
        let from = env.sender;
        let payload = payload.to_vec();
        match env.channel {
            CHANNEL_UNICAST if env.recipient == self.me => {
                Ok(Some(Received::Unicast { from, payload }))
            }
            CHANNEL_UNICAST => Ok(None),
            _ => Ok(Some(Received::Broadcast { from, payload })),
        }
    }

    /// Broadcast after `delay`. Sending happens in a spawned task so the caller never waits.
    pub fn broadcast_after(&self, payload: &[u8], delay: Duration) {
        let datagram = encode_envelope(
            &Envelope {
                channel: CHANNEL_BROADCAST,
                sender: self.me,
                recipient: NodeAddress::new(0, 0),
            },
            payload,
        );
        let socket = self.socket.clone();
        let group = self.group;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = socket.send_to(&datagram, group).await {
                warn!(error = %e, "broadcast failed");
            }
        });
    }

    /// Unicast to a neighbor heard earlier. Returns false if the neighbor was never heard.
    pub async fn unicast(&self, to: NodeAddress, payload: &[u8]) -> std::io::Result<bool> {
        let Some(addr) = self.peers.get(&to) else {
            return Ok(false);
        };
        let dest = SocketAddr::new(addr.ip(), self.port);
        let datagram = encode_envelope(
            &Envelope {
                channel: CHANNEL_UNICAST,
                sender: self.me,
                recipient: to,
            },
            payload,
        );
        self.socket.send_to(&datagram, dest).await?;
        Ok(true)
    }
}

fn make_multicast_socket(group: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", port))?;
    std_sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(false)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_channel_and_addresses() {
        let env = Envelope {
            channel: CHANNEL_UNICAST,
            sender: NodeAddress::new(2, 0),
            recipient: NodeAddress::new(3, 0),
        };
        let datagram = encode_envelope(&env, b"ack");
        assert_eq!(datagram, vec![2, 2, 0, 3, 0, b'a', b'c', b'k']);
        let (decoded, payload) = decode_envelope(&datagram).unwrap();
        assert_eq!(decoded, env);
        assert_eq!(payload, b"ack");
    }

    #[test]
    fn short_or_unknown_datagrams_rejected() {
        assert!(decode_envelope(&[1, 2, 0]).is_none());
        assert!(decode_envelope(&[9, 2, 0, 3, 0]).is_none());
        let (_, payload) = decode_envelope(&[1, 2, 0, 0, 0]).unwrap();
        assert!(payload.is_empty());
    }
}

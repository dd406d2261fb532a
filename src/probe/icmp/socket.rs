//! Blocking ICMP sockets with cancellation-aware receive.
//!
//! Runs inside spawn_blocking for sub-millisecond timing precision; reads use
//! short timeouts so a cancelled probe releases its thread promptly.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio_util::sync::CancellationToken;

use super::packet::{self, Reply};
use crate::probe::ProbeError;

/// Longest time a blocking call runs before cancellation is checked again.
const CANCEL_POLL: Duration = Duration::from_millis(50);
const RECV_BUF_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Privileged; sees every ICMP message including router errors.
    Raw,
    /// Unprivileged echo-only socket; the kernel owns the identifier.
    Dgram,
}

/// A reply received before the deadline.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Received {
    pub reply: Reply,
    pub from: IpAddr,
    pub at: Instant,
}

#[derive(Debug)]
pub struct IcmpSocket {
    socket: Socket,
    kind: SocketKind,
    v6: bool,
}

impl IcmpSocket {
    pub(crate) fn open(ip: IpAddr, kind: SocketKind) -> io::Result<Self> {
        let v6 = ip.is_ipv6();
        let (domain, protocol) = if v6 {
            (Domain::IPV6, Protocol::ICMPV6)
        } else {
            (Domain::IPV4, Protocol::ICMPV4)
        };
        let ty = match kind {
            SocketKind::Raw => Type::RAW,
            SocketKind::Dgram => Type::DGRAM,
        };

        let socket = Socket::new(domain, ty, Some(protocol))?;
        socket.set_write_timeout(Some(Duration::from_secs(1)))?;
        Ok(Self { socket, kind, v6 })
    }

    pub fn is_v6(&self) -> bool {
        self.v6
    }

    /// Set the TTL (IPv4) or unicast hop limit (IPv6) of outgoing packets.
    pub(crate) fn set_hop_limit(&self, hops: u8) -> Result<(), ProbeError> {
        let result = if self.v6 {
            self.socket.set_unicast_hops_v6(hops as u32)
        } else {
            self.socket.set_ttl(hops as u32)
        };
        result.map_err(|e| ProbeError::Internal(format!("failed to set hop limit {}: {}", hops, e)))
    }

    /// Send one packet; returns the send instant.
    pub(crate) fn send_to(&self, packet: &[u8], dest: IpAddr) -> Result<Instant, ProbeError> {
        let addr = SockAddr::from(SocketAddr::new(dest, 0));
        let sent_at = Instant::now();
        self.socket.send_to(packet, &addr).map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied => permission_error(e),
            _ => ProbeError::Connection(format!("failed to send to {}: {}", dest, e)),
        })?;
        Ok(sent_at)
    }

    /// Wait for the next parseable ICMP message until `deadline`.
    ///
    /// Returns `Ok(None)` when the deadline passes first.
    pub(crate) fn recv_until(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<Received>, ProbeError> {
        let mut buf = [MaybeUninit::<u8>::uninit(); RECV_BUF_LEN];
        loop {
            if cancel.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let slice = (deadline - now).min(CANCEL_POLL).max(Duration::from_millis(1));
            self.socket
                .set_read_timeout(Some(slice))
                .map_err(|e| ProbeError::Internal(format!("failed to set read timeout: {}", e)))?;

            let (len, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(ProbeError::Connection(format!("failed to receive: {}", e))),
            };
            let at = Instant::now();

            // SAFETY: recv_from initialized the first `len` bytes
            let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

            let ip_header = self.kind == SocketKind::Raw && !self.v6;
            let Some(reply) = packet::parse_reply(data, self.v6, ip_header) else {
                continue;
            };
            let Some(from) = from.as_socket().map(|a| a.ip()) else {
                continue;
            };
            return Ok(Some(Received { reply, from, at }));
        }
    }

    /// Whether a reply belongs to the request `(identifier, sequence)`.
    ///
    /// Datagram sockets get their identifier rewritten by the kernel, which
    /// also filters replies per socket, so only the sequence is compared.
    pub(crate) fn matches(&self, reply: &Reply, identifier: u16, sequence: u16) -> bool {
        let (id, seq) = reply.id_seq();
        match self.kind {
            SocketKind::Raw => id == identifier && seq == sequence,
            SocketKind::Dgram => seq == sequence,
        }
    }
}

/// Sleep until `until`, returning early with an error on cancellation.
pub(crate) fn pause_until(until: Instant, cancel: &CancellationToken) -> Result<(), ProbeError> {
    loop {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        let now = Instant::now();
        if now >= until {
            return Ok(());
        }
        std::thread::sleep((until - now).min(CANCEL_POLL));
    }
}

pub(crate) fn permission_error(e: io::Error) -> ProbeError {
    ProbeError::Permission(format!(
        "{} (raw ICMP needs root or CAP_NET_RAW; unprivileged ping needs net.ipv4.ping_group_range)",
        e
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_until_observes_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Instant::now();
        let result = pause_until(started + Duration::from_secs(5), &cancel);
        assert!(matches!(result, Err(ProbeError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_pause_until_past_deadline_returns() {
        assert!(pause_until(Instant::now(), &CancellationToken::new()).is_ok());
    }

    #[test]
    fn test_dgram_matches_on_sequence_only() {
        // opening may fail without ping_group_range; nothing to check then
        let Ok(socket) = IcmpSocket::open("127.0.0.1".parse().unwrap(), SocketKind::Dgram) else {
            return;
        };
        let reply = Reply::Echo { id: 1, seq: 9 };
        assert!(socket.matches(&reply, 500, 9));
        assert!(!socket.matches(&reply, 500, 10));
    }
}

//! Traceroute over ICMP echo with an increasing hop limit.

use std::net::IpAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::packet::{self, Reply};
use super::socket::IcmpSocket;
use crate::model::{Hop, IcmpMetrics, IcmpOptions};
use crate::probe::ProbeError;
use crate::stats::{compute_stats, duration_ms};

/// Outcome of one hop-limit value.
enum HopResponse {
    /// A router reported the hop limit expired.
    Router,
    /// The destination answered the echo.
    Destination,
    /// Something on the path reported the destination unreachable.
    Unreachable,
}

/// Walk hop limits from 1 until the destination answers, something reports
/// it unreachable, or `max_hops` is reached. A hop that stays silent for all
/// attempts is recorded without address and RTT.
pub(crate) fn run(
    socket: &IcmpSocket,
    dest: IpAddr,
    opts: &IcmpOptions,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<IcmpMetrics, ProbeError> {
    let identifier: u16 = rand::random();
    let mut samples: Vec<Option<Duration>> = Vec::new();
    let mut hops = Vec::with_capacity(opts.max_hops as usize);
    let mut reached = false;

    for ttl in 1..=opts.max_hops {
        socket.set_hop_limit(ttl)?;
        let mut hop = Hop {
            hop_index: ttl,
            address: None,
            rtt_ms: None,
        };
        let mut terminal = false;

        for _ in 0..opts.attempts_per_hop {
            if cancel.is_cancelled() {
                return Err(ProbeError::Cancelled);
            }

            let sequence = packet::next_sequence();
            let request = packet::echo_request(socket.is_v6(), identifier, sequence, opts.payload_size);
            let sent_at = match socket.send_to(&request, dest) {
                Ok(at) => at,
                Err(e @ ProbeError::Permission(_)) => return Err(e),
                Err(e) => {
                    tracing::debug!(%dest, ttl, "traceroute probe not sent: {}", e);
                    samples.push(None);
                    continue;
                }
            };

            let deadline = sent_at + timeout;
            let mut answer = None;
            while let Some(received) = socket.recv_until(deadline, cancel)? {
                if !socket.matches(&received.reply, identifier, sequence) {
                    continue;
                }
                let response = match received.reply {
                    Reply::Echo { .. } if received.from == dest => HopResponse::Destination,
                    Reply::Echo { .. } => continue,
                    Reply::TimeExceeded { .. } => HopResponse::Router,
                    Reply::Unreachable { .. } => HopResponse::Unreachable,
                };
                answer = Some((received, response));
                break;
            }

            let Some((received, response)) = answer else {
                samples.push(None);
                continue;
            };

            let rtt = received.at - sent_at;
            samples.push(Some(rtt));
            hop.address = Some(received.from);
            hop.rtt_ms = Some(duration_ms(rtt));
            match response {
                HopResponse::Router => {}
                HopResponse::Destination => {
                    reached = true;
                    terminal = true;
                }
                HopResponse::Unreachable => terminal = true,
            }
            break;
        }

        tracing::debug!(%dest, "{}", hop);
        hops.push(hop);
        if terminal {
            break;
        }
    }

    let stats = compute_stats(&samples, samples.len());
    Ok(IcmpMetrics::from_stats(&stats, hops, Some(reached)))
}

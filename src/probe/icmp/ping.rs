//! Ping burst: `count` echo requests at a fixed interval over one socket.

use std::net::IpAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::packet::{self, Reply};
use super::socket::{pause_until, IcmpSocket};
use crate::model::{IcmpMetrics, IcmpOptions};
use crate::probe::ProbeError;
use crate::stats::compute_stats;

/// Send the burst and wait up to `timeout` for each reply.
///
/// A reply that arrives after its packet was written off as lost carries an
/// older sequence number and is discarded.
pub(crate) fn run(
    socket: &IcmpSocket,
    dest: IpAddr,
    opts: &IcmpOptions,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<IcmpMetrics, ProbeError> {
    let count = opts.count as usize;
    let identifier: u16 = rand::random();
    let mut samples: Vec<Option<Duration>> = Vec::with_capacity(count);

    for i in 0..count {
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }

        let sequence = packet::next_sequence();
        let request = packet::echo_request(socket.is_v6(), identifier, sequence, opts.payload_size);

        let sent_at = match socket.send_to(&request, dest) {
            Ok(at) => at,
            Err(e @ ProbeError::Permission(_)) => return Err(e),
            Err(e) => {
                tracing::debug!(%dest, sequence, "echo request not sent: {}", e);
                samples.push(None);
                if i + 1 < count {
                    pause_until(std::time::Instant::now() + opts.interval(), cancel)?;
                }
                continue;
            }
        };

        let deadline = sent_at + timeout;
        let mut rtt = None;
        while let Some(received) = socket.recv_until(deadline, cancel)? {
            let is_echo = matches!(received.reply, Reply::Echo { .. });
            if is_echo && received.from == dest && socket.matches(&received.reply, identifier, sequence) {
                rtt = Some(received.at - sent_at);
                break;
            }
        }
        samples.push(rtt);

        if i + 1 < count {
            pause_until(sent_at + opts.interval(), cancel)?;
        }
    }

    let stats = compute_stats(&samples, count);
    tracing::debug!(
        %dest,
        sent = stats.sent,
        received = stats.received,
        avg_ms = stats.avg_ms,
        "ping burst completed"
    );
    Ok(IcmpMetrics::from_stats(&stats, Vec::new(), None))
}

//! ICMP and ICMPv6 echo packets and reply parsing.

use std::sync::atomic::{AtomicU16, Ordering};

pub(crate) const ICMP_HEADER_LEN: usize = 8;
const IPV6_HEADER_LEN: usize = 40;

const ECHO_REPLY_V4: u8 = 0;
const UNREACHABLE_V4: u8 = 3;
const ECHO_REQUEST_V4: u8 = 8;
const TIME_EXCEEDED_V4: u8 = 11;

const UNREACHABLE_V6: u8 = 1;
const TIME_EXCEEDED_V6: u8 = 3;
const ECHO_REQUEST_V6: u8 = 128;
const ECHO_REPLY_V6: u8 = 129;

/// Process-wide sequence counter so concurrent probes never reuse a sequence.
static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

pub(crate) fn next_sequence() -> u16 {
    PING_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// An ICMP message relevant to an echo probe, with the identifier and
/// sequence of the request it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    Echo { id: u16, seq: u16 },
    TimeExceeded { id: u16, seq: u16 },
    Unreachable { id: u16, seq: u16 },
}

impl Reply {
    pub fn id_seq(&self) -> (u16, u16) {
        match *self {
            Reply::Echo { id, seq } | Reply::TimeExceeded { id, seq } | Reply::Unreachable { id, seq } => (id, seq),
        }
    }
}

/// RFC 1071 internet checksum.
pub(crate) fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build an echo request with a patterned payload.
///
/// The ICMPv6 checksum covers a pseudo-header only the kernel knows, so it
/// is left zero for the kernel to fill in.
pub(crate) fn echo_request(v6: bool, identifier: u16, sequence: u16, payload_size: usize) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_LEN + payload_size];
    packet[0] = if v6 { ECHO_REQUEST_V6 } else { ECHO_REQUEST_V4 };
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    for (i, byte) in packet[ICMP_HEADER_LEN..].iter_mut().enumerate() {
        *byte = (i % 256) as u8;
    }

    if !v6 {
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

/// Parse a received datagram.
///
/// `ip_header` is set for raw IPv4 sockets, which deliver the IP header in
/// front of the ICMP message.
pub(crate) fn parse_reply(buf: &[u8], v6: bool, ip_header: bool) -> Option<Reply> {
    let icmp = if ip_header { skip_ipv4_header(buf)? } else { buf };
    if icmp.len() < ICMP_HEADER_LEN {
        return None;
    }

    let (echo_reply, time_exceeded, unreachable) = if v6 {
        (ECHO_REPLY_V6, TIME_EXCEEDED_V6, UNREACHABLE_V6)
    } else {
        (ECHO_REPLY_V4, TIME_EXCEEDED_V4, UNREACHABLE_V4)
    };

    let kind = icmp[0];
    if kind == echo_reply {
        let (id, seq) = id_seq(icmp)?;
        return Some(Reply::Echo { id, seq });
    }

    if kind != time_exceeded && kind != unreachable {
        return None;
    }

    // error messages quote the offending datagram after their own header
    let quoted = &icmp[ICMP_HEADER_LEN..];
    let inner = if v6 {
        quoted.get(IPV6_HEADER_LEN..)?
    } else {
        skip_ipv4_header(quoted)?
    };
    let (id, seq) = id_seq(inner)?;

    if kind == time_exceeded {
        Some(Reply::TimeExceeded { id, seq })
    } else {
        Some(Reply::Unreachable { id, seq })
    }
}

fn skip_ipv4_header(buf: &[u8]) -> Option<&[u8]> {
    let first = *buf.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let ihl = ((first & 0x0F) as usize) * 4;
    if ihl < 20 {
        return None;
    }
    buf.get(ihl..)
}

fn id_seq(icmp: &[u8]) -> Option<(u16, u16)> {
    if icmp.len() < ICMP_HEADER_LEN {
        return None;
    }
    Some((
        u16::from_be_bytes([icmp[4], icmp[5]]),
        u16::from_be_bytes([icmp[6], icmp[7]]),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_header() -> Vec<u8> {
        let mut header = vec![0u8; 20];
        header[0] = 0x45;
        header[9] = 1; // protocol ICMP
        header
    }

    #[test]
    fn test_checksum_validates() {
        let packet = echo_request(false, 0x1234, 7, 56);
        assert_eq!(packet.len(), 64);
        assert_eq!(checksum(&packet), 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        // 0x0102 + 0x0300 = 0x0402
        assert_eq!(checksum(&[1, 2, 3]), !0x0402);
    }

    #[test]
    fn test_echo_request_layout() {
        let packet = echo_request(true, 0xABCD, 0x0102, 4);
        assert_eq!(packet[0], ECHO_REQUEST_V6);
        assert_eq!(&packet[2..4], &[0, 0]);
        assert_eq!(&packet[4..8], &[0xAB, 0xCD, 0x01, 0x02]);
        assert_eq!(&packet[8..], &[0, 1, 2, 3]);
    }

    #[test]
    fn test_parse_v4_echo_reply_with_ip_header() {
        let mut reply = echo_request(false, 99, 5, 8);
        reply[0] = ECHO_REPLY_V4;
        let mut datagram = ipv4_header();
        datagram.extend_from_slice(&reply);

        assert_eq!(parse_reply(&datagram, false, true), Some(Reply::Echo { id: 99, seq: 5 }));
        // the same bytes without the header flag do not parse as ICMP
        assert_eq!(parse_reply(&datagram, false, false), None);
        assert_eq!(parse_reply(&reply, false, false), Some(Reply::Echo { id: 99, seq: 5 }));
    }

    #[test]
    fn test_parse_time_exceeded_quotes_original() {
        let original = echo_request(false, 0x4242, 17, 8);
        let mut message = vec![TIME_EXCEEDED_V4, 0, 0, 0, 0, 0, 0, 0];
        message.extend_from_slice(&ipv4_header());
        message.extend_from_slice(&original[..8]);

        let mut datagram = ipv4_header();
        datagram.extend_from_slice(&message);
        let reply = parse_reply(&datagram, false, true).unwrap();
        assert_eq!(reply, Reply::TimeExceeded { id: 0x4242, seq: 17 });
        assert_eq!(reply.id_seq(), (0x4242, 17));
    }

    #[test]
    fn test_parse_v6_unreachable() {
        let original = echo_request(true, 1, 2, 0);
        let mut message = vec![UNREACHABLE_V6, 0, 0, 0, 0, 0, 0, 0];
        message.extend_from_slice(&[0u8; IPV6_HEADER_LEN]);
        message.extend_from_slice(&original);

        assert_eq!(parse_reply(&message, true, false), Some(Reply::Unreachable { id: 1, seq: 2 }));
    }

    #[test]
    fn test_ignores_requests_and_truncated_data() {
        let request = echo_request(false, 1, 1, 0);
        assert_eq!(parse_reply(&request, false, false), None);
        assert_eq!(parse_reply(&[0, 0, 0], false, false), None);
        let truncated = [TIME_EXCEEDED_V4, 0, 0, 0, 0, 0, 0, 0, 0x45];
        assert_eq!(parse_reply(&truncated, false, false), None);
    }

    #[test]
    fn test_sequence_advances() {
        let a = next_sequence();
        let b = next_sequence();
        assert_ne!(a, b);
    }
}

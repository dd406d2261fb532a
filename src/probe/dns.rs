//! Minimal DNS wire format for the UDP DNS probe.
//!
//! Only what the probe needs: a single-question query and header-level
//! validation of the response.

use std::sync::OnceLock;

use regex::Regex;

use super::ProbeError;

pub(crate) const DNS_PORT: u16 = 53;

const HEADER_LEN: usize = 12;
const QTYPE_A: u16 = 1;
const QCLASS_IN: u16 = 1;

/// Header fields of a validated response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DnsResponse {
    pub rcode: u8,
    pub answer_count: u16,
}

/// Check that `name` is a syntactically valid DNS name.
pub(crate) fn validate_name(name: &str) -> Result<(), ProbeError> {
    static LABELS: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    let re = LABELS
        .get_or_init(|| {
            Regex::new(r"^([A-Za-z0-9_]([A-Za-z0-9_-]{0,61}[A-Za-z0-9_])?\.)*[A-Za-z0-9_]([A-Za-z0-9_-]{0,61}[A-Za-z0-9_])?\.?$")
        })
        .as_ref()
        .map_err(|e| ProbeError::Internal(format!("DNS name pattern: {}", e)))?;

    if name.len() > 253 || !re.is_match(name) {
        return Err(ProbeError::Config(format!("invalid DNS query name: {:?}", name)));
    }
    Ok(())
}

/// Build a single-question A/IN query for `name` with recursion desired.
pub(crate) fn build_query(name: &str, tx_id: u16) -> Result<Vec<u8>, ProbeError> {
    validate_name(name)?;

    let flags: u16 = 0x0100; // Standard query, recursion desired
    let qd_count: u16 = 1;

    let mut packet = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&qd_count.to_be_bytes());
    packet.extend_from_slice(&[0u8; 6]); // AN, NS, AR counts

    for label in name.trim_end_matches('.').split('.') {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&QTYPE_A.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());

    Ok(packet)
}

/// Validate a response header against the query's transaction ID.
///
/// A non-zero RCODE is still a well-formed response.
pub(crate) fn parse_response(response: &[u8], tx_id: u16) -> Result<DnsResponse, ProbeError> {
    if response.len() < HEADER_LEN {
        return Err(ProbeError::ProtocolMismatch(format!(
            "DNS response too short: {} bytes",
            response.len()
        )));
    }

    let resp_tx_id = u16::from_be_bytes([response[0], response[1]]);
    if resp_tx_id != tx_id {
        return Err(ProbeError::ProtocolMismatch(format!(
            "transaction ID mismatch: got {:#06x}, expected {:#06x}",
            resp_tx_id, tx_id
        )));
    }

    // QR bit must mark a response
    if response[2] & 0x80 == 0 {
        return Err(ProbeError::ProtocolMismatch(
            "DNS packet is not a response".to_string(),
        ));
    }

    let opcode = (response[2] >> 3) & 0x0F;
    if opcode != 0 {
        return Err(ProbeError::ProtocolMismatch(format!(
            "unexpected DNS opcode {}",
            opcode
        )));
    }

    Ok(DnsResponse {
        rcode: response[3] & 0x0F,
        answer_count: u16::from_be_bytes([response[6], response[7]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_for(query: &[u8], rcode: u8) -> Vec<u8> {
        let mut resp = query.to_vec();
        resp[2] |= 0x80;
        resp[3] = (resp[3] & 0xF0) | rcode;
        resp
    }

    #[test]
    fn test_build_query() {
        let packet = build_query("example.com", 0xBEEF).unwrap();
        // 12 (header) + 13 (question name) + 4 (type/class)
        assert_eq!(packet.len(), 29);
        assert_eq!(&packet[0..2], &[0xBE, 0xEF]);
        assert_eq!(&packet[12..20], &[7, b'e', b'x', b'a', b'm', b'p', b'l', b'e']);
        assert_eq!(&packet[25..29], &[0, 1, 0, 1]);
    }

    #[test]
    fn test_trailing_dot_is_accepted() {
        assert_eq!(build_query("example.com.", 1).unwrap(), build_query("example.com", 1).unwrap());
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("example.com").is_ok());
        assert!(validate_name("_dmarc.example.com").is_ok());
        assert!(validate_name("localhost").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("a..b").is_err());
        assert!(validate_name("-bad.example").is_err());
        assert!(validate_name(&format!("{}.com", "a".repeat(64))).is_err());
    }

    #[test]
    fn test_parse_valid_response() {
        let query = build_query("example.com", 42).unwrap();
        let parsed = parse_response(&response_for(&query, 0), 42).unwrap();
        assert_eq!(parsed.rcode, 0);
    }

    #[test]
    fn test_nxdomain_is_valid() {
        let query = build_query("nope.example", 7).unwrap();
        let parsed = parse_response(&response_for(&query, 3), 7).unwrap();
        assert_eq!(parsed.rcode, 3);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let query = build_query("example.com", 9).unwrap();
        assert!(matches!(parse_response(&query[..5], 9), Err(ProbeError::ProtocolMismatch(_))));
        // echoed query without QR bit
        assert!(matches!(parse_response(&query, 9), Err(ProbeError::ProtocolMismatch(_))));
        // wrong transaction id
        assert!(matches!(
            parse_response(&response_for(&query, 0), 10),
            Err(ProbeError::ProtocolMismatch(_))
        ));
    }
}

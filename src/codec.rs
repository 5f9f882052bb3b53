//! Ethernet/VLAN parsing and the GOOSE tunnel wire format.
//!
//! Parsing returns an error rather than panicking on anything short;
//! callers decide whether to drop or log.

use std::fmt;

/// Canonical GOOSE multicast destination MAC, 01:0C:CD:01:00:01.
pub const GOOSE_MULTICAST_MAC: [u8; 6] = [0x01, 0x0C, 0xCD, 0x01, 0x00, 0x01];
pub const GOOSE_ETHERTYPE: u16 = 0x88B8;
const VLAN_ETHERTYPE: u16 = 0x8100;
const TUNNEL_HEADER_LEN: usize = 18;
const MIN_ETHERNET_LEN: usize = 14;
const RECONSTRUCTED_VLAN_PRIORITY: u16 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub dst_mac: [u8; 6],
    pub src_mac: [u8; 6],
    pub has_vlan: bool,
    pub vlan_id: u16,
    pub vlan_priority: u8,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

impl ParsedFrame {
    pub fn is_goose(&self) -> bool {
        self.ethertype == GOOSE_ETHERTYPE && self.dst_mac == GOOSE_MULTICAST_MAC
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    TooShort,
    TruncatedVlan,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::TooShort => write!(f, "not a frame: shorter than minimum Ethernet length"),
            CodecError::TruncatedVlan => write!(f, "not a frame: VLAN tag present but truncated"),
        }
    }
}

impl std::error::Error for CodecError {}

fn u16be(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Parse a raw Ethernet frame, recognizing an optional single 802.1Q tag.
pub fn parse_ethernet(bytes: &[u8]) -> Result<ParsedFrame, CodecError> {
    if bytes.len() < MIN_ETHERNET_LEN {
        return Err(CodecError::TooShort);
    }

    let mut dst_mac = [0u8; 6];
    let mut src_mac = [0u8; 6];
    dst_mac.copy_from_slice(&bytes[0..6]);
    src_mac.copy_from_slice(&bytes[6..12]);

    let outer_ethertype = u16be(&bytes[12..14]);

    if outer_ethertype == VLAN_ETHERTYPE {
        if bytes.len() < 18 {
            return Err(CodecError::TruncatedVlan);
        }
        let tci = u16be(&bytes[14..16]);
        let vlan_id = tci & 0x0FFF;
        let vlan_priority = ((tci >> 13) & 0x7) as u8;
        let ethertype = u16be(&bytes[16..18]);
        Ok(ParsedFrame {
            dst_mac,
            src_mac,
            has_vlan: true,
            vlan_id,
            vlan_priority,
            ethertype,
            payload: bytes[18..].to_vec(),
        })
    } else {
        Ok(ParsedFrame {
            dst_mac,
            src_mac,
            has_vlan: false,
            vlan_id: 0,
            vlan_priority: 0,
            ethertype: outer_ethertype,
            payload: bytes[14..].to_vec(),
        })
    }
}

/// Decoded tunnel payload as read off the multicast socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPayload {
    pub src_mac: [u8; 6],
    pub timestamp_micros: u64,
    pub vlan_flag: bool,
    pub vlan_id: u16,
    pub payload: Vec<u8>,
}

/// Encode a parsed GOOSE frame into the 18-byte-header tunnel wire format.
///
/// `timestamp_micros` is the sender's wall-clock microseconds at encode
/// time; it exists for one-way-latency observability, not ordering.
pub fn encode_tunnel(frame: &ParsedFrame, timestamp_micros: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(TUNNEL_HEADER_LEN + frame.payload.len());
    out.extend_from_slice(&frame.src_mac);
    out.extend_from_slice(&timestamp_micros.to_be_bytes());
    out.extend_from_slice(&(frame.has_vlan as u16).to_be_bytes());
    out.extend_from_slice(&frame.vlan_id.to_be_bytes());
    out.extend_from_slice(&frame.payload);
    out
}

/// Decode the 18-byte tunnel header plus trailing GOOSE payload.
pub fn decode_tunnel(bytes: &[u8]) -> Result<TunnelPayload, CodecError> {
    if bytes.len() < TUNNEL_HEADER_LEN {
        return Err(CodecError::TooShort);
    }
    let mut src_mac = [0u8; 6];
    src_mac.copy_from_slice(&bytes[0..6]);
    let timestamp_micros = u64::from_be_bytes(bytes[6..14].try_into().unwrap());
    let vlan_flag = u16be(&bytes[14..16]) != 0;
    let vlan_id = u16be(&bytes[16..18]);
    Ok(TunnelPayload {
        src_mac,
        timestamp_micros,
        vlan_flag,
        vlan_id,
        payload: bytes[TUNNEL_HEADER_LEN..].to_vec(),
    })
}

/// Rebuild the Ethernet frame a remote TAP should write out.
///
/// The destination MAC is always the canonical GOOSE multicast MAC; the
/// original destination is by contract that address. VLAN priority is
/// not carried in the tunnel header, so reconstructed frames always use
/// a fixed priority.
pub fn reconstruct_ethernet(tunnel: &TunnelPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(18 + tunnel.payload.len());
    out.extend_from_slice(&GOOSE_MULTICAST_MAC);
    out.extend_from_slice(&tunnel.src_mac);
    if tunnel.vlan_flag {
        let tci = (RECONSTRUCTED_VLAN_PRIORITY << 13) | (tunnel.vlan_id & 0x0FFF);
        out.extend_from_slice(&VLAN_ETHERTYPE.to_be_bytes());
        out.extend_from_slice(&tci.to_be_bytes());
        out.extend_from_slice(&GOOSE_ETHERTYPE.to_be_bytes());
    } else {
        out.extend_from_slice(&GOOSE_ETHERTYPE.to_be_bytes());
    }
    out.extend_from_slice(&tunnel.payload);
    out
}

pub fn now_micros() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(parts: &[&str]) -> Vec<u8> {
        parts
            .join("")
            .as_bytes()
            .chunks(2)
            .map(|c| u8::from_str_radix(std::str::from_utf8(c).unwrap(), 16).unwrap())
            .collect()
    }

    #[test]
    fn parses_plain_goose_frame() {
        let raw = hex(&["010CCD010001", "020000000AAA", "88B8", "DEADBEEF"]);
        let frame = parse_ethernet(&raw).unwrap();
        assert!(!frame.has_vlan);
        assert_eq!(frame.ethertype, GOOSE_ETHERTYPE);
        assert_eq!(frame.payload, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(frame.is_goose());
    }

    #[test]
    fn parses_vlan_goose_frame() {
        let raw = hex(&["010CCD010001", "020000000ABB", "8100", "0064", "88B8", "CAFE"]);
        let frame = parse_ethernet(&raw).unwrap();
        assert!(frame.has_vlan);
        assert_eq!(frame.vlan_id, 0x064);
        assert_eq!(frame.ethertype, GOOSE_ETHERTYPE);
        assert_eq!(frame.payload, vec![0xCA, 0xFE]);
    }

    #[test]
    fn rejects_short_input() {
        assert_eq!(parse_ethernet(&[0u8; 13]), Err(CodecError::TooShort));
    }

    #[test]
    fn vlan_tag_at_exactly_18_bytes_has_empty_payload() {
        let raw = hex(&["010CCD010001", "020000000ACC", "8100", "0001", "88B8"]);
        let frame = parse_ethernet(&raw).unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn non_8100_outer_ethertype_is_not_vlan() {
        // Outer ethertype happens to equal the GOOSE ethertype itself.
        let raw = hex(&["010CCD010001", "020000000ADD", "88B8", "00"]);
        let frame = parse_ethernet(&raw).unwrap();
        assert!(!frame.has_vlan);
        assert!(frame.is_goose());
    }

    #[test]
    fn round_trips_plain_frame_through_tunnel_and_back() {
        let raw = hex(&["010CCD010001", "020000000AAA", "88B8", "DEADBEEF"]);
        let frame = parse_ethernet(&raw).unwrap();
        let tunnel_bytes = encode_tunnel(&frame, 1234);
        let decoded = decode_tunnel(&tunnel_bytes).unwrap();
        assert_eq!(decoded.src_mac, frame.src_mac);
        assert_eq!(decoded.vlan_flag, frame.has_vlan);
        assert_eq!(decoded.vlan_id, frame.vlan_id);
        assert_eq!(decoded.payload, frame.payload);

        let reconstructed = reconstruct_ethernet(&decoded);
        assert_eq!(reconstructed, raw);

        let reparsed = parse_ethernet(&reconstructed).unwrap();
        assert_eq!(reparsed.dst_mac, GOOSE_MULTICAST_MAC);
        assert_eq!(reparsed.src_mac, frame.src_mac);
        assert_eq!(reparsed.ethertype, GOOSE_ETHERTYPE);
        assert_eq!(reparsed.payload, frame.payload);
    }

    #[test]
    fn round_trips_vlan_frame_with_fixed_priority() {
        let raw = hex(&["010CCD010001", "020000000ABB", "8100", "0064", "88B8", "CAFE"]);
        let frame = parse_ethernet(&raw).unwrap();
        let tunnel_bytes = encode_tunnel(&frame, 99);
        // trailing fields: vlan_flag=0001, vlan_id=0064, payload=CAFE
        assert_eq!(&tunnel_bytes[14..16], &[0x00, 0x01]);
        assert_eq!(&tunnel_bytes[16..18], &[0x00, 0x64]);
        assert_eq!(&tunnel_bytes[18..], &[0xCA, 0xFE]);

        let decoded = decode_tunnel(&tunnel_bytes).unwrap();
        let reconstructed = reconstruct_ethernet(&decoded);
        let expected = hex(&["010CCD010001", "020000000ABB", "8100", "8064", "88B8", "CAFE"]);
        assert_eq!(reconstructed, expected);
    }

    #[test]
    fn decode_tunnel_rejects_short_payload() {
        assert_eq!(decode_tunnel(&[0u8; 17]), Err(CodecError::TooShort));
    }

    #[test]
    fn non_goose_ethertype_is_not_goose() {
        let raw = hex(&["FFFFFFFFFFFF", "020000000AEE", "0800", "00"]);
        let frame = parse_ethernet(&raw).unwrap();
        assert!(!frame.is_goose());
    }
}

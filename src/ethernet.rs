//! Ethernet framing: the 14-byte `{dst, src, type}` header every device
//! in this crate frames its payload with (`spec.md` §6), including the
//! `Loopback` device — a simplification that keeps protocol dispatch
//! (`protocol::Registry::input_handler`) identical regardless of which
//! device a frame arrived on.

use crate::addr::MacAddress;

pub const HEADER_LEN: usize = 14;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub struct EthernetHeader {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub ethertype: u16,
}

/// Wrap `payload` in a 14-byte Ethernet header.
pub fn encode(dst: MacAddress, src: MacAddress, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(dst.as_bytes());
    frame.extend_from_slice(src.as_bytes());
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame into its header and payload; `None` if too short.
pub fn decode(frame: &[u8]) -> Option<(EthernetHeader, &[u8])> {
    if frame.len() < HEADER_LEN {
        return None;
    }
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    Some((
        EthernetHeader {
            dst: MacAddress::new(dst),
            src: MacAddress::new(src),
            ethertype,
        },
        &frame[HEADER_LEN..],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let dst = MacAddress::new([1, 2, 3, 4, 5, 6]);
        let src = MacAddress::new([6, 5, 4, 3, 2, 1]);
        let payload = b"hello there";
        let frame = encode(dst, src, ETHERTYPE_IPV4, payload);
        let (hdr, body) = decode(&frame).unwrap();
        assert_eq!(hdr.dst, dst);
        assert_eq!(hdr.src, src);
        assert_eq!(hdr.ethertype, ETHERTYPE_IPV4);
        assert_eq!(body, payload);
    }

    #[test]
    fn short_frame_is_rejected() {
        assert!(decode(&[0u8; 13]).is_none());
    }
}

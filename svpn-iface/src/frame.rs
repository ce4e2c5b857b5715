//! Byte-layout parsing for TAP (Ethernet) frames and TUN (IP) packets — the pure logic
//! behind the virtual-interface adapter's "expose source inner address" contract.
//!
//! Grounded on `tunconn.go`'s `ReadFrom`/`WriteTo`: a TAP frame's source MAC sits at
//! bytes 6..12 (destination at 0..6), with the 18-byte minimum chosen to leave room for
//! an 802.1Q tag between the addresses and the ethertype. A TUN packet's IP version is
//! the top nibble of the first byte; IPv4 carries its source at bytes 12..16, IPv6 at
//! bytes 8..24. The write path rewrites the destination address only for IPv4 — the
//! source leaves IPv6 rewrite unimplemented, and so does this port.

use svpn_core::endpoint::Endpoint;

/// Minimum TAP frame length the source accepts: 14-byte Ethernet header plus room for
/// an 802.1Q tag.
pub const TAP_HEADER_MIN: usize = 18;

/// Parse the Ethernet source address out of a TAP frame. Returns `None` if the frame
/// is shorter than [`TAP_HEADER_MIN`].
pub fn tap_source(frame: &[u8]) -> Option<Endpoint> {
    if frame.len() < TAP_HEADER_MIN {
        return None;
    }
    let mac = &frame[6..12];
    Some(Endpoint::new("eth", format_mac(mac)))
}

/// Parse the Ethernet destination address out of a TAP frame.
pub fn tap_destination(frame: &[u8]) -> Option<Endpoint> {
    if frame.len() < TAP_HEADER_MIN {
        return None;
    }
    let mac = &frame[0..6];
    Some(Endpoint::new("eth", format_mac(mac)))
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse the source IP out of a TUN packet's IPv4 or IPv6 header, dispatching on the
/// version nibble in the first byte. Returns `None` for anything else or a packet too
/// short to carry the relevant header field.
pub fn tun_source(packet: &[u8]) -> Option<Endpoint> {
    let version = packet.first()? >> 4;
    match version {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[12..16].try_into().ok()?;
            Some(Endpoint::new("ip", std::net::Ipv4Addr::from(octets).to_string()))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[8..24].try_into().ok()?;
            Some(Endpoint::new("ip", std::net::Ipv6Addr::from(octets).to_string()))
        }
        _ => None,
    }
}

/// Parse the destination IP out of a TUN packet's IPv4 or IPv6 header — the same byte
/// offsets [`rewrite_tun_destination`] writes back into.
pub fn tun_destination(packet: &[u8]) -> Option<Endpoint> {
    let version = packet.first()? >> 4;
    match version {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(Endpoint::new("ip", std::net::Ipv4Addr::from(octets).to_string()))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(Endpoint::new("ip", std::net::Ipv6Addr::from(octets).to_string()))
        }
        _ => None,
    }
}

/// Rewrite the destination address in a TUN packet's IPv4 header in place, updating the
/// checksum. Returns `false` (no-op) for IPv6 or a non-IPv4 destination, matching the
/// source's "IPv6 dst rewrite not implemented" behavior.
pub fn rewrite_tun_destination(packet: &mut [u8], dst: &Endpoint) -> bool {
    if packet.first().map(|b| b >> 4) != Some(4) || packet.len() < 20 {
        return false;
    }
    let Ok(addr) = dst.value().parse::<std::net::Ipv4Addr>() else {
        return false;
    };
    packet[16..20].copy_from_slice(&addr.octets());
    recompute_ipv4_header_checksum(packet);
    true
}

fn recompute_ipv4_header_checksum(packet: &mut [u8]) {
    let ihl = (packet[0] & 0x0f) as usize * 4;
    if packet.len() < ihl {
        return;
    }
    packet[10] = 0;
    packet[11] = 0;
    let mut sum: u32 = 0;
    let mut i = 0;
    while i < ihl {
        let word = u16::from_be_bytes([packet[i], packet.get(i + 1).copied().unwrap_or(0)]);
        sum += word as u32;
        i += 2;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    let checksum = !(sum as u16);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tap_frame(dst: [u8; 6], src: [u8; 6]) -> Vec<u8> {
        let mut frame = vec![0u8; TAP_HEADER_MIN];
        frame[0..6].copy_from_slice(&dst);
        frame[6..12].copy_from_slice(&src);
        frame
    }

    #[test]
    fn tap_source_reads_bytes_6_to_12() {
        let frame = tap_frame([0xff; 6], [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(
            tap_source(&frame),
            Some(Endpoint::new("eth", "aa:bb:cc:dd:ee:ff"))
        );
    }

    #[test]
    fn tap_destination_reads_bytes_0_to_6() {
        let frame = tap_frame([0x11, 0x22, 0x33, 0x44, 0x55, 0x66], [0; 6]);
        assert_eq!(
            tap_destination(&frame),
            Some(Endpoint::new("eth", "11:22:33:44:55:66"))
        );
    }

    #[test]
    fn tap_source_none_below_minimum_length() {
        assert_eq!(tap_source(&[0u8; 13]), None);
    }

    #[test]
    fn tun_source_parses_ipv4_header() {
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x45;
        pkt[12..16].copy_from_slice(&[10, 0, 0, 1]);
        assert_eq!(tun_source(&pkt), Some(Endpoint::new("ip", "10.0.0.1")));
    }

    #[test]
    fn tun_source_parses_ipv6_header() {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x60;
        pkt[8..24].copy_from_slice(&std::net::Ipv6Addr::LOCALHOST.octets());
        assert_eq!(tun_source(&pkt), Some(Endpoint::new("ip", "::1")));
    }

    #[test]
    fn rewrite_destination_updates_header_and_checksum() {
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x45;
        pkt[16..20].copy_from_slice(&[192, 168, 0, 1]);
        let dst = Endpoint::new("ip", "10.0.0.5");
        assert!(rewrite_tun_destination(&mut pkt, &dst));
        assert_eq!(&pkt[16..20], &[10, 0, 0, 5]);
    }

    #[test]
    fn rewrite_destination_is_noop_for_ipv6() {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x60;
        let dst = Endpoint::new("ip", "::1");
        assert!(!rewrite_tun_destination(&mut pkt, &dst));
    }

    #[test]
    fn tun_destination_parses_ipv4_header() {
        let mut pkt = vec![0u8; 20];
        pkt[0] = 0x45;
        pkt[16..20].copy_from_slice(&[172, 16, 0, 9]);
        assert_eq!(tun_destination(&pkt), Some(Endpoint::new("ip", "172.16.0.9")));
    }
}

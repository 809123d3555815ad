use etherparse::{LaxNetSlice, LaxSlicedPacket};

use super::{LINKTYPE_ETHERNET, LINKTYPE_IPV4, LINKTYPE_IPV6, LINKTYPE_NULL, LINKTYPE_RAW};

const NULL_HEADER_LEN: usize = 4;

/// Whether a frame carries a recognised network-layer header.
///
/// Payload truncation (snaplen) is tolerated; only the L3 header itself has
/// to be present.
pub fn has_layer3(link_type: u32, data: &[u8]) -> bool {
    match link_type {
        LINKTYPE_ETHERNET => LaxSlicedPacket::from_ethernet(data)
            .map(|sliced| sliced.net.is_some())
            .unwrap_or(false),
        LINKTYPE_RAW | LINKTYPE_IPV4 | LINKTYPE_IPV6 => ip_present(data),
        // BSD loopback: 4-byte address family in host order, then IP.
        LINKTYPE_NULL => data.len() > NULL_HEADER_LEN && ip_present(&data[NULL_HEADER_LEN..]),
        _ => false,
    }
}

/// Where the IP header starts within a frame, if the frame carries one.
pub fn network_offset(link_type: u32, data: &[u8]) -> Option<usize> {
    match link_type {
        LINKTYPE_ETHERNET => {
            let sliced = LaxSlicedPacket::from_ethernet(data).ok()?;
            let header = match sliced.net.as_ref()? {
                LaxNetSlice::Ipv4(ipv4) => ipv4.header().slice(),
                LaxNetSlice::Ipv6(ipv6) => ipv6.header().slice(),
                #[allow(unreachable_patterns)]
                _ => return None,
            };
            (header.as_ptr() as usize).checked_sub(data.as_ptr() as usize)
        }
        LINKTYPE_RAW | LINKTYPE_IPV4 | LINKTYPE_IPV6 => ip_present(data).then_some(0),
        LINKTYPE_NULL => has_layer3(link_type, data).then_some(NULL_HEADER_LEN),
        _ => None,
    }
}

fn ip_present(data: &[u8]) -> bool {
    LaxSlicedPacket::from_ip(data)
        .map(|sliced| sliced.net.is_some())
        .unwrap_or(false)
}

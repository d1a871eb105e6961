// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Decodes captured link-layer frames into flow-keyed TCP segments.
//!
//! Decoding happens in the capture thread, on the slice lent out by
//! libpcap; only the TCP payload is copied out, since the buffer is
//! invalidated by the next read.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use pktparse::{ethernet::EtherType, ip::IPProtocol};

use crate::tcp_reassemble::Segment;

/// One direction of one TCP connection as observed on the wire. The reverse
/// direction is a distinct key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn src(&self) -> SocketAddr {
        SocketAddr::new(self.src_ip, self.src_port)
    }

    pub fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.dst_ip, self.dst_port)
    }
}

impl fmt::Debug for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src(), self.dst())
    }
}

// Link types as reported by pcap_datalink(3PCAP).
const LINKTYPE_NULL: i32 = 0;
const LINKTYPE_ETHERNET: i32 = 1;
const LINKTYPE_RAW_BSD: i32 = 12;
const LINKTYPE_RAW: i32 = 101;
const LINKTYPE_LOOP: i32 = 108;

/// Decodes one captured frame into an owned TCP segment. Non-TCP traffic,
/// unknown ethertypes and truncated headers all come back as `None`; the BPF
/// filter makes those rare.
pub fn decode_frame(linktype: i32, frame: &[u8]) -> Option<Segment> {
    let l3 = match linktype {
        LINKTYPE_ETHERNET => {
            let (remain, eth) = pktparse::ethernet::parse_ethernet_frame(frame).ok()?;
            match eth.ethertype {
                EtherType::IPv4 | EtherType::IPv6 => remain,
                _ => return None,
            }
        }
        // BSD loopback: 4-byte host-order address family, then the datagram.
        LINKTYPE_NULL | LINKTYPE_LOOP => frame.get(4..)?,
        LINKTYPE_RAW | LINKTYPE_RAW_BSD => frame,
        _ => frame,
    };

    let (src_ip, dst_ip, l4) = decode_ip(l3)?;
    let (payload, tcp) = pktparse::tcp::parse_tcp_header(l4).ok()?;

    Some(Segment {
        key: FlowKey {
            src_ip,
            dst_ip,
            src_port: tcp.source_port,
            dst_port: tcp.dest_port,
        },
        seq: tcp.sequence_no,
        syn: tcp.flag_syn,
        fin: tcp.flag_fin,
        rst: tcp.flag_rst,
        payload: payload.to_vec(),
    })
}

/// Parses the IP header and returns the transport slice, trimmed to the IP
/// payload length so Ethernet trailer padding never leaks into the stream.
fn decode_ip(data: &[u8]) -> Option<(IpAddr, IpAddr, &[u8])> {
    match data.first()? >> 4 {
        4 => {
            let (remain, v4) = pktparse::ipv4::parse_ipv4_header(data).ok()?;
            if v4.protocol != IPProtocol::TCP {
                return None;
            }
            let payload_len = (v4.length as usize).saturating_sub(v4.ihl as usize * 4);
            let l4 = &remain[..payload_len.min(remain.len())];
            Some((v4.source_addr.into(), v4.dest_addr.into(), l4))
        }
        6 => {
            let (remain, v6) = pktparse::ipv6::parse_ipv6_header(data).ok()?;
            if v6.next_header != IPProtocol::TCP {
                return None;
            }
            let payload_len = v6.length as usize;
            let l4 = &remain[..payload_len.min(remain.len())];
            Some((v6.source_addr.into(), v6.dest_addr.into(), l4))
        }
        _ => None,
    }
}

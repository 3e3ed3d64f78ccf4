use pnet_packet::Packet;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use pnet_packet::tcp::TcpPacket;
use pnet_packet::udp::UdpPacket;
use std::net::IpAddr;

/// Network-layer view of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub protocol: &'static str,
    pub source: IpAddr,
    pub destination: IpAddr,
}

/// Transport-layer view of a frame. The TCP-only fields are `None` for UDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    pub protocol: &'static str,
    pub source_port: u16,
    pub destination_port: u16,
    pub tcp_flags: Option<u8>,
    pub tcp_window: Option<u16>,
}

/// The decoded layers of one raw frame. Each view is present exactly when
/// that layer could be parsed; nothing is fabricated for malformed frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub network: Option<NetworkInfo>,
    pub transport: Option<TransportInfo>,
    /// Application payload carried above the transport header, if any.
    pub payload: Option<Vec<u8>>,
}

impl DecodedFrame {
    fn undecodable() -> Self {
        DecodedFrame {
            network: None,
            transport: None,
            payload: None,
        }
    }

    /// True when the frame carries a decodable IPv4 network layer *and* a
    /// decodable transport layer, the requirement of the strict capture
    /// profile.
    pub fn is_ipv4_with_transport(&self) -> bool {
        self.network.as_ref().is_some_and(|n| n.protocol == "IPv4") && self.transport.is_some()
    }
}

/// Parses the raw bytes of an Ethernet frame into its layered views.
pub fn decode_frame(data: &[u8]) -> DecodedFrame {
    let Some(ethernet) = EthernetPacket::new(data) else {
        return DecodedFrame::undecodable();
    };

    match ethernet.get_ethertype() {
        EtherTypes::Ipv4 => {
            let Some(ipv4) = Ipv4Packet::new(ethernet.payload()) else {
                return DecodedFrame::undecodable();
            };
            let network = NetworkInfo {
                protocol: "IPv4",
                source: IpAddr::V4(ipv4.get_source()),
                destination: IpAddr::V4(ipv4.get_destination()),
            };
            let (transport, payload) =
                decode_transport(ipv4.get_next_level_protocol(), ipv4.payload());
            DecodedFrame {
                network: Some(network),
                transport,
                payload,
            }
        }
        EtherTypes::Ipv6 => {
            let Some(ipv6) = Ipv6Packet::new(ethernet.payload()) else {
                return DecodedFrame::undecodable();
            };
            let network = NetworkInfo {
                protocol: "IPv6",
                source: IpAddr::V6(ipv6.get_source()),
                destination: IpAddr::V6(ipv6.get_destination()),
            };
            let (transport, payload) = decode_transport(ipv6.get_next_header(), ipv6.payload());
            DecodedFrame {
                network: Some(network),
                transport,
                payload,
            }
        }
        // Not an IP frame (ARP and friends). No network layer to report.
        _ => DecodedFrame::undecodable(),
    }
}

fn decode_transport(
    protocol: IpNextHeaderProtocol,
    data: &[u8],
) -> (Option<TransportInfo>, Option<Vec<u8>>) {
    match protocol {
        IpNextHeaderProtocols::Tcp => {
            let Some(tcp) = TcpPacket::new(data) else {
                return (None, None);
            };
            let info = TransportInfo {
                protocol: "TCP",
                source_port: tcp.get_source(),
                destination_port: tcp.get_destination(),
                tcp_flags: Some(tcp.get_flags()),
                tcp_window: Some(tcp.get_window()),
            };
            (Some(info), Some(tcp.payload().to_vec()))
        }
        IpNextHeaderProtocols::Udp => {
            let Some(udp) = UdpPacket::new(data) else {
                return (None, None);
            };
            let info = TransportInfo {
                protocol: "UDP",
                source_port: udp.get_source(),
                destination_port: udp.get_destination(),
                tcp_flags: None,
                tcp_window: None,
            };
            (Some(info), Some(udp.payload().to_vec()))
        }
        // Another protocol over IP (ICMP and friends): network layer only.
        _ => (None, None),
    }
}

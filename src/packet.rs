//! Network/transport header decoding for queued packets.

use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::{TcpFlags, TcpPacket};
use std::cmp::min;
use std::net::IpAddr;
use thiserror::Error;

use crate::conntrack::ConnectionTuple;

const IPV6_HEADER_LEN: usize = 40;

/// Why a queued packet could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,

    #[error("unsupported IP version {0}")]
    UnknownVersion(u8),

    #[error("truncated {0} header")]
    Truncated(&'static str),

    #[error("{0} header length out of range")]
    BadHeaderLength(&'static str),

    #[error("panic while inspecting packet: {0}")]
    Panicked(String),
}

/// Decoded view of a TCP segment, borrowing the queued bytes.
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub tuple: ConnectionTuple,
    pub syn: bool,
    pub ack: bool,
    pub payload: &'a [u8],
}

impl TcpSegment<'_> {
    /// SYN without ACK: the client opening the connection.
    pub fn is_connection_open(&self) -> bool {
        self.syn && !self.ack
    }
}

#[derive(Debug)]
pub enum Decoded<'a> {
    Tcp(TcpSegment<'a>),
    /// Valid IP packet carrying something other than TCP.
    Other,
}

/// Decode an IPv4 or IPv6 packet as handed over by the inspection queue.
pub fn decode(data: &[u8]) -> Result<Decoded<'_>, PacketError> {
    let version = data.first().ok_or(PacketError::Empty)? >> 4;

    let (source, destination, transport) = match version {
        4 => {
            let ip = Ipv4Packet::new(data).ok_or(PacketError::Truncated("IPv4"))?;
            if ip.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
                return Ok(Decoded::Other);
            }
            let start = ip.get_header_length() as usize * 4;
            let end = min(ip.get_total_length() as usize, data.len());
            let transport = data
                .get(start..end)
                .ok_or(PacketError::BadHeaderLength("IPv4"))?;
            (
                IpAddr::V4(ip.get_source()),
                IpAddr::V4(ip.get_destination()),
                transport,
            )
        }
        6 => {
            let ip = Ipv6Packet::new(data).ok_or(PacketError::Truncated("IPv6"))?;
            // Extension headers are not walked; only a direct TCP next header counts.
            if ip.get_next_header() != IpNextHeaderProtocols::Tcp {
                return Ok(Decoded::Other);
            }
            let end = min(
                IPV6_HEADER_LEN + ip.get_payload_length() as usize,
                data.len(),
            );
            let transport = data
                .get(IPV6_HEADER_LEN..end)
                .ok_or(PacketError::BadHeaderLength("IPv6"))?;
            (
                IpAddr::V6(ip.get_source()),
                IpAddr::V6(ip.get_destination()),
                transport,
            )
        }
        other => return Err(PacketError::UnknownVersion(other)),
    };

    let tcp = TcpPacket::new(transport).ok_or(PacketError::Truncated("TCP"))?;
    let flags = tcp.get_flags();
    let payload = transport
        .get(tcp.get_data_offset() as usize * 4..)
        .ok_or(PacketError::BadHeaderLength("TCP"))?;

    Ok(Decoded::Tcp(TcpSegment {
        tuple: ConnectionTuple {
            source,
            source_port: tcp.get_source(),
            destination,
            destination_port: tcp.get_destination(),
        },
        syn: (flags & TcpFlags::SYN) != 0,
        ack: (flags & TcpFlags::ACK) != 0,
        payload,
    }))
}

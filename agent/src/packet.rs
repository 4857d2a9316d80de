//! Read-only views over one raw ipv4 datagram read from the tunnel device.
//!
//! A `Packet` owns the buffer it was parsed from and exposes the ipv4 header,
//! the tcp or udp header that follows it, and the payload slice. Nothing is
//! copied after the initial read; all header fields are decoded once on parse.

use crate::error::ParseError;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Other(u8),
}

impl From<u8> for Protocol {
    fn from(p: u8) -> Self {
        match p {
            PROTO_TCP => Protocol::Tcp,
            PROTO_UDP => Protocol::Udp,
            other => Protocol::Other(other),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(p: Protocol) -> u8 {
        match p {
            Protocol::Tcp => PROTO_TCP,
            Protocol::Udp => PROTO_UDP,
            Protocol::Other(other) => other,
        }
    }
}

// The flow a packet belongs to, as seen from the device: where it is going and
// which local port it left from. Both the tcp flow table and the udp nat table
// are keyed on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub dst: SocketAddrV4,
    pub src_port: u16,
}

impl FlowKey {
    pub fn new(dst: SocketAddrV4, src_port: u16) -> Self {
        FlowKey { dst, src_port }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.dst.ip(), self.dst.port(), self.src_port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub total_len: usize,
    pub id: u16,
    pub ttl: u8,
    pub protocol: Protocol,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < IPV4_HEADER_LEN {
            return Err(ParseError::Truncated {
                provided: buf.len(),
                minimum: IPV4_HEADER_LEN,
            });
        }
        let version = buf[0] >> 4;
        if version != 4 {
            return Err(ParseError::UnsupportedVersion(version));
        }
        let ihl = buf[0] & 0x0f;
        if ihl < 5 {
            return Err(ParseError::InvalidIhl(ihl));
        }
        let header_len = ihl as usize * 4;
        if buf.len() < header_len {
            return Err(ParseError::Truncated {
                provided: buf.len(),
                minimum: header_len,
            });
        }
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if total_len < header_len {
            return Err(ParseError::InvalidTotalLength {
                total: total_len,
                header: header_len,
            });
        }
        if total_len > buf.len() {
            return Err(ParseError::Truncated {
                provided: buf.len(),
                minimum: total_len,
            });
        }
        Ok(Ipv4Header {
            header_len,
            total_len,
            id: u16::from_be_bytes([buf[4], buf[5]]),
            ttl: buf[8],
            protocol: Protocol::from(buf[9]),
            checksum: u16::from_be_bytes([buf[10], buf[11]]),
            src: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
            dst: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub header_len: usize,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
}

impl TcpHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < TCP_HEADER_LEN {
            return Err(ParseError::Truncated {
                provided: buf.len(),
                minimum: TCP_HEADER_LEN,
            });
        }
        let offset = buf[12] >> 4;
        if offset < 5 {
            return Err(ParseError::InvalidDataOffset(offset));
        }
        let header_len = offset as usize * 4;
        if buf.len() < header_len {
            return Err(ParseError::Truncated {
                provided: buf.len(),
                minimum: header_len,
            });
        }
        Ok(TcpHeader {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            seq: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ack: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            header_len,
            flags: buf[13],
            window: u16::from_be_bytes([buf[14], buf[15]]),
            checksum: u16::from_be_bytes([buf[16], buf[17]]),
        })
    }

    pub fn is_syn(&self) -> bool {
        self.flags & TCP_SYN != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & TCP_ACK != 0
    }

    pub fn is_fin(&self) -> bool {
        self.flags & TCP_FIN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & TCP_RST != 0
    }

    pub fn is_psh(&self) -> bool {
        self.flags & TCP_PSH != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: usize,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < UDP_HEADER_LEN {
            return Err(ParseError::Truncated {
                provided: buf.len(),
                minimum: UDP_HEADER_LEN,
            });
        }
        Ok(UdpHeader {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            length: u16::from_be_bytes([buf[4], buf[5]]) as usize,
            checksum: u16::from_be_bytes([buf[6], buf[7]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Packet {
    buf: Vec<u8>,
    ip: Ipv4Header,
    transport: TransportHeader,
    payload_start: usize,
    payload_end: usize,
}

impl Packet {
    /// Parses `buf` as an ipv4 datagram. Anything past the ipv4 total length
    /// is ignored. A protocol other than tcp/udp is not an error, it parses to
    /// `TransportHeader::Unknown` and the caller decides to drop it.
    pub fn parse(buf: Vec<u8>) -> Result<Packet, ParseError> {
        let ip = Ipv4Header::parse(&buf)?;
        let l4 = &buf[ip.header_len..ip.total_len];
        let (transport, payload_start, payload_end) = match ip.protocol {
            Protocol::Tcp => {
                let tcp = TcpHeader::parse(l4)?;
                (
                    TransportHeader::Tcp(tcp),
                    ip.header_len + tcp.header_len,
                    ip.total_len,
                )
            }
            Protocol::Udp => {
                let udp = UdpHeader::parse(l4)?;
                // Trust the udp length only when it is consistent with the ip length
                let end = if udp.length >= UDP_HEADER_LEN && udp.length <= l4.len() {
                    ip.header_len + udp.length
                } else {
                    ip.total_len
                };
                (
                    TransportHeader::Udp(udp),
                    ip.header_len + UDP_HEADER_LEN,
                    end,
                )
            }
            Protocol::Other(_) => (TransportHeader::Unknown, ip.header_len, ip.total_len),
        };
        Ok(Packet {
            buf,
            ip,
            transport,
            payload_start,
            payload_end,
        })
    }

    pub fn ip(&self) -> &Ipv4Header {
        &self.ip
    }

    pub fn protocol(&self) -> Protocol {
        self.ip.protocol
    }

    pub fn transport(&self) -> &TransportHeader {
        &self.transport
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        match self.transport {
            TransportHeader::Tcp(ref t) => Some(t),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpHeader> {
        match self.transport {
            TransportHeader::Udp(ref u) => Some(u),
            _ => None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[self.payload_start..self.payload_end]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.ip.total_len]
    }

    fn ports(&self) -> Option<(u16, u16)> {
        match self.transport {
            TransportHeader::Tcp(ref t) => Some((t.src_port, t.dst_port)),
            TransportHeader::Udp(ref u) => Some((u.src_port, u.dst_port)),
            TransportHeader::Unknown => None,
        }
    }

    pub fn source(&self) -> Option<SocketAddrV4> {
        self.ports()
            .map(|(sport, _)| SocketAddrV4::new(self.ip.src, sport))
    }

    pub fn destination(&self) -> Option<SocketAddrV4> {
        self.ports()
            .map(|(_, dport)| SocketAddrV4::new(self.ip.dst, dport))
    }

    pub fn flow_key(&self) -> Option<FlowKey> {
        self.ports().map(|(sport, dport)| {
            FlowKey::new(SocketAddrV4::new(self.ip.dst, dport), sport)
        })
    }
}

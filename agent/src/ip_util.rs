//! Construction of the packets we hand back to the device.
//!
//! A packet is built in two steps: the headers are laid out with room for the
//! payload, the caller fills (or reads straight into) the payload area and can
//! shrink it once the real size is known, and only then `finish()` computes the
//! ip and tcp/udp checksums.

use crate::packet::{Protocol, IPV4_HEADER_LEN, TCP_HEADER_LEN, UDP_HEADER_LEN};
use std::net::SocketAddrV4;

const IP_TTL: u8 = 64;
const IP_DONT_FRAGMENT: u16 = 0x4000;

#[derive(Debug)]
pub struct PacketBuilder {
    buf: Vec<u8>,
    protocol: Protocol,
}

impl PacketBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn tcp(
        src: SocketAddrV4,
        dst: SocketAddrV4,
        id: u16,
        seq: u32,
        ack: u32,
        flags: u8,
        window: u16,
        payload_len: usize,
    ) -> Self {
        let mut b =
            PacketBuilder::with_headers(Protocol::Tcp, src, dst, id, TCP_HEADER_LEN, payload_len);
        let t = &mut b.buf[IPV4_HEADER_LEN..IPV4_HEADER_LEN + TCP_HEADER_LEN];
        t[0..2].copy_from_slice(&src.port().to_be_bytes());
        t[2..4].copy_from_slice(&dst.port().to_be_bytes());
        t[4..8].copy_from_slice(&seq.to_be_bytes());
        t[8..12].copy_from_slice(&ack.to_be_bytes());
        t[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
        t[13] = flags;
        t[14..16].copy_from_slice(&window.to_be_bytes());
        b
    }

    pub fn udp(src: SocketAddrV4, dst: SocketAddrV4, id: u16, payload_len: usize) -> Self {
        let mut b =
            PacketBuilder::with_headers(Protocol::Udp, src, dst, id, UDP_HEADER_LEN, payload_len);
        let u = &mut b.buf[IPV4_HEADER_LEN..IPV4_HEADER_LEN + UDP_HEADER_LEN];
        u[0..2].copy_from_slice(&src.port().to_be_bytes());
        u[2..4].copy_from_slice(&dst.port().to_be_bytes());
        b.write_lengths();
        b
    }

    fn with_headers(
        protocol: Protocol,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        id: u16,
        l4_header_len: usize,
        payload_len: usize,
    ) -> Self {
        let mut buf = vec![0u8; IPV4_HEADER_LEN + l4_header_len + payload_len];
        buf[0] = 0x45;
        buf[4..6].copy_from_slice(&id.to_be_bytes());
        buf[6..8].copy_from_slice(&IP_DONT_FRAGMENT.to_be_bytes());
        buf[8] = IP_TTL;
        buf[9] = protocol.into();
        buf[12..16].copy_from_slice(&src.ip().octets());
        buf[16..20].copy_from_slice(&dst.ip().octets());
        let mut b = PacketBuilder { buf, protocol };
        b.write_lengths();
        b
    }

    fn l4_header_len(&self) -> usize {
        match self.protocol {
            Protocol::Tcp => TCP_HEADER_LEN,
            _ => UDP_HEADER_LEN,
        }
    }

    fn payload_start(&self) -> usize {
        IPV4_HEADER_LEN + self.l4_header_len()
    }

    fn write_lengths(&mut self) {
        let total = self.buf.len() as u16;
        self.buf[2..4].copy_from_slice(&total.to_be_bytes());
        if self.protocol == Protocol::Udp {
            let udp_len = (self.buf.len() - IPV4_HEADER_LEN) as u16;
            self.buf[IPV4_HEADER_LEN + 4..IPV4_HEADER_LEN + 6]
                .copy_from_slice(&udp_len.to_be_bytes());
        }
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len() - self.payload_start()
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let start = self.payload_start();
        &mut self.buf[start..]
    }

    // Resizes the payload area, used when the payload was read in place and
    // turned out shorter than the space reserved for it.
    pub fn set_payload_len(&mut self, len: usize) {
        let total = self.payload_start() + len;
        debug_assert!(total <= u16::MAX as usize);
        self.buf.resize(total, 0);
        self.write_lengths();
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf[10..12].copy_from_slice(&[0, 0]);
        let ip_sum = checksum(&self.buf[..IPV4_HEADER_LEN]);
        self.buf[10..12].copy_from_slice(&ip_sum.to_be_bytes());

        let off = match self.protocol {
            Protocol::Tcp => 16,
            _ => 6,
        };
        let l4 = IPV4_HEADER_LEN;
        self.buf[l4 + off..l4 + off + 2].copy_from_slice(&[0, 0]);
        let mut sum = transport_checksum(&self.buf, self.protocol);
        if self.protocol == Protocol::Udp && sum == 0 {
            // zero means "no checksum" for udp
            sum = 0xffff;
        }
        self.buf[l4 + off..l4 + off + 2].copy_from_slice(&sum.to_be_bytes());
        self.buf
    }
}

// Adds `data` as big endian 16 bit words to `acc`, padding an odd trailing byte
fn sum_words(data: &[u8], mut acc: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for w in &mut chunks {
        acc += u16::from_be_bytes([w[0], w[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        acc += (*last as u32) << 8;
    }
    acc
}

fn fold(mut acc: u32) -> u16 {
    while acc > 0xffff {
        acc = (acc & 0xffff) + (acc >> 16);
    }
    !(acc as u16)
}

// Internet checksum (rfc 1071) of `data`
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// Checksum of the tcp/udp part of an ipv4 datagram, including the pseudo
/// header. The checksum field itself must already be zero (or the result is
/// zero when verifying a received packet).
pub fn transport_checksum(ip_packet: &[u8], protocol: Protocol) -> u16 {
    let l4 = &ip_packet[IPV4_HEADER_LEN..];
    let mut acc = sum_words(&ip_packet[12..20], 0);
    acc += u8::from(protocol) as u32;
    acc += l4.len() as u32;
    fold(sum_words(l4, acc))
}

//! Minimal pcap stream reader and TCP segment decoding
//!
//! The capture tool writes the classic pcap format to stdout. Only the pieces
//! needed to recover loopback TCP payloads are implemented.

use bytes::Bytes;
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;
const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_NANOS: u32 = 0xa1b2_3c4d;

#[derive(Error, Debug)]
pub enum PcapError {
    #[error("not a pcap stream (magic {0:#010x})")]
    BadMagic(u32),

    #[error("unsupported link type {0}")]
    UnsupportedLinkType(u32),

    #[error("record length {0} exceeds limit")]
    RecordTooLarge(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Link-layer framing of captured packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// BSD loopback: 4-byte address family header
    Null,
    /// Ethernet II
    Ethernet,
    /// Bare IPv4/IPv6
    RawIp,
    /// Linux cooked capture v1 (16-byte header)
    LinuxSll,
    /// Linux cooked capture v2 (20-byte header)
    LinuxSll2,
}

impl LinkType {
    pub fn from_code(code: u32) -> Result<Self, PcapError> {
        match code {
            0 | 108 => Ok(LinkType::Null),
            1 => Ok(LinkType::Ethernet),
            12 | 14 | 101 => Ok(LinkType::RawIp),
            113 => Ok(LinkType::LinuxSll),
            276 => Ok(LinkType::LinuxSll2),
            other => Err(PcapError::UnsupportedLinkType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn u32(self, bytes: &[u8]) -> u32 {
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        }
    }
}

/// One captured frame
#[derive(Debug, Clone)]
pub struct PcapRecord {
    pub data: Bytes,
}

/// Reads pcap records from an async byte stream
pub struct PcapReader<R> {
    reader: R,
    order: ByteOrder,
    link_type: LinkType,
}

impl<R: AsyncRead + Unpin> PcapReader<R> {
    /// Consume and validate the global header
    pub async fn open(mut reader: R) -> Result<Self, PcapError> {
        let mut header = [0u8; GLOBAL_HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let magic_le = ByteOrder::Little.u32(&header[0..4]);
        let order = if magic_le == MAGIC_MICROS || magic_le == MAGIC_NANOS {
            ByteOrder::Little
        } else if magic_le.swap_bytes() == MAGIC_MICROS || magic_le.swap_bytes() == MAGIC_NANOS {
            ByteOrder::Big
        } else {
            return Err(PcapError::BadMagic(magic_le));
        };

        let link_type = LinkType::from_code(order.u32(&header[20..24]) & 0x0fff_ffff)?;

        Ok(Self {
            reader,
            order,
            link_type,
        })
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    /// Next record, or `None` at a clean end of stream
    pub async fn next_record(&mut self) -> Result<Option<PcapRecord>, PcapError> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let captured_len = self.order.u32(&header[8..12]);
        if captured_len > MAX_RECORD_LEN {
            return Err(PcapError::RecordTooLarge(captured_len));
        }

        let mut data = vec![0u8; captured_len as usize];
        self.reader.read_exact(&mut data).await?;

        Ok(Some(PcapRecord {
            data: Bytes::from(data),
        }))
    }
}

/// TCP segment recovered from a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub sequence: u32,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Bytes,
}

/// Decode a frame into a TCP segment; anything else yields `None`
pub fn decode_segment(link_type: LinkType, frame: &[u8]) -> Option<TcpSegment> {
    let sliced = match link_type {
        LinkType::Ethernet => SlicedPacket::from_ethernet(frame).ok()?,
        LinkType::Null => SlicedPacket::from_ip(frame.get(4..)?).ok()?,
        LinkType::RawIp => SlicedPacket::from_ip(frame).ok()?,
        LinkType::LinuxSll => SlicedPacket::from_ip(frame.get(16..)?).ok()?,
        LinkType::LinuxSll2 => SlicedPacket::from_ip(frame.get(20..)?).ok()?,
    };

    let (src_ip, dst_ip) = match sliced.net.as_ref()? {
        NetSlice::Ipv4(ipv4) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
        ),
        NetSlice::Ipv6(ipv6) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
        ),
        #[allow(unreachable_patterns)]
        _ => return None,
    };

    let tcp = match sliced.transport.as_ref()? {
        TransportSlice::Tcp(tcp) => tcp,
        _ => return None,
    };

    Some(TcpSegment {
        src: SocketAddr::new(src_ip, tcp.source_port()),
        dst: SocketAddr::new(dst_ip, tcp.destination_port()),
        sequence: tcp.sequence_number(),
        syn: tcp.syn(),
        ack: tcp.ack(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        payload: Bytes::copy_from_slice(tcp.payload()),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    pub(crate) fn global_header(link_type: u32) -> Vec<u8> {
        let mut header = Vec::with_capacity(GLOBAL_HEADER_LEN);
        header.extend_from_slice(&MAGIC_MICROS.to_le_bytes());
        header.extend_from_slice(&2u16.to_le_bytes());
        header.extend_from_slice(&4u16.to_le_bytes());
        header.extend_from_slice(&0i32.to_le_bytes());
        header.extend_from_slice(&0u32.to_le_bytes());
        header.extend_from_slice(&65535u32.to_le_bytes());
        header.extend_from_slice(&link_type.to_le_bytes());
        header
    }

    pub(crate) fn record(frame: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_HEADER_LEN + frame.len());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
        out
    }

    /// NULL-link IPv4 TCP frame as macOS writes it on lo0
    pub(crate) fn null_frame(src_port: u16, dst_port: u16, seq: u32, flags: &str, payload: &[u8]) -> Vec<u8> {
        let mut builder = PacketBuilder::ipv4([127, 0, 0, 1], [127, 0, 0, 1], 64)
            .tcp(src_port, dst_port, seq, 65535);
        if flags.contains('S') {
            builder = builder.syn();
        }
        if flags.contains('A') {
            builder = builder.ack(1);
        }
        if flags.contains('F') {
            builder = builder.fin();
        }
        if flags.contains('R') {
            builder = builder.rst();
        }

        let mut frame = 2u32.to_le_bytes().to_vec();
        builder.write(&mut frame, payload).unwrap();
        frame
    }

    #[tokio::test]
    async fn test_reads_records_little_endian() {
        let mut stream = global_header(0);
        stream.extend(record(&null_frame(50000, 42100, 7, "A", b"hello")));

        let mut reader = PcapReader::open(&stream[..]).await.unwrap();
        assert_eq!(reader.link_type(), LinkType::Null);

        let record = reader.next_record().await.unwrap().unwrap();
        let segment = decode_segment(reader.link_type(), &record.data).unwrap();
        assert_eq!(segment.src.port(), 50000);
        assert_eq!(segment.dst.port(), 42100);
        assert_eq!(segment.sequence, 7);
        assert_eq!(segment.payload, Bytes::from_static(b"hello"));

        assert!(reader.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reads_big_endian_header() {
        let mut header = Vec::new();
        header.extend_from_slice(&MAGIC_MICROS.to_be_bytes());
        header.extend_from_slice(&2u16.to_be_bytes());
        header.extend_from_slice(&4u16.to_be_bytes());
        header.extend_from_slice(&[0u8; 8]);
        header.extend_from_slice(&65535u32.to_be_bytes());
        header.extend_from_slice(&1u32.to_be_bytes());

        let reader = PcapReader::open(&header[..]).await.unwrap();
        assert_eq!(reader.link_type(), LinkType::Ethernet);
    }

    #[tokio::test]
    async fn test_rejects_bad_magic() {
        let stream = vec![0u8; GLOBAL_HEADER_LEN];
        let result = PcapReader::open(&stream[..]).await;
        assert!(matches!(result, Err(PcapError::BadMagic(0))));
    }

    #[test]
    fn test_decode_ethernet_frame() {
        let builder = PacketBuilder::ethernet2([0; 6], [0; 6])
            .ipv4([127, 0, 0, 1], [127, 0, 0, 1], 64)
            .tcp(42100, 50000, 99, 65535)
            .fin();
        let mut frame = Vec::new();
        builder.write(&mut frame, b"").unwrap();

        let segment = decode_segment(LinkType::Ethernet, &frame).unwrap();
        assert!(segment.fin);
        assert!(segment.payload.is_empty());
        assert_eq!(segment.src.port(), 42100);
    }

    #[test]
    fn test_decode_ignores_udp() {
        let builder = PacketBuilder::ipv4([127, 0, 0, 1], [127, 0, 0, 1], 64).udp(53, 53);
        let mut frame = Vec::new();
        builder.write(&mut frame, b"dns").unwrap();

        assert!(decode_segment(LinkType::RawIp, &frame).is_none());
    }
}

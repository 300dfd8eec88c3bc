//! Socket endpoint: buffers, sequence counter and partial-read state for
//! one side of a proxied connection.
//!
//! A socket owns three buffers: the outbound send queue (framed packets),
//! the raw inbound accumulator, and the queue of fully assembled inbound
//! packets. `packet_len` tracks a partially received packet across
//! readiness events; `None` means no header has been parsed yet.

use crate::net::packet::{FrameError, Header, Packet, HEADER_SIZE};
use crate::net::queue::PacketQueue;
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Default listen port when the address string carries none.
pub const DEFAULT_PORT: u16 = 4043;

const READ_CHUNK: usize = 16 * 1024;

/// Listen-address parse errors. Fatal to startup, per-connection never.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    /// Host part did not parse as an IP address.
    InvalidHost(String),
    /// Port part did not parse as a u16.
    InvalidPort(String),
}

impl std::fmt::Display for AddrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddrError::InvalidHost(host) => write!(f, "invalid listen host '{host}'"),
            AddrError::InvalidPort(port) => write!(f, "invalid listen port '{port}'"),
        }
    }
}

impl std::error::Error for AddrError {}

/// Parse a `host:port` listen address.
///
/// An empty host means all interfaces; a missing `:port` suffix selects
/// the default port.
pub fn parse_addr(spec: &str) -> Result<SocketAddr, AddrError> {
    let (host, port) = match spec.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| AddrError::InvalidPort(port.to_string()))?;
            (host, port)
        }
        None => (spec, DEFAULT_PORT),
    };

    let ip = if host.is_empty() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse::<IpAddr>()
            .map_err(|_| AddrError::InvalidHost(host.to_string()))?
    };

    Ok(SocketAddr::new(ip, port))
}

/// Result of a non-blocking flush of the send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Everything queued has been written.
    Flushed,
    /// The peer's buffer filled up; data remains queued.
    Partial,
}

/// Result of a non-blocking read into the raw buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// The stream is still open.
    Open,
    /// The peer closed its end.
    Eof,
}

/// One endpoint of a proxied connection.
#[derive(Debug, Default)]
pub struct Socket {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,

    send_queue: PacketQueue,
    recv_queue: PacketQueue,
    recv_raw: BytesMut,

    /// Expected payload length of the packet being assembled; `None` until
    /// a header has been read.
    packet_len: Option<usize>,
    /// Next outbound sequence id.
    packet_id: u8,
    /// Bytes of the send queue's head chunk already written.
    send_offset: usize,

    // Protocol scratch, filled in by handlers as the exchange progresses.
    pub username: String,
    pub scrambled_password: Vec<u8>,
    pub scramble_seed: Vec<u8>,
    pub default_db: String,
    pub handshake_cache: Option<Bytes>,
}

impl Socket {
    /// Create a detached socket (no stream yet).
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an accepted stream.
    pub fn from_stream(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer: Some(peer),
            ..Self::default()
        }
    }

    /// The underlying stream, for readiness registration.
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// Peer address, if connected.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Next outbound sequence id.
    pub fn packet_id(&self) -> u8 {
        self.packet_id
    }

    /// Overwrite the outbound sequence id.
    pub fn set_packet_id(&mut self, id: u8) {
        self.packet_id = id;
    }

    /// Advance the outbound sequence id by one, wrapping mod 256.
    pub fn bump_packet_id(&mut self) {
        self.packet_id = self.packet_id.wrapping_add(1);
    }

    /// Frame `payload` with the current sequence id, queue it for sending,
    /// and advance the sequence id.
    pub fn queue_reply(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        self.send_queue.append(payload, self.packet_id)?;
        self.packet_id = self.packet_id.wrapping_add(1);
        Ok(())
    }

    /// Whether any outbound data is waiting.
    pub fn has_pending_send(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Pop the oldest queued outbound chunk (tests and diagnostics).
    pub fn pop_send_chunk(&mut self) -> Option<Bytes> {
        self.send_queue.pop_head()
    }

    /// Append newly read bytes to the raw buffer and assemble as many
    /// complete packets as are available.
    ///
    /// Returns the number of packets moved to the assembled queue. Partial
    /// data is not an error; the bytes simply wait for the next read.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        self.recv_raw.extend_from_slice(bytes);

        let mut assembled = 0;
        loop {
            let expected = match self.packet_len {
                Some(len) => len,
                None => {
                    if self.recv_raw.len() < HEADER_SIZE {
                        break;
                    }
                    // Header::parse only fails on short input, checked above.
                    let header = match Header::parse(&self.recv_raw) {
                        Ok(h) => h,
                        Err(_) => break,
                    };
                    self.packet_len = Some(header.len);
                    header.len
                }
            };

            if self.recv_raw.len() < HEADER_SIZE + expected {
                break;
            }

            let chunk = self.recv_raw.split_to(HEADER_SIZE + expected).freeze();
            self.recv_queue.append_chunk(chunk);
            self.packet_len = None;
            assembled += 1;
        }
        assembled
    }

    /// Pop the oldest assembled packet, recording its sequence id as the
    /// socket's current one.
    pub fn next_packet(&mut self) -> Option<Packet> {
        let chunk = self.recv_queue.pop_head()?;
        // Chunks in the assembled queue were framed by feed(); reparsing
        // recovers exactly the header fields seen on the wire.
        let parsed = Packet::parse(&chunk).ok()?;
        self.packet_id = parsed.seq;
        Some(parsed)
    }

    /// Whether a fully assembled packet is waiting.
    pub fn has_packet(&self) -> bool {
        !self.recv_queue.is_empty()
    }

    /// Read from the stream into the raw buffer until it would block,
    /// assembling packets as data arrives.
    pub fn fill_recv(&mut self) -> io::Result<ReadState> {
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            let stream = match self.stream.as_mut() {
                Some(s) => s,
                None => return Ok(ReadState::Eof),
            };
            match stream.read(&mut scratch) {
                Ok(0) => return Ok(ReadState::Eof),
                Ok(n) => {
                    self.feed(&scratch[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadState::Open)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write queued packets to the stream in FIFO order until the queue is
    /// empty or the write would block. Never blocks.
    pub fn drain_send(&mut self) -> io::Result<SendState> {
        loop {
            let chunk = match self.send_queue.head() {
                Some(chunk) => chunk.clone(),
                None => return Ok(SendState::Flushed),
            };
            let stream = match self.stream.as_mut() {
                Some(s) => s,
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "socket has no stream",
                    ))
                }
            };
            match stream.write(&chunk[self.send_offset..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    ))
                }
                Ok(n) => {
                    self.send_offset += n;
                    if self.send_offset == chunk.len() {
                        self.send_queue.pop_head();
                        self.send_offset = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SendState::Partial)
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Release the stream and every buffer. Idempotent. The caller must
    /// deregister the stream from its poll registry first.
    pub fn close(&mut self) {
        self.stream = None;
        self.send_queue.clear();
        self.recv_queue.clear();
        self.recv_raw.clear();
        self.packet_len = None;
        self.send_offset = 0;
        self.handshake_cache = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::packet;

    #[test]
    fn test_parse_addr_forms() {
        assert_eq!(
            parse_addr("127.0.0.1:3307").unwrap(),
            "127.0.0.1:3307".parse::<SocketAddr>().unwrap()
        );
        // empty host = all interfaces
        assert_eq!(
            parse_addr(":4043").unwrap(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 4043)
        );
        // bare host gets the default port
        assert_eq!(
            parse_addr("10.0.0.1").unwrap(),
            SocketAddr::new("10.0.0.1".parse().unwrap(), DEFAULT_PORT)
        );
        // empty string = all interfaces, default port
        assert_eq!(
            parse_addr("").unwrap(),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT)
        );
    }

    #[test]
    fn test_parse_addr_errors() {
        assert_eq!(
            parse_addr("nonsense:80"),
            Err(AddrError::InvalidHost("nonsense".to_string()))
        );
        assert_eq!(
            parse_addr("127.0.0.1:notaport"),
            Err(AddrError::InvalidPort("notaport".to_string()))
        );
        assert_eq!(
            parse_addr(":99999"),
            Err(AddrError::InvalidPort("99999".to_string()))
        );
    }

    #[test]
    fn test_feed_single_packet() {
        let mut sock = Socket::new();
        let chunk = packet::frame(b"query", 0).unwrap();

        assert_eq!(sock.feed(&chunk), 1);
        let packet = sock.next_packet().unwrap();
        assert_eq!(packet.seq, 0);
        assert_eq!(&packet.payload[..], b"query");
        assert!(sock.next_packet().is_none());
    }

    #[test]
    fn test_feed_partial_header_then_rest() {
        let mut sock = Socket::new();
        let chunk = packet::frame(b"abcdef", 2).unwrap();

        // fewer than 4 bytes: nothing assembled, no header parsed
        assert_eq!(sock.feed(&chunk[..3]), 0);
        assert!(!sock.has_packet());

        // header completes, payload still short
        assert_eq!(sock.feed(&chunk[3..7]), 0);
        assert!(!sock.has_packet());

        // rest arrives
        assert_eq!(sock.feed(&chunk[7..]), 1);
        let packet = sock.next_packet().unwrap();
        assert_eq!(&packet.payload[..], b"abcdef");
    }

    #[test]
    fn test_feed_byte_at_a_time() {
        let mut sock = Socket::new();
        let chunk = packet::frame(b"xyz", 5).unwrap();

        let mut total = 0;
        for b in chunk.iter() {
            total += sock.feed(&[*b]);
        }
        assert_eq!(total, 1);
        assert_eq!(sock.next_packet().unwrap().seq, 5);
    }

    #[test]
    fn test_feed_multiple_packets_one_read() {
        let mut sock = Socket::new();
        let mut wire = Vec::new();
        wire.extend_from_slice(&packet::frame(b"one", 0).unwrap());
        wire.extend_from_slice(&packet::frame(b"two", 1).unwrap());
        wire.extend_from_slice(&packet::frame(b"three", 2).unwrap());

        assert_eq!(sock.feed(&wire), 3);
        assert_eq!(&sock.next_packet().unwrap().payload[..], b"one");
        assert_eq!(&sock.next_packet().unwrap().payload[..], b"two");
        assert_eq!(&sock.next_packet().unwrap().payload[..], b"three");
    }

    #[test]
    fn test_feed_empty_payload_packet() {
        let mut sock = Socket::new();
        let chunk = packet::frame(b"", 1).unwrap();
        assert_eq!(sock.feed(&chunk), 1);
        let packet = sock.next_packet().unwrap();
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_next_packet_records_sequence_id() {
        let mut sock = Socket::new();
        sock.feed(&packet::frame(b"q", 7).unwrap());
        sock.next_packet().unwrap();
        assert_eq!(sock.packet_id(), 7);
    }

    #[test]
    fn test_queue_reply_sequence_discipline() {
        let mut sock = Socket::new();
        sock.set_packet_id(1);
        sock.queue_reply(b"first").unwrap();
        sock.queue_reply(b"second").unwrap();

        let a = Packet::parse(&sock.pop_send_chunk().unwrap()).unwrap();
        let b = Packet::parse(&sock.pop_send_chunk().unwrap()).unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(sock.packet_id(), 3);
    }

    #[test]
    fn test_queue_reply_wraps_at_256() {
        let mut sock = Socket::new();
        sock.set_packet_id(255);
        sock.queue_reply(b"last").unwrap();
        sock.queue_reply(b"wrapped").unwrap();

        let a = Packet::parse(&sock.pop_send_chunk().unwrap()).unwrap();
        let b = Packet::parse(&sock.pop_send_chunk().unwrap()).unwrap();
        assert_eq!(a.seq, 255);
        assert_eq!(b.seq, 0);
    }

    #[test]
    fn test_close_with_partial_header_releases_everything() {
        let mut sock = Socket::new();
        sock.feed(&[0x05, 0x00]); // two header bytes only
        sock.queue_reply(b"pending").unwrap();

        sock.close();
        assert!(!sock.has_packet());
        assert!(!sock.has_pending_send());
        assert_eq!(sock.packet_len, None);

        // closing again is a no-op
        sock.close();

        // a fresh endpoint is unaffected
        let mut next = Socket::new();
        assert_eq!(next.feed(&packet::frame(b"ok", 0).unwrap()), 1);
    }
}

//! Overlay wire protocol.
//!
//! Every message exchanged between nodes is a fixed 16-byte header
//! followed by `length` payload bytes, all in network byte order:
//!
//! ```text
//! offset  size  field
//!      0     1  version
//!      1     1  msg_type
//!      2     1  ttl          remaining forwards allowed
//!      3     1  hop_count    hops traversed so far
//!      4     2  port         originating sender's listen port
//!      6     2  length       payload length in bytes
//!      8     4  ip           originating sender's IPv4, numeric
//!     12     4  message_id   4-byte opaque id
//! +------------------------+----------------------+
//! | Header (16 bytes)      | Payload (UTF-8 text) |
//! +------------------------+----------------------+
//! ```
//!
//! There is no framing beyond the header's `length` field: a reader pulls
//! exactly 16 bytes, then exactly `length` more. The `ip`/`port` pair
//! always names the *original* sender's listening endpoint — forwarding
//! nodes touch only `ttl` and `hop_count`.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};

use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Size of the packed header in bytes.
pub const HEADER_LEN: usize = 16;

/// Errors that can occur while encoding or decoding protocol frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("unknown message type 0x{0:02x}")]
    UnknownMsgType(u8),

    #[error("connection closed mid-frame: expected {0} payload bytes")]
    TruncatedPayload(usize),
}

// ---------------------------------------------------------------------------
// MsgType
// ---------------------------------------------------------------------------

/// The eight message types of the overlay protocol.
///
/// PING/PONG discover peers, JOIN/JACC build mutual neighbour relations,
/// QUERY/QHIT locate a chat recipient by peer id, POST carries the chat
/// itself, BYE announces departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Ping = 0x00,
    Pong = 0x01,
    Bye = 0x02,
    Join = 0x03,
    Jacc = 0x04,
    Query = 0x10,
    Qhit = 0x11,
    Post = 0x12,
}

impl TryFrom<u8> for MsgType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(MsgType::Ping),
            0x01 => Ok(MsgType::Pong),
            0x02 => Ok(MsgType::Bye),
            0x03 => Ok(MsgType::Join),
            0x04 => Ok(MsgType::Jacc),
            0x10 => Ok(MsgType::Query),
            0x11 => Ok(MsgType::Qhit),
            0x12 => Ok(MsgType::Post),
            other => Err(ProtocolError::UnknownMsgType(other)),
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgType::Ping => "PING",
            MsgType::Pong => "PONG",
            MsgType::Bye => "BYE",
            MsgType::Join => "JOIN",
            MsgType::Jacc => "JACC",
            MsgType::Query => "QUERY",
            MsgType::Qhit => "QHIT",
            MsgType::Post => "POST",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// Process-wide sequence counter feeding [`MessageId::generate`], so two
/// ids produced within the same clock second still differ.
static MESSAGE_SEQ: AtomicU64 = AtomicU64::new(0);

/// A 4-byte opaque message identifier, used as a map key in the
/// seen-message tables. Uniqueness is probabilistic; a colliding later
/// message is dropped by de-duplication, which the flood tolerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 4]);

impl MessageId {
    /// Derives a fresh id for a message originated by `ip:port`.
    ///
    /// The id is the first 8 hex characters (4 raw bytes) of the SHA-1
    /// digest of `ip || port || (unix_seconds + seq)` rendered as ASCII.
    pub fn generate(ip: Ipv4Addr, port: u16) -> Self {
        let seq = MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp() as u64;
        let input = format!("{ip}{port}{}", now.wrapping_add(seq));
        let digest = Sha1::digest(input.as_bytes());
        MessageId([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Returns the raw id bytes.
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// The fixed 16-byte message header. See the module docs for the layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MsgType,
    pub ttl: u8,
    pub hop_count: u8,
    pub port: u16,
    pub length: u16,
    pub ip: Ipv4Addr,
    pub message_id: MessageId,
}

impl Header {
    /// Packs the header into its 16-byte wire form.
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.version;
        buf[1] = self.msg_type as u8;
        buf[2] = self.ttl;
        buf[3] = self.hop_count;
        buf[4..6].copy_from_slice(&self.port.to_be_bytes());
        buf[6..8].copy_from_slice(&self.length.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ip.octets());
        buf[12..16].copy_from_slice(&self.message_id.0);
        buf
    }

    /// Unpacks a header from its 16-byte wire form.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::UnknownMsgType` for a type byte outside the
    /// known set; the caller treats that as fatal for the connection.
    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        Ok(Header {
            version: buf[0],
            msg_type: MsgType::try_from(buf[1])?,
            ttl: buf[2],
            hop_count: buf[3],
            port: u16::from_be_bytes([buf[4], buf[5]]),
            length: u16::from_be_bytes([buf[6], buf[7]]),
            ip: Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11]),
            message_id: MessageId([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// The originating sender's listening endpoint, as carried in the header.
    pub fn sender(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A complete protocol message: header plus exactly `header.length`
/// payload bytes of UTF-8 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds a freshly originated message with a newly generated id,
    /// `hop_count = 0`, and the sender's listening endpoint in the header.
    pub fn new(
        msg_type: MsgType,
        sender: SocketAddrV4,
        version: u8,
        ttl: u8,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let id = MessageId::generate(*sender.ip(), sender.port());
        Self::with_id(msg_type, sender, version, ttl, id, payload)
    }

    /// Builds a message carrying a caller-chosen id. Replies (PONG, QHIT)
    /// reuse the id of the message that triggered them so the originator
    /// can correlate them.
    pub fn with_id(
        msg_type: MsgType,
        sender: SocketAddrV4,
        version: u8,
        ttl: u8,
        id: MessageId,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        let payload = payload.into();
        debug_assert!(payload.len() <= u16::MAX as usize);
        Message {
            header: Header {
                version,
                msg_type,
                ttl,
                hop_count: 0,
                port: sender.port(),
                length: payload.len() as u16,
                ip: *sender.ip(),
                message_id: id,
            },
            payload,
        }
    }

    /// The message id from the header.
    pub fn id(&self) -> MessageId {
        self.header.message_id
    }

    /// The originating sender's listening endpoint from the header.
    pub fn sender(&self) -> SocketAddrV4 {
        self.header.sender()
    }

    /// Serialises the whole message into wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header.to_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// The payload as text, with invalid UTF-8 replaced.
    pub fn payload_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

// ---------------------------------------------------------------------------
// Framed async I/O
// ---------------------------------------------------------------------------

/// Writes one message to an async writer (e.g. a TCP stream) and flushes.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), ProtocolError> {
    writer.write_all(&msg.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one message from an async reader (e.g. a TCP stream).
///
/// Returns `ProtocolError::ConnectionClosed` if the peer closed the
/// connection before the header, and `TruncatedPayload` if the stream
/// ended mid-payload. Both are fatal for the connection, never the node.
pub async fn read_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Message, ProtocolError> {
    let mut header_buf = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(ProtocolError::Io(e)),
    }
    let header = Header::from_bytes(&header_buf)?;

    let mut payload = vec![0u8; header.length as usize];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::TruncatedPayload(header.length as usize));
        }
        Err(e) => return Err(ProtocolError::Io(e)),
    }

    Ok(Message { header, payload })
}

// ---------------------------------------------------------------------------
// Numeric IP helpers
// ---------------------------------------------------------------------------

/// Converts an IPv4 address into its big-endian numeric form.
pub fn ip_to_num(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}

/// Converts a big-endian numeric IP back into dotted-quad form.
pub fn num_to_ip(num: u32) -> Ipv4Addr {
    Ipv4Addr::from(num)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            version: 1,
            msg_type: MsgType::Ping,
            ttl: 5,
            hop_count: 0,
            port: 1337,
            length: 0,
            ip: Ipv4Addr::new(127, 0, 0, 1),
            message_id: MessageId([0xde, 0xad, 0xbe, 0xef]),
        }
    }

    #[test]
    fn header_wire_bytes() {
        let bytes = sample_header().to_bytes();
        assert_eq!(
            bytes,
            [
                0x01, 0x00, 0x05, 0x00, 0x05, 0x39, 0x00, 0x00, 0x7f, 0x00, 0x00, 0x01, 0xde,
                0xad, 0xbe, 0xef
            ]
        );
    }

    #[test]
    fn header_roundtrip() {
        let header = Header {
            version: 3,
            msg_type: MsgType::Query,
            ttl: 2,
            hop_count: 4,
            port: 65535,
            length: 512,
            ip: Ipv4Addr::new(192, 168, 1, 44),
            message_id: MessageId([1, 2, 3, 4]),
        };
        let decoded = Header::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn unknown_msg_type_rejected() {
        let mut bytes = sample_header().to_bytes();
        bytes[1] = 0x7f;
        match Header::from_bytes(&bytes) {
            Err(ProtocolError::UnknownMsgType(0x7f)) => {}
            other => panic!("expected UnknownMsgType, got {other:?}"),
        }
    }

    #[test]
    fn ip_num_roundtrip() {
        for num in [0u32, 1, 0x7f000001, 0xc0a80101, u32::MAX] {
            assert_eq!(ip_to_num(num_to_ip(num)), num);
        }
        assert_eq!(ip_to_num(Ipv4Addr::new(127, 0, 0, 1)), 0x7f000001);
    }

    #[test]
    fn message_ids_are_unique_within_a_tick() {
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let a = MessageId::generate(ip, 4000);
        let b = MessageId::generate(ip, 4000);
        assert_ne!(a, b, "sequence counter must separate same-tick ids");
    }

    #[test]
    fn message_length_tracks_payload() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 1337);
        let msg = Message::new(MsgType::Post, addr, 1, 5, "hello".as_bytes().to_vec());
        assert_eq!(msg.header.length, 5);
        assert_eq!(msg.to_bytes().len(), HEADER_LEN + 5);
    }

    #[tokio::test]
    async fn async_write_read_roundtrip() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);

        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 2001);
        let original = Message::new(MsgType::Query, addr, 1, 5, "0123456789".as_bytes().to_vec());

        write_message(&mut writer, &original).await.unwrap();
        let received = read_message(&mut reader).await.unwrap();
        assert_eq!(received, original);
    }

    #[tokio::test]
    async fn multiple_messages_in_sequence() {
        let (mut writer, mut reader) = tokio::io::duplex(4096);
        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 2001);

        let messages = vec![
            Message::new(MsgType::Ping, addr, 1, 5, Vec::new()),
            Message::new(MsgType::Bye, addr, 1, 5, Vec::new()),
            Message::new(MsgType::Post, addr, 1, 5, "hi".as_bytes().to_vec()),
        ];

        for msg in &messages {
            write_message(&mut writer, msg).await.unwrap();
        }
        for expected in &messages {
            let received = read_message(&mut reader).await.unwrap();
            assert_eq!(&received, expected);
        }
    }

    #[tokio::test]
    async fn clean_eof_reports_connection_closed() {
        let (writer, mut reader) = tokio::io::duplex(64);
        drop(writer);
        match read_message(&mut reader).await {
            Err(ProtocolError::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn short_payload_reports_truncation() {
        let (mut writer, mut reader) = tokio::io::duplex(64);

        let addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 2001);
        let msg = Message::new(MsgType::Post, addr, 1, 5, "truncated".as_bytes().to_vec());
        let bytes = msg.to_bytes();

        // Header plus only half the payload, then EOF.
        writer.write_all(&bytes[..HEADER_LEN + 4]).await.unwrap();
        drop(writer);

        match read_message(&mut reader).await {
            Err(ProtocolError::TruncatedPayload(9)) => {}
            other => panic!("expected TruncatedPayload, got {other:?}"),
        }
    }
}

//! Server response encoding: OK, ERROR, result sets and the handshake.
//!
//! Every function here frames its packets through the socket's send queue,
//! consuming one sequence id per packet. Callers position the sequence id
//! (request id + 1) before the first packet of an exchange.

use crate::mysql::wire::PacketWriter;
use crate::mysql::{status, FieldType};
use crate::net::packet::FrameError;
use crate::net::socket::Socket;
use bytes::Bytes;

/// Type byte opening an ERROR payload.
pub const ERR_MARKER: u8 = 0xFF;
/// Type byte opening an OK payload.
pub const OK_MARKER: u8 = 0x00;
/// Type byte opening an EOF payload.
pub const EOF_MARKER: u8 = 0xFE;

/// A result-set column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
}

impl Field {
    /// A var-string column with the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: FieldType::VarString,
        }
    }
}

/// One result row: nullable text cells, positionally matched to fields.
pub type Row = Vec<Option<String>>;

/// The server greeting sent to a newly connected client.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    /// 8-byte scramble seed included for credential hashing.
    pub scramble: [u8; 8],
    pub capabilities: u16,
    pub language: u8,
    pub status: u16,
}

impl Handshake {
    /// Encode the greeting payload in wire emission order.
    pub fn encode(&self) -> Bytes {
        let mut w = PacketWriter::new();
        w.put_u8(self.protocol_version);
        w.put_nul_str(&self.server_version);
        w.put_u32_le(self.thread_id);
        w.put_bytes(&self.scramble);
        w.put_filler(1);
        w.put_u16_le(self.capabilities);
        w.put_u8(self.language);
        w.put_u16_le(self.status);
        w.put_filler(13);
        w.finish()
    }
}

/// Queue a minimal success packet: zero affected rows, no warnings.
pub fn send_ok(sock: &mut Socket) -> Result<(), FrameError> {
    let mut w = PacketWriter::new();
    w.put_u8(OK_MARKER);
    w.put_lenenc_int(0); // affected rows
    w.put_lenenc_int(0); // last insert id
    w.put_u16_le(status::SERVER_STATUS_AUTOCOMMIT);
    w.put_u16_le(0); // warnings
    sock.queue_reply(&w.finish())
}

/// Queue an error packet carrying `message` verbatim.
///
/// No structured error code is attached; the payload is the type byte
/// followed by the message.
pub fn send_error(sock: &mut Socket, message: &str) -> Result<(), FrameError> {
    let mut w = PacketWriter::new();
    w.put_u8(ERR_MARKER);
    w.put_bytes(message.as_bytes());
    sock.queue_reply(&w.finish())
}

/// Queue a complete result set: field count, one definition per field, an
/// end-of-fields marker, one packet per row, and an end-of-rows marker.
///
/// Each row must have the same cardinality as `fields`; that is the
/// caller's contract and is not validated here.
pub fn send_resultset(
    sock: &mut Socket,
    fields: &[Field],
    rows: &[Row],
) -> Result<(), FrameError> {
    let mut w = PacketWriter::new();
    w.put_lenenc_int(fields.len() as u64);
    sock.queue_reply(&w.finish())?;

    for field in fields {
        sock.queue_reply(&field_definition(field).finish())?;
    }
    sock.queue_reply(&eof_payload().finish())?;

    for row in rows {
        let mut w = PacketWriter::new();
        for cell in row {
            match cell {
                Some(text) => w.put_lenenc_str(text),
                None => w.put_null_cell(),
            }
        }
        sock.queue_reply(&w.finish())?;
    }
    sock.queue_reply(&eof_payload().finish())
}

/// 4.1-format column definition payload.
fn field_definition(field: &Field) -> PacketWriter {
    let mut w = PacketWriter::new();
    w.put_lenenc_str("def"); // catalog
    w.put_lenenc_str(""); // schema
    w.put_lenenc_str(""); // table
    w.put_lenenc_str(""); // org table
    w.put_lenenc_str(&field.name);
    w.put_lenenc_str(""); // org name
    w.put_u8(0x0C); // length of the fixed fields below
    w.put_u16_le(8); // charset: latin1
    w.put_u32_le(0); // display length
    w.put_u8(field.ty.wire_byte());
    w.put_u16_le(0); // flags
    w.put_u8(0); // decimals
    w.put_filler(2);
    w
}

fn eof_payload() -> PacketWriter {
    let mut w = PacketWriter::new();
    w.put_u8(EOF_MARKER);
    w.put_u16_le(0); // warnings
    w.put_u16_le(status::SERVER_STATUS_AUTOCOMMIT);
    w
}

//! TFTP wire codec.
//!
//! RFC 1350 packet layouts plus the OACK packet from RFC 2347. Every
//! multi-byte field is in network byte order.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::LazyLock;

use crate::error::{EncodeError, RequestError};

// RFC 1350: a request must fit in a single 512 byte datagram
pub const REQUEST_MAX_SIZE: usize = 512;
pub const DEFAULT_BLOCK_SIZE: u16 = 512; // RFC 1350 standard block size
pub const MIN_BLOCK_SIZE: u16 = 8; // RFC 2348
pub const MAX_BLOCK_SIZE: u16 = 65464; // RFC 2348 maximum block size
pub const DEFAULT_WINDOW_SIZE: u16 = 1; // RFC 7440 stop-and-wait
pub const DATA_HEADER_SIZE: usize = 4;
pub const MAX_PACKET_SIZE: usize = MAX_BLOCK_SIZE as usize + DATA_HEADER_SIZE;

// Everything after the opcode
const REQUEST_BODY_SIZE: usize = REQUEST_MAX_SIZE - 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,   // Read request (RFC 1350)
    Wrq = 2,   // Write request (RFC 1350)
    Data = 3,  // Data packet (RFC 1350)
    Ack = 4,   // Acknowledgment (RFC 1350)
    Error = 5, // Error packet (RFC 1350)
    Oack = 6,  // Option acknowledgment (RFC 2347)
}

impl TryFrom<u16> for Opcode {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, u16> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            other => Err(other),
        }
    }
}

// RFC 1350 - TFTP Error Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,       // Not defined, see error message
    FileNotFound = 1,     // File not found
    AccessViolation = 2,  // Access violation
    DiskFull = 3,         // Disk full or allocation exceeded
    IllegalOperation = 4, // Illegal TFTP operation
    UnknownTid = 5,       // Unknown transfer ID
    FileExists = 6,       // File already exists
    NoSuchUser = 7,       // No such user
    InvalidOptions = 8,   // RFC 2347 - Option negotiation failure
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 9] = [
        ErrorCode::NotDefined,
        ErrorCode::FileNotFound,
        ErrorCode::AccessViolation,
        ErrorCode::DiskFull,
        ErrorCode::IllegalOperation,
        ErrorCode::UnknownTid,
        ErrorCode::FileExists,
        ErrorCode::NoSuchUser,
        ErrorCode::InvalidOptions,
    ];

    /// Default human readable message for the code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined, see error message (if any).",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::IllegalOperation => "Illegal TFTP operation.",
            ErrorCode::UnknownTid => "Unknown transfer ID.",
            ErrorCode::FileExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
            ErrorCode::InvalidOptions => "Invalid options.",
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }
}

// RFC 1350 - Transfer modes ("mail" is obsolete and refused)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Netascii,
    Octet,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Netascii => "netascii",
            Mode::Octet => "octet",
        }
    }

    /// Case-insensitive exact match against the supported mode tokens.
    pub fn parse(token: &[u8]) -> Option<Self> {
        if token.eq_ignore_ascii_case(b"octet") {
            Some(Mode::Octet)
        } else if token.eq_ignore_ascii_case(b"netascii") {
            Some(Mode::Netascii)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

impl RequestKind {
    fn opcode(self) -> Opcode {
        match self {
            RequestKind::Read => Opcode::Rrq,
            RequestKind::Write => Opcode::Wrq,
        }
    }
}

/// A decoded RRQ/WRQ. `options` is the raw `name\0value\0` tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request<'a> {
    pub kind: RequestKind,
    pub filename: &'a str,
    pub mode: Mode,
    pub options: &'a [u8],
}

/// Decode a read or write request.
///
/// Total over every input: any byte string yields either a request or a
/// typed [`RequestError`].
pub fn decode_request(bytes: &[u8]) -> std::result::Result<Request<'_>, RequestError> {
    if bytes.len() > REQUEST_MAX_SIZE {
        return Err(RequestError::MaxSizeExceeded);
    }
    if bytes.len() < 2 {
        return Err(RequestError::NotARequest);
    }

    let kind = match Opcode::try_from(u16::from_be_bytes([bytes[0], bytes[1]])) {
        Ok(Opcode::Rrq) => RequestKind::Read,
        Ok(Opcode::Wrq) => RequestKind::Write,
        _ => return Err(RequestError::NotARequest),
    };

    // filename\0 needs room left over for at least a one byte mode and its NUL
    let body = &bytes[2..];
    let filename_len = body.iter().position(|&b| b == 0).unwrap_or(body.len());
    if filename_len == 0 || filename_len + 3 > body.len() {
        return Err(RequestError::InvalidFilename);
    }

    let rest = &body[filename_len + 1..];
    let mode_len = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(RequestError::InvalidMode)?;
    let mode = Mode::parse(&rest[..mode_len]).ok_or(RequestError::InvalidMode)?;

    let filename =
        std::str::from_utf8(&body[..filename_len]).map_err(|_| RequestError::InvalidFilename)?;

    Ok(Request {
        kind,
        filename,
        mode,
        options: &rest[mode_len + 1..],
    })
}

/// Encode an RRQ/WRQ without options.
pub fn encode_request(
    kind: RequestKind,
    filename: &str,
    mode: Mode,
) -> std::result::Result<Bytes, EncodeError> {
    encode_request_with_options(kind, filename, mode, &[])
}

/// Encode an RRQ/WRQ followed by a raw `name\0value\0` option tail.
pub fn encode_request_with_options(
    kind: RequestKind,
    filename: &str,
    mode: Mode,
    options: &[u8],
) -> std::result::Result<Bytes, EncodeError> {
    let mode = mode.as_str();
    if filename.is_empty() || filename.contains('\0') {
        return Err(EncodeError::TruncatedFilename);
    }
    if filename.len() + 1 + mode.len() + 1 + options.len() > REQUEST_BODY_SIZE {
        return Err(EncodeError::TruncatedFilename);
    }

    let mut packet = BytesMut::with_capacity(2 + filename.len() + mode.len() + 2 + options.len());
    packet.put_u16(kind.opcode() as u16);
    packet.put_slice(filename.as_bytes());
    packet.put_u8(0);
    packet.put_slice(mode.as_bytes());
    packet.put_u8(0);
    packet.put_slice(options);
    Ok(packet.freeze())
}

/// Write a DATA header for `block` into the first four bytes of `buf`.
///
/// # Panics
///
/// Panics if `buf` is shorter than [`DATA_HEADER_SIZE`].
pub fn data_packet_init(buf: &mut [u8], block: u16) {
    buf[..2].copy_from_slice(&(Opcode::Data as u16).to_be_bytes());
    buf[2..4].copy_from_slice(&block.to_be_bytes());
}

pub fn ack_packet_init(block: u16) -> [u8; 4] {
    let mut packet = [0u8; 4];
    packet[..2].copy_from_slice(&(Opcode::Ack as u16).to_be_bytes());
    packet[2..].copy_from_slice(&block.to_be_bytes());
    packet
}

pub fn encode_data(block: u16, payload: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(DATA_HEADER_SIZE + payload.len());
    packet.put_u16(Opcode::Data as u16);
    packet.put_u16(block);
    packet.put_slice(payload);
    packet.freeze()
}

pub fn encode_ack(block: u16) -> Bytes {
    Bytes::copy_from_slice(&ack_packet_init(block))
}

// RFC 1350: ERROR packet format
// 2 bytes: opcode (05)
// 2 bytes: error code
// string: error message (null-terminated)
pub fn encode_error(code: u16, message: &str) -> Bytes {
    let mut packet = BytesMut::with_capacity(5 + message.len());
    packet.put_u16(Opcode::Error as u16);
    packet.put_u16(code);
    packet.put_slice(message.as_bytes());
    packet.put_u8(0);
    packet.freeze()
}

static CANNED_ERRORS: LazyLock<[Option<Bytes>; 9]> = LazyLock::new(|| {
    ErrorCode::ALL.map(|code| match code {
        ErrorCode::NotDefined => None,
        code => Some(encode_error(code as u16, code.message())),
    })
});

/// Pre-encoded ERROR packet carrying the code's default message.
///
/// `NotDefined` has no canned form; it always needs a custom message.
pub fn canned_error(code: ErrorCode) -> Option<Bytes> {
    CANNED_ERRORS[code as usize].clone()
}

/// ERROR packet for `code`/`message`, reusing the canned packet when the
/// message is the default one.
pub fn error_packet(code: ErrorCode, message: &str) -> Bytes {
    if message == code.message()
        && let Some(packet) = canned_error(code)
    {
        return packet;
    }
    encode_error(code as u16, message)
}

/// Packets a server session receives or a client sees in reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet<'a> {
    Request(Request<'a>),
    Data { block: u16, payload: &'a [u8] },
    Ack { block: u16 },
    /// `message` is `None` when the peer did not NUL-terminate it or it is
    /// not UTF-8.
    Error { code: u16, message: Option<&'a str> },
    Oack { options: &'a [u8] },
}

impl<'a> Packet<'a> {
    pub fn parse(bytes: &'a [u8]) -> Option<Packet<'a>> {
        if bytes.len() < 2 {
            return None;
        }
        let opcode = Opcode::try_from(u16::from_be_bytes([bytes[0], bytes[1]])).ok()?;
        let body = &bytes[2..];
        let field = |body: &[u8]| -> Option<u16> {
            (body.len() >= 2).then(|| u16::from_be_bytes([body[0], body[1]]))
        };

        match opcode {
            Opcode::Rrq | Opcode::Wrq => decode_request(bytes).ok().map(Packet::Request),
            Opcode::Data => Some(Packet::Data {
                block: field(body)?,
                payload: &body[2..],
            }),
            Opcode::Ack => Some(Packet::Ack { block: field(body)? }),
            Opcode::Error => {
                let code = field(body)?;
                let text = &body[2..];
                let message = text
                    .iter()
                    .position(|&b| b == 0)
                    .and_then(|end| std::str::from_utf8(&text[..end]).ok());
                Some(Packet::Error { code, message })
            }
            Opcode::Oack => Some(Packet::Oack { options: body }),
        }
    }
}

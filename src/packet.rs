use std::fmt;
use std::str::{self, FromStr};

use crate::error::PacketError;
use crate::options::{self, OptionSet};
use crate::MAX_REQUEST_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl TryFrom<u16> for Opcode {
    type Error = PacketError;

    fn try_from(value: u16) -> Result<Self, PacketError> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(PacketError::InvalidOpcode(value)),
        }
    }
}

/// Reads the opcode of a datagram without decoding the rest of it.
pub fn peek_opcode(buf: &[u8]) -> Option<Opcode> {
    if buf.len() < 2 {
        return None;
    }
    Opcode::try_from(u16::from_be_bytes([buf[0], buf[1]])).ok()
}

/// TFTP error codes (RFC 1350, RFC 2347).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    InvalidOptions = 8,
}

impl ErrorCode {
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined, see error message (if any).",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::IllegalOperation => "Illegal TFTP operation.",
            ErrorCode::UnknownTransferId => "Unknown transfer ID.",
            ErrorCode::FileAlreadyExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
            ErrorCode::InvalidOptions => "Invalid options.",
        }
    }
}

impl From<u16> for ErrorCode {
    /// Codes outside the RFC range collapse to `NotDefined`.
    fn from(value: u16) -> Self {
        match value {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::InvalidOptions,
            _ => ErrorCode::NotDefined,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u16)
    }
}

/// Transfer mode. "mail" is obsolete and not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Octet,
    Netascii,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Octet => "octet",
            Mode::Netascii => "netascii",
        }
    }
}

impl FromStr for Mode {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, PacketError> {
        if s.eq_ignore_ascii_case("octet") {
            Ok(Mode::Octet)
        } else if s.eq_ignore_ascii_case("netascii") {
            Ok(Mode::Netascii)
        } else {
            Err(PacketError::UnknownMode(s.to_string()))
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: String,
        options: OptionSet,
    },
    Wrq {
        filename: String,
        mode: String,
        options: OptionSet,
    },
    Data {
        block: u16,
        data: Vec<u8>,
    },
    Ack(u16),
    Error {
        code: u16,
        message: String,
    },
    Oack(OptionSet),
}

impl Packet {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code: code as u16,
            message: message.into(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq { .. } => Opcode::Rrq,
            Packet::Wrq { .. } => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack(_) => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack(_) => Opcode::Oack,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        bytes.extend_from_slice(&(self.opcode() as u16).to_be_bytes());

        match self {
            Packet::Rrq {
                filename,
                mode,
                options,
            }
            | Packet::Wrq {
                filename,
                mode,
                options,
            } => {
                bytes.extend_from_slice(filename.as_bytes());
                bytes.push(0);
                bytes.extend_from_slice(mode.as_bytes());
                bytes.push(0);
                bytes.extend_from_slice(&options.encode());
            }
            Packet::Data { block, data } => {
                bytes.extend_from_slice(&block.to_be_bytes());
                bytes.extend_from_slice(data);
            }
            Packet::Ack(block) => {
                bytes.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                bytes.extend_from_slice(&code.to_be_bytes());
                bytes.extend_from_slice(message.as_bytes());
                bytes.push(0);
            }
            Packet::Oack(options) => {
                bytes.extend_from_slice(&options.encode());
            }
        }
        bytes
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < 4 {
            return Err(PacketError::TooShort(buf.len()));
        }

        let opcode = Opcode::try_from(u16::from_be_bytes([buf[0], buf[1]]))?;
        let pkt = match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let filename = read_cstr(&buf[2..])?;
                if filename.is_empty() {
                    return Err(PacketError::EmptyFilename);
                }
                let rest = &buf[2 + filename.len() + 1..];
                let mode = read_cstr(rest)?;
                let options = options::parse_options(&rest[mode.len() + 1..]);
                if opcode == Opcode::Rrq {
                    Packet::Rrq {
                        filename,
                        mode,
                        options,
                    }
                } else {
                    Packet::Wrq {
                        filename,
                        mode,
                        options,
                    }
                }
            }
            Opcode::Data => Packet::Data {
                block: u16::from_be_bytes([buf[2], buf[3]]),
                data: buf[4..].to_vec(),
            },
            Opcode::Ack => Packet::Ack(u16::from_be_bytes([buf[2], buf[3]])),
            Opcode::Error => {
                let code = u16::from_be_bytes([buf[2], buf[3]]);
                // Some peers omit the terminator of an empty message.
                let message = match read_cstr(&buf[4..]) {
                    Ok(message) => message,
                    Err(PacketError::MissingTerminator) => String::from_utf8_lossy(&buf[4..]).into_owned(),
                    Err(e) => return Err(e),
                };
                Packet::Error { code, message }
            }
            Opcode::Oack => Packet::Oack(options::parse_options(&buf[2..])),
        };

        Ok(pkt)
    }

    fn encoded_len(&self) -> usize {
        2 + match self {
            Packet::Rrq {
                filename,
                mode,
                options,
            }
            | Packet::Wrq {
                filename,
                mode,
                options,
            } => filename.len() + mode.len() + 2 + options.encoded_len(),
            Packet::Data { data, .. } => 2 + data.len(),
            Packet::Ack(_) => 2,
            Packet::Error { message, .. } => 2 + message.len() + 1,
            Packet::Oack(options) => options.encoded_len(),
        }
    }
}

/// Builds a RRQ/WRQ, refusing anything that would not fit in a single
/// request datagram.
pub fn encode_request(
    kind: RequestKind,
    filename: &str,
    mode: Mode,
    options: &OptionSet,
) -> Result<Vec<u8>, PacketError> {
    if filename.is_empty() {
        return Err(PacketError::EmptyFilename);
    }
    if filename.as_bytes().contains(&0) {
        return Err(PacketError::InvalidEncoding);
    }
    let packet = match kind {
        RequestKind::Read => Packet::Rrq {
            filename: filename.to_string(),
            mode: mode.as_str().to_string(),
            options: options.clone(),
        },
        RequestKind::Write => Packet::Wrq {
            filename: filename.to_string(),
            mode: mode.as_str().to_string(),
            options: options.clone(),
        },
    };
    if packet.encoded_len() > MAX_REQUEST_SIZE {
        return Err(PacketError::RequestTooLarge {
            max: MAX_REQUEST_SIZE,
        });
    }
    Ok(packet.serialize())
}

/// Writes a DATA header for `block` into the first four bytes of `buf`.
pub(crate) fn write_data_header(buf: &mut [u8], block: u16) {
    buf[..2].copy_from_slice(&(Opcode::Data as u16).to_be_bytes());
    buf[2..4].copy_from_slice(&block.to_be_bytes());
}

fn read_cstr(buf: &[u8]) -> Result<String, PacketError> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::MissingTerminator)?;
    let s = str::from_utf8(&buf[..pos])
        .map_err(|_| PacketError::InvalidEncoding)?
        .to_string();
    Ok(s)
}

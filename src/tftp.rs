use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Size of the payload carried by every DATA packet except the last one.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Opcode plus block number.
pub const HEADER_SIZE: usize = 4;

/// Largest datagram either side ever sends.
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + DATA_BUFFER_SIZE;

/// The only transfer mode this crate requests.
pub const OCTET_MODE: &str = "octet";

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Malformed(SocketAddr, String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {}", e),
            SocketError::Malformed(src, e) => write!(f, "Malformed packet from {}: {}", src, e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read.
#[derive(Debug, Clone, PartialEq)]
pub enum FileMode { NetAscii, Octet, Mail }

impl FileMode {
    fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => OCTET_MODE,
            FileMode::Mail => "mail",
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorCode { Undefined, FileNotFound, AccessViolation, DiskFull, Illegal, UnknownTid, FileAlreadyExists, NoSuchUser }

impl ErrorCode {
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::WriteZero => ErrorCode::DiskFull,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request. Only ever decoded, so the server can refuse it.
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the UTF-8 string begins at the beginning of the buffer and runs until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> TftpResult<(String, usize)> {
    let end = buf.iter().position(|&c| c == 0x00).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..end]) {
        Ok(s) => Ok((s.to_string(), end)),
        Err(e) => Err(SocketError::PacketParse(format!("String is not valid UTF-8: {e}"))),
    }
}

#[derive(Debug, PartialEq)]
pub enum OpCode { Rrq, Wrq, Data, Ack, Error }

/// Utility function for obtaining the TFTP OpCode from a buffer
fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(format!("Unknown opcode retrieved: {rawcode}"))),
    }
}

fn parse_path_and_mode(buf: &[u8]) -> TftpResult<(String, FileMode)> {
    let (path, path_end) = string_from_buffer(buf)?;

    if path_end == buf.len() {
        return Err(SocketError::PacketParse("Request does not contain a mode, but it needs to!".to_string()));
    }

    let (raw_mode, mode_end) = string_from_buffer(&buf[path_end + 1..])?;

    if path_end + 1 + mode_end >= buf.len() {
        return Err(SocketError::PacketParse("Mode must be terminated with a null byte!".to_string()));
    }

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        "mail" => FileMode::Mail,
        _ => return Err(SocketError::PacketParse(format!("Unknown file mode: '{raw_mode}'"))),
    };

    Ok((path, mode))
}

fn parse_read_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::ReadReq { path, mode })
}

fn parse_write_req(buf: &[u8]) -> TftpResult<Packet> {
    let (path, mode) = parse_path_and_mode(&buf[2..])?;
    Ok(Packet::WriteReq { path, mode })
}

fn parse_data(buf: &[u8]) -> TftpResult<Packet> {
    if buf.len() > MAX_PACKET_SIZE {
        return Err(SocketError::PacketParse(format!(
            "Data packet carries {} bytes, more than the {DATA_BUFFER_SIZE} allowed",
            buf.len() - HEADER_SIZE
        )));
    }
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Data { block, data: Vec::from(&buf[HEADER_SIZE..]) })
}

fn parse_ack(buf: &[u8]) -> TftpResult<Packet> {
    let block = u16_from_buffer(&buf[2..4]);
    Ok(Packet::Ack { block })
}

fn parse_error(buf: &[u8]) -> TftpResult<Packet> {
    let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
    let (message, _) = string_from_buffer(&buf[4..])?;
    Ok(Packet::Error { code, message })
}

impl Packet {
    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < HEADER_SIZE {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => parse_read_req(buf),
            OpCode::Wrq => parse_write_req(buf),
            OpCode::Data => parse_data(buf),
            OpCode::Ack => parse_ack(buf),
            OpCode::Error => parse_error(buf),
        }
    }

    /// Encodes the packet in its wire format.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PACKET_SIZE);
        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                let opcode: u16 = if matches!(self, Packet::ReadReq { .. }) { 1 } else { 2 };
                buf.extend_from_slice(&opcode.to_be_bytes());
                buf.extend_from_slice(path.as_bytes());
                buf.push(0x00);
                buf.extend_from_slice(mode.as_str().as_bytes());
                buf.push(0x00);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&3_u16.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&4_u16.to_be_bytes());
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&5_u16.to_be_bytes());
                buf.extend_from_slice(&code.code().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
            }
        }
        buf
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(&packet.serialize(), dst).await?;
        Ok(())
    }

    /// Waits for the next datagram from any source, however long that takes.
    pub async fn recv(&self) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; MAX_PACKET_SIZE + 1];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;

        match Packet::parse_from_buf(&buf[..total_written]) {
            Ok(packet) => Ok((packet, src)),
            Err(SocketError::PacketParse(reason)) => Err(SocketError::Malformed(src, reason)),
            Err(e) => Err(e),
        }
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        timeout(ttl, self.recv()).await?
    }
}

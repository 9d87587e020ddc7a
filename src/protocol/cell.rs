//! Tor cell protocol
//!
//! Framing and parsing of fixed and variable length cells, the relay
//! command table, and the inner relay-cell layout. Header widths depend
//! on the negotiated link protocol version: the circuit id is 2 bytes up
//! to version 3 and 4 bytes from version 4 on. VERSIONS cells are always
//! framed with the 2-byte header because they are exchanged before
//! negotiation completes.

use crate::error::{Result, TorError};
use std::net::Ipv4Addr;

/// Payload size for fixed-length cells.
pub const PAYLOAD_LEN: usize = 509;

/// Inner relay header: command(1) recognized(2) stream_id(2) digest(4) length(2).
pub const RELAY_HEADER_LEN: usize = 11;

/// Maximum data bytes in one relay cell.
pub const RELAY_DATA_MAX: usize = PAYLOAD_LEN - RELAY_HEADER_LEN;

/// Variable cells larger than this kill the link.
pub const VARIABLE_PAYLOAD_MAX: usize = 16384;

/// Offset of the digest field within a relay cell body.
pub const RELAY_DIGEST_OFFSET: usize = 5;

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - ignored
    Padding = 0,
    /// RELAY - relay cell
    Relay = 3,
    /// DESTROY - destroy a circuit
    Destroy = 4,
    /// CREATE_FAST - fast circuit creation (legacy, never sent)
    CreateFast = 5,
    /// CREATED_FAST - fast circuit created (legacy, never sent)
    CreatedFast = 6,
    /// VERSIONS - negotiate link protocol versions
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell counted against the early budget
    RelayEarly = 9,
    /// CREATE2 - create a circuit
    Create2 = 10,
    /// CREATED2 - circuit created
    Created2 = 11,
    /// CERTS - certificate cell
    Certs = 129,
    /// AUTH_CHALLENGE - authentication challenge
    AuthChallenge = 130,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            10 => Some(CellCommand::Create2),
            11 => Some(CellCommand::Created2),
            129 => Some(CellCommand::Certs),
            130 => Some(CellCommand::AuthChallenge),
            _ => None,
        }
    }

    /// Variable-length cells carry a 16-bit length prefix instead of a
    /// fixed 509-byte payload.
    pub fn is_variable(self) -> bool {
        self == CellCommand::Versions || (self as u8) >= 128
    }
}

/// A framed cell, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID; 0 for link-level cells.
    pub circuit_id: u32,

    /// Command
    pub command: CellCommand,

    /// Payload; exactly 509 bytes after encoding for fixed cells.
    pub payload: Vec<u8>,
}

/// Result of one `try_decode` call.
#[derive(Debug)]
pub enum Decoded {
    /// A complete cell was framed; `consumed` bytes were used.
    Cell { consumed: usize, cell: Cell },
    /// A complete frame with an unknown command byte; log and drop it.
    Unknown { consumed: usize, command: u8 },
    /// Not enough buffered bytes for a complete frame.
    NeedMore,
}

impl Cell {
    /// Create a new cell
    pub fn new(circuit_id: u32, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Header length for the given link protocol version.
    fn header_len(proto_version: u16) -> usize {
        if proto_version < 4 {
            3
        } else {
            5
        }
    }

    /// Serialize the cell for the given link protocol version.
    ///
    /// Fixed cells are zero-padded to exactly 509 payload bytes. VERSIONS
    /// is always written with the 2-byte circuit id header.
    pub fn encode(&self, proto_version: u16) -> Result<Vec<u8>> {
        let two_byte_id = proto_version < 4 || self.command == CellCommand::Versions;

        let mut buf = Vec::with_capacity(5 + PAYLOAD_LEN.max(self.payload.len()) + 2);
        if two_byte_id {
            let id = u16::try_from(self.circuit_id).map_err(|_| {
                TorError::Internal(format!(
                    "circuit id {} does not fit a 2-byte header",
                    self.circuit_id
                ))
            })?;
            buf.extend_from_slice(&id.to_be_bytes());
        } else {
            buf.extend_from_slice(&self.circuit_id.to_be_bytes());
        }
        buf.push(self.command as u8);

        if self.command.is_variable() {
            let len = u16::try_from(self.payload.len())
                .map_err(|_| TorError::OversizedVariable(self.payload.len()))?;
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&self.payload);
        } else {
            if self.payload.len() > PAYLOAD_LEN {
                return Err(TorError::Internal(format!(
                    "fixed cell payload {} exceeds {}",
                    self.payload.len(),
                    PAYLOAD_LEN
                )));
            }
            buf.extend_from_slice(&self.payload);
            buf.resize(buf.len() + PAYLOAD_LEN - self.payload.len(), 0);
        }

        Ok(buf)
    }

    /// Try to frame one cell out of `buf` without consuming anything on
    /// `NeedMore`. On success the caller drains `consumed` bytes.
    pub fn try_decode(buf: &[u8], proto_version: u16) -> Result<Decoded> {
        let header_len = Self::header_len(proto_version);
        if buf.len() < header_len {
            return Ok(Decoded::NeedMore);
        }

        let (circuit_id, command_byte) = if proto_version < 4 {
            (u16::from_be_bytes([buf[0], buf[1]]) as u32, buf[2])
        } else {
            (
                u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
                buf[4],
            )
        };

        let command = CellCommand::from_u8(command_byte);
        let variable = match command {
            Some(c) => c.is_variable(),
            // Unknown commands >= 128 are variable by definition, so we can
            // still skip the frame; unknown fixed commands are 509 bytes.
            None => command_byte >= 128,
        };

        let (consumed, payload) = if variable {
            if buf.len() < header_len + 2 {
                return Ok(Decoded::NeedMore);
            }
            let length =
                u16::from_be_bytes([buf[header_len], buf[header_len + 1]]) as usize;
            if length > VARIABLE_PAYLOAD_MAX {
                return Err(TorError::OversizedVariable(length));
            }
            let total = header_len + 2 + length;
            if buf.len() < total {
                return Ok(Decoded::NeedMore);
            }
            (total, buf[header_len + 2..total].to_vec())
        } else {
            let total = header_len + PAYLOAD_LEN;
            if buf.len() < total {
                return Ok(Decoded::NeedMore);
            }
            (total, buf[header_len..total].to_vec())
        };

        match command {
            Some(command) => Ok(Decoded::Cell {
                consumed,
                cell: Cell {
                    circuit_id,
                    command,
                    payload,
                },
            }),
            None => Ok(Decoded::Unknown {
                consumed,
                command: command_byte,
            }),
        }
    }
}

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin = 1,
    /// DATA - stream data
    Data = 2,
    /// END - close stream
    End = 3,
    /// CONNECTED - stream connected
    Connected = 4,
    /// SENDME - flow control credit
    Sendme = 5,
    /// EXTEND - extend circuit (legacy, never sent)
    Extend = 6,
    /// EXTENDED - circuit extended (legacy, never sent)
    Extended = 7,
    /// TRUNCATE - truncate circuit
    Truncate = 8,
    /// TRUNCATED - circuit truncated
    Truncated = 9,
    /// DROP - long-range padding, ignored
    Drop = 10,
    /// RESOLVE - DNS resolve
    Resolve = 11,
    /// RESOLVED - DNS resolved
    Resolved = 12,
    /// BEGIN_DIR - begin directory stream
    BeginDir = 13,
    /// EXTEND2 - extend circuit
    Extend2 = 14,
    /// EXTENDED2 - circuit extended
    Extended2 = 15,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            14 => Some(RelayCommand::Extend2),
            15 => Some(RelayCommand::Extended2),
            _ => None,
        }
    }
}

/// Inner framing of a RELAY or RELAY_EARLY cell, after layered decryption.
///
/// The command is kept as a raw byte: whether a decrypted body is "ours"
/// is decided by the recognized field and the running digest, not by the
/// command table, so an unknown command must survive parsing and be
/// dropped at dispatch instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command byte
    pub command: u8,

    /// Stream ID; 0 for circuit-level commands
    pub stream_id: u16,

    /// Digest (4 bytes), filled in by the circuit engine
    pub digest: [u8; 4],

    /// Data (up to 498 bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Create a new relay cell with a zeroed digest field.
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command: command as u8,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// The command, if it is in the relay command table.
    pub fn relay_command(&self) -> Option<RelayCommand> {
        RelayCommand::from_u8(self.command)
    }

    /// Serialize to a full 509-byte relay cell body, zero-padded.
    /// The recognized field is always written as zero.
    pub fn encode(&self) -> Result<[u8; PAYLOAD_LEN]> {
        if self.data.len() > RELAY_DATA_MAX {
            return Err(TorError::Internal(format!(
                "relay data {} exceeds {} bytes",
                self.data.len(),
                RELAY_DATA_MAX
            )));
        }

        let mut body = [0u8; PAYLOAD_LEN];
        body[0] = self.command;
        // recognized: bytes 1..3 stay zero
        body[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        body[5..9].copy_from_slice(&self.digest);
        body[9..11].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        body[11..11 + self.data.len()].copy_from_slice(&self.data);
        Ok(body)
    }

    /// Structural parse of a decrypted 509-byte body.
    ///
    /// Returns `None` when the body is not addressed to the hop that
    /// decrypted it (`recognized != 0` or an impossible length), so the
    /// circuit engine can try the next hop. The digest check is separate;
    /// see `HopCrypto::check_inbound`.
    pub fn try_parse(body: &[u8]) -> Option<RelayCell> {
        if body.len() != PAYLOAD_LEN {
            return None;
        }

        let recognized = u16::from_be_bytes([body[1], body[2]]);
        let length = u16::from_be_bytes([body[9], body[10]]) as usize;
        if recognized != 0 || length > RELAY_DATA_MAX {
            return None;
        }

        Some(RelayCell {
            command: body[0],
            stream_id: u16::from_be_bytes([body[3], body[4]]),
            digest: [body[5], body[6], body[7], body[8]],
            data: body[11..11 + length].to_vec(),
        })
    }
}

/// VERSIONS payload: a list of big-endian 16-bit versions.
pub fn encode_versions(versions: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(versions.len() * 2);
    for v in versions {
        out.extend_from_slice(&v.to_be_bytes());
    }
    out
}

/// Parse a VERSIONS payload; an odd number of bytes is a protocol error.
pub fn parse_versions(payload: &[u8]) -> Result<Vec<u16>> {
    if payload.len() % 2 != 0 {
        return Err(TorError::Protocol(format!(
            "VERSIONS payload has odd length {}",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect())
}

/// Parsed NETINFO cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Netinfo {
    /// Sender's clock, seconds since the epoch.
    pub timestamp: u32,

    /// The address the sender observed for us.
    pub our_address: Option<Ipv4Addr>,

    /// The sender's own addresses. May be empty.
    pub router_addresses: Vec<Ipv4Addr>,
}

impl Netinfo {
    /// Parse a NETINFO payload out of a fixed cell body.
    ///
    /// IPv6 entries are skipped (this core only speaks IPv4 NETINFO);
    /// any other address type is a protocol error.
    pub fn parse(payload: &[u8]) -> Result<Netinfo> {
        if payload.len() < 5 {
            return Err(TorError::Protocol("NETINFO too short".into()));
        }

        let timestamp = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let mut rest = &payload[4..];

        let our_address = Self::decode_address(&mut rest)?;

        let num_addresses = *rest
            .first()
            .ok_or_else(|| TorError::Protocol("NETINFO truncated".into()))?;
        rest = &rest[1..];

        let mut router_addresses = Vec::new();
        for _ in 0..num_addresses {
            if let Some(addr) = Self::decode_address(&mut rest)? {
                router_addresses.push(addr);
            }
        }

        Ok(Netinfo {
            timestamp,
            our_address,
            router_addresses,
        })
    }

    fn decode_address(data: &mut &[u8]) -> Result<Option<Ipv4Addr>> {
        if data.len() < 2 {
            return Err(TorError::Protocol("NETINFO address truncated".into()));
        }
        let host_type = data[0];
        let size = data[1] as usize;
        if data.len() < 2 + size {
            return Err(TorError::Protocol("NETINFO address truncated".into()));
        }
        let value = &data[2..2 + size];
        let parsed = match (host_type, size) {
            (4, 4) => Some(Ipv4Addr::new(value[0], value[1], value[2], value[3])),
            (6, 16) => None,
            _ => {
                return Err(TorError::Protocol(format!(
                    "NETINFO address type {} len {}",
                    host_type, size
                )))
            }
        };
        *data = &data[2 + size..];
        Ok(parsed)
    }

    /// Build our NETINFO reply payload: timestamp, the peer's address as
    /// the "other" entry, and one entry for the address the peer observed
    /// for us.
    pub fn encode(timestamp: u32, other: Ipv4Addr, ours: Ipv4Addr) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 6 + 1 + 6);
        out.extend_from_slice(&timestamp.to_be_bytes());
        Self::encode_address(&mut out, other);
        out.push(1);
        Self::encode_address(&mut out, ours);
        out
    }

    fn encode_address(out: &mut Vec<u8>, ip: Ipv4Addr) {
        out.push(4);
        out.push(4);
        out.extend_from_slice(&ip.octets());
    }
}

/// CREATE2 payload for the ntor handshake: htype 0x0002, hlen, hdata.
pub fn encode_create2(hdata: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + hdata.len());
    out.extend_from_slice(&0x0002u16.to_be_bytes());
    out.extend_from_slice(&(hdata.len() as u16).to_be_bytes());
    out.extend_from_slice(hdata);
    out
}

/// Parse a CREATED2 payload (or an EXTENDED2 relay body, same layout):
/// hlen, then Y(32) and AUTH(32).
pub fn parse_created2(payload: &[u8]) -> Result<([u8; 32], [u8; 32])> {
    if payload.len() < 2 {
        return Err(TorError::Protocol("CREATED2 too short".into()));
    }
    let hlen = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    if hlen < 64 || payload.len() < 2 + hlen {
        return Err(TorError::Protocol(format!(
            "CREATED2 handshake length {}",
            hlen
        )));
    }
    let mut y = [0u8; 32];
    let mut auth = [0u8; 32];
    y.copy_from_slice(&payload[2..34]);
    auth.copy_from_slice(&payload[34..66]);
    Ok((y, auth))
}

/// DESTROY cell reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    None,
    Protocol,
    Internal,
    Requested,
    Hibernating,
    ResourceLimit,
    ConnectFailed,
    OrIdentity,
    ChannelClosed,
    Finished,
    Timeout,
    Destroyed,
    NoSuchService,
    Unknown(u8),
}

impl DestroyReason {
    pub fn from_u8(reason: u8) -> Self {
        match reason {
            0 => DestroyReason::None,
            1 => DestroyReason::Protocol,
            2 => DestroyReason::Internal,
            3 => DestroyReason::Requested,
            4 => DestroyReason::Hibernating,
            5 => DestroyReason::ResourceLimit,
            6 => DestroyReason::ConnectFailed,
            7 => DestroyReason::OrIdentity,
            8 => DestroyReason::ChannelClosed,
            9 => DestroyReason::Finished,
            10 => DestroyReason::Timeout,
            11 => DestroyReason::Destroyed,
            12 => DestroyReason::NoSuchService,
            other => DestroyReason::Unknown(other),
        }
    }
}

impl std::fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DestroyReason::None => "no reason given",
            DestroyReason::Protocol => "tor protocol violation",
            DestroyReason::Internal => "internal error",
            DestroyReason::Requested => "client sent a TRUNCATE",
            DestroyReason::Hibernating => "not currently operating",
            DestroyReason::ResourceLimit => "out of memory, sockets, or circuit ids",
            DestroyReason::ConnectFailed => "unable to reach relay",
            DestroyReason::OrIdentity => "OR identity was not as expected",
            DestroyReason::ChannelClosed => "the carrying OR connection died",
            DestroyReason::Finished => "circuit expired for being dirty or old",
            DestroyReason::Timeout => "circuit construction took too long",
            DestroyReason::Destroyed => "circuit destroyed without client TRUNCATE",
            DestroyReason::NoSuchService => "request for unknown hidden service",
            DestroyReason::Unknown(code) => return write!(f, "unknown reason {}", code),
        };
        f.write_str(text)
    }
}

/// RELAY_END reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Misc,
    ResolveFailed,
    ConnectRefused,
    ExitPolicy,
    Destroy,
    Done,
    Timeout,
    NoRoute,
    Hibernating,
    Internal,
    ResourceLimit,
    ConnReset,
    Unknown(u8),
}

impl EndReason {
    pub const DONE: u8 = 6;

    pub fn from_u8(reason: u8) -> Self {
        match reason {
            1 => EndReason::Misc,
            2 => EndReason::ResolveFailed,
            3 => EndReason::ConnectRefused,
            4 => EndReason::ExitPolicy,
            5 => EndReason::Destroy,
            6 => EndReason::Done,
            7 => EndReason::Timeout,
            8 => EndReason::NoRoute,
            9 => EndReason::Hibernating,
            10 => EndReason::Internal,
            11 => EndReason::ResourceLimit,
            12 => EndReason::ConnReset,
            other => EndReason::Unknown(other),
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            EndReason::Misc => "miscellaneous",
            EndReason::ResolveFailed => "resolve failed",
            EndReason::ConnectRefused => "connection refused",
            EndReason::ExitPolicy => "exit policy rejection",
            EndReason::Destroy => "circuit destroyed",
            EndReason::Done => "done",
            EndReason::Timeout => "timed out",
            EndReason::NoRoute => "no route to host",
            EndReason::Hibernating => "relay hibernating",
            EndReason::Internal => "internal error",
            EndReason::ResourceLimit => "resource limit",
            EndReason::ConnReset => "connection reset",
            EndReason::Unknown(code) => return write!(f, "unknown reason {}", code),
        };
        f.write_str(text)
    }
}

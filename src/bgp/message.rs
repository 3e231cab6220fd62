//! Decoded BGP messages as handed over by the protocol engine.
//!
//! Wire decoding is the engine's business. This module only defines the
//! decoded shapes the session layer classifies, plus the two pieces of wire
//! framing the session layer owns itself: the message header and the fixed
//! KEEPALIVE payload.

use std::fmt;
use std::io;
use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use super::family::AddressFamily;
use super::route::{Attributes, Nlri};

pub const BGP_MARKER: [u8; 16] = [0xFF; 16];
pub const BGP_VERSION: u8 = 4;
pub const BGP_HEADER_LEN: usize = 19;

/// The complete KEEPALIVE message. It never varies between sessions.
pub const KEEPALIVE: [u8; BGP_HEADER_LEN] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0x00, 0x13, 0x04,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Open = 1,
    Update = 2,
    Notification = 3,
    Keepalive = 4,
    RouteRefresh = 5,
}

impl TryFrom<u8> for MessageType {
    type Error = io::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Open),
            2 => Ok(MessageType::Update),
            3 => Ok(MessageType::Notification),
            4 => Ok(MessageType::Keepalive),
            5 => Ok(MessageType::RouteRefresh),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid BGP message type: {}", value),
            )),
        }
    }
}

/// BGP message header: 16-byte marker, 2-byte length, 1-byte type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub length: u16,
    pub msg_type: MessageType,
}

impl Header {
    /// Header for a message whose body is `body_len` bytes long.
    pub fn for_body(msg_type: MessageType, body_len: usize) -> io::Result<Self> {
        let length = u16::try_from(BGP_HEADER_LEN + body_len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "BGP message too long"))?;
        Ok(Header { length, msg_type })
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&BGP_MARKER);
        buf.put_u16(self.length);
        buf.put_u8(self.msg_type as u8);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(BGP_HEADER_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }
}

pub struct KeepaliveMessage;

impl KeepaliveMessage {
    pub fn to_bytes() -> Bytes {
        Bytes::from_static(&KEEPALIVE)
    }
}

/// A decoded OPEN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenMessage {
    pub version: u8,
    pub asn: u16,
    pub hold_time: u16,
    pub router_id: Ipv4Addr,
    /// Families advertised through multiprotocol capabilities, in order.
    pub families: Vec<AddressFamily>,
}

impl OpenMessage {
    pub fn new_with_families(
        asn: u16,
        hold_time: u16,
        router_id: Ipv4Addr,
        families: &[AddressFamily],
    ) -> Self {
        Self {
            version: BGP_VERSION,
            asn,
            hold_time,
            router_id,
            families: families.to_vec(),
        }
    }
}

/// NOTIFICATION error codes per RFC 4271 Section 4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    MessageHeaderError = 1,
    OpenMessageError = 2,
    UpdateMessageError = 3,
    HoldTimerExpired = 4,
    FiniteStateMachineError = 5,
    Cease = 6,
    RouteRefreshMessageError = 7,
}

impl TryFrom<u8> for ErrorCode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ErrorCode::MessageHeaderError),
            2 => Ok(ErrorCode::OpenMessageError),
            3 => Ok(ErrorCode::UpdateMessageError),
            4 => Ok(ErrorCode::HoldTimerExpired),
            5 => Ok(ErrorCode::FiniteStateMachineError),
            6 => Ok(ErrorCode::Cease),
            7 => Ok(ErrorCode::RouteRefreshMessageError),
            other => Err(other),
        }
    }
}

/// A BGP NOTIFICATION, sent or received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
}

impl Notification {
    pub fn new(code: u8, subcode: u8, data: Vec<u8>) -> Self {
        Self { code, subcode, data }
    }

    pub fn codes(&self) -> (u8, u8) {
        (self.code, self.subcode)
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ErrorCode::try_from(self.code) {
            Ok(code) => write!(f, "{:?} ({}/{})", code, self.code, self.subcode)?,
            Err(code) => write!(f, "unknown error ({}/{})", code, self.subcode)?,
        }
        if !self.data.is_empty() {
            write!(f, " data {:02x?}", self.data)?;
        }
        Ok(())
    }
}

/// A decoded UPDATE: the NLRIs it announces or withdraws and the shared
/// path attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateMessage {
    pub nlris: Vec<Nlri>,
    pub attributes: Attributes,
}

impl UpdateMessage {
    pub fn new(nlris: Vec<Nlri>, attributes: Attributes) -> Self {
        Self { nlris, attributes }
    }
}

/// One decoded message, or the `Nop` sentinel the engine returns when
/// nothing complete was available to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Nop,
    Open(OpenMessage),
    Update(UpdateMessage),
    Notification(Notification),
    Keepalive,
    RouteRefresh(AddressFamily),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Nop => "NOP",
            Message::Open(_) => "OPEN",
            Message::Update(_) => "UPDATE",
            Message::Notification(_) => "NOTIFICATION",
            Message::Keepalive => "KEEPALIVE",
            Message::RouteRefresh(_) => "ROUTE_REFRESH",
        }
    }
}

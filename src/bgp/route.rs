//! Route descriptors exchanged between peer sessions and the route bus.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::family::AddressFamily;

/// Path attribute type code for EXTENDED_COMMUNITIES (RFC 4360).
pub const ATTR_EXTENDED_COMMUNITIES: u8 = 16;

/// Optional + transitive attribute flags.
const ATTR_FLAGS_OPTIONAL_TRANSITIVE: u8 = 0xC0;

/// Extended community subtype for Route Targets.
const RT_SUBTYPE: u8 = 0x02;

/// A Route Target extended community.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteTarget {
    /// Type 0x00: 2-octet AS, 4-octet assigned number.
    As2 { asn: u16, number: u32 },
    /// Type 0x01: IPv4 address, 2-octet assigned number.
    Ipv4 { addr: Ipv4Addr, number: u16 },
    /// Type 0x02: 4-octet AS, 2-octet assigned number.
    As4 { asn: u32, number: u16 },
}

impl RouteTarget {
    /// Decode from an 8-byte extended community. Returns `None` when the
    /// community is not a Route Target.
    pub fn from_extended_community(data: &[u8; 8]) -> Option<Self> {
        if data[1] != RT_SUBTYPE {
            return None;
        }
        // the high bits of the type octet are IANA authority / transitivity flags
        match data[0] & 0x3F {
            0x00 => Some(RouteTarget::As2 {
                asn: u16::from_be_bytes([data[2], data[3]]),
                number: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            }),
            0x01 => Some(RouteTarget::Ipv4 {
                addr: Ipv4Addr::new(data[2], data[3], data[4], data[5]),
                number: u16::from_be_bytes([data[6], data[7]]),
            }),
            0x02 => Some(RouteTarget::As4 {
                asn: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
                number: u16::from_be_bytes([data[6], data[7]]),
            }),
            _ => None,
        }
    }

    /// Encode as an 8-byte transitive extended community.
    pub fn to_extended_community(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[1] = RT_SUBTYPE;
        match *self {
            RouteTarget::As2 { asn, number } => {
                out[0] = 0x00;
                out[2..4].copy_from_slice(&asn.to_be_bytes());
                out[4..8].copy_from_slice(&number.to_be_bytes());
            }
            RouteTarget::Ipv4 { addr, number } => {
                out[0] = 0x01;
                out[2..6].copy_from_slice(&addr.octets());
                out[6..8].copy_from_slice(&number.to_be_bytes());
            }
            RouteTarget::As4 { asn, number } => {
                out[0] = 0x02;
                out[2..6].copy_from_slice(&asn.to_be_bytes());
                out[6..8].copy_from_slice(&number.to_be_bytes());
            }
        }
        out
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::As2 { asn, number } => write!(f, "{}:{}", asn, number),
            RouteTarget::Ipv4 { addr, number } => write!(f, "{}:{}", addr, number),
            RouteTarget::As4 { asn, number } => write!(f, "{}:{}", asn, number),
        }
    }
}

/// Error returned when a route target string cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid route target: {0}")]
pub struct ParseRouteTargetError(String);

impl FromStr for RouteTarget {
    type Err = ParseRouteTargetError;

    /// Parses `asn:number` or `a.b.c.d:number`. An AS number above 65535
    /// selects the 4-octet AS form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRouteTargetError(s.to_string());
        let (admin, number) = s.rsplit_once(':').ok_or_else(err)?;

        if admin.contains('.') {
            let addr = admin.parse().map_err(|_| err())?;
            let number = number.parse().map_err(|_| err())?;
            return Ok(RouteTarget::Ipv4 { addr, number });
        }

        let asn: u32 = admin.parse().map_err(|_| err())?;
        match u16::try_from(asn) {
            Ok(asn) => Ok(RouteTarget::As2 {
                asn,
                number: number.parse().map_err(|_| err())?,
            }),
            Err(_) => Ok(RouteTarget::As4 {
                asn,
                number: number.parse().map_err(|_| err())?,
            }),
        }
    }
}

/// What an NLRI carried in an update is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NlriAction {
    /// Not set by the decoder. Never valid in a received update.
    Unset,
    Announced,
    Withdrawn,
}

/// A routing prefix descriptor.
///
/// The prefix itself is kept in its encoded form; only the protocol engine
/// interprets it. RTC NLRIs additionally expose their Route Target, where
/// `None` is the wildcard (default) route target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nlri {
    pub family: AddressFamily,
    pub action: NlriAction,
    pub prefix: Bytes,
    pub next_hop: Option<IpAddr>,
    pub route_target: Option<RouteTarget>,
}

/// Identity of an NLRI in a route table: action and next hop do not count.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NlriKey {
    pub family: AddressFamily,
    pub prefix: Bytes,
    pub route_target: Option<RouteTarget>,
}

impl Nlri {
    pub fn new(family: AddressFamily, action: NlriAction, prefix: impl Into<Bytes>) -> Self {
        Self {
            family,
            action,
            prefix: prefix.into(),
            next_hop: None,
            route_target: None,
        }
    }

    /// Build an RTC NLRI. `None` is the wildcard route target.
    pub fn rtc(action: NlriAction, origin_as: u32, route_target: Option<RouteTarget>) -> Self {
        let mut prefix = BytesMut::with_capacity(12);
        if let Some(rt) = route_target {
            prefix.put_u32(origin_as);
            prefix.put_slice(&rt.to_extended_community());
        }
        Self {
            family: AddressFamily::IPV4_RTC,
            action,
            prefix: prefix.freeze(),
            next_hop: None,
            route_target,
        }
    }

    pub fn with_next_hop(mut self, next_hop: IpAddr) -> Self {
        self.next_hop = Some(next_hop);
        self
    }

    pub fn key(&self) -> NlriKey {
        NlriKey {
            family: self.family,
            prefix: self.prefix.clone(),
            route_target: self.route_target,
        }
    }
}

impl fmt::Display for Nlri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.family, self.action)?;
        if self.family.is_rtc() {
            match &self.route_target {
                Some(rt) => write!(f, " rt {}", rt)?,
                None => write!(f, " rt <wildcard>")?,
            }
        } else {
            write!(f, " prefix 0x")?;
            for b in self.prefix.iter() {
                write!(f, "{:02x}", b)?;
            }
        }
        if let Some(nh) = self.next_hop {
            write!(f, " next-hop {}", nh)?;
        }
        Ok(())
    }
}

/// A single path attribute, kept opaque apart from its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathAttribute {
    pub flags: u8,
    pub type_code: u8,
    pub value: Bytes,
}

/// The path attributes of an update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(pub Vec<PathAttribute>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, type_code: u8) -> Option<&PathAttribute> {
        self.0.iter().find(|a| a.type_code == type_code)
    }

    /// Replace any attribute of the same type code.
    pub fn insert(&mut self, attr: PathAttribute) {
        self.0.retain(|a| a.type_code != attr.type_code);
        self.0.push(attr);
    }

    /// Append Route Target extended communities, keeping the others.
    pub fn with_route_targets(mut self, rts: &[RouteTarget]) -> Self {
        let mut value = BytesMut::new();
        if let Some(existing) = self.get(ATTR_EXTENDED_COMMUNITIES) {
            value.put_slice(&existing.value);
        }
        for rt in rts {
            value.put_slice(&rt.to_extended_community());
        }
        self.insert(PathAttribute {
            flags: ATTR_FLAGS_OPTIONAL_TRANSITIVE,
            type_code: ATTR_EXTENDED_COMMUNITIES,
            value: value.freeze(),
        });
        self
    }

    /// Route Targets found in the EXTENDED_COMMUNITIES attribute.
    pub fn route_targets(&self) -> Vec<RouteTarget> {
        let Some(attr) = self.get(ATTR_EXTENDED_COMMUNITIES) else {
            return Vec::new();
        };
        attr.value
            .chunks_exact(8)
            .filter_map(|chunk| {
                let community: &[u8; 8] = chunk.try_into().ok()?;
                RouteTarget::from_extended_community(community)
            })
            .collect()
    }
}

/// A route as seen by the route bus: an NLRI and its attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub nlri: Nlri,
    pub attributes: Attributes,
}

impl RouteEntry {
    pub fn new(nlri: Nlri, attributes: Attributes) -> Self {
        Self { nlri, attributes }
    }

    pub fn family(&self) -> AddressFamily {
        self.nlri.family
    }

    /// Route Targets used to match subscriptions. RTC routes are matched on
    /// the route target they carry in their NLRI.
    pub fn route_targets(&self) -> Vec<RouteTarget> {
        if self.nlri.family.is_rtc() {
            self.nlri.route_target.into_iter().collect()
        } else {
            self.attributes.route_targets()
        }
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} attributes)", self.nlri, self.attributes.0.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteEventKind {
    Advertise,
    Withdraw,
}

impl RouteEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteEventKind::Advertise => "advertise",
            RouteEventKind::Withdraw => "withdraw",
        }
    }
}

impl From<RouteEventKind> for NlriAction {
    fn from(kind: RouteEventKind) -> Self {
        match kind {
            RouteEventKind::Advertise => NlriAction::Announced,
            RouteEventKind::Withdraw => NlriAction::Withdrawn,
        }
    }
}

/// The unit exchanged with the route bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEvent {
    pub kind: RouteEventKind,
    pub entry: RouteEntry,
    /// Worker that published the event.
    pub source: String,
}

impl RouteEvent {
    pub fn advertise(entry: RouteEntry, source: impl Into<String>) -> Self {
        Self {
            kind: RouteEventKind::Advertise,
            entry,
            source: source.into(),
        }
    }

    pub fn withdraw(entry: RouteEntry, source: impl Into<String>) -> Self {
        Self {
            kind: RouteEventKind::Withdraw,
            entry,
            source: source.into(),
        }
    }
}
